//! 时钟计数

use std::num::Wrapping;

use crate::spinlock::SpinLock;

/// 单调递增的时钟来源。
///
/// 缓存层只在缓冲块引用计数归零时读取一次，作为其最近使用时间戳。
pub trait TickSource {
    fn ticks(&self) -> u64;
}

/// 自旋锁保护的时钟计数器
///
/// 内核中的时钟由时钟中断推进。宿主环境下没有时钟中断，
/// 因此每次通过 [`TickSource::ticks`] 读取都会先前进一拍，
/// 先后两次读取得到的时间戳严格递增，不需要调用者手动推进。
/// [`Ticks::tick`] 仍可用于额外推进时钟。
pub struct Ticks {
    count: SpinLock<Wrapping<u64>>,
}

impl Ticks {
    pub const fn new() -> Self {
        Self {
            count: SpinLock::new(Wrapping(0), "time"),
        }
    }

    /// 时钟前进一拍，返回前进后的计数
    pub fn tick(&self) -> u64 {
        let mut guard = self.count.lock();
        *guard += Wrapping(1);
        guard.0
    }

    /// 读取当前计数，不推进时钟
    pub fn now(&self) -> u64 {
        self.count.lock().0
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for Ticks {
    fn ticks(&self) -> u64 {
        self.tick()
    }
}

impl<T: TickSource + ?Sized> TickSource for &T {
    fn ticks(&self) -> u64 {
        (**self).ticks()
    }
}

impl<T: TickSource + ?Sized> TickSource for std::sync::Arc<T> {
    fn ticks(&self) -> u64 {
        (**self).ticks()
    }
}
