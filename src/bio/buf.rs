//! 缓冲块及其持有句柄

use crate::consts::BSIZE;
use crate::sleeplock::SleepLockGuard;
use crate::ticks::TickSource;

use super::hash::{BlockKey, HashIndex};

bitflags! {
    /// 缓冲块状态标志，受缓冲块的睡眠锁保护
    pub struct BufFlags: u8 {
        /// 数据已从磁盘读入
        const VALID = 1 << 0;
    }
}

/// 块数据，按 8 字节对齐，上层可以把 `Buf::data` 按字长解析而不必复制。
#[repr(C, align(8))]
pub(crate) struct BufData(pub [u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}

/// 缓冲块中受睡眠锁保护的部分：状态标志与块数据
pub(crate) struct BufInner {
    pub flags: BufFlags,
    pub data: BufData,
}

impl BufInner {
    pub const fn new() -> Self {
        Self {
            flags: BufFlags::empty(),
            data: BufData::new(),
        }
    }
}

/// 已加锁的缓冲块，由 [`Bcache::bread`](super::Bcache::bread) 返回。
///
/// `Buf` 持有缓冲块的睡眠锁与一次引用计数。
/// 在 `Drop` 中先释放睡眠锁，再减少引用计数，因此可以显式调用
/// [`Bcache::brelse`](super::Bcache::brelse)，也可以直接离开作用域。
///
/// 睡眠锁记录了持有线程，`Buf` 不能被转移到其他线程。
pub struct Buf<'a> {
    /// 所属缓存的索引，用于释放时定位桶
    pub(super) index: &'a HashIndex,

    /// 所属缓存的时钟来源
    pub(super) ticks: &'a dyn TickSource,

    /// 缓冲块在缓冲池中的下标
    pub(super) slot: usize,

    pub(super) key: BlockKey,

    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// 提前取出该字段可以实现先释放锁再触发 `Drop` 的行为。
    pub(super) inner: Option<SleepLockGuard<'a, BufInner>>,
}

impl<'a> Buf<'a> {
    /// 缓冲块所缓存的设备号
    pub fn dev(&self) -> u32 {
        self.key.dev()
    }

    /// 缓冲块所缓存的块号
    pub fn blockno(&self) -> u32 {
        self.key.blockno()
    }

    pub fn flags(&self) -> BufFlags {
        self.inner().flags
    }

    /// 数据是否反映设备上的内容。
    ///
    /// 由 `bread` 返回的缓冲块总是有效的。
    pub fn is_valid(&self) -> bool {
        self.flags().contains(BufFlags::VALID)
    }

    /// 只读访问块数据。
    ///
    /// # 返回值
    /// 长度为 `BSIZE` 的数据数组，生命周期不超过本句柄，即不超过睡眠锁的持有期。
    pub fn data(&self) -> &[u8; BSIZE] {
        &self.inner().data.0
    }

    /// 修改块数据。
    ///
    /// # 功能说明
    /// 修改只作用于内存副本，需要调用 [`Bcache::bwrite`](super::Bcache::bwrite) 才会写回设备。
    /// 未写回就释放的修改仍留在缓存中，对之后命中该块的请求可见，直到缓冲块被回收。
    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.inner_mut().data.0
    }

    /// 当前线程是否持有该缓冲块的睡眠锁
    pub fn holding(&self) -> bool {
        self.inner.as_ref().map_or(false, |g| g.holding())
    }

    pub(super) fn inner(&self) -> &BufInner {
        match &self.inner {
            Some(guard) => &**guard,
            None => unreachable!("buf used after release"),
        }
    }

    pub(super) fn inner_mut(&mut self) -> &mut BufInner {
        match &mut self.inner {
            Some(guard) => &mut **guard,
            None => unreachable!("buf used after release"),
        }
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.inner.take());
        self.index.release(self.slot, self.key, self.ticks);
    }
}

/// 钉住缓冲块得到的凭据，由 [`Bcache::bpin`](super::Bcache::bpin) 返回。
///
/// 凭据存在期间缓冲块的引用计数不为 0，不会被回收，
/// 但不持有睡眠锁。交还给 [`Bcache::bunpin`](super::Bcache::bunpin) 后解除钉住。
#[must_use = "a pinned buffer stays resident until passed to bunpin"]
pub struct BufPin<'a> {
    pub(super) index: &'a HashIndex,
    pub(super) slot: usize,
    pub(super) key: BlockKey,
}

impl<'a> BufPin<'a> {
    /// 被钉住块的设备号
    pub fn dev(&self) -> u32 {
        self.key.dev()
    }

    pub fn blockno(&self) -> u32 {
        self.key.blockno()
    }
}
