//! 睡眠锁模块
//! 提供基于休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的线程会在条件变量上休眠，避免忙等待。
//! 缓冲块的内容锁即为睡眠锁，可以跨越磁盘 I/O 持有。

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut, Drop};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::process::{my_id, NO_HOLDER};

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的线程会进入休眠状态，
/// 直到锁被释放后被唤醒。
///
/// # 字段说明
/// - `locked`: 表示锁是否已被占用，由内部互斥锁保护
/// - `wait`: 等待该锁的线程在此休眠
/// - `holder`: 持有者线程编号，用于 `holding` 检查
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    locked: Mutex<bool>,
    wait: Condvar,
    holder: AtomicUsize,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: Mutex::new(false),
            wait: Condvar::new(),
            holder: AtomicUsize::new(NO_HOLDER),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞当前线程）
    ///
    /// # 流程解释
    /// 1. 获取内部互斥锁保护 `locked` 状态
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：在条件变量上休眠，被唤醒后重新检查
    ///   - 如果未锁定：设置`locked=true`并记录持有者
    /// 3. 释放内部互斥锁（因已设置locked状态）
    ///
    /// # Panics
    /// 当前线程已持有该锁时再次获取会 panic（否则将永远休眠）。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        if self.holding() {
            panic!("sleeplock {} acquire", self.name);
        }
        let mut locked = self.locked.lock();
        while *locked {
            self.wait.wait(&mut locked);
        }
        *locked = true;
        self.holder.store(my_id(), Ordering::Relaxed);
        drop(locked);

        self.guard()
    }

    /// 尝试获取睡眠锁，锁被占用时立即返回 `None`。
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        let mut locked = self.locked.lock();
        if *locked {
            return None;
        }
        *locked = true;
        self.holder.store(my_id(), Ordering::Relaxed);
        drop(locked);

        Some(self.guard())
    }

    /// 当前线程是否持有该锁
    pub fn holding(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == my_id()
    }

    /// 是否有任何线程持有该锁
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    fn guard(&self) -> SleepLockGuard<'_, T> {
        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// # 流程解释
    /// 1. 获取内部互斥锁
    /// 2. 清除持有者并设置`locked=false`
    /// 3. 唤醒等待该锁的线程
    fn unlock(&self) {
        let mut locked = self.locked.lock();
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        *locked = false;
        self.wait.notify_all();
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
