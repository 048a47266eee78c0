//! 缓存层
//!
//! 缓冲区缓存保存磁盘块的内存副本，既减少了磁盘读取，
//! 也为多个线程使用同一磁盘块提供了同步点。
//!
//! 接口：
//! * 调用 `bread` 获取某个磁盘块的缓冲块；
//! * 修改缓冲块数据后，调用 `bwrite` 写回磁盘；
//! * 用完后调用 `brelse`（或直接丢弃 `Buf`）；
//! * 同一时刻只有一个线程能使用某个缓冲块，不要持有过久。
//!
//! 没有全局锁：缓冲块按 `(dev, blockno)` 散列到各自加锁的桶中，
//! 以“引用计数归零时的时钟”近似全局 LRU。

mod buf;
mod hash;

pub use buf::{Buf, BufFlags, BufPin};
pub use hash::BlockKey;

use core::ptr;

use log::{trace, warn};

use crate::consts::{NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::error::{BcacheError, Result};
use crate::sleeplock::SleepLock;
use crate::spinlock::SpinLockGuard;
use crate::ticks::{TickSource, Ticks};

use buf::BufInner;
use hash::{Age, Bucket, BufCtrl, HashIndex};

/// 缓存的构造参数，构造后不可更改
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcacheConfig {
    /// 缓冲块数量
    pub nbuf: usize,
    /// 哈希桶数量
    pub nbucket: usize,
}

impl BcacheConfig {
    /// 设置缓冲块数量。
    ///
    /// # 参数
    /// - `nbuf`: 缓冲池大小，必须为正数，在 [`Bcache::new`] 中检查。
    ///
    /// # 返回值
    /// 修改后的配置，便于链式调用。
    pub fn with_nbuf(mut self, nbuf: usize) -> Self {
        self.nbuf = nbuf;
        self
    }

    /// 设置哈希桶数量，必须为正数。取素数能让连续块号分布得更均匀。
    pub fn with_nbucket(mut self, nbucket: usize) -> Self {
        self.nbucket = nbucket;
        self
    }
}

impl Default for BcacheConfig {
    fn default() -> Self {
        Self {
            nbuf: NBUF,
            nbucket: NBUCKET,
        }
    }
}

/// 缓冲区缓存
///
/// `Bcache` 提供了一个固定大小的缓冲池，用于缓存磁盘块数据。
/// 缓冲块的元信息（键、引用计数、时间戳）分散在各个哈希桶中，由桶的自旋锁保护；
/// 块数据与有效标志由每个缓冲块自己的睡眠锁保护，可以跨越磁盘 I/O 持有。
///
/// 锁的规则：
/// - 持有桶锁时绝不等待睡眠锁，也不进行 I/O；
/// - 回收扫描按桶下标递增的顺序加锁，且最多同时持有两把桶锁。
pub struct Bcache<D, T = Ticks> {
    index: HashIndex,

    /// 缓冲池，长度为 `nbuf`，与 `BufCtrl::index` 一一对应
    bufs: Box<[SleepLock<BufInner>]>,

    device: D,
    ticks: T,
}

/// 回收扫描中当前最旧的空闲缓冲块，持有其所在桶的锁
struct Candidate<'a> {
    bucket: usize,
    guard: SpinLockGuard<'a, Bucket>,
    slot: usize,
    age: Age,
}

impl<D: BlockDevice, T: TickSource> Bcache<D, T> {
    /// 构造缓冲区缓存
    ///
    /// # 功能说明
    /// 一次性分配 `nbuf` 个缓冲块与 `nbucket` 个哈希桶。
    /// 所有缓冲块以哨兵键预置到各个桶中，此后只会被反复改作他用，从不释放。
    ///
    /// # 可能的错误
    /// - `nbuf` 或 `nbucket` 为 0 时返回 [`BcacheError::InvalidConfig`]。
    pub fn new(config: BcacheConfig, device: D, ticks: T) -> Result<Self, D::Error> {
        if config.nbuf == 0 {
            return Err(BcacheError::InvalidConfig("nbuf must be positive"));
        }
        if config.nbucket == 0 {
            return Err(BcacheError::InvalidConfig("nbucket must be positive"));
        }

        let bufs = (0..config.nbuf)
            .map(|_| SleepLock::new(BufInner::new(), "buffer"))
            .collect();
        let index = HashIndex::new(config.nbuf, config.nbucket);

        #[cfg(feature = "verbose_init_info")]
        log::info!("bcache: {} buffers in {} buckets", config.nbuf, config.nbucket);
        #[cfg(not(feature = "verbose_init_info"))]
        log::debug!("bcache: {} buffers in {} buckets", config.nbuf, config.nbucket);

        Ok(Self {
            index,
            bufs,
            device,
            ticks,
        })
    }

    /// 缓冲池大小
    pub fn nbuf(&self) -> usize {
        self.bufs.len()
    }

    /// 哈希桶数量
    pub fn nbucket(&self) -> usize {
        self.index.nbucket()
    }

    /// 返回下层块设备。
    ///
    /// # 功能说明
    /// 缓存不独占设备，调用者可以借此检查设备状态；
    /// 绕过缓存直接写设备不会使已缓存的副本失效。
    ///
    /// # 返回值
    /// 构造时传入的设备的共享引用。
    pub fn device(&self) -> &D {
        &self.device
    }

    /// 返回用于记录最近使用时间的时钟来源
    pub fn ticks(&self) -> &T {
        &self.ticks
    }

    /// 返回包含指定块数据的已加锁缓冲块。
    ///
    /// # 功能说明
    /// 调用 `bget` 获取缓冲块；若其数据尚未从磁盘读入，则读取一次并标记为有效。
    /// 返回的 `Buf` 持有睡眠锁，必须通过 `brelse` 或离开作用域释放。
    ///
    /// # 可能的错误
    /// - 没有可回收的缓冲块时返回 [`BcacheError::NoBuffers`]；
    /// - 磁盘读取失败时返回 [`BcacheError::Device`]，缓冲块保持无效并被释放。
    pub fn bread(&self, dev: u32, blockno: u32) -> Result<Buf<'_>, D::Error> {
        let mut b = self.bget(dev, blockno)?;
        if !b.is_valid() {
            let inner = b.inner_mut();
            self.device
                .read_block(dev, blockno, &mut inner.data.0)
                .map_err(BcacheError::Device)?;
            inner.flags.insert(BufFlags::VALID);
        }
        Ok(b)
    }

    /// 将缓冲块的内容写回磁盘，调用者必须持有其睡眠锁。
    ///
    /// # Panics
    /// `b` 不属于本缓存，或当前线程未持有其睡眠锁。
    pub fn bwrite(&self, b: &mut Buf<'_>) -> Result<(), D::Error> {
        if !self.owns(b) || !b.holding() {
            panic!("bwrite: buffer not locked");
        }
        self.device
            .write_block(b.dev(), b.blockno(), &b.inner().data.0)
            .map_err(BcacheError::Device)
    }

    /// 释放已加锁的缓冲块。
    ///
    /// 先释放睡眠锁，再在所属桶中减少引用计数；引用计数归零时记录时钟，
    /// 此后该缓冲块可被回收。缓冲块不会从索引中移除，之后对同一块的请求仍会命中。
    ///
    /// # Panics
    /// `b` 不属于本缓存，或当前线程未持有其睡眠锁。
    pub fn brelse(&self, b: Buf<'_>) {
        if !self.owns(&b) || !b.holding() {
            panic!("brelse: buffer not locked");
        }
        drop(b);
    }

    /// 钉住缓冲块：引用计数加一，使其在不持有睡眠锁的情况下常驻缓存。
    pub fn bpin(&self, b: &Buf<'_>) -> BufPin<'_> {
        if !self.owns(b) {
            panic!("bpin: buffer from another cache");
        }
        let mut bucket = self.index.bucket_of(b.key).lock();
        let Some(ctrl) = bucket.find(b.slot) else {
            panic!("bpin: buffer {} not indexed", b.slot);
        };
        ctrl.refcnt += 1;
        BufPin {
            index: &self.index,
            slot: b.slot,
            key: b.key,
        }
    }

    /// 解除钉住：引用计数减一，归零时记录时钟。
    ///
    /// # Panics
    /// 凭据不属于本缓存，或缓冲块的引用计数已为 0。
    pub fn bunpin(&self, pin: BufPin<'_>) {
        if !ptr::eq(pin.index, &self.index) {
            panic!("bunpin: pin from another cache");
        }
        let mut bucket = self.index.bucket_of(pin.key).lock();
        let Some(ctrl) = bucket.find(pin.slot) else {
            panic!("bunpin: buffer {} not indexed", pin.slot);
        };
        if ctrl.refcnt == 0 {
            panic!("bunpin: buffer {} not pinned", pin.slot);
        }
        ctrl.refcnt -= 1;
        if ctrl.refcnt == 0 {
            ctrl.ticks = self.ticks.ticks();
        }
    }

    /// 当前在索引中的块，按 `(dev, blockno)` 排序。
    ///
    /// 逐个桶加锁收集，并发修改下不是原子快照。
    pub fn resident(&self) -> Vec<(u32, u32)> {
        let mut keys: Vec<BlockKey> = (0..self.index.nbucket())
            .flat_map(|i| self.index.bucket(i).lock().keys().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys.into_iter().map(|k| (k.dev(), k.blockno())).collect()
    }

    /// 指定块的引用计数，未缓存时返回 `None`
    pub fn refcnt(&self, dev: u32, blockno: u32) -> Option<usize> {
        let key = BlockKey::new(dev, blockno);
        self.index.bucket_of(key).lock().lookup(key).map(|b| b.refcnt)
    }

    fn owns(&self, b: &Buf<'_>) -> bool {
        ptr::eq(b.index, &self.index)
    }

    /// 查找指定设备与块号的缓冲块；未缓存时回收一个空闲缓冲块。
    /// 无论哪种情况，都返回已加锁的缓冲块。
    ///
    /// # 流程解释
    /// 1. 锁住目标桶查找，命中则引用计数加一，解锁后再等待睡眠锁；
    /// 2. 未命中时按桶下标递增扫描，找出时间戳最旧的空闲缓冲块，并保留其所在桶的锁；
    /// 3. 将其从原桶摘下后解锁，此时该缓冲块不在索引中，由当前线程独占；
    /// 4. 锁住目标桶重新检查：其他线程可能已经为同一块装入了缓冲块。
    fn bget(&self, dev: u32, blockno: u32) -> Result<Buf<'_>, D::Error> {
        let key = BlockKey::new(dev, blockno);

        // 查找缓存块
        let hit = self.index.bucket_of(key).lock().lookup(key).map(|b| {
            // 先于增加引用计数检查，panic 被捕获后不会残留引用
            if self.bufs[b.index].holding() {
                panic!("bget: dev {} blockno {} already held by this thread", dev, blockno);
            }
            b.refcnt += 1;
            b.index
        });
        if let Some(slot) = hit {
            trace!("bcache: hit dev {} blockno {} in buffer {}", dev, blockno, slot);
            return Ok(self.lock_buf(slot, key));
        }

        // 未缓存，回收最近最少使用的空闲缓冲区
        let ctrl = self.evict()?;
        let slot = self.install(key, ctrl);
        Ok(self.lock_buf(slot, key))
    }

    /// 回收扫描：找出最旧的空闲缓冲块，将其从索引中摘下并交给调用者。
    /// 尚未缓存任何块的缓冲块优先于已缓存的块。
    ///
    /// 按桶下标递增加锁。只保留当前最优候选所在桶的锁，
    /// 找到更优候选时释放旧的候选桶；本桶没有更优候选时立即解锁。
    fn evict(&self) -> Result<BufCtrl, D::Error> {
        let mut best: Option<Candidate<'_>> = None;
        for i in 0..self.index.nbucket() {
            let guard = self.index.bucket(i).lock();
            let older_than = best.as_ref().map(|c| c.age);
            if let Some((slot, age)) = guard.lru_idle(older_than) {
                // 覆盖旧候选即释放其所在桶的锁
                best = Some(Candidate {
                    bucket: i,
                    guard,
                    slot,
                    age,
                });
            }
        }

        let Some(Candidate { bucket, mut guard, slot, age }) = best else {
            warn!("bcache: no buffers");
            return Err(BcacheError::NoBuffers);
        };
        let Some(ctrl) = guard.remove(slot) else {
            panic!("bget: buffer {} vanished from bucket {}", slot, bucket);
        };
        drop(guard);
        trace!("bcache: evict buffer {} ({:?}) from bucket {}", slot, age, bucket);

        // 引用计数为 0 说明无人持有也无人等待其睡眠锁
        match self.bufs[slot].try_lock() {
            Some(mut inner) => inner.flags.remove(BufFlags::VALID),
            None => panic!("bget: evicted buffer {} is locked", slot),
        }
        Ok(ctrl)
    }

    /// 将回收得到的缓冲块装入目标桶，返回最终被引用的缓冲块下标。
    ///
    /// 若其他线程已为 `key` 装入缓冲块，则改用已有的缓冲块，
    /// 回收得到的缓冲块以哨兵键、引用计数 0 放回目标桶，保持缓冲池大小不变。
    fn install(&self, key: BlockKey, mut ctrl: BufCtrl) -> usize {
        let mut bucket = self.index.bucket_of(key).lock();
        let winner = bucket.lookup(key).map(|b| {
            b.refcnt += 1;
            b.index
        });
        match winner {
            Some(slot) => {
                trace!(
                    "bcache: lost race for dev {} blockno {}, buffer {} returned",
                    key.dev(),
                    key.blockno(),
                    ctrl.index
                );
                ctrl.refcnt = 0;
                bucket.insert(ctrl, None);
                slot
            }
            None => {
                let slot = ctrl.index;
                ctrl.refcnt = 1;
                bucket.insert(ctrl, Some(key));
                slot
            }
        }
    }

    /// 在不持有任何桶锁的情况下等待缓冲块的睡眠锁
    fn lock_buf(&self, slot: usize, key: BlockKey) -> Buf<'_> {
        Buf {
            index: &self.index,
            ticks: &self.ticks,
            slot,
            key,
            inner: Some(self.bufs[slot].lock()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RamDisk;
    use std::panic::{self, AssertUnwindSafe};

    fn cache(nbuf: usize, nbucket: usize) -> Bcache<RamDisk> {
        let config = BcacheConfig::default().with_nbuf(nbuf).with_nbucket(nbucket);
        Bcache::new(config, RamDisk::new(), Ticks::new()).unwrap()
    }

    #[test]
    fn default_config_matches_consts() {
        let c = Bcache::new(BcacheConfig::default(), RamDisk::new(), Ticks::new()).unwrap();
        assert_eq!(c.nbuf(), NBUF);
        assert_eq!(c.nbucket(), NBUCKET);
        assert!(c.resident().is_empty());
    }

    #[test]
    fn zero_sized_config_is_rejected() {
        let zero_buf = BcacheConfig::default().with_nbuf(0);
        assert!(matches!(
            Bcache::new(zero_buf, RamDisk::new(), Ticks::new()),
            Err(BcacheError::InvalidConfig(_))
        ));
        let zero_bucket = BcacheConfig::default().with_nbucket(0);
        assert!(matches!(
            Bcache::new(zero_bucket, RamDisk::new(), Ticks::new()),
            Err(BcacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn lost_race_adopts_winner_and_keeps_pool_size() {
        let c = cache(3, 2);
        let key = BlockKey::new(1, 5);

        // 本线程回收了一个缓冲块，尚未装入目标桶
        let loser = c.evict().unwrap();
        let loser_slot = loser.index;
        assert_eq!(c.index.population(), 2);

        // 与此同时另一个请求完成了同一块的装入
        let winner = c.bread(1, 5).unwrap();
        assert_ne!(winner.slot, loser_slot);

        let slot = c.install(key, loser);
        assert_eq!(slot, winner.slot);
        assert_eq!(c.refcnt(1, 5), Some(2));
        assert_eq!(c.index.population(), 3);
        assert_eq!(c.resident(), vec![(1, 5)]);

        // 放回的缓冲块以哨兵键空闲，可再次被回收
        {
            let mut bucket = c.index.bucket_of(key).lock();
            let b = bucket.find(loser_slot).unwrap();
            assert_eq!(b.key, None);
            assert_eq!(b.refcnt, 0);
        }

        c.index.release(slot, key, &c.ticks);
        drop(winner);
        assert_eq!(c.refcnt(1, 5), Some(0));
    }

    #[test]
    fn evicted_buffer_loses_validity() {
        let c = cache(1, 1);
        let b = c.bread(1, 1).unwrap();
        assert!(b.is_valid());
        c.brelse(b);

        let b = c.bread(1, 2).unwrap();
        assert!(b.is_valid());
        assert_eq!(c.resident(), vec![(1, 2)]);
        assert_eq!(c.device().reads(), 2);
    }

    #[test]
    fn pin_keeps_buffer_from_eviction() {
        let c = cache(1, 1);
        let b = c.bread(1, 1).unwrap();
        let pin = c.bpin(&b);
        assert_eq!((pin.dev(), pin.blockno()), (1, 1));
        c.brelse(b);
        assert_eq!(c.refcnt(1, 1), Some(1));
        assert!(matches!(c.bread(1, 2), Err(BcacheError::NoBuffers)));

        c.bunpin(pin);
        assert_eq!(c.refcnt(1, 1), Some(0));
        assert!(c.bread(1, 2).is_ok());
    }

    #[test]
    fn rereading_a_held_block_panics_without_taking_a_reference() {
        let c = cache(2, 1);
        let b = c.bread(1, 1).unwrap();
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            let _again = c.bread(1, 1);
        }));
        assert!(res.is_err());
        assert_eq!(c.refcnt(1, 1), Some(1));

        c.brelse(b);
        assert_eq!(c.refcnt(1, 1), Some(0));
        assert!(c.bread(1, 1).unwrap().is_valid());
    }

    #[test]
    #[should_panic(expected = "bwrite")]
    fn bwrite_with_buffer_from_another_cache_panics() {
        let a = cache(1, 1);
        let b = cache(1, 1);
        let mut buf = a.bread(1, 1).unwrap();
        let _ = b.bwrite(&mut buf);
    }

    #[test]
    #[should_panic(expected = "brelse")]
    fn brelse_with_buffer_from_another_cache_panics() {
        let a = cache(1, 1);
        let b = cache(1, 1);
        let buf = a.bread(1, 1).unwrap();
        b.brelse(buf);
    }

    #[test]
    #[should_panic(expected = "bunpin")]
    fn bunpin_with_pin_from_another_cache_panics() {
        let a = cache(1, 1);
        let b = cache(1, 1);
        let buf = a.bread(1, 1).unwrap();
        let pin = a.bpin(&buf);
        b.bunpin(pin);
    }
}
