//! 缓冲块的哈希索引
//!
//! 索引由固定数量、各自加锁的哈希桶组成。每个桶持有一条链，
//! 链上是当前映射到该桶的缓冲块控制信息 `BufCtrl`。
//! 控制信息（键、引用计数、时间戳）只受所在桶的锁保护，从不受缓冲块自身的睡眠锁保护。
//!
//! 缓冲块被回收时，其控制信息从原桶的链上摘下，由回收线程独占持有，
//! 之后再挂到目标桶的链上。任何操作都只触及一个桶的锁，也不会在持锁时等待 I/O。

use bit_field::BitField;

use crate::spinlock::SpinLock;
use crate::ticks::TickSource;

/// 由 `(dev, blockno)` 组成的块标识，`dev` 占高 32 位，`blockno` 占低 32 位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey(u64);

impl BlockKey {
    pub fn new(dev: u32, blockno: u32) -> Self {
        let mut key = 0u64;
        key.set_bits(32..64, dev as u64);
        key.set_bits(0..32, blockno as u64);
        Self(key)
    }

    pub fn dev(self) -> u32 {
        self.0.get_bits(32..64) as u32
    }

    pub fn blockno(self) -> u32 {
        self.0.get_bits(0..32) as u32
    }

    /// 键所属的桶
    pub fn bucket(self, nbucket: usize) -> usize {
        (self.0 % nbucket as u64) as usize
    }
}

/// 缓冲块控制信息
#[derive(Debug)]
pub(crate) struct BufCtrl {
    /// 当前映射的块；`None` 是永不匹配的哨兵键
    pub key: Option<BlockKey>,
    /// 对应缓冲块在缓冲池中的下标，即该缓冲块的身份
    pub index: usize,
    /// 未释放的持有与钉住次数之和
    pub refcnt: usize,
    /// 引用计数最近一次归零时的时钟
    pub ticks: u64,
}

impl BufCtrl {
    const fn new(index: usize) -> Self {
        Self {
            key: None,
            index,
            refcnt: 0,
            ticks: 0,
        }
    }

    pub fn age(&self) -> Age {
        Age {
            bound: self.key.is_some(),
            ticks: self.ticks,
        }
    }
}

/// 回收先后顺序，越小越先被回收。
///
/// 持有哨兵键的缓冲块不缓存任何块，总是先于已绑定的缓冲块被回收；
/// 同类之间再比较时间戳。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Age {
    bound: bool,
    ticks: u64,
}

/// 一个哈希桶的链
///
/// 链的容量在构造时按缓冲池大小预留，持锁期间插入不会触发内存分配。
/// 新插入的条目放在链尾，查找从链尾向前进行，与头插法单链表的顺序一致。
pub(crate) struct Bucket {
    chain: Vec<BufCtrl>,
}

impl Bucket {
    fn with_capacity(nbuf: usize) -> Self {
        Self {
            chain: Vec::with_capacity(nbuf),
        }
    }

    /// 在链上查找键为 `key` 的缓冲块
    pub fn lookup(&mut self, key: BlockKey) -> Option<&mut BufCtrl> {
        self.chain.iter_mut().rev().find(|b| b.key == Some(key))
    }

    /// 按身份（缓冲池下标）查找缓冲块
    pub fn find(&mut self, index: usize) -> Option<&mut BufCtrl> {
        self.chain.iter_mut().rev().find(|b| b.index == index)
    }

    /// 将缓冲块挂到链上，并将其键设为 `key`
    pub fn insert(&mut self, mut ctrl: BufCtrl, key: Option<BlockKey>) {
        debug_assert!(self.chain.len() < self.chain.capacity());
        ctrl.key = key;
        self.chain.push(ctrl);
    }

    /// 按身份将缓冲块从链上摘下，缓冲块不在链上时返回 `None`。
    ///
    /// 不按键删除：键可能已过期或已被改写。
    pub fn remove(&mut self, index: usize) -> Option<BufCtrl> {
        let pos = self.chain.iter().position(|b| b.index == index)?;
        Some(self.chain.remove(pos))
    }

    /// 找出链上引用计数为 0、且严格早于 `older_than` 的最旧缓冲块。
    ///
    /// 返回其缓冲池下标与回收顺序。
    pub fn lru_idle(&self, older_than: Option<Age>) -> Option<(usize, Age)> {
        let mut best = older_than;
        let mut found = None;
        for b in self.chain.iter().rev() {
            let age = b.age();
            if b.refcnt == 0 && best.map_or(true, |t| age < t) {
                best = Some(age);
                found = Some((b.index, age));
            }
        }
        found
    }

    /// 链上已绑定块的键
    pub fn keys(&self) -> impl Iterator<Item = BlockKey> + '_ {
        self.chain.iter().filter_map(|b| b.key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.chain.len()
    }
}

/// 哈希索引：固定数量的桶，每个桶一把自旋锁
pub(crate) struct HashIndex {
    buckets: Box<[SpinLock<Bucket>]>,
}

impl HashIndex {
    /// 构造索引，并将 `nbuf` 个缓冲块以哨兵键轮流预置到各个桶中，
    /// 使整个缓冲池都能被回收扫描遍历到。
    pub fn new(nbuf: usize, nbucket: usize) -> Self {
        let buckets: Box<[SpinLock<Bucket>]> = (0..nbucket)
            .map(|_| SpinLock::new(Bucket::with_capacity(nbuf), "bcache.bucket"))
            .collect();
        for i in 0..nbuf {
            buckets[i % nbucket].lock().insert(BufCtrl::new(i), None);
        }
        Self { buckets }
    }

    pub fn nbucket(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, i: usize) -> &SpinLock<Bucket> {
        &self.buckets[i]
    }

    /// `key` 所属的桶
    pub fn bucket_of(&self, key: BlockKey) -> &SpinLock<Bucket> {
        &self.buckets[key.bucket(self.buckets.len())]
    }

    /// 持有者释放缓冲块后调用：引用计数减一，归零时记录时间戳。
    ///
    /// 缓冲块仍留在索引中，在被回收之前对同一块的请求仍然命中。
    pub fn release(&self, index: usize, key: BlockKey, ticks: &dyn TickSource) {
        let mut bucket = self.bucket_of(key).lock();
        let Some(b) = bucket.find(index) else {
            panic!("brelse: buffer {} not indexed", index);
        };
        if b.refcnt == 0 {
            panic!("brelse: buffer {} refcnt underflow", index);
        }
        b.refcnt -= 1;
        if b.refcnt == 0 {
            b.ticks = ticks.ticks();
        }
    }

    /// 所有桶中的缓冲块总数
    #[cfg(test)]
    pub fn population(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticks::Ticks;

    #[test]
    fn key_packs_dev_high_and_blockno_low() {
        let key = BlockKey::new(1, 10);
        assert_eq!(key, BlockKey((1 << 32) | 10));
        assert_eq!(key.dev(), 1);
        assert_eq!(key.blockno(), 10);

        let max = BlockKey::new(u32::MAX, u32::MAX);
        assert_eq!(max.dev(), u32::MAX);
        assert_eq!(max.blockno(), u32::MAX);
        assert_eq!(BlockKey::new(0, 18).bucket(17), 1);
    }

    #[test]
    fn seeding_spreads_the_pool_round_robin() {
        let index = HashIndex::new(5, 2);
        assert_eq!(index.bucket(0).lock().len(), 3);
        assert_eq!(index.bucket(1).lock().len(), 2);
        assert_eq!(index.population(), 5);
        // 哨兵键不会被任何查找命中
        assert!(index.bucket(0).lock().keys().next().is_none());
        assert!(index.bucket(0).lock().lookup(BlockKey::new(0, 0)).is_none());
    }

    #[test]
    fn remove_is_by_identity() {
        let mut bucket = Bucket::with_capacity(4);
        bucket.insert(BufCtrl::new(0), Some(BlockKey::new(1, 1)));
        bucket.insert(BufCtrl::new(1), Some(BlockKey::new(1, 3)));

        let b = bucket.remove(0).unwrap();
        assert_eq!(b.index, 0);
        assert_eq!(b.key, Some(BlockKey::new(1, 1)));
        assert!(bucket.remove(0).is_none());
        assert!(bucket.lookup(BlockKey::new(1, 1)).is_none());
        assert_eq!(bucket.lookup(BlockKey::new(1, 3)).unwrap().index, 1);
    }

    fn bound(ticks: u64) -> Age {
        Age { bound: true, ticks }
    }

    #[test]
    fn lru_idle_skips_referenced_and_newer() {
        let mut bucket = Bucket::with_capacity(4);
        for (i, (refcnt, ticks)) in [(0, 5), (1, 1), (0, 3), (0, 9)].into_iter().enumerate() {
            let mut b = BufCtrl::new(i);
            b.refcnt = refcnt;
            b.ticks = ticks;
            bucket.insert(b, Some(BlockKey::new(1, i as u32)));
        }
        assert_eq!(bucket.lru_idle(None), Some((2, bound(3))));
        assert_eq!(bucket.lru_idle(Some(bound(4))), Some((2, bound(3))));
        assert_eq!(bucket.lru_idle(Some(bound(3))), None);
    }

    #[test]
    fn unbound_buffers_are_evicted_before_cached_blocks() {
        let mut bucket = Bucket::with_capacity(3);
        // 已缓存块的时间戳与空闲哨兵相同，甚至更旧
        let cached = BufCtrl::new(0);
        bucket.insert(cached, Some(BlockKey::new(1, 10)));
        let mut spare = BufCtrl::new(1);
        spare.ticks = 7;
        bucket.insert(spare, None);
        let newest = BufCtrl::new(2);
        bucket.insert(newest, Some(BlockKey::new(1, 12)));

        assert_eq!(bucket.lru_idle(None).map(|(i, _)| i), Some(1));
        // 任何已绑定块都不会比哨兵更早被回收
        assert_eq!(bucket.lru_idle(Some(Age { bound: false, ticks: 7 })), None);
        assert!(Age { bound: false, ticks: u64::MAX } < bound(0));
    }

    #[test]
    fn release_stamps_only_when_idle() {
        let index = HashIndex::new(1, 1);
        let key = BlockKey::new(2, 7);
        let ticks = Ticks::new();
        {
            let mut bucket = index.bucket(0).lock();
            let mut b = bucket.remove(0).unwrap();
            b.refcnt = 2;
            bucket.insert(b, Some(key));
        }

        index.release(0, key, &ticks);
        assert_eq!(index.bucket(0).lock().find(0).unwrap().ticks, 0);
        assert_eq!(ticks.now(), 0);

        index.release(0, key, &ticks);
        let mut bucket = index.bucket(0).lock();
        let b = bucket.find(0).unwrap();
        assert_eq!(b.refcnt, 0);
        assert_eq!(b.ticks, 1);
    }

    #[test]
    #[should_panic(expected = "brelse")]
    fn release_of_idle_buffer_panics() {
        let index = HashIndex::new(1, 1);
        index.release(0, BlockKey::new(0, 0), &Ticks::new());
    }
}
