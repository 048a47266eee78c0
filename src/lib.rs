//! 块缓冲区缓存
//!
//! 将最近使用的磁盘块保存在内存中，合并对同一块的并发读写，并减少实际的设备 I/O。
//! 缓冲块按 `(dev, blockno)` 散列到各自加锁的哈希桶中，没有全局锁；
//! 回收时以引用计数归零时的时钟近似全局 LRU。
//!
//! ```
//! use bcache::{Bcache, BcacheConfig, RamDisk, Ticks};
//!
//! let cache = Bcache::new(BcacheConfig::default(), RamDisk::new(), Ticks::new()).unwrap();
//! let mut b = cache.bread(1, 10).unwrap();
//! b.data_mut()[0] = 0xaa;
//! cache.bwrite(&mut b).unwrap();
//! cache.brelse(b);
//!
//! assert_eq!(cache.device().peek(1, 10).unwrap()[0], 0xaa);
//! ```

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

pub mod bio;
pub mod consts;
pub mod driver;
pub mod error;
pub mod sleeplock;
pub mod spinlock;
pub mod ticks;

mod process;

pub use bio::{Bcache, BcacheConfig, BlockKey, Buf, BufFlags, BufPin};
pub use driver::{BlockDevice, RamDisk, RamDiskError};
pub use error::{BcacheError, Result};
pub use ticks::{TickSource, Ticks};
