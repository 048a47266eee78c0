//! 内存盘
//!
//! 以内存模拟的块设备。各设备的块按需创建，首次读取时内容全零。
//! 记录读写次数，便于观察缓存是否真正减少了设备访问。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::consts::BSIZE;
use super::BlockDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamDiskError {
    /// 块号超出设备容量
    OutOfRange { dev: u32, blockno: u32 },
}

impl fmt::Display for RamDiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RamDiskError::OutOfRange { dev, blockno } => {
                write!(f, "ramdisk: block {} out of range on dev {}", blockno, dev)
            }
        }
    }
}

impl std::error::Error for RamDiskError {}

pub struct RamDisk {
    blocks: Mutex<HashMap<(u32, u32), Box<[u8; BSIZE]>>>,
    /// 每个设备的块数，`None` 表示不限
    nblocks: Option<u32>,
    /// 每次传输的模拟延迟
    latency: Option<Duration>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            nblocks: None,
            latency: None,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 限制每个设备的块数，越界访问返回 [`RamDiskError::OutOfRange`]
    pub fn with_nblocks(mut self, nblocks: u32) -> Self {
        self.nblocks = Some(nblocks);
        self
    }

    /// 每次读写前休眠 `latency`，模拟慢速设备
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 设备读取次数（只统计成功的读取）
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// 设备写入次数（只统计成功的写入）
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 绕过缓存直接查看块内容
    pub fn peek(&self, dev: u32, blockno: u32) -> Option<[u8; BSIZE]> {
        self.blocks.lock().get(&(dev, blockno)).map(|b| **b)
    }

    /// 绕过缓存直接写入块内容，不计入写入次数
    pub fn poke(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) {
        self.blocks.lock().insert((dev, blockno), Box::new(*data));
    }

    fn check(&self, dev: u32, blockno: u32) -> Result<(), RamDiskError> {
        match self.nblocks {
            Some(n) if blockno >= n => Err(RamDiskError::OutOfRange { dev, blockno }),
            _ => Ok(()),
        }
    }

    fn stall(&self) {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for RamDisk {
    type Error = RamDiskError;

    fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]) -> Result<(), Self::Error> {
        self.check(dev, blockno)?;
        self.stall();
        match self.blocks.lock().get(&(dev, blockno)) {
            Some(block) => data.copy_from_slice(&block[..]),
            None => data.fill(0),
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) -> Result<(), Self::Error> {
        self.check(dev, blockno)?;
        self.stall();
        self.blocks.lock().insert((dev, blockno), Box::new(*data));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
