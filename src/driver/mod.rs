//! 块设备驱动接口
//!
//! 缓存层只通过 [`BlockDevice`] 与下层设备交互：同步读写整块数据，
//! 设备返回的错误原样向上传递，缓存层既不重试也不解释。

mod ramdisk;

pub use ramdisk::{RamDisk, RamDiskError};

use crate::consts::BSIZE;

/// 同步块设备
pub trait BlockDevice {
    /// 设备自身的错误类型
    type Error;

    /// 将 `(dev, blockno)` 的内容读入 `data`
    fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]) -> Result<(), Self::Error>;

    /// 将 `data` 写入 `(dev, blockno)`
    fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) -> Result<(), Self::Error>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    type Error = D::Error;

    fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]) -> Result<(), Self::Error> {
        (**self).read_block(dev, blockno, data)
    }

    fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) -> Result<(), Self::Error> {
        (**self).write_block(dev, blockno, data)
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<D> {
    type Error = D::Error;

    fn read_block(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]) -> Result<(), Self::Error> {
        (**self).read_block(dev, blockno, data)
    }

    fn write_block(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) -> Result<(), Self::Error> {
        (**self).write_block(dev, blockno, data)
    }
}
