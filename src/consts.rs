//! 缓存层使用的常量

/// 单个文件系统操作最多写入的块数
pub const MAXOPBLOCKS: usize = 10;

/// 默认的缓冲块数量
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// 默认的哈希桶数量，取素数以减少聚集
pub const NBUCKET: usize = 17;

/// 块大小（字节）
pub const BSIZE: usize = 1024;
