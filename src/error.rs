//! 缓存层错误类型

use std::fmt;

/// 缓存层操作可能返回的错误
///
/// `E` 为下层块设备的错误类型，设备错误不经解释原样携带。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BcacheError<E> {
    /// 构造参数不合法
    InvalidConfig(&'static str),
    /// 所有缓冲块都被引用，没有可回收的块
    NoBuffers,
    /// 块设备返回的错误
    Device(E),
}

pub type Result<T, E> = core::result::Result<T, BcacheError<E>>;

impl<E: fmt::Display> fmt::Display for BcacheError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BcacheError::InvalidConfig(why) => write!(f, "bcache: invalid config: {}", why),
            BcacheError::NoBuffers => f.write_str("bcache: no buffers"),
            BcacheError::Device(e) => write!(f, "bcache: device error: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BcacheError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BcacheError::Device(e) => Some(e),
            _ => None,
        }
    }
}
