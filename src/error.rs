//! Error types for mapped-page-cache
//!
//! mapped-page-cache 的错误类型

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::cache::FileId;

/// Error type for page cache and coordinator operations
///
/// 页缓存与协调器操作的错误类型
///
/// OS refusals surface here as values instead of aborting the process, so the
/// caller can retry, back off, or escalate.
///
/// 操作系统拒绝的操作会以错误值返回，而不是终止进程，调用者可以重试、退避或上报。
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    ///
    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The mapping object of a file could not be created or extended
    ///
    /// 无法创建或扩展文件的映射对象
    #[error("failed to create mapping object of {size} bytes for file {file}: {source}")]
    MappingCreation {
        file: FileId,
        size: u64,
        #[source]
        source: io::Error,
    },

    /// A block view could not be mapped
    ///
    /// 无法映射块视图
    #[error("failed to map block {block} of file {file}: {source}")]
    ViewMap {
        file: FileId,
        block: u32,
        #[source]
        source: io::Error,
    },

    /// Shared memory or the named lock could not be set up
    ///
    /// 无法建立共享内存或命名锁
    #[error("interprocess coordinator unavailable: {reason}")]
    IpcUnavailable { reason: String },

    /// Every slot of the shared file table is bound to a live signature
    ///
    /// 共享文件表的所有槽位都已被占用
    #[error("interprocess file table is full ({capacity} slots)")]
    IpcTableFull { capacity: u32 },

    /// A page handle was released twice or does not belong to a live pin
    ///
    /// 页句柄被重复释放或不对应有效的固定
    #[error("page handle in slot {slot} is not live")]
    HandleMisuse { slot: u32 },

    /// The file id is not registered, or the signature does not match it
    ///
    /// 文件 ID 未注册，或签名不匹配
    #[error("file {file} is not registered with this cache")]
    UnknownFile { file: FileId },

    /// Block shift outside the supported range
    ///
    /// 块位移超出支持范围
    #[error("block shift {shift} outside supported range [{min}, {max}]")]
    InvalidBlockShift { shift: u8, min: u8, max: u8 },

    /// An aligned access would cross a block boundary
    ///
    /// 对齐访问跨越了块边界
    #[error("access of {len} bytes at offset {offset} crosses a {block_size}-byte block boundary")]
    CrossesBlock {
        offset: u64,
        len: usize,
        block_size: u64,
    },

    /// No more file ids can be handed out
    ///
    /// 文件 ID 已耗尽
    #[error("every file id is in use")]
    TooManyFiles,

    /// The per-file write lock was not obtained in time
    ///
    /// 未能在规定时间内获得文件写锁
    #[error("timed out after {waited:?} waiting for the write lock of file {file}")]
    WriteLockTimeout { file: FileId, waited: Duration },
}

impl Error {
    /// Whether this error came from the OS refusing a mapping operation
    ///
    /// 此错误是否来自操作系统拒绝映射操作
    #[inline]
    pub fn is_mapping_failure(&self) -> bool {
        matches!(self, Error::MappingCreation { .. } | Error::ViewMap { .. })
    }
}

/// Convert from Error to io::Error for compatibility
///
/// 从 Error 转换到 io::Error 以保持兼容性
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io_err) => io_err,
            Error::MappingCreation { .. } | Error::ViewMap { .. } => {
                io::Error::new(io::ErrorKind::OutOfMemory, err.to_string())
            }
            Error::IpcUnavailable { .. } => {
                io::Error::new(io::ErrorKind::Unsupported, err.to_string())
            }
            Error::WriteLockTimeout { .. } => {
                io::Error::new(io::ErrorKind::TimedOut, err.to_string())
            }
            Error::IpcTableFull { .. } | Error::TooManyFiles => io::Error::other(err.to_string()),
            _ => io::Error::new(io::ErrorKind::InvalidInput, err.to_string()),
        }
    }
}

/// Result type alias using our custom Error type
///
/// 使用自定义 Error 类型的 Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
