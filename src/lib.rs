//! Budgeted memory-mapped block cache with cross-process write locks
//!
//! 带预算的内存映射块缓存，支持跨进程写锁
//!
//! This library maps large files block by block instead of all at once. The
//! address space held by mapped views stays under a fixed budget, and the
//! least recently used blocks are unmapped to make room. Processes sharing the
//! same files serialize their writers through a small shared-memory table.
//!
//! 本库按块映射大文件，而不是一次性映射整个文件。已映射视图占用的地址空间保持在固定预算之内，
//! 最久未使用的块会被解除映射以腾出空间。共享相同文件的进程通过一张小型共享内存表串行化写入者。
//!
//! # Features
//!
//! - **Bounded address space**: a budget counted in 4KiB units with LRU trimming
//! - **Pinned blocks**: a [`PageHandle`] keeps its block mapped until released
//! - **Growing windows**: files grow transparently as writes pass their end
//! - **Cross-process writers**: per-file spin write locks in shared memory
//!
//! # 特性
//!
//! - **地址空间有界**：以 4KiB 为单位的预算，配合 LRU 裁剪
//! - **固定块**：[`PageHandle`] 在释放前保持其块的映射
//! - **窗口扩展**：写入越过文件末尾时文件会透明地扩展
//! - **跨进程写入者**：共享内存中的按文件自旋写锁
//!
//! # Quick Start
//!
//! # 快速开始
//!
//! ```
//! use mapped_page_cache::{BlockShift, CacheConfig, FileSig, PageCache, Result};
//! # use tempfile::tempdir;
//! # fn main() -> Result<()> {
//! # let dir = tempdir()?;
//! # let path = dir.path().join("data.bin");
//! let file = std::fs::OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .create(true)
//!     .truncate(true)
//!     .open(&path)?;
//!
//! // A 1MiB budget shared by every registered file
//! // 所有注册文件共享 1MiB 预算
//! let config = CacheConfig::default().with_max_mapped_bytes(1 << 20);
//! let cache = PageCache::in_memory(config);
//!
//! let sig = FileSig::new(*b"data.bin\0\0\0\0\0\0\0\0");
//! let id = cache.add_file(file, sig, BlockShift::new(16)?)?;
//!
//! cache.write_unaligned(id, 65_530, b"spans two blocks")?;
//!
//! let mut buf = [0u8; 16];
//! cache.read_unaligned(id, 65_530, &mut buf)?;
//! assert_eq!(&buf, b"spans two blocks");
//!
//! cache.flush(id)?;
//! let _file = cache.remove_file(id, &sig)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Sharing with other processes
//!
//! On unix, [`Coordinator::named`] opens a table in `/dev/shm` that every
//! process using the same name shares. [`Coordinator::in_memory`] keeps the
//! table private to one process.
//!
//! # 与其他进程共享
//!
//! 在 unix 上，[`Coordinator::named`] 在 `/dev/shm` 中打开一张表，使用相同名称的所有进程共享它。
//! [`Coordinator::in_memory`] 使表仅对单个进程可见。
//!
//! # Main Types
//!
//! - [`PageCache`]: The cache itself
//! - [`PageHandle`]: A pin on one block
//! - [`CacheConfig`]: Budget, trim fraction and write-lock policy
//! - [`Coordinator`]: The shared file table and its write locks
//!
//! # 主要类型
//!
//! - [`PageCache`]: 缓存本身
//! - [`PageHandle`]: 对单个块的固定
//! - [`CacheConfig`]: 预算、裁剪比例与写锁策略
//! - [`Coordinator`]: 共享文件表及其写锁

mod cache;
mod error;
mod ipc;

pub use cache::{
    BlockShift, CacheConfig, CacheStats, DEFAULT_AGE_WRAP, DEFAULT_MAX_MAPPED_UNITS,
    DEFAULT_WRITE_LOCK_SPINS, FileId, MAX_BLOCK_SHIFT, PageCache, PageHandle, TrimFraction,
    TrimReport, TrimShortfall, UNIT_SHIFT, UNIT_SIZE, WriteGuard, allocation_granularity,
};
pub use error::{Error, Result};
#[cfg(unix)]
pub use ipc::NamedRegion;
pub use ipc::{
    CURRENT_VERSION, Coordinator, DEFAULT_SLOTS, FileSig, MemoryRegion, SharedRegion, SlotIndex,
    SlotWriteGuard, SpinPolicy, table_size,
};
