//! Budgeted cache of memory-mapped file blocks
//!
//! 带预算的内存映射文件块缓存
//!
//! Registered files are split into fixed-size, power-of-two blocks that are
//! mapped on first touch. The total mapped address space is bounded by a
//! budget counted in 4KiB units; once a new view would exceed it, the least
//! recently used blocks that no [`PageHandle`] pins are unmapped.
//!
//! 已注册的文件被划分为固定大小（2 的幂）的块，在首次访问时映射。
//! 映射的地址空间总量受以 4KiB 为单位的预算约束；一旦新视图会超出预算，
//! 就解除映射最久未使用且未被 [`PageHandle`] 固定的块。
//!
//! # Locking
//!
//! One mutex guards every in-process table. Writers additionally hold the
//! file's cross-process write lock, which is always taken before the mutex.
//! Readers take no write lock and may observe a write in progress.
//!
//! # 加锁
//!
//! 一个互斥锁保护所有进程内的表。写入者还会持有文件的跨进程写锁，该锁总是在互斥锁之前获取。
//! 读取者不获取写锁，可能观察到进行中的写入。

mod budget;
mod config;
mod direct_io;
mod handle;
mod mapper;
mod registry;
mod rw;
mod stats;


pub use budget::{TrimReport, TrimShortfall};
pub use config::{
    BlockShift, CacheConfig, DEFAULT_AGE_WRAP, DEFAULT_MAX_MAPPED_UNITS, DEFAULT_WRITE_LOCK_SPINS,
    MAX_BLOCK_SHIFT, TrimFraction, UNIT_SHIFT, UNIT_SIZE, allocation_granularity,
};
pub use handle::PageHandle;
pub use registry::FileId;
pub use stats::CacheStats;

use crate::error::{Error, Result};
use crate::ipc::{Coordinator, FileSig, SlotIndex, SlotWriteGuard, SpinPolicy};
use budget::{AgeClock, Budget};
use handle::HandleTable;
use parking_lot::Mutex;
use registry::{FileEntry, FileRegistry};
use rw::Transfer;
use stats::Counters;
use std::fs::File;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything the cache mutex guards
///
/// 缓存互斥锁保护的全部状态
pub(crate) struct CacheState {
    pub(crate) registry: FileRegistry,
    pub(crate) budget: Budget,
    pub(crate) clock: AgeClock,
    pub(crate) handles: HandleTable,
    pub(crate) counters: Counters,
}

impl CacheState {
    fn new(config: &CacheConfig) -> Self {
        Self {
            registry: FileRegistry::default(),
            budget: Budget::new(config.max_mapped_units),
            clock: AgeClock::new(config.age_wrap),
            handles: HandleTable::new(),
            counters: Counters::default(),
        }
    }
}

/// Process-wide cache of mapped file blocks
///
/// 进程级的映射文件块缓存
///
/// One instance is meant to serve a whole process. Files coordinate with
/// other processes through the [`Coordinator`] the cache was built with.
///
/// 一个实例通常服务整个进程。文件通过构建缓存时提供的 [`Coordinator`] 与其他进程协调。
///
/// # Examples
///
/// ```
/// # use mapped_page_cache::{BlockShift, CacheConfig, FileSig, PageCache, Result};
/// # use tempfile::tempfile;
/// # fn main() -> Result<()> {
/// let cache = PageCache::in_memory(CacheConfig::default());
/// let file = cache.add_file(tempfile()?, FileSig::new([1; 16]), BlockShift::min())?;
///
/// // Writes may span blocks and grow the file
/// // 写入可以跨越块并扩展文件
/// cache.write_unaligned(file, 4000, b"across a block boundary")?;
///
/// let mut buf = [0u8; 23];
/// cache.read_unaligned(file, 4000, &mut buf)?;
/// assert_eq!(&buf, b"across a block boundary");
///
/// // Pin a block and look at it in place
/// // 固定一个块并就地访问
/// let handle = cache.acquire(file, 0)?;
/// let first = cache.with_page(&handle, |page| page[4000])?;
/// assert_eq!(first, b'a');
/// cache.release(handle)?;
/// # Ok(())
/// # }
/// ```
pub struct PageCache {
    state: Mutex<CacheState>,
    coordinator: Coordinator,
    config: CacheConfig,
}

impl PageCache {
    /// Build a cache that coordinates through `coordinator`
    ///
    /// 构建通过 `coordinator` 进行协调的缓存
    pub fn new(config: CacheConfig, coordinator: Coordinator) -> Self {
        debug!(?config, ?coordinator, "creating page cache");
        Self {
            state: Mutex::new(CacheState::new(&config)),
            coordinator,
            config,
        }
    }

    /// Build a cache whose coordinator is private to this process
    ///
    /// 构建协调器仅在本进程内可见的缓存
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(config, Coordinator::in_memory())
    }

    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    fn spin_policy(&self) -> SpinPolicy {
        SpinPolicy {
            spins: self.config.write_lock_spins,
            timeout: self.config.write_lock_timeout,
        }
    }

    /// Register an open file
    ///
    /// 注册一个已打开的文件
    ///
    /// The file must be open for reading and writing. Nothing is mapped until
    /// a block is first touched.
    ///
    /// 文件必须以读写方式打开。在首次访问某个块之前不会映射任何内容。
    ///
    /// # Errors
    /// - `IpcTableFull` if no shared slot is free for `sig`
    /// - `TooManyFiles` if 65,536 files are already registered
    ///
    /// # Errors
    /// - 如果没有可供 `sig` 使用的共享槽位，返回 `IpcTableFull`
    /// - 已注册 65,536 个文件时返回 `TooManyFiles`
    pub fn add_file(&self, file: File, sig: FileSig, shift: BlockShift) -> Result<FileId> {
        // The region lock is never taken while the cache lock is held.
        let slot = self
            .coordinator
            .slot_for_file(&sig)?
            .ok_or(Error::IpcTableFull {
                capacity: self.coordinator.capacity(),
            })?;

        let mut state = self.state.lock();
        let id = match state.registry.next_id() {
            Ok(id) => id,
            Err(err) => {
                drop(state);
                if let Err(release) = self.coordinator.release_slot(slot) {
                    warn!(%release, slot = slot.get(), "failed to release shared slot");
                }
                return Err(err);
            }
        };
        state.registry.insert(id, FileEntry::new(file, sig, shift, slot));
        debug!(file = %id, ?sig, slot = slot.get(), shift = shift.get(), "added file");
        Ok(id)
    }

    /// Unregister a file and hand it back
    ///
    /// 注销文件并将其交还
    ///
    /// Every view of the file is unmapped and its units refunded. Handles
    /// still pinning its blocks become stale. The id is retired; a later file
    /// may reuse its index under a new generation.
    ///
    /// 文件的所有视图被解除映射，占用的单位被退还。仍固定其块的句柄随之失效。
    /// 该 ID 随之作废；之后的文件可能以新的代数复用其索引。
    ///
    /// # Errors
    /// Returns `UnknownFile` if `id` is not registered or `sig` does not match
    ///
    /// # Errors
    /// 如果 `id` 未注册或 `sig` 不匹配，返回 `UnknownFile`
    pub fn remove_file(&self, id: FileId, sig: &FileSig) -> Result<File> {
        let mut state = self.state.lock();
        if state.registry.get(id)?.sig != *sig {
            return Err(Error::UnknownFile { file: id });
        }
        let mut entry = state.registry.take(id)?;
        let unmapped = entry.unmap_all();
        entry.mapping = None;
        state.budget.refund(unmapped as u64 * entry.shift.units());
        let stale = state.handles.forget_file(id);
        drop(state);

        if let Err(err) = self.coordinator.release_slot(entry.ipc_slot) {
            warn!(file = %id, error = %err, "failed to release shared slot");
        }
        debug!(file = %id, unmapped, stale_handles = stale, "removed file");
        Ok(entry.file)
    }

    /// Pin `block` of `file`, mapping it if needed
    ///
    /// 固定 `file` 的 `block`，必要时进行映射
    ///
    /// The block is kept mapped until the handle is released. Holding many
    /// handles can push the cache over budget; see [`TrimShortfall`].
    ///
    /// 在句柄释放之前块保持映射。持有大量句柄可能使缓存超出预算；参见 [`TrimShortfall`]。
    pub fn acquire(&self, file: FileId, block: u32) -> Result<PageHandle> {
        let mut state = self.state.lock();
        let addr = mapper::resolve(&mut state, &self.config, file, block)?.as_ptr() as usize;
        Ok(state.handles.acquire(file, block, addr))
    }

    /// Give a pin back
    ///
    /// 归还固定
    ///
    /// # Errors
    /// Returns `HandleMisuse` if the handle went stale, e.g. because its file
    /// was removed
    ///
    /// # Errors
    /// 如果句柄已失效（例如其文件已被移除），返回 `HandleMisuse`
    pub fn release(&self, handle: PageHandle) -> Result<()> {
        self.state.lock().handles.release(handle)
    }

    /// Run `f` on the bytes of a pinned block
    ///
    /// 在被固定块的字节上执行 `f`
    ///
    /// The slice is resolved afresh on every call, so it is valid even if the
    /// file's mapping was recreated since the handle was acquired. The cache
    /// lock is held while `f` runs.
    ///
    /// 每次调用都会重新解析切片，因此即使在获取句柄后文件映射被重建，切片依然有效。
    /// `f` 执行期间持有缓存锁。
    pub fn with_page<R>(&self, handle: &PageHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mut state = self.state.lock();
        state.handles.check(handle)?;
        let page = mapper::resolve(&mut state, &self.config, handle.file(), handle.block())?;
        Ok(f(page))
    }

    /// Run `f` on the bytes of a pinned block, mutably
    ///
    /// 以可变方式在被固定块的字节上执行 `f`
    ///
    /// No write lock is taken; use [`lock_for_write`](Self::lock_for_write)
    /// around the call when other writers may touch the same file.
    ///
    /// 不会获取写锁；当其他写入者可能访问同一文件时，请在调用外层使用
    /// [`lock_for_write`](Self::lock_for_write)。
    pub fn with_page_mut<R>(
        &self,
        handle: &PageHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock();
        state.handles.check(handle)?;
        let page = mapper::resolve(&mut state, &self.config, handle.file(), handle.block())?;
        Ok(f(page))
    }

    /// Address the handle table currently records for a pin
    ///
    /// 句柄表当前为该固定记录的地址
    pub fn handle_addr(&self, handle: &PageHandle) -> Result<usize> {
        self.state.lock().handles.addr(handle)
    }

    /// Read a range that lies inside one block
    ///
    /// 读取位于单个块内的范围
    ///
    /// # Errors
    /// Returns `CrossesBlock` if the range does not fit in one block
    ///
    /// # Errors
    /// 如果范围不在单个块内，返回 `CrossesBlock`
    pub fn read_aligned(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        rw::aligned(&mut state, &self.config, file, offset, Transfer::Read(buf))
    }

    /// Read a range that may span blocks
    ///
    /// 读取可能跨越多个块的范围
    pub fn read_unaligned(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        rw::unaligned(&mut state, &self.config, file, offset, Transfer::Read(buf))
    }

    /// Write a range that lies inside one block, under the file's write lock
    ///
    /// 在文件写锁下写入位于单个块内的范围
    ///
    /// # Errors
    /// - `CrossesBlock` if the range does not fit in one block
    /// - `WriteLockTimeout` if the write lock was not obtained in time
    ///
    /// # Errors
    /// - 如果范围不在单个块内，返回 `CrossesBlock`
    /// - 如果未能及时获得写锁，返回 `WriteLockTimeout`
    pub fn write_aligned(&self, file: FileId, offset: u64, data: &[u8]) -> Result<()> {
        self.lock_for_write(file)?.write_aligned(offset, data)
    }

    /// Write a range that may span blocks, under the file's write lock
    ///
    /// 在文件写锁下写入可能跨越多个块的范围
    ///
    /// The lock is held for the whole range.
    ///
    /// 整个范围写入期间持有写锁。
    pub fn write_unaligned(&self, file: FileId, offset: u64, data: &[u8]) -> Result<()> {
        self.lock_for_write(file)?.write_unaligned(offset, data)
    }

    /// Hold the cross-process write lock of `file`
    ///
    /// 持有 `file` 的跨进程写锁
    ///
    /// Writes made through the returned guard do not lock again, so several
    /// of them can be grouped into one exclusive section.
    ///
    /// 通过返回的守卫进行的写入不会再次加锁，因此可以把多次写入组合为一个独占区间。
    ///
    /// # Errors
    /// - `UnknownFile` if `file` is not registered
    /// - `WriteLockTimeout` if the lock was not obtained in time
    ///
    /// # Errors
    /// - 如果 `file` 未注册，返回 `UnknownFile`
    /// - 如果未能及时获得锁，返回 `WriteLockTimeout`
    pub fn lock_for_write(&self, file: FileId) -> Result<WriteGuard<'_>> {
        let slot: SlotIndex = self.state.lock().registry.get(file)?.ipc_slot;
        let started = Instant::now();
        let lock = self
            .coordinator
            .write_lock(slot, self.spin_policy())
            .ok_or_else(|| Error::WriteLockTimeout {
                file,
                waited: started.elapsed(),
            })?;
        Ok(WriteGuard {
            cache: self,
            file,
            _lock: lock,
        })
    }

    /// Run one trim pass now
    ///
    /// 立即执行一次裁剪
    pub fn trim(&self) -> TrimReport {
        let mut state = self.state.lock();
        budget::trim(&mut state, &self.config, None, 0)
    }

    /// Block slots in the file's current mapping window
    ///
    /// 文件当前映射窗口中的块槽位数
    pub fn block_count(&self, file: FileId) -> Result<usize> {
        Ok(self.state.lock().registry.get(file)?.blocks.len())
    }

    /// Bytes covered by the file's mapping window, 0 before the first access
    ///
    /// 文件映射窗口覆盖的字节数，首次访问前为 0
    pub fn window_size(&self, file: FileId) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .registry
            .get(file)?
            .mapping
            .map_or(0, |mapping| mapping.capacity()))
    }

    /// Snapshot of budget usage and event counters
    ///
    /// 预算使用情况与事件计数的快照
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let counters = state.counters;
        CacheStats {
            mapped_units: state.budget.current_units(),
            max_mapped_units: state.budget.max_units(),
            mapped_blocks: state.registry.iter().map(|(_, e)| e.mapped_blocks()).sum(),
            files: state.registry.live_files(),
            live_handles: state.handles.live(),
            trims: counters.trims,
            trim_shortfalls: counters.trim_shortfalls,
            last_shortfall: counters.last_shortfall,
            growths: counters.growths,
            renormalizations: counters.renormalizations,
            write_through_ops: counters.write_through_ops,
        }
    }

    /// Synchronously flush every resident view of `file`
    ///
    /// 同步刷新 `file` 的所有驻留视图
    pub fn flush(&self, file: FileId) -> Result<()> {
        let state = self.state.lock();
        let entry = state.registry.get(file)?;
        for view in entry.blocks.iter().filter_map(|b| b.view.as_ref()) {
            view.flush()?;
        }
        Ok(())
    }

    /// Tear the cache down, reporting the first failure
    ///
    /// 拆除缓存，并报告遇到的第一个错误
    ///
    /// Dropping the cache does the same but can only log failures.
    ///
    /// 丢弃缓存会执行相同操作，但只能记录错误日志。
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let CacheState {
            registry,
            budget,
            handles,
            ..
        } = self.state.get_mut();

        let mut first_error = None;
        for (id, mut entry) in registry.drain() {
            let unmapped = entry.unmap_all();
            budget.refund(unmapped as u64 * entry.shift.units());
            handles.forget_file(id);
            if let Err(err) = self.coordinator.release_slot(entry.ipc_slot) {
                first_error.get_or_insert(err);
            }
            debug!(file = %id, unmapped, "closed file");
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(error = %err, "page cache teardown failed");
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

/// Exclusive write access to one file across processes
///
/// 跨进程对单个文件的独占写访问
///
/// Obtained from [`PageCache::lock_for_write`]; the lock is released when the
/// guard is dropped.
///
/// 通过 [`PageCache::lock_for_write`] 获得；守卫被丢弃时释放锁。
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    cache: &'a PageCache,
    file: FileId,
    _lock: SlotWriteGuard<'a>,
}

impl WriteGuard<'_> {
    #[inline]
    pub fn file(&self) -> FileId {
        self.file
    }

    /// Write a range that lies inside one block
    ///
    /// 写入位于单个块内的范围
    pub fn write_aligned(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.cache.state.lock();
        rw::aligned(&mut state, &self.cache.config, self.file, offset, Transfer::Write(data))
    }

    /// Write a range that may span blocks
    ///
    /// 写入可能跨越多个块的范围
    pub fn write_unaligned(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.cache.state.lock();
        rw::unaligned(&mut state, &self.cache.config, self.file, offset, Transfer::Write(data))
    }
}

impl std::fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGuard").field("file", &self.file).finish()
    }
}
