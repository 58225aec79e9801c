//! Shared memory regions guarded by a named lock
//!
//! 由命名锁保护的共享内存区域

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Memory that several coordinators can map, plus the lock guarding it
///
/// 多个协调器可以映射的内存，以及保护它的锁
///
/// Production regions live in OS shared memory and lock across processes;
/// [`MemoryRegion`] only spans the coordinators of one process and suits
/// tests that do not need real cross-process behaviour.
///
/// 生产环境的区域位于操作系统共享内存中，并跨进程加锁；
/// [`MemoryRegion`] 只在单个进程的协调器之间共享，适用于不需要真实跨进程行为的测试。
pub trait SharedRegion: Send + Sync {
    /// Start of the region; stays valid and fixed for the region's lifetime
    ///
    /// 区域起始地址；在区域生命周期内保持有效且不变
    fn base(&self) -> NonNull<u8>;

    /// Length of the region in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until this caller holds the region lock
    ///
    /// 阻塞直到调用者持有区域锁
    fn lock(&self) -> io::Result<()>;

    /// Release the region lock
    ///
    /// # Safety
    ///
    /// The caller must hold the lock through a successful [`lock`](Self::lock).
    ///
    /// # Safety
    ///
    /// 调用者必须通过成功的 [`lock`](Self::lock) 持有该锁。
    unsafe fn unlock(&self);

    /// Human readable name used in diagnostics
    fn describe(&self) -> String;
}

/// Holds a region lock until dropped
pub(crate) struct RegionGuard<'a> {
    region: &'a dyn SharedRegion,
}

impl<'a> RegionGuard<'a> {
    pub(crate) fn lock(region: &'a dyn SharedRegion) -> io::Result<Self> {
        region.lock()?;
        Ok(Self { region })
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        // Safety: constructed only after a successful lock
        unsafe { self.region.unlock() }
    }
}

/// In-process stand-in for OS shared memory
///
/// 操作系统共享内存的进程内替身
///
/// Clones share the same memory and lock, so two coordinators opened on
/// clones of one region behave like two processes sharing a segment.
///
/// 克隆体共享同一块内存和锁，因此在同一区域的克隆上打开的两个协调器
/// 表现得像共享同一段内存的两个进程。
///
/// # Examples
///
/// ```
/// # use mapped_page_cache::{Coordinator, FileSig, MemoryRegion};
/// let region = MemoryRegion::for_slots(16);
/// let a = Coordinator::with_capacity(region.clone(), 16).unwrap();
/// let b = Coordinator::with_capacity(region, 16).unwrap();
///
/// let sig = FileSig::new([7; 16]);
/// assert_eq!(a.slot_for_file(&sig).unwrap(), b.slot_for_file(&sig).unwrap());
/// ```
#[derive(Clone)]
pub struct MemoryRegion {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    words: Box<[AtomicU64]>,
    mutex: RawMutex,
}

impl MemoryRegion {
    /// Zeroed region of at least `len` bytes
    ///
    /// 至少 `len` 字节的全零区域
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Self {
            inner: Arc::new(MemoryInner {
                words,
                mutex: RawMutex::INIT,
            }),
        }
    }

    /// Region sized for a table of `capacity` slots
    pub fn for_slots(capacity: u32) -> Self {
        Self::new(super::layout::table_size(capacity))
    }
}

impl SharedRegion for MemoryRegion {
    fn base(&self) -> NonNull<u8> {
        NonNull::from(&self.inner.words[..]).cast::<u8>()
    }

    fn len(&self) -> usize {
        self.inner.words.len() * 8
    }

    fn lock(&self) -> io::Result<()> {
        self.inner.mutex.lock();
        Ok(())
    }

    unsafe fn unlock(&self) {
        // Safety: forwarded from the trait contract
        unsafe { self.inner.mutex.unlock() }
    }

    fn describe(&self) -> String {
        format!("in-memory region ({} bytes)", self.len())
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("len", &self.len())
            .finish()
    }
}
