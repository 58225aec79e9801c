//! Cross-process file table and write locks
//!
//! 跨进程文件表与写锁
//!
//! Every process that caches the same files maps one shared table. A file is
//! bound to a slot by its 16-byte [`FileSig`]; the slot carries an alive count
//! of the processes using it and a spin write lock that serializes writers of
//! that file across all of them.
//!
//! 所有缓存相同文件的进程都映射同一张共享表。文件通过其 16 字节的 [`FileSig`] 绑定到槽位；
//! 槽位记录正在使用它的进程数，以及一个在所有进程间串行化该文件写入者的自旋写锁。
//!
//! Slot assignment happens under the region lock. The write lock is a plain
//! atomic flag and never touches the region lock.
//!
//! 槽位分配在区域锁下进行。写锁只是一个原子标志，不涉及区域锁。

mod layout;
#[cfg(unix)]
mod named;
mod region;

#[cfg(test)]
mod tests;

pub use layout::{CURRENT_VERSION, DEFAULT_SLOTS, table_size};
#[cfg(unix)]
pub use named::NamedRegion;
pub use region::{MemoryRegion, SharedRegion};

use crate::error::{Error, Result};
use layout::{TABLE_ALIGN, TableView};
use region::RegionGuard;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

/// 16 opaque bytes naming a file across processes
///
/// 跨进程标识文件的 16 个不透明字节
///
/// Signatures are compared byte for byte; how they are derived (volume and
/// file index, a path hash, a UUID) is up to the caller.
///
/// 签名按字节比较；如何生成（卷与文件索引、路径哈希、UUID）由调用者决定。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileSig([u8; 16]);

impl FileSig {
    #[inline]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The signature as the two words stored in a slot
    fn words(&self) -> [u64; 2] {
        let (lo, hi) = self.0.split_at(8);
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(lo);
        b.copy_from_slice(hi);
        [u64::from_ne_bytes(a), u64::from_ne_bytes(b)]
    }
}

impl From<[u8; 16]> for FileSig {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for FileSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileSig(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Index of a slot in the shared table
///
/// 共享表中槽位的索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u32);

impl SlotIndex {
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(index: u32) -> Self {
        Self(index)
    }
}

/// How long a writer spins for a slot's write lock
///
/// 写入者为槽位写锁自旋的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    /// Failed attempts between yields to the scheduler
    ///
    /// 两次让出调度器之间的失败尝试次数
    pub spins: u32,

    /// Give up after this long; `None` waits forever
    ///
    /// 超过此时间放弃；`None` 表示永久等待
    pub timeout: Option<Duration>,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self {
            spins: crate::cache::DEFAULT_WRITE_LOCK_SPINS,
            timeout: None,
        }
    }
}

/// Handle on the shared file table
///
/// 共享文件表的句柄
///
/// # Examples
///
/// ```
/// # use mapped_page_cache::{Coordinator, FileSig, SpinPolicy};
/// let coordinator = Coordinator::in_memory();
/// let sig = FileSig::new(*b"0123456789abcdef");
///
/// let slot = coordinator.slot_for_file(&sig).unwrap().unwrap();
/// assert_eq!(coordinator.alive_count(slot), Some(1));
///
/// let guard = coordinator.write_lock(slot, SpinPolicy::default()).unwrap();
/// assert!(coordinator.try_write_lock(slot).is_none());
/// drop(guard);
///
/// coordinator.release_slot(slot).unwrap();
/// ```
pub struct Coordinator {
    region: Box<dyn SharedRegion>,
    capacity: u32,
}

impl Coordinator {
    /// Open a table of [`DEFAULT_SLOTS`] slots in `region`
    pub fn open(region: impl SharedRegion + 'static) -> Result<Self> {
        Self::with_capacity(region, DEFAULT_SLOTS)
    }

    /// Open a table of `capacity` slots in `region`
    ///
    /// 在 `region` 中打开包含 `capacity` 个槽位的表
    ///
    /// The first opener of a zeroed region initializes the table. Later openers
    /// check that the layout version and capacity match.
    ///
    /// 全零区域的第一个打开者负责初始化表。之后的打开者检查布局版本和容量是否一致。
    ///
    /// # Errors
    /// Returns `IpcUnavailable` if the region is too small or misaligned, or
    /// holds a table with another layout. Returns `Io` if the region lock fails.
    ///
    /// # Errors
    /// 如果区域过小、未对齐或包含其他布局的表，返回 `IpcUnavailable`。
    /// 如果区域锁失败，返回 `Io`。
    pub fn with_capacity(region: impl SharedRegion + 'static, capacity: u32) -> Result<Self> {
        let needed = table_size(capacity);
        if region.len() < needed {
            return Err(Error::IpcUnavailable {
                reason: format!(
                    "{} holds {} bytes, table of {capacity} slots needs {needed}",
                    region.describe(),
                    region.len()
                ),
            });
        }
        if region.base().as_ptr() as usize % TABLE_ALIGN != 0 {
            return Err(Error::IpcUnavailable {
                reason: format!("{} is not {TABLE_ALIGN}-byte aligned", region.describe()),
            });
        }

        let coordinator = Self {
            region: Box::new(region),
            capacity,
        };
        coordinator.init_table()?;
        Ok(coordinator)
    }

    fn init_table(&self) -> Result<()> {
        let _guard = RegionGuard::lock(self.region.as_ref())?;
        let table = self.table();
        let version = table.header.version.load(Ordering::Acquire);

        if version == 0 {
            for slot in table.slots {
                slot.sig[0].store(0, Ordering::Relaxed);
                slot.sig[1].store(0, Ordering::Relaxed);
                slot.alive.store(0, Ordering::Relaxed);
            }
            for lock in table.locks {
                lock.flag.store(0, Ordering::Relaxed);
            }
            table.header.capacity.store(self.capacity, Ordering::Relaxed);
            table.header.version.store(CURRENT_VERSION, Ordering::Release);
            info!(
                region = %self.region.describe(),
                capacity = self.capacity,
                "initialized shared file table"
            );
            return Ok(());
        }

        if version != CURRENT_VERSION {
            return Err(Error::IpcUnavailable {
                reason: format!(
                    "{} holds table version {version}, expected {CURRENT_VERSION}",
                    self.region.describe()
                ),
            });
        }
        let existing = table.header.capacity.load(Ordering::Relaxed);
        if existing != self.capacity {
            return Err(Error::IpcUnavailable {
                reason: format!(
                    "{} holds a table of {existing} slots, expected {}",
                    self.region.describe(),
                    self.capacity
                ),
            });
        }
        Ok(())
    }

    /// Coordinator over a private in-memory table
    ///
    /// 基于私有内存表的协调器
    ///
    /// Nothing outside this coordinator can see the table, so write locks only
    /// exclude writers inside this process.
    ///
    /// 该表对协调器之外不可见，因此写锁只排斥本进程内的写入者。
    pub fn in_memory() -> Self {
        Self {
            region: Box::new(MemoryRegion::for_slots(DEFAULT_SLOTS)),
            capacity: DEFAULT_SLOTS,
        }
        .initialized()
    }

    // A fresh memory region is zeroed, aligned and large enough, and its lock
    // cannot fail.
    fn initialized(self) -> Self {
        let result = self.init_table();
        if let Err(err) = &result {
            let region = self.region.describe();
            warn!(%err, %region, "in-memory table failed to initialize");
        }
        debug_assert!(result.is_ok(), "in-memory table failed to initialize: {result:?}");
        self
    }

    /// Coordinator over the shared segment called `name`
    ///
    /// 基于名为 `name` 的共享段的协调器
    ///
    /// # Errors
    /// Returns `IpcUnavailable` if the segment cannot be opened or holds
    /// another layout
    ///
    /// # Errors
    /// 如果无法打开共享段或其布局不同，返回 `IpcUnavailable`
    #[cfg(unix)]
    pub fn named(name: &str) -> Result<Self> {
        let region = NamedRegion::named(name, table_size(DEFAULT_SLOTS)).map_err(|err| {
            Error::IpcUnavailable {
                reason: format!("cannot open shared segment {name:?}: {err}"),
            }
        })?;
        Self::open(region)
    }

    /// Coordinator over the shared segment file at `path`
    #[cfg(unix)]
    pub fn at_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let region = NamedRegion::open(path, table_size(DEFAULT_SLOTS)).map_err(|err| {
            Error::IpcUnavailable {
                reason: format!("cannot open shared segment {}: {err}", path.display()),
            }
        })?;
        Self::open(region)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn table(&self) -> TableView<'_> {
        // Safety: size and alignment were checked when the coordinator was
        // built, and the region stays mapped for as long as `self`.
        unsafe { TableView::from_raw(self.region.base(), self.capacity) }
    }

    /// Bind `sig` to a slot and count this user in
    ///
    /// 将 `sig` 绑定到槽位并把当前使用者计入
    ///
    /// A slot already bound to `sig` is shared; otherwise the first slot with
    /// no users is taken over. Returns `None` when every slot is in use.
    ///
    /// 已绑定到 `sig` 的槽位会被共享；否则接管第一个没有使用者的槽位。
    /// 所有槽位都被占用时返回 `None`。
    pub fn slot_for_file(&self, sig: &FileSig) -> Result<Option<SlotIndex>> {
        let _guard = RegionGuard::lock(self.region.as_ref())?;
        let table = self.table();
        let words = sig.words();

        let matching = table.slots.iter().position(|slot| {
            slot.alive.load(Ordering::Acquire) > 0
                && slot.sig[0].load(Ordering::Relaxed) == words[0]
                && slot.sig[1].load(Ordering::Relaxed) == words[1]
        });
        let index = match matching {
            Some(index) => index,
            None => {
                let Some(index) = table
                    .slots
                    .iter()
                    .position(|slot| slot.alive.load(Ordering::Acquire) == 0)
                else {
                    return Ok(None);
                };
                let slot = &table.slots[index];
                slot.sig[0].store(words[0], Ordering::Relaxed);
                slot.sig[1].store(words[1], Ordering::Relaxed);
                index
            }
        };

        let alive = table.slots[index].alive.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(?sig, slot = index, alive, "bound file to slot");
        Ok(Some(SlotIndex(index as u32)))
    }

    /// Count one user of `slot` out
    ///
    /// 将 `slot` 的一个使用者移出计数
    ///
    /// The slot keeps its signature but can be taken over once no user is left.
    ///
    /// 槽位保留其签名，但在没有使用者后可以被接管。
    ///
    /// # Errors
    /// Returns `HandleMisuse` if the slot is out of range or has no users
    ///
    /// # Errors
    /// 如果槽位越界或没有使用者，返回 `HandleMisuse`
    pub fn release_slot(&self, slot: SlotIndex) -> Result<()> {
        let _guard = RegionGuard::lock(self.region.as_ref())?;
        let table = self.table();
        let entry = table
            .slots
            .get(slot.0 as usize)
            .ok_or(Error::HandleMisuse { slot: slot.0 })?;
        if entry.alive.load(Ordering::Acquire) == 0 {
            return Err(Error::HandleMisuse { slot: slot.0 });
        }
        let alive = entry.alive.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(slot = slot.0, alive, "released slot");
        Ok(())
    }

    /// Users currently counted on `slot`, `None` if out of range
    pub fn alive_count(&self, slot: SlotIndex) -> Option<u32> {
        self.table()
            .slots
            .get(slot.0 as usize)
            .map(|entry| entry.alive.load(Ordering::Acquire))
    }

    fn lock_flag(&self, slot: SlotIndex) -> Option<&AtomicU32> {
        let locks = self.table().locks;
        locks.get(slot.0 as usize).map(|lock| &lock.flag)
    }

    /// Take the write lock of `slot` if it is free right now
    ///
    /// 如果 `slot` 的写锁当前空闲则获取它
    pub fn try_write_lock(&self, slot: SlotIndex) -> Option<SlotWriteGuard<'_>> {
        let flag = self.lock_flag(slot)?;
        flag.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SlotWriteGuard { flag })
    }

    /// Spin until the write lock of `slot` is taken
    ///
    /// 自旋直到获得 `slot` 的写锁
    ///
    /// The loop yields to the scheduler every `policy.spins` failed attempts.
    /// Returns `None` if the slot is out of range or the timeout runs out.
    /// The lock is unfair: a waiter may be overtaken any number of times.
    ///
    /// 每失败 `policy.spins` 次就让出调度器。如果槽位越界或超时，返回 `None`。
    /// 该锁不公平：等待者可能被任意多次超越。
    pub fn write_lock(&self, slot: SlotIndex, policy: SpinPolicy) -> Option<SlotWriteGuard<'_>> {
        let flag = self.lock_flag(slot)?;
        let spins = policy.spins.max(1);
        let deadline = policy.timeout.map(|timeout| Instant::now() + timeout);
        let mut attempts = 0u32;
        loop {
            if flag
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(SlotWriteGuard { flag });
            }
            attempts = attempts.wrapping_add(1);
            if attempts % spins == 0 {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return None;
                }
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("region", &self.region.describe())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Holds a slot's write lock; dropping it releases the lock
///
/// 持有槽位写锁；释放守卫即释放锁
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct SlotWriteGuard<'a> {
    flag: &'a AtomicU32,
}

impl Drop for SlotWriteGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(0, Ordering::Release);
    }
}

impl fmt::Debug for SlotWriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotWriteGuard").finish_non_exhaustive()
    }
}
