//! File-backed shared memory for unix targets
//!
//! unix 平台上基于文件的共享内存

use super::region::SharedRegion;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

/// Shared table segment mapped from a file under `/dev/shm` or the temp dir
///
/// 从 `/dev/shm` 或临时目录下的文件映射的共享表段
///
/// The region lock is an advisory `flock(2)` on the segment file, so every
/// process (and every separately opened instance inside one process) that
/// opens the same path contends on it. Threads sharing one instance are
/// serialized by a local mutex first, since `flock` is held per open file.
///
/// 区域锁是段文件上的建议性 `flock(2)`，因此打开同一路径的每个进程
/// （以及同一进程内分别打开的每个实例）都会竞争它。共享同一实例的线程先由本地互斥锁串行化，
/// 因为 `flock` 是按打开的文件持有的。
pub struct NamedRegion {
    path: PathBuf,
    file: File,
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
    local: RawMutex,
}

// Safety: `base` points into `_map`, which lives as long as the region and is
// only accessed through atomics.
unsafe impl Send for NamedRegion {}
unsafe impl Sync for NamedRegion {}

impl NamedRegion {
    /// Open or create the segment at `path`, at least `len` bytes long
    ///
    /// 打开或创建位于 `path` 的段，长度至少为 `len` 字节
    ///
    /// # Errors
    /// Returns the OS error if the file cannot be opened, locked, sized or mapped
    ///
    /// # Errors
    /// 如果文件无法打开、加锁、调整大小或映射，返回操作系统错误
    pub fn open(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // Size the segment under the lock so a concurrent opener never maps a
        // half-extended file.
        flock(&file, libc::LOCK_EX)?;
        let sized = file.metadata().and_then(|meta| {
            if meta.len() < len as u64 {
                file.set_len(len as u64)
            } else {
                Ok(())
            }
        });
        let unlocked = flock(&file, libc::LOCK_UN);
        sized?;
        unlocked?;

        // Safety: the segment is only ever accessed through atomics, by this
        // and every other process that maps it.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| io::Error::other("mapping returned a null pointer"))?;
        debug!(path = %path.display(), len, "opened shared segment");

        Ok(Self {
            path,
            file,
            _map: map,
            base,
            len,
            local: RawMutex::INIT,
        })
    }

    /// Open the segment called `name` in the shared-memory directory
    ///
    /// 在共享内存目录中打开名为 `name` 的段
    ///
    /// Uses `/dev/shm` when present and the temp dir otherwise.
    ///
    /// 存在 `/dev/shm` 时使用它，否则使用临时目录。
    pub fn named(name: &str, len: usize) -> io::Result<Self> {
        if name.is_empty() || name.contains('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid segment name {name:?}"),
            ));
        }
        Self::open(segment_dir().join(name), len)
    }

    /// Path of the segment file
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    loop {
        // Safety: the descriptor is owned by `file` and open for the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl SharedRegion for NamedRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn lock(&self) -> io::Result<()> {
        self.local.lock();
        if let Err(err) = flock(&self.file, libc::LOCK_EX) {
            // Safety: locked just above
            unsafe { self.local.unlock() };
            return Err(err);
        }
        Ok(())
    }

    unsafe fn unlock(&self) {
        // Unlocking a held flock does not fail for a valid descriptor
        let _ = flock(&self.file, libc::LOCK_UN);
        // Safety: forwarded from the trait contract
        unsafe { self.local.unlock() }
    }

    fn describe(&self) -> String {
        format!("shared segment {}", self.path.display())
    }
}

impl std::fmt::Debug for NamedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}
