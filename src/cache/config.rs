//! Cache configuration and checked block sizes
//!
//! 缓存配置与经过校验的块大小

use crate::error::{Error, Result};
use std::sync::OnceLock;
use std::time::Duration;

/// Size of one budget unit in bytes (4KiB)
///
/// 一个预算单位的字节数（4KiB）
pub const UNIT_SIZE: u64 = 1 << UNIT_SHIFT;

/// log2 of [`UNIT_SIZE`]
pub const UNIT_SHIFT: u8 = 12;

/// Largest supported block shift (1MiB blocks)
///
/// 支持的最大块位移（1MiB 块）
pub const MAX_BLOCK_SHIFT: u8 = 20;

/// Default budget: 16MiB of mapped address space, in 4KiB units
///
/// 默认预算：16MiB 映射地址空间（以 4KiB 为单位）
pub const DEFAULT_MAX_MAPPED_UNITS: u64 = (16 * 1024 * 1024) / UNIT_SIZE;

/// Default age counter value at which ages are renormalized
///
/// 触发年龄重新归一化的默认计数值
pub const DEFAULT_AGE_WRAP: u32 = 0xF000_0000;

/// Default number of spins between yields while waiting for a write lock
///
/// 等待写锁时两次让出之间的默认自旋次数
pub const DEFAULT_WRITE_LOCK_SPINS: u32 = 64;

/// OS allocation granularity in bytes
///
/// 操作系统分配粒度（字节）
///
/// Views must start at a multiple of this value, so it is the lower bound for
/// the block size. Read once and cached.
///
/// 视图必须从该值的整数倍处开始，因此它是块大小的下限。只读取一次并缓存。
pub fn allocation_granularity() -> u64 {
    static GRANULARITY: OnceLock<u64> = OnceLock::new();
    *GRANULARITY.get_or_init(query_granularity)
}

#[cfg(unix)]
fn query_granularity() -> u64 {
    // Safety: sysconf has no memory-safety preconditions
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 { page as u64 } else { UNIT_SIZE }
}

#[cfg(not(unix))]
fn query_granularity() -> u64 {
    64 * 1024
}

/// log2 of [`allocation_granularity`]
#[inline]
pub fn granularity_shift() -> u8 {
    allocation_granularity().trailing_zeros() as u8
}

/// Checked per-file block size, stored as its log2
///
/// 经过校验的单文件块大小（以 log2 存储）
///
/// The valid range is `[granularity_shift(), MAX_BLOCK_SHIFT]`. A value of this
/// type can only be obtained through [`BlockShift::new`], so every block size
/// handed to the cache is already known to be mappable.
///
/// 有效范围为 `[granularity_shift(), MAX_BLOCK_SHIFT]`。该类型只能通过
/// [`BlockShift::new`] 获得，因此传给缓存的块大小一定可以映射。
///
/// # Examples
///
/// ```
/// # use mapped_page_cache::BlockShift;
/// let shift = BlockShift::new(20).unwrap();
/// assert_eq!(shift.block_size(), 1 << 20);
/// assert!(BlockShift::new(21).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct BlockShift(u8);

impl BlockShift {
    /// Validate a block shift against the OS granularity and [`MAX_BLOCK_SHIFT`]
    ///
    /// 根据操作系统粒度与 [`MAX_BLOCK_SHIFT`] 校验块位移
    ///
    /// # Errors
    /// Returns `InvalidBlockShift` if the shift is out of range
    ///
    /// # Errors
    /// 位移超出范围时返回 `InvalidBlockShift`
    pub fn new(shift: u8) -> Result<Self> {
        let min = granularity_shift().max(UNIT_SHIFT);
        if shift < min || shift > MAX_BLOCK_SHIFT {
            return Err(Error::InvalidBlockShift {
                shift,
                min,
                max: MAX_BLOCK_SHIFT,
            });
        }
        Ok(Self(shift))
    }

    /// Smallest block shift the current OS can map
    ///
    /// 当前操作系统能映射的最小块位移
    #[inline]
    pub fn min() -> Self {
        Self(granularity_shift().max(UNIT_SHIFT))
    }

    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Block size in bytes
    ///
    /// 块大小（字节）
    #[inline]
    pub fn block_size(self) -> u64 {
        1 << self.0
    }

    /// Mask covering the in-block offset bits
    ///
    /// 覆盖块内偏移位的掩码
    #[inline]
    pub fn block_mask(self) -> u64 {
        self.block_size() - 1
    }

    /// Budget units consumed by one mapped block
    ///
    /// 一个已映射块占用的预算单位数
    #[inline]
    pub fn units(self) -> u64 {
        1 << (self.0 - UNIT_SHIFT)
    }

    /// Block index containing a byte offset
    #[inline]
    pub fn block_of(self, offset: u64) -> u64 {
        offset >> self.0
    }

    /// Offset of a byte inside its block
    #[inline]
    pub fn offset_in_block(self, offset: u64) -> u64 {
        offset & self.block_mask()
    }
}

impl TryFrom<u8> for BlockShift {
    type Error = Error;

    fn try_from(shift: u8) -> Result<Self> {
        Self::new(shift)
    }
}

impl From<BlockShift> for u8 {
    fn from(shift: BlockShift) -> u8 {
        shift.0
    }
}

/// Share of mapped blocks released by one trim, in sixty-fourths
///
/// 一次裁剪释放的已映射块比例（以 1/64 为单位）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrimFraction(u8);

impl TrimFraction {
    /// Create a fraction of `sixty_fourths / 64`; must be within `1..=64`
    ///
    /// 创建 `sixty_fourths / 64` 的比例，取值必须在 `1..=64` 之内
    pub const fn new(sixty_fourths: u8) -> Option<Self> {
        if sixty_fourths == 0 || sixty_fourths > 64 {
            None
        } else {
            Some(Self(sixty_fourths))
        }
    }

    #[inline]
    pub fn sixty_fourths(self) -> u8 {
        self.0
    }

    /// Number of blocks out of `mapped` this fraction asks a trim to free
    ///
    /// 对 `mapped` 个块按此比例应释放的块数
    #[inline]
    pub fn quota(self, mapped: usize) -> usize {
        (mapped * self.0 as usize) / 64
    }
}

impl Default for TrimFraction {
    fn default() -> Self {
        Self(16)
    }
}

/// Page cache configuration
///
/// 页缓存配置
///
/// # Examples
///
/// ```
/// # use mapped_page_cache::{CacheConfig, TrimFraction};
/// let config = CacheConfig::default()
///     .with_max_mapped_bytes(64 * 1024 * 1024)
///     .with_trim_fraction(TrimFraction::new(8).unwrap());
/// assert_eq!(config.max_mapped_units, 16384);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
    /// Budget of mapped address space, in 4KiB units
    ///
    /// 映射地址空间预算（以 4KiB 为单位）
    pub max_mapped_units: u64,

    /// Share of mapped blocks released per trim
    ///
    /// 每次裁剪释放的已映射块比例
    pub trim_fraction: TrimFraction,

    /// Age counter value that triggers renormalization
    ///
    /// 触发年龄重新归一化的计数值
    pub age_wrap: u32,

    /// Fall back to direct positioned I/O when a block cannot be mapped
    ///
    /// 块无法映射时回退到直接定位 I/O
    pub write_through: bool,

    /// Spins between yields while waiting for a write lock
    ///
    /// 等待写锁时两次让出之间的自旋次数
    pub write_lock_spins: u32,

    /// Give up waiting for a write lock after this long; `None` waits forever
    ///
    /// 等待写锁的超时时间；`None` 表示一直等待
    pub write_lock_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_mapped_units: DEFAULT_MAX_MAPPED_UNITS,
            trim_fraction: TrimFraction::default(),
            age_wrap: DEFAULT_AGE_WRAP,
            write_through: false,
            write_lock_spins: DEFAULT_WRITE_LOCK_SPINS,
            write_lock_timeout: None,
        }
    }
}

impl CacheConfig {
    pub fn with_max_mapped_units(mut self, units: u64) -> Self {
        self.max_mapped_units = units;
        self
    }

    /// Set the budget in bytes, rounded down to whole units
    ///
    /// 以字节设置预算，向下取整到完整单位
    pub fn with_max_mapped_bytes(mut self, bytes: u64) -> Self {
        self.max_mapped_units = bytes >> UNIT_SHIFT;
        self
    }

    pub fn with_trim_fraction(mut self, fraction: TrimFraction) -> Self {
        self.trim_fraction = fraction;
        self
    }

    /// Lower the renormalization threshold (at least 2)
    ///
    /// 调整重新归一化阈值（至少为 2）
    pub fn with_age_wrap(mut self, wrap: u32) -> Self {
        self.age_wrap = wrap.max(2);
        self
    }

    pub fn with_write_through(mut self, enabled: bool) -> Self {
        self.write_through = enabled;
        self
    }

    pub fn with_write_lock_spins(mut self, spins: u32) -> Self {
        self.write_lock_spins = spins.max(1);
        self
    }

    pub fn with_write_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_lock_timeout = timeout;
        self
    }
}
