//! Cache counters
//!
//! 缓存计数器

use super::budget::TrimShortfall;

/// Event counters kept under the cache lock
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub(crate) trims: u64,
    pub(crate) trim_shortfalls: u64,
    pub(crate) last_shortfall: Option<TrimShortfall>,
    pub(crate) growths: u64,
    pub(crate) renormalizations: u64,
    pub(crate) write_through_ops: u64,
}

/// Point-in-time snapshot of the cache
///
/// 缓存的时间点快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    /// Mapped address space in 4KiB units
    ///
    /// 已映射地址空间（4KiB 单位）
    pub mapped_units: u64,

    /// Configured budget in 4KiB units
    ///
    /// 配置的预算（4KiB 单位）
    pub max_mapped_units: u64,

    pub mapped_blocks: usize,
    pub files: usize,
    pub live_handles: usize,

    /// Trim passes run
    ///
    /// 已执行的裁剪次数
    pub trims: u64,

    /// Trim passes that could not reach their target because of pins
    ///
    /// 因固定而未能达到目标的裁剪次数
    pub trim_shortfalls: u64,

    /// Most recent shortfall, if any
    pub last_shortfall: Option<TrimShortfall>,

    /// Mapping objects recreated to widen a file's window
    ///
    /// 为扩大文件窗口而重建映射对象的次数
    pub growths: u64,

    pub renormalizations: u64,

    /// Block accesses served by direct I/O because mapping failed
    ///
    /// 因映射失败而通过直接 I/O 完成的块访问次数
    pub write_through_ops: u64,
}

impl CacheStats {
    /// Whether the mapped total is currently above the budget
    ///
    /// 当前映射总量是否超出预算
    #[inline]
    pub fn over_budget(&self) -> bool {
        self.mapped_units > self.max_mapped_units
    }
}
