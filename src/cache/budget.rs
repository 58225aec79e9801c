//! Mapped-unit budget, LRU ages and trimming
//!
//! 映射单位预算、LRU 年龄与裁剪
//!
//! Every mapped block is charged `block_size / 4KiB` units. When mapping a
//! block would push the total over the budget, [`trim`] unmaps the least
//! recently touched blocks that are not pinned.
//!
//! 每个已映射块按 `块大小 / 4KiB` 计费。当映射新块会使总量超出预算时，
//! [`trim`] 会解除映射最久未访问且未被固定的块。
//!
//! Ages come from a single counter shared by every file. Before the counter
//! reaches `age_wrap`, all mapped blocks are re-ranked `0..N` by their current
//! age and the counter restarts at `N`, which keeps relative recency intact.
//!
//! 年龄来自所有文件共享的单个计数器。计数器达到 `age_wrap` 时，
//! 所有已映射块按当前年龄重新排名为 `0..N`，计数器从 `N` 重新开始，相对新旧顺序保持不变。

use super::CacheState;
use super::config::CacheConfig;
use super::registry::{FileId, FileRegistry};
use std::collections::HashSet;
use tracing::{trace, warn};

/// Running total of mapped units against the configured maximum
///
/// 已映射单位的累计值与配置上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Budget {
    current_units: u64,
    max_units: u64,
}

impl Budget {
    pub(crate) fn new(max_units: u64) -> Self {
        Self {
            current_units: 0,
            max_units,
        }
    }

    #[inline]
    pub(crate) fn current_units(&self) -> u64 {
        self.current_units
    }

    #[inline]
    pub(crate) fn max_units(&self) -> u64 {
        self.max_units
    }

    /// Whether adding `incoming` units would leave the cache over budget
    ///
    /// 增加 `incoming` 个单位后是否超出预算
    #[inline]
    pub(crate) fn would_exceed(&self, incoming: u64) -> bool {
        self.current_units + incoming > self.max_units
    }

    /// Units that must be released before `incoming` fits
    #[inline]
    pub(crate) fn excess(&self, incoming: u64) -> u64 {
        (self.current_units + incoming).saturating_sub(self.max_units)
    }

    #[inline]
    pub(crate) fn charge(&mut self, units: u64) {
        self.current_units += units;
    }

    #[inline]
    pub(crate) fn refund(&mut self, units: u64) {
        debug_assert!(units <= self.current_units);
        self.current_units = self.current_units.saturating_sub(units);
    }
}

/// Global logical clock for LRU ages
///
/// 用于 LRU 年龄的全局逻辑时钟
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AgeClock {
    date: u32,
    wrap: u32,
}

impl AgeClock {
    pub(crate) fn new(wrap: u32) -> Self {
        Self { date: 0, wrap }
    }

    #[cfg(test)]
    pub(crate) fn date(&self) -> u32 {
        self.date
    }

    /// Stamp a mapped block with the next age
    ///
    /// 为已映射块打上下一个年龄
    ///
    /// Returns `true` when the stamp triggered a renormalization pass.
    ///
    /// 如果此次打戳触发了重新归一化，返回 `true`。
    pub(crate) fn touch(&mut self, registry: &mut FileRegistry, file: FileId, block: u32) -> bool {
        if let Some(b) = registry.block_mut(file, block) {
            b.age = self.date;
        }
        self.date += 1;
        if self.date >= self.wrap {
            self.renormalize(registry);
            true
        } else {
            false
        }
    }

    /// Re-rank every mapped block `0..N` by age and restart the counter at `N`
    ///
    /// 按年龄将所有已映射块重新排名为 `0..N`，计数器从 `N` 重新开始
    pub(crate) fn renormalize(&mut self, registry: &mut FileRegistry) {
        let mut all = registry.collect_mapped();
        all.sort_by_key(|b| b.age);
        for (rank, mapped) in all.iter().enumerate() {
            if let Some(b) = registry.block_mut(mapped.file, mapped.block) {
                b.age = rank as u32;
            }
        }
        self.date = all.len() as u32;
        trace!(blocks = all.len(), "renormalized block ages");
    }
}

/// A trim that could not free as much as it was asked to
///
/// 未能释放预期数量的裁剪
///
/// Not an error: the triggering call still succeeds and the budget is
/// exceeded until enough pins are released.
///
/// 这不是错误：触发调用仍然成功，预算会被暂时超出，直到足够多的固定被释放。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrimShortfall {
    pub wanted_blocks: usize,
    pub freed_blocks: usize,
    pub wanted_units: u64,
    pub freed_units: u64,
}

/// Outcome of one trim pass
///
/// 一次裁剪的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrimReport {
    /// Mapped blocks seen before trimming
    ///
    /// 裁剪前的已映射块数
    pub candidates: usize,
    pub freed_blocks: usize,
    pub freed_units: u64,
    /// Set when pinned blocks kept the trim from reaching its target
    ///
    /// 固定的块使裁剪无法达到目标时设置
    pub shortfall: Option<TrimShortfall>,
}

/// Unmap the least recently used unpinned blocks across every file
///
/// 在所有文件中解除映射最久未使用且未被固定的块
///
/// The pass stops once it has freed both the configured fraction of mapped
/// blocks and enough units for `incoming` to fit under the budget. `protect`
/// names a block that is about to be handed out and must survive the pass.
///
/// 当释放的块数达到配置比例，且释放的单位足以让 `incoming` 落在预算内时停止。
/// `protect` 指定即将返回给调用者、必须保留的块。
pub(crate) fn trim(
    state: &mut CacheState,
    config: &CacheConfig,
    protect: Option<(FileId, u32)>,
    incoming: u64,
) -> TrimReport {
    let mut all = state.registry.collect_mapped();
    all.sort_by_key(|b| b.age);

    let pinned: HashSet<(FileId, u32)> = state.handles.pinned().collect();
    let wanted_blocks = config.trim_fraction.quota(all.len());
    let wanted_units = state.budget.excess(incoming);

    let mut report = TrimReport {
        candidates: all.len(),
        ..TrimReport::default()
    };
    for mapped in &all {
        if report.freed_blocks >= wanted_blocks && report.freed_units >= wanted_units {
            break;
        }
        let key = (mapped.file, mapped.block);
        if pinned.contains(&key) || protect == Some(key) {
            continue;
        }
        let Ok(entry) = state.registry.get_mut(mapped.file) else {
            continue;
        };
        if entry.unmap_block(mapped.block) {
            let units = entry.shift.units();
            state.budget.refund(units);
            report.freed_blocks += 1;
            report.freed_units += units;
        }
    }

    state.counters.trims += 1;
    if report.freed_blocks < wanted_blocks || report.freed_units < wanted_units {
        let shortfall = TrimShortfall {
            wanted_blocks,
            freed_blocks: report.freed_blocks,
            wanted_units,
            freed_units: report.freed_units,
        };
        warn!(
            ?shortfall,
            pinned = pinned.len(),
            current_units = state.budget.current_units(),
            max_units = state.budget.max_units(),
            "trim could not free enough blocks, too many handles are outstanding"
        );
        state.counters.trim_shortfalls += 1;
        state.counters.last_shortfall = Some(shortfall);
        report.shortfall = Some(shortfall);
    }
    trace!(?report, "trim finished");
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_accounting() {
        let mut budget = Budget::new(4);
        assert!(!budget.would_exceed(4));
        assert!(budget.would_exceed(5));

        budget.charge(3);
        assert_eq!(budget.excess(2), 1);
        assert_eq!(budget.excess(1), 0);

        budget.refund(3);
        assert_eq!(budget.current_units(), 0);
    }

    #[test]
    fn test_clock_counts_up_without_blocks() {
        let mut registry = FileRegistry::default();
        let mut clock = AgeClock::new(10);
        let file = FileId::from_raw(0);
        for _ in 0..9 {
            assert!(!clock.touch(&mut registry, file, 0));
        }
        // 第 10 次触发归一化，没有已映射块时计数归零
        assert!(clock.touch(&mut registry, file, 0));
        assert_eq!(clock.date(), 0);
    }
}
