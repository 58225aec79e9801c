//! Mapping objects and block views
//!
//! 映射对象与块视图
//!
//! Each registered file owns at most one mapping object, which fixes the
//! window of the file that views may cover. Blocks inside that window are
//! mapped lazily, one view per block, through `memmap2`.
//!
//! 每个已注册文件最多拥有一个映射对象，它决定了视图可以覆盖的文件窗口。
//! 窗口内的块按需映射，每个块通过 `memmap2` 建立一个视图。
//!
//! Growing the window recreates the mapping object. Every view of the file is
//! torn down first and re-established afterwards, so every address obtained
//! before a growth is stale once it returns. Live pins are refreshed before
//! control leaves [`ensure_mapped`].
//!
//! 扩展窗口会重建映射对象。文件的所有视图先被拆除，之后重新建立，
//! 因此扩展前获得的地址在扩展后全部失效。在 [`ensure_mapped`] 返回前会刷新所有有效的固定。

use super::CacheState;
use super::budget;
use super::config::{BlockShift, CacheConfig};
use super::registry::{Block, FileEntry, FileId};
use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use tracing::{debug, trace};

/// The window of a file that block views may cover
///
/// 块视图可以覆盖的文件窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MappingObject {
    capacity: u64,
}

impl MappingObject {
    /// Window size in bytes, always a whole number of blocks
    ///
    /// 窗口大小（字节），总是块大小的整数倍
    #[inline]
    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Round `value` up to a multiple of the power-of-two `align`
#[inline]
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Map a single block of `file` read-write
///
/// 以读写方式映射 `file` 的单个块
pub(crate) fn map_view(file: &File, id: FileId, shift: BlockShift, block: u32) -> Result<MmapMut> {
    let offset = u64::from(block) << shift.get();
    // Safety: the view only lives inside the cache state and is dropped before
    // the mapping object it belongs to is recreated. Other processes writing
    // the same file through their own cache is the shared-mapping contract
    // callers accept when they register the file.
    let view = unsafe {
        MmapOptions::new()
            .offset(offset)
            .len(shift.block_size() as usize)
            .map_mut(file)
    }
    .map_err(|source| Error::ViewMap {
        file: id,
        block,
        source,
    })?;
    trace!(file = %id, block, offset, "mapped block view");
    Ok(view)
}

impl FileEntry {
    /// Map one block that lies inside the current window
    ///
    /// 映射当前窗口内的一个块
    pub(crate) fn map_block(&mut self, id: FileId, block: u32) -> Result<()> {
        let view = map_view(&self.file, id, self.shift, block)?;
        self.blocks[block as usize].view = Some(view);
        Ok(())
    }

    /// Drop one block view, returning whether it was mapped
    ///
    /// 释放一个块视图，返回它之前是否已映射
    pub(crate) fn unmap_block(&mut self, block: u32) -> bool {
        match self.blocks.get_mut(block as usize) {
            Some(b) if b.view.is_some() => {
                b.view = None;
                b.age = 0;
                trace!(file = %b.file, block, "unmapped block view");
                true
            }
            _ => false,
        }
    }

    /// Drop every view of this file, returning the number of blocks released
    ///
    /// 释放此文件的所有视图，返回释放的块数
    pub(crate) fn unmap_all(&mut self) -> usize {
        let mut released = 0;
        for block in &mut self.blocks {
            if block.view.take().is_some() {
                block.age = 0;
                released += 1;
            }
        }
        released
    }

    /// Recreate the mapping object so that `block` lies inside the window
    ///
    /// 重建映射对象，使 `block` 位于窗口之内
    ///
    /// The new window covers `max(end of block, on-disk length rounded up to a
    /// block)`. Blocks that were resident are mapped again at their offsets.
    /// Blocks that were resident but could not be mapped again are reported in
    /// the returned [`Regrowth`] and left unmapped.
    ///
    /// 新窗口覆盖 `max(块末尾, 按块向上取整的磁盘长度)`。之前驻留的块会在原偏移处重新映射。
    /// 无法重新映射的块会在返回的 [`Regrowth`] 中报告，并保持未映射状态。
    pub(crate) fn grow(&mut self, id: FileId, block: u32) -> Result<Regrowth> {
        let block_size = self.shift.block_size();
        let wanted = (u64::from(block) + 1) << self.shift.get();
        let on_disk = self
            .file
            .metadata()
            .map_err(|source| Error::MappingCreation {
                file: id,
                size: wanted,
                source,
            })?
            .len();
        let target = wanted.max(align_up(on_disk, block_size));

        // Every view of the old object goes away with it
        let resident: Vec<u32> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_mapped())
            .map(|(i, _)| i as u32)
            .collect();
        let ages: Vec<u32> = resident.iter().map(|&i| self.blocks[i as usize].age).collect();
        self.mapping = None;
        for &i in &resident {
            self.blocks[i as usize].view = None;
        }

        if on_disk < target {
            if let Err(source) = self.file.set_len(target) {
                for &i in &resident {
                    self.blocks[i as usize].age = 0;
                }
                return Ok(Regrowth {
                    lost: resident.len(),
                    error: Some(Error::MappingCreation {
                        file: id,
                        size: target,
                        source,
                    }),
                });
            }
        }
        self.mapping = Some(MappingObject { capacity: target });

        let top = (target >> self.shift.get()) as usize;
        if self.blocks.len() < top {
            self.blocks.resize_with(top, || Block::unmapped(id));
        }
        debug!(
            file = %id,
            old_blocks = resident.len(),
            capacity = target,
            "recreated mapping object"
        );

        let mut outcome = Regrowth::default();
        for (&i, &age) in resident.iter().zip(&ages) {
            match self.map_block(id, i) {
                Ok(()) => self.blocks[i as usize].age = age,
                Err(err) => {
                    outcome.lost += 1;
                    self.blocks[i as usize].age = 0;
                    outcome.error.get_or_insert(err);
                }
            }
        }
        Ok(outcome)
    }
}

/// Result of recreating a mapping object
///
/// 重建映射对象的结果
#[derive(Debug, Default)]
pub(crate) struct Regrowth {
    /// Previously resident blocks that are no longer mapped
    pub(crate) lost: usize,
    /// First failure met while creating the object or remapping
    pub(crate) error: Option<Error>,
}

/// Make `block` of `file` resident, trimming and growing as needed
///
/// 使 `file` 的 `block` 驻留内存，必要时进行裁剪和扩展
///
/// 1. Trim first if mapping the block would exceed the budget, or if the cache
///    is already over budget.
/// 2. Recreate the mapping object if the block is outside the window, remapping
///    previously resident blocks and refreshing live pins of the file.
/// 3. Map the block itself.
///
/// 1. 如果映射该块会超出预算，或缓存已经超出预算，先进行裁剪。
/// 2. 如果块位于窗口之外，重建映射对象，重新映射之前驻留的块并刷新该文件的有效固定。
/// 3. 映射该块。
pub(crate) fn ensure_mapped(
    state: &mut CacheState,
    config: &CacheConfig,
    file: FileId,
    block: u32,
) -> Result<()> {
    let (resident, units) = {
        let entry = state.registry.get(file)?;
        (entry.is_resident(block), entry.shift.units())
    };
    let incoming = if resident { 0 } else { units };
    if state.budget.would_exceed(incoming) {
        budget::trim(state, config, Some((file, block)), incoming);
    }
    if resident {
        return Ok(());
    }

    let CacheState {
        registry,
        budget,
        handles,
        counters,
        ..
    } = state;
    let entry = registry.get_mut(file)?;

    if entry.needs_growth(block) {
        let regrowth = entry.grow(file, block)?;
        counters.growths += 1;
        budget.refund(regrowth.lost as u64 * units);
        handles.freshen(file, entry);
        if let Some(err) = regrowth.error {
            return Err(err);
        }
    }

    entry.map_block(file, block)?;
    budget.charge(units);
    handles.freshen_block(file, block, entry);
    Ok(())
}

/// Resolve a resident block to its bytes, touching it for LRU purposes
///
/// 将驻留块解析为其字节并更新 LRU 年龄
pub(crate) fn resolve<'s>(
    state: &'s mut CacheState,
    config: &CacheConfig,
    file: FileId,
    block: u32,
) -> Result<&'s mut [u8]> {
    ensure_mapped(state, config, file, block)?;
    if state.clock.touch(&mut state.registry, file, block) {
        state.counters.renormalizations += 1;
    }
    state
        .registry
        .get_mut(file)?
        .blocks
        .get_mut(block as usize)
        .and_then(|b| b.view.as_deref_mut())
        .ok_or_else(|| Error::ViewMap {
            file,
            block,
            source: std::io::Error::other("block lost its view after mapping"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(100 * 1024, 65536), 131072);
    }
}
