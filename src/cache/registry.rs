//! Registered files and their block tables
//!
//! 已注册文件及其块表

use super::config::BlockShift;
use super::mapper::MappingObject;
use crate::error::{Error, Result};
use crate::ipc::{FileSig, SlotIndex};
use memmap2::MmapMut;
use std::fmt;
use std::fs::File;

/// Stable id of a file registered with a [`PageCache`](super::PageCache)
///
/// 在 [`PageCache`](super::PageCache) 中注册的文件的稳定 ID
///
/// An index is recycled once its file is removed, but every reuse bumps the
/// index's generation, so an id kept after `remove_file` is reported as
/// unknown instead of aliasing the newer file.
///
/// 文件移除后其索引会被复用，但每次复用都会递增该索引的代数，
/// 因此 `remove_file` 之后仍持有的 ID 会被报告为未知，而不会指向新注册的文件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileId {
    index: u16,
    generation: u32,
}

impl FileId {
    /// Index of the file in the registry
    #[inline]
    pub fn get(self) -> u16 {
        self.index
    }

    /// How many files held this index before
    ///
    /// 此前占用过该索引的文件数量
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// One fixed-size window of a file
///
/// 文件中的一个固定大小窗口
///
/// The view is present iff the block is mapped.
///
/// 当且仅当块已映射时视图存在。
pub(crate) struct Block {
    pub(crate) view: Option<MmapMut>,
    pub(crate) age: u32,
    pub(crate) file: FileId,
}

impl Block {
    #[inline]
    pub(crate) fn unmapped(file: FileId) -> Self {
        Self {
            view: None,
            age: 0,
            file,
        }
    }

    #[inline]
    pub(crate) fn is_mapped(&self) -> bool {
        self.view.is_some()
    }

    /// Address of the current view, if mapped
    #[inline]
    pub(crate) fn addr(&self) -> Option<usize> {
        self.view.as_ref().map(|view| view.as_ptr() as usize)
    }
}

/// Per-file state
///
/// 单个文件的状态
pub(crate) struct FileEntry {
    pub(crate) file: File,
    pub(crate) sig: FileSig,
    pub(crate) mapping: Option<MappingObject>,
    pub(crate) ipc_slot: SlotIndex,
    pub(crate) shift: BlockShift,
    pub(crate) blocks: Vec<Block>,
}

impl FileEntry {
    pub(crate) fn new(file: File, sig: FileSig, shift: BlockShift, ipc_slot: SlotIndex) -> Self {
        Self {
            file,
            sig,
            mapping: None,
            ipc_slot,
            shift,
            blocks: Vec::new(),
        }
    }

    /// Whether `block` lies outside the current mapping window
    ///
    /// `block` 是否位于当前映射窗口之外
    #[inline]
    pub(crate) fn needs_growth(&self, block: u32) -> bool {
        self.mapping.is_none() || block as usize >= self.blocks.len()
    }

    #[inline]
    pub(crate) fn is_resident(&self, block: u32) -> bool {
        self.blocks
            .get(block as usize)
            .is_some_and(Block::is_mapped)
    }

    /// Number of mapped blocks
    pub(crate) fn mapped_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_mapped()).count()
    }
}

/// A mapped block seen during a collection pass
///
/// 收集过程中看到的已映射块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MappedBlock {
    pub(crate) file: FileId,
    pub(crate) block: u32,
    pub(crate) age: u32,
}

/// Table of registered files, indexed by [`FileId`]
///
/// 已注册文件表，以 [`FileId`] 为索引
#[derive(Default)]
pub(crate) struct FileRegistry {
    slots: Vec<FileSlot>,
}

#[derive(Default)]
struct FileSlot {
    entry: Option<FileEntry>,
    generation: u32,
}

impl FileSlot {
    fn live(&self, id: FileId) -> bool {
        self.entry.is_some() && self.generation == id.generation
    }
}

/// Largest number of files registered at once
const MAX_FILES: usize = u16::MAX as usize + 1;

impl FileRegistry {
    /// Id the next registered file will get
    ///
    /// 下一个注册文件将获得的 ID
    ///
    /// The first free index is reused before the table grows.
    ///
    /// 在表增长之前优先复用第一个空闲索引。
    pub(crate) fn next_id(&self) -> Result<FileId> {
        let (index, generation) = match self.slots.iter().position(|s| s.entry.is_none()) {
            Some(index) => (index, self.slots[index].generation),
            None if self.slots.len() < MAX_FILES => (self.slots.len(), 0),
            None => return Err(Error::TooManyFiles),
        };
        Ok(FileId {
            index: index as u16,
            generation,
        })
    }

    /// Store `entry` under an id from [`next_id`](Self::next_id)
    pub(crate) fn insert(&mut self, id: FileId, entry: FileEntry) {
        if id.index() == self.slots.len() {
            self.slots.push(FileSlot::default());
        }
        let slot = &mut self.slots[id.index()];
        debug_assert!(slot.entry.is_none() && slot.generation == id.generation);
        slot.entry = Some(entry);
    }

    pub(crate) fn get(&self, id: FileId) -> Result<&FileEntry> {
        self.slots
            .get(id.index())
            .filter(|s| s.live(id))
            .and_then(|s| s.entry.as_ref())
            .ok_or(Error::UnknownFile { file: id })
    }

    pub(crate) fn get_mut(&mut self, id: FileId) -> Result<&mut FileEntry> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.live(id))
            .and_then(|s| s.entry.as_mut())
            .ok_or(Error::UnknownFile { file: id })
    }

    /// Remove the entry for `id`, retiring the id
    ///
    /// 移除 `id` 对应的条目并使该 ID 失效
    pub(crate) fn take(&mut self, id: FileId) -> Result<FileEntry> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|s| s.live(id))
            .ok_or(Error::UnknownFile { file: id })?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.entry.take().ok_or(Error::UnknownFile { file: id })
    }

    /// Live entries with their ids
    pub(crate) fn iter(&self) -> impl Iterator<Item = (FileId, &FileEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            let id = FileId {
                index: i as u16,
                generation: slot.generation,
            };
            slot.entry.as_ref().map(|e| (id, e))
        })
    }

    /// Drain every live entry, retiring their ids
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (FileId, FileEntry)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let entry = slot.entry.take()?;
            let id = FileId {
                index: i as u16,
                generation: slot.generation,
            };
            slot.generation = slot.generation.wrapping_add(1);
            Some((id, entry))
        })
    }

    pub(crate) fn live_files(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Collect every mapped block across all files
    ///
    /// 收集所有文件中的已映射块
    pub(crate) fn collect_mapped(&self) -> Vec<MappedBlock> {
        let mut all = Vec::new();
        for (id, entry) in self.iter() {
            for (index, block) in entry.blocks.iter().enumerate() {
                if block.is_mapped() {
                    debug_assert_eq!(block.file, id);
                    all.push(MappedBlock {
                        file: id,
                        block: index as u32,
                        age: block.age,
                    });
                }
            }
        }
        all
    }

    pub(crate) fn block_mut(&mut self, file: FileId, block: u32) -> Option<&mut Block> {
        self.get_mut(file).ok()?.blocks.get_mut(block as usize)
    }
}

#[cfg(test)]
impl FileId {
    pub(crate) fn from_raw(index: u16) -> Self {
        Self {
            index,
            generation: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn entry() -> FileEntry {
        let shift = BlockShift::min();
        FileEntry::new(tempfile().unwrap(), FileSig::new([1; 16]), shift, SlotIndex::from_raw(0))
    }

    #[test]
    fn test_removed_index_is_reused_with_new_generation() {
        let mut registry = FileRegistry::default();
        let first = registry.next_id().unwrap();
        registry.insert(first, entry());
        let second = registry.next_id().unwrap();
        registry.insert(second, entry());
        assert_eq!((first.get(), second.get()), (0, 1));

        registry.take(first).unwrap();
        let reused = registry.next_id().unwrap();
        assert_eq!(reused.get(), 0);
        assert_eq!(reused.generation(), first.generation() + 1);
        registry.insert(reused, entry());

        // 旧 ID 与新 ID 索引相同，但代数不同，必须被拒绝
        assert!(matches!(registry.get(first), Err(Error::UnknownFile { file }) if file == first));
        assert!(registry.take(first).is_err());
        assert!(registry.get(reused).is_ok());
        assert_eq!(registry.live_files(), 2);
    }

    #[test]
    fn test_drain_retires_ids() {
        let mut registry = FileRegistry::default();
        let id = registry.next_id().unwrap();
        registry.insert(id, entry());

        let drained: Vec<_> = registry.drain().map(|(id, _)| id).collect();
        assert_eq!(drained, vec![id]);
        assert!(registry.get(id).is_err());
        assert_ne!(registry.next_id().unwrap(), id);
    }
}
