//! Pinned blocks
//!
//! 被固定的块
//!
//! A [`PageHandle`] names a block by `(file, block)` and a slot in the handle
//! table; it never carries an address. Bytes are reached through the cache's
//! scoped accessors, which resolve the current view on every call, so a
//! growth-driven remap cannot leave a holder with a dangling pointer.
//!
//! [`PageHandle`] 通过 `(文件, 块)` 及句柄表中的槽位来标识块，不携带地址。
//! 字节只能通过缓存的作用域访问器获取，每次调用都会解析当前视图，
//! 因此扩展导致的重新映射不会让持有者拿到悬垂指针。

use super::registry::{FileEntry, FileId};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of handle table owner ids, unique within the process
static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);

/// A pin on one block; the block cannot be trimmed while the handle is live
///
/// 对单个块的固定；句柄有效期间该块不会被裁剪
///
/// Obtained from [`PageCache::acquire`](super::PageCache::acquire) and given
/// back with [`PageCache::release`](super::PageCache::release). The handle is
/// neither `Clone` nor `Copy`, so releasing it twice does not compile.
///
/// 通过 [`PageCache::acquire`](super::PageCache::acquire) 获取，
/// 通过 [`PageCache::release`](super::PageCache::release) 归还。
/// 句柄既不是 `Clone` 也不是 `Copy`，因此重复释放无法通过编译。
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pinned block stays mapped until the handle is released"]
pub struct PageHandle {
    owner: u64,
    file: FileId,
    block: u32,
    slot: u32,
    generation: u32,
}

impl PageHandle {
    #[inline]
    pub fn file(&self) -> FileId {
        self.file
    }

    #[inline]
    pub fn block(&self) -> u32 {
        self.block
    }

    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

#[derive(Debug, Clone, Copy)]
struct Pin {
    file: FileId,
    block: u32,
    /// Address of the block's view as of the last refresh, 0 if unmapped
    addr: usize,
}

#[derive(Debug, Default)]
struct Slot {
    pin: Option<Pin>,
    generation: u32,
}

/// Table of live pins
///
/// 有效固定表
///
/// Lookups are linear scans; the number of pins held at once is expected to
/// stay small. Every table has its own owner id, stamped into the handles it
/// issues, so a handle from another cache never matches a pin here.
///
/// 查找为线性扫描；同时持有的固定数量预计很少。每个表都有自己的所有者 ID，
/// 并写入其签发的句柄，因此来自其他缓存的句柄不会匹配这里的固定。
#[derive(Debug)]
pub(crate) struct HandleTable {
    owner: u64,
    slots: Vec<Slot>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
        }
    }

    /// Pin `(file, block)`, reusing the first free slot
    ///
    /// 固定 `(file, block)`，复用第一个空闲槽位
    pub(crate) fn acquire(&mut self, file: FileId, block: u32, addr: usize) -> PageHandle {
        let pin = Some(Pin { file, block, addr });
        let index = match self.slots.iter().position(|s| s.pin.is_none()) {
            Some(index) => {
                self.slots[index].pin = pin;
                index
            }
            None => {
                self.slots.push(Slot { pin, generation: 0 });
                self.slots.len() - 1
            }
        };
        PageHandle {
            owner: self.owner,
            file,
            block,
            slot: index as u32,
            generation: self.slots[index].generation,
        }
    }

    /// Free the slot held by `handle`
    ///
    /// 释放 `handle` 占用的槽位
    ///
    /// # Errors
    /// Returns `HandleMisuse` if the handle belongs to another table, or its
    /// slot is free or was reused since the handle was issued
    ///
    /// # Errors
    /// 如果句柄属于其他表，或槽位空闲或在句柄签发后已被复用，返回 `HandleMisuse`
    pub(crate) fn release(&mut self, handle: PageHandle) -> Result<()> {
        let slot = self.live_slot_mut(&handle)?;
        slot.pin = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Check that `handle` was issued here and names a live pin
    pub(crate) fn check(&self, handle: &PageHandle) -> Result<()> {
        if handle.owner != self.owner {
            return Err(Error::HandleMisuse { slot: handle.slot });
        }
        match self.slots.get(handle.slot as usize) {
            Some(Slot {
                pin: Some(pin),
                generation,
            }) if *generation == handle.generation
                && pin.file == handle.file
                && pin.block == handle.block =>
            {
                Ok(())
            }
            _ => Err(Error::HandleMisuse { slot: handle.slot }),
        }
    }

    /// Address the table currently records for `handle`
    ///
    /// 句柄表当前为 `handle` 记录的地址
    pub(crate) fn addr(&self, handle: &PageHandle) -> Result<usize> {
        self.check(handle)?;
        Ok(self.slots[handle.slot as usize]
            .pin
            .map(|pin| pin.addr)
            .unwrap_or_default())
    }

    fn live_slot_mut(&mut self, handle: &PageHandle) -> Result<&mut Slot> {
        self.check(handle)?;
        Ok(&mut self.slots[handle.slot as usize])
    }

    /// Every pinned `(file, block)`
    pub(crate) fn pinned(&self) -> impl Iterator<Item = (FileId, u32)> + '_ {
        self.slots
            .iter()
            .filter_map(|s| s.pin.map(|pin| (pin.file, pin.block)))
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.pin.is_some()).count()
    }

    /// Refresh the recorded address of every pin on `file`
    ///
    /// 刷新 `file` 上所有固定记录的地址
    pub(crate) fn freshen(&mut self, file: FileId, entry: &FileEntry) {
        for pin in self.slots.iter_mut().filter_map(|s| s.pin.as_mut()) {
            if pin.file == file {
                pin.addr = entry
                    .blocks
                    .get(pin.block as usize)
                    .and_then(|b| b.addr())
                    .unwrap_or_default();
            }
        }
    }

    /// Refresh the recorded address of pins on one block
    pub(crate) fn freshen_block(&mut self, file: FileId, block: u32, entry: &FileEntry) {
        let addr = entry
            .blocks
            .get(block as usize)
            .and_then(|b| b.addr())
            .unwrap_or_default();
        for pin in self.slots.iter_mut().filter_map(|s| s.pin.as_mut()) {
            if pin.file == file && pin.block == block {
                pin.addr = addr;
            }
        }
    }

    /// Drop every pin on `file`, returning how many were dropped
    ///
    /// 删除 `file` 上的所有固定，返回删除的数量
    ///
    /// Handles to those pins become stale and are rejected afterwards.
    ///
    /// 这些固定对应的句柄随之失效，之后会被拒绝。
    pub(crate) fn forget_file(&mut self, file: FileId) -> usize {
        let mut dropped = 0;
        for slot in &mut self.slots {
            if slot.pin.is_some_and(|pin| pin.file == file) {
                slot.pin = None;
                slot.generation = slot.generation.wrapping_add(1);
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_reused() {
        let mut table = HandleTable::new();
        let file = FileId::from_raw(0);

        let h0 = table.acquire(file, 0, 0x1000);
        let h1 = table.acquire(file, 1, 0x2000);
        assert_eq!((h0.slot(), h1.slot()), (0, 1));

        table.release(h0).unwrap();
        let h2 = table.acquire(file, 7, 0x3000);
        assert_eq!(h2.slot(), 0);
        assert_eq!(table.live(), 2);
        assert_eq!(table.addr(&h2).unwrap(), 0x3000);
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut table = HandleTable::new();
        let file = FileId::from_raw(3);

        let h = table.acquire(file, 5, 0);
        // 伪造一个指向同一槽位的旧句柄
        let stale = PageHandle {
            owner: table.owner,
            file,
            block: 5,
            slot: h.slot(),
            generation: h.generation,
        };
        table.release(h).unwrap();
        assert!(matches!(
            table.release(stale),
            Err(Error::HandleMisuse { slot: 0 })
        ));

        let foreign = PageHandle {
            owner: table.owner,
            file,
            block: 0,
            slot: 42,
            generation: 0,
        };
        assert!(matches!(table.check(&foreign), Err(Error::HandleMisuse { slot: 42 })));
    }

    #[test]
    fn test_handle_from_other_table_is_rejected() {
        let mut mine = HandleTable::new();
        let mut other = HandleTable::new();
        let file = FileId::from_raw(0);

        // 两个表的第一个句柄槽位、代数、文件与块完全相同，只有所有者不同
        let own = mine.acquire(file, 0, 0x1000);
        let foreign = other.acquire(file, 0, 0x2000);
        assert_eq!((own.slot(), own.generation), (foreign.slot(), foreign.generation));

        assert!(matches!(mine.check(&foreign), Err(Error::HandleMisuse { slot: 0 })));
        assert!(mine.addr(&foreign).is_err());
        assert!(mine.release(foreign).is_err());
        assert_eq!(mine.live(), 1);
        mine.release(own).unwrap();
    }

    #[test]
    fn test_forget_file_drops_only_its_pins() {
        let mut table = HandleTable::new();
        let a = FileId::from_raw(0);
        let b = FileId::from_raw(1);

        let ha = table.acquire(a, 0, 0);
        let hb = table.acquire(b, 0, 0);
        assert_eq!(table.forget_file(a), 1);
        assert!(table.check(&ha).is_err());
        assert!(table.check(&hb).is_ok());
        assert_eq!(table.pinned().collect::<Vec<_>>(), vec![(b, 0)]);
    }
}
