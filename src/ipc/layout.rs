//! Layout of the shared file table
//!
//! 共享文件表的内存布局
//!
//! ```text
//! +----------------------------+  offset 0
//! | Header { version, capacity }|
//! +----------------------------+  offset 8
//! | SlotEntry[capacity]        |  signature (16 bytes) + alive count
//! +----------------------------+
//! | WriteLockEntry[capacity]   |  write-lock flag per slot
//! +----------------------------+
//! ```
//!
//! Every field is an atomic so the table can be read and written through a
//! shared reference from any process that maps it. Zeroed memory is a valid,
//! uninitialized table (`version == 0`).
//!
//! 所有字段都是原子类型，因此任何映射了该表的进程都可以通过共享引用读写它。
//! 全零内存是一个有效但未初始化的表（`version == 0`）。

use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Layout version written into the header
///
/// 写入表头的布局版本
pub const CURRENT_VERSION: u32 = 1000;

/// Default number of slots, fixed so the table never needs to be resized
///
/// 默认槽位数量，固定大小使得表无需扩容
pub const DEFAULT_SLOTS: u32 = 4096;

#[repr(C)]
pub(crate) struct Header {
    pub(crate) version: AtomicU32,
    pub(crate) capacity: AtomicU32,
}

#[repr(C)]
pub(crate) struct SlotEntry {
    /// Signature bytes as two native-endian words
    pub(crate) sig: [AtomicU64; 2],
    /// Users of the slot across all processes
    pub(crate) alive: AtomicU32,
}

// Kept apart from the slot entries so lock flags stay dense in the cache.
#[repr(C)]
pub(crate) struct WriteLockEntry {
    pub(crate) flag: AtomicU32,
}

/// Bytes needed for a table of `capacity` slots
///
/// `capacity` 个槽位的表所需的字节数
pub const fn table_size(capacity: u32) -> usize {
    size_of::<Header>()
        + capacity as usize * (size_of::<SlotEntry>() + size_of::<WriteLockEntry>())
}

/// Alignment the table base must satisfy
pub(crate) const TABLE_ALIGN: usize = align_of::<SlotEntry>();

/// Typed view over a mapped table
///
/// 已映射表的类型化视图
pub(crate) struct TableView<'a> {
    pub(crate) header: &'a Header,
    pub(crate) slots: &'a [SlotEntry],
    pub(crate) locks: &'a [WriteLockEntry],
}

impl<'a> TableView<'a> {
    /// Interpret `table_size(capacity)` bytes at `base` as a table
    ///
    /// # Safety
    ///
    /// `base` must be aligned to [`TABLE_ALIGN`], point to at least
    /// `table_size(capacity)` bytes that stay mapped for `'a`, and only ever
    /// be accessed through atomics.
    ///
    /// # Safety
    ///
    /// `base` 必须按 [`TABLE_ALIGN`] 对齐，指向至少 `table_size(capacity)` 个在 `'a`
    /// 期间保持映射的字节，且只能通过原子操作访问。
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, capacity: u32) -> Self {
        let capacity = capacity as usize;
        unsafe {
            let header = base.cast::<Header>().as_ref();
            let slots_ptr = base.add(size_of::<Header>()).cast::<SlotEntry>();
            let slots = std::slice::from_raw_parts(slots_ptr.as_ptr(), capacity);
            let locks_ptr = slots_ptr.add(capacity).cast::<WriteLockEntry>();
            let locks = std::slice::from_raw_parts(locks_ptr.as_ptr(), capacity);
            Self {
                header,
                slots,
                locks,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(size_of::<Header>(), 8);
        assert_eq!(size_of::<SlotEntry>(), 24);
        assert_eq!(size_of::<WriteLockEntry>(), 4);
        assert_eq!(table_size(DEFAULT_SLOTS), 8 + 4096 * 28);
    }
}
