//! 测试模块

use super::*;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::thread;

fn sig(n: u8) -> FileSig {
    FileSig::new([n; 16])
}

/// 槽位分配测试
#[cfg(test)]
mod slot_tests {
    use super::*;

    #[test]
    fn test_two_coordinators_share_slot() {
        let region = MemoryRegion::for_slots(8);
        let a = Coordinator::with_capacity(region.clone(), 8).unwrap();
        let b = Coordinator::with_capacity(region, 8).unwrap();

        // 两个"进程"对同一签名得到同一槽位
        let sa = a.slot_for_file(&sig(1)).unwrap().unwrap();
        let sb = b.slot_for_file(&sig(1)).unwrap().unwrap();
        assert_eq!(sa, sb);
        assert_eq!(a.alive_count(sa), Some(2));

        // 不同签名得到不同槽位
        let other = b.slot_for_file(&sig(2)).unwrap().unwrap();
        assert_ne!(other, sa);
    }

    #[test]
    fn test_slot_recycled_after_release() {
        let coordinator = Coordinator::with_capacity(MemoryRegion::for_slots(4), 4).unwrap();

        let first = coordinator.slot_for_file(&sig(1)).unwrap().unwrap();
        let again = coordinator.slot_for_file(&sig(1)).unwrap().unwrap();
        assert_eq!(first, again);

        coordinator.release_slot(first).unwrap();
        assert_eq!(coordinator.alive_count(first), Some(1));
        coordinator.release_slot(again).unwrap();
        assert_eq!(coordinator.alive_count(first), Some(0));

        // 计数归零后，新签名接管该槽位
        let recycled = coordinator.slot_for_file(&sig(9)).unwrap().unwrap();
        assert_eq!(recycled, first);
    }

    #[test]
    fn test_table_full() {
        let coordinator = Coordinator::with_capacity(MemoryRegion::for_slots(2), 2).unwrap();

        assert!(coordinator.slot_for_file(&sig(1)).unwrap().is_some());
        assert!(coordinator.slot_for_file(&sig(2)).unwrap().is_some());
        assert!(coordinator.slot_for_file(&sig(3)).unwrap().is_none());

        // 已存在的签名仍可共享槽位
        assert!(coordinator.slot_for_file(&sig(1)).unwrap().is_some());
    }

    #[test]
    fn test_release_unused_slot_is_misuse() {
        let coordinator = Coordinator::with_capacity(MemoryRegion::for_slots(2), 2).unwrap();
        let slot = coordinator.slot_for_file(&sig(1)).unwrap().unwrap();
        coordinator.release_slot(slot).unwrap();

        assert!(matches!(
            coordinator.release_slot(slot),
            Err(Error::HandleMisuse { .. })
        ));
        assert!(matches!(
            coordinator.release_slot(SlotIndex(99)),
            Err(Error::HandleMisuse { slot: 99 })
        ));
        assert_eq!(coordinator.alive_count(SlotIndex(99)), None);
    }
}

/// 表头校验测试
#[cfg(test)]
mod layout_tests {
    use super::*;

    #[test]
    fn test_region_too_small() {
        let region = MemoryRegion::new(16);
        assert!(matches!(
            Coordinator::with_capacity(region, 8),
            Err(Error::IpcUnavailable { .. })
        ));
    }

    #[test]
    fn test_capacity_mismatch() {
        let region = MemoryRegion::for_slots(8);
        let _first = Coordinator::with_capacity(region.clone(), 8).unwrap();

        // 同一区域以更小容量打开，表头容量不一致
        assert!(matches!(
            Coordinator::with_capacity(region, 4),
            Err(Error::IpcUnavailable { .. })
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let region = MemoryRegion::for_slots(4);
        // 伪造一个其他版本写入的表头
        let table = unsafe { TableView::from_raw(region.base(), 4) };
        table.header.capacity.store(4, Ordering::SeqCst);
        table.header.version.store(CURRENT_VERSION + 1, Ordering::SeqCst);

        assert!(matches!(
            Coordinator::with_capacity(region, 4),
            Err(Error::IpcUnavailable { .. })
        ));
    }

    #[test]
    fn test_in_memory_is_private() {
        let a = Coordinator::in_memory();
        let b = Coordinator::in_memory();
        assert_eq!(a.capacity(), DEFAULT_SLOTS);

        let sa = a.slot_for_file(&sig(5)).unwrap().unwrap();
        let _sb = b.slot_for_file(&sig(5)).unwrap().unwrap();
        assert_eq!(a.alive_count(sa), Some(1));
    }
}

/// 写锁测试
#[cfg(test)]
mod write_lock_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_try_write_lock_excludes() {
        let coordinator = Coordinator::in_memory();
        let slot = coordinator.slot_for_file(&sig(1)).unwrap().unwrap();

        let guard = coordinator.try_write_lock(slot).unwrap();
        assert!(coordinator.try_write_lock(slot).is_none());
        drop(guard);
        assert!(coordinator.try_write_lock(slot).is_some());
    }

    #[test]
    fn test_write_lock_timeout() {
        let coordinator = Coordinator::in_memory();
        let slot = coordinator.slot_for_file(&sig(1)).unwrap().unwrap();
        let _held = coordinator.try_write_lock(slot).unwrap();

        let policy = SpinPolicy {
            spins: 8,
            timeout: Some(Duration::from_millis(20)),
        };
        assert!(coordinator.write_lock(slot, policy).is_none());
    }

    #[test]
    fn test_write_lock_across_coordinators() {
        let region = MemoryRegion::for_slots(4);
        let a = Arc::new(Coordinator::with_capacity(region.clone(), 4).unwrap());
        let b = Arc::new(Coordinator::with_capacity(region, 4).unwrap());
        let slot = a.slot_for_file(&sig(1)).unwrap().unwrap();
        assert_eq!(b.slot_for_file(&sig(1)).unwrap(), Some(slot));

        // 非原子的读-改-写只有在写锁互斥时才不会丢失更新
        let counter = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = [a, b]
            .into_iter()
            .flat_map(|c| [c.clone(), c])
            .map(|coordinator| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = coordinator.write_lock(slot, SpinPolicy::default()).unwrap();
                        let value = counter.load(Ordering::Relaxed);
                        thread::yield_now();
                        counter.store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }

    #[test]
    fn test_out_of_range_slot() {
        let coordinator = Coordinator::with_capacity(MemoryRegion::for_slots(2), 2).unwrap();
        assert!(coordinator.try_write_lock(SlotIndex(2)).is_none());
        assert!(coordinator.write_lock(SlotIndex(2), SpinPolicy::default()).is_none());
    }
}

/// 基于文件的共享段测试
#[cfg(all(test, unix))]
mod named_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_two_opens_share_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.shm");

        let a = Coordinator::at_path(&path).unwrap();
        let b = Coordinator::at_path(&path).unwrap();

        let sa = a.slot_for_file(&sig(3)).unwrap().unwrap();
        let sb = b.slot_for_file(&sig(3)).unwrap().unwrap();
        assert_eq!(sa, sb);
        assert_eq!(b.alive_count(sa), Some(2));

        // 一个实例持有写锁时，另一个实例无法获取
        let guard = a.try_write_lock(sa).unwrap();
        assert!(b.try_write_lock(sb).is_none());
        drop(guard);
        assert!(b.try_write_lock(sb).is_some());
    }

    #[test]
    fn test_table_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.shm");

        let slot = {
            let first = Coordinator::at_path(&path).unwrap();
            first.slot_for_file(&sig(7)).unwrap().unwrap()
        };

        // 段文件保留了前一个实例的计数
        let second = Coordinator::at_path(&path).unwrap();
        assert_eq!(second.alive_count(slot), Some(1));
        assert_eq!(second.slot_for_file(&sig(7)).unwrap(), Some(slot));
    }

    #[test]
    fn test_region_lock_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock.shm");
        let len = table_size(4);

        let a = NamedRegion::open(&path, len).unwrap();
        let b = NamedRegion::open(&path, len).unwrap();
        assert_eq!(a.path(), b.path());

        // 依次加锁、解锁，两个实例不会互相死锁
        a.lock().unwrap();
        unsafe { a.unlock() };
        b.lock().unwrap();
        unsafe { b.unlock() };
    }

    #[test]
    fn test_invalid_segment_name() {
        assert!(NamedRegion::named("a/b", 64).is_err());
        assert!(NamedRegion::named("", 64).is_err());
    }
}
