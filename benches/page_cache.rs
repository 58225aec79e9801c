use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mapped_page_cache::{BlockShift, CacheConfig, FileSig, PageCache};
use std::fs::{File, OpenOptions};
use std::hint::black_box;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::tempdir;

/// 测试参数
const FILE_SIZE: usize = 64 * 1024 * 1024; // 64MB
const READ_SIZE: usize = 512;
const BLOCK_SHIFT: u8 = 16; // 64KB 块
const READS_PER_ITER: usize = 4096;

fn create_file(path: &Path) -> File {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap();
    let chunk: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    for _ in 0..FILE_SIZE / chunk.len() {
        file.write_all(&chunk).unwrap();
    }
    file.sync_all().unwrap();
    file
}

/// 伪随机但可复现的读取偏移，每个偏移都落在单个块内
fn offsets() -> Vec<u64> {
    let block = 1usize << BLOCK_SHIFT;
    let mut x = 0x2545_F491_4F6C_DD1Du64;
    (0..READS_PER_ITER)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let pos = (x as usize) % (FILE_SIZE - block);
            let in_block = pos % block;
            let in_block = in_block.min(block - READ_SIZE);
            ((pos - pos % block) + in_block) as u64
        })
        .collect()
}

/// 使用 seek + read 读取
fn bench_seek_read(file: &mut File, offsets: &[u64]) {
    let mut buf = [0u8; READ_SIZE];
    for &offset in offsets {
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut buf).unwrap();
        black_box(&buf);
    }
}

/// 通过页缓存进行对齐读取
fn bench_cache_read(cache: &PageCache, id: mapped_page_cache::FileId, offsets: &[u64]) {
    let mut buf = [0u8; READ_SIZE];
    for &offset in offsets {
        cache.read_aligned(id, offset, &mut buf).unwrap();
        black_box(&buf);
    }
}

fn page_cache_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("aligned_read");
    group.sample_size(20);

    let dir = tempdir().unwrap();
    let path = dir.path().join("bench.bin");
    let mut file = create_file(&path);
    let offsets = offsets();
    let label = format!("{}MB_{}B_reads", FILE_SIZE / (1024 * 1024), READ_SIZE);

    group.bench_function(BenchmarkId::new("seek_read", &label), |b| {
        b.iter(|| bench_seek_read(&mut file, &offsets));
    });

    // 预算分别覆盖整个文件与文件的 1/8，后者会持续触发裁剪
    let budgets = [
        ("cache_full_budget", FILE_SIZE),
        ("cache_eighth_budget", FILE_SIZE / 8),
    ];
    for (name, budget) in budgets {
        let config = CacheConfig::default().with_max_mapped_bytes(budget as u64);
        let cache = PageCache::in_memory(config);
        let shift = BlockShift::new(BLOCK_SHIFT).unwrap();
        let id = cache
            .add_file(file.try_clone().unwrap(), FileSig::new([7; 16]), shift)
            .unwrap();

        group.bench_function(BenchmarkId::new(name, &label), |b| {
            b.iter(|| bench_cache_read(&cache, id, &offsets));
        });
    }

    group.finish();
}

criterion_group!(benches, page_cache_benchmark);
criterion_main!(benches);
