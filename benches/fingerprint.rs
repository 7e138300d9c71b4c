//! Hashing and tree-diff benchmarks.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use synctree_lib::core::comparator::diff_files;
use synctree_lib::core::filter::ExclusionFilter;
use synctree_lib::core::fingerprint::hash_file_blocking;
use synctree_lib::core::scanner::{FileDetail, TreeScanner};
use tempfile::tempdir;

const FILE_SIZE: usize = 1024 * 1024; // 1 MB per file

fn create_tree(count: usize) -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    for i in 0..count {
        let path = dir.path().join(format!("d{}/file_{i}.bin", i % 4));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let content: Vec<u8> = (0..FILE_SIZE).map(|j| ((i + j) % 251) as u8).collect();
        fs::write(&path, content).unwrap();
    }
    dir
}

fn synthetic_files(count: usize, salt: &str) -> HashMap<String, FileDetail> {
    (0..count)
        .map(|i| {
            let rel = format!("dir{}/file{}.txt", i % 32, i);
            let hash = if i % 10 == 0 {
                format!("{salt}{i}")
            } else {
                format!("h{i}")
            };
            let detail = FileDetail {
                relative_path: rel.clone(),
                absolute_path: PathBuf::from(&rel),
                size: i as u64,
                mtime_ns: 0,
                content_hash: Some(hash),
            };
            (rel, detail)
        })
        .collect()
}

fn hash_benchmarks(c: &mut Criterion) {
    let dir = create_tree(1);
    let path = dir.path().join("d0/file_0.bin");

    let mut group = c.benchmark_group("hash_file");
    group.throughput(Throughput::Bytes(FILE_SIZE as u64));
    group.bench_function("blake3_1mb", |b| {
        b.iter(|| black_box(hash_file_blocking(&path).unwrap()));
    });
    group.finish();
}

fn scan_benchmarks(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let file_count = 32;
    let dir = create_tree(file_count);

    let mut group = c.benchmark_group("scan_details");
    group.throughput(Throughput::Bytes((file_count * FILE_SIZE) as u64));
    group.sample_size(10);

    for workers in [1, 4, 16] {
        let scanner = TreeScanner::new(ExclusionFilter::default()).with_hash_workers(workers);
        group.bench_with_input(BenchmarkId::new("workers", workers), &scanner, |b, scanner| {
            b.to_async(&runtime).iter(|| async {
                black_box(scanner.scan_details(dir.path(), dir.path(), None).await.unwrap())
            });
        });
    }
    group.finish();
}

fn diff_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_files");

    for count in [1_000, 10_000, 100_000] {
        let a = synthetic_files(count, "a");
        let b = synthetic_files(count, "b");
        group.bench_with_input(BenchmarkId::from_parameter(count), &(a, b), |bench, (a, b)| {
            bench.iter(|| black_box(diff_files(a, b)));
        });
    }
    group.finish();
}

criterion_group!(benches, hash_benchmarks, scan_benchmarks, diff_benchmarks);
criterion_main!(benches);
