//! Benchmarks for skimmer random access against full deserialization

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tevd::{ByteArray64, Charset, CrcLevel, DiskSkimmer, EntryId, VirtualDisk, ROOT_ID};
use tempfile::TempDir;

fn build_image(dir: &TempDir, files: usize, size: usize) -> (std::path::PathBuf, Vec<EntryId>) {
    let cs = Charset::Utf8;
    let mut disk = VirtualDisk::new(u32::MAX as u64, "BENCH", cs).unwrap();
    let ids = (0..files)
        .map(|i| {
            disk.add_file(
                ROOT_ID,
                &format!("file{}.bin", i),
                ByteArray64::from_slice(&vec![i as u8; size]),
                cs,
            )
            .unwrap()
        })
        .collect();
    let path = dir.path().join(format!("bench-{}.tevd", files));
    disk.write_to_file(&path).unwrap();
    (path, ids)
}

fn benchmark_single_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_entry_read");

    for files in [100, 1000].iter() {
        let dir = TempDir::new().unwrap();
        let (path, ids) = build_image(&dir, *files, 4096);
        let target = ids[ids.len() / 2];

        group.bench_with_input(BenchmarkId::new("skimmer", files), files, |b, _| {
            let mut skimmer = DiskSkimmer::open(&path).unwrap();
            b.iter(|| black_box(skimmer.request_file(target).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("full_dom", files), files, |b, _| {
            b.iter(|| {
                let disk = VirtualDisk::read_from_file(&path, CrcLevel::Ignore).unwrap();
                black_box(disk.entry(target).cloned())
            });
        });
    }

    group.finish();
}

fn benchmark_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("open_index");

    for files in [100, 1000].iter() {
        let dir = TempDir::new().unwrap();
        let (path, _) = build_image(&dir, *files, 1024);
        group.bench_with_input(BenchmarkId::from_parameter(files), files, |b, _| {
            b.iter(|| black_box(DiskSkimmer::open(&path).unwrap().len()));
        });
    }

    group.finish();
}

fn benchmark_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (path, _) = build_image(&dir, 200, 1024);
    let mut skimmer = DiskSkimmer::open(&path).unwrap();
    let mut n = 0u64;

    c.bench_function("create_new_file", |b| {
        b.iter(|| {
            n += 1;
            skimmer
                .create_new_file(
                    &format!("/appended/{}", n),
                    ByteArray64::from_slice(b"payload"),
                    false,
                    Charset::Utf8,
                )
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    benchmark_single_read,
    benchmark_open,
    benchmark_append
);
criterion_main!(benches);
