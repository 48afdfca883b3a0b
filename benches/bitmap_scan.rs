use blockbackup_core::DirtyBitmap;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const GRANULARITY: u64 = 64 << 10;
const SIZE: u64 = 16 << 30;

fn sparse_bitmap() -> DirtyBitmap {
    let mut bm = DirtyBitmap::new(SIZE, GRANULARITY).unwrap();
    let mut off = 0u64;
    while off < SIZE {
        bm.set(off, GRANULARITY).unwrap();
        off += GRANULARITY * 4096;
    }
    bm
}

fn dense_bitmap() -> DirtyBitmap {
    DirtyBitmap::new_all_ones(SIZE, GRANULARITY).unwrap()
}

fn bench_next_dirty_area(c: &mut Criterion) {
    let sparse = sparse_bitmap();
    let dense = dense_bitmap();

    c.bench_function("next_dirty_area/sparse_16gib", |b| {
        b.iter(|| {
            let mut off = 0u64;
            let mut found = 0u64;
            while let Some((start, _len)) = sparse.next_dirty_area(off, SIZE) {
                found += 1;
                off = start + GRANULARITY;
            }
            black_box(found)
        })
    });

    c.bench_function("next_dirty_area/dense_16gib", |b| {
        b.iter(|| {
            let mut off = 0u64;
            let mut found = 0u64;
            // Only walk the first slice of a fully-dirty bitmap; scanning the
            // whole 16 GiB every iteration would dominate the benchmark with
            // noise unrelated to the scan loop itself.
            while let Some((start, len)) = dense.next_dirty_area(off, 64 << 20) {
                found += 1;
                off = start + len;
            }
            black_box(found)
        })
    });

    c.bench_function("dirty_bytes/dense_16gib", |b| b.iter(|| black_box(dense.dirty_bytes())));
}

criterion_group!(benches, bench_next_dirty_area);
criterion_main!(benches);
