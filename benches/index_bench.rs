/*!
 * Allocation-Index Benchmarks
 * Insert, interval-cover lookup, and traversal over the AVL index
 */

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pagemerge::index::RegionIndex;

const PAGE: usize = 4096;
const REGIONS: usize = 4096;

fn populated() -> RegionIndex {
    let mut index = RegionIndex::new();
    for i in 0..REGIONS {
        // spread the bases so lookups exercise real descents
        index.insert(0x1000_0000 + i * 8 * PAGE, 4 * PAGE, None);
    }
    index
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("index_insert_4096_regions", |b| {
        b.iter(|| {
            let mut index = RegionIndex::new();
            for i in 0..REGIONS {
                index.insert(0x1000_0000 + i * 8 * PAGE, 4 * PAGE, None);
            }
            black_box(index.len())
        })
    });
}

fn bench_find_containing(c: &mut Criterion) {
    let index = populated();
    c.bench_function("index_find_containing", |b| {
        b.iter(|| {
            let addr = 0x1000_0000 + (REGIONS / 2) * 8 * PAGE + 3 * PAGE + 17;
            black_box(index.find_containing(black_box(addr)).is_some())
        })
    });
}

fn bench_traverse(c: &mut Criterion) {
    let mut index = populated();
    c.bench_function("index_traverse_4096_regions", |b| {
        b.iter(|| {
            let mut dirty = 0usize;
            index.traverse(|region| {
                if region.dirty {
                    dirty += 1;
                }
            });
            black_box(dirty)
        })
    });
}

criterion_group!(benches, bench_insert, bench_find_containing, bench_traverse);
criterion_main!(benches);
