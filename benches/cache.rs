use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zarya::{DataCache, HeapAllocator, Lookup, RawCacheKey};

fn bench_hit_path(c: &mut Criterion) {
    let cache = DataCache::new(HeapAllocator::new(4096), None);
    let key = RawCacheKey::new(1, 0);
    match cache.find_or_create(key, 4096).unwrap() {
        Lookup::Exclusive(mut pin) => {
            pin.write_all(&[0u8; 4096]);
            drop(pin.into_shared());
        }
        other => panic!("expected exclusive pin, got {other:?}"),
    }

    c.bench_function("find_or_create_hit", |b| {
        b.iter(|| match cache.find_or_create(black_box(key), 4096).unwrap() {
            Lookup::Shared(pin) => drop(pin),
            other => panic!("expected hit, got {other:?}"),
        })
    });
}

fn bench_exists(c: &mut Criterion) {
    let cache = DataCache::new(HeapAllocator::new(4096), None);
    let key = RawCacheKey::new(1, 0);
    match cache.find_or_create(key, 4096).unwrap() {
        Lookup::Exclusive(mut pin) => {
            pin.write_all(&[0u8; 4096]);
            drop(pin.into_shared());
        }
        other => panic!("expected exclusive pin, got {other:?}"),
    }

    c.bench_function("exists", |b| b.iter(|| cache.exists(black_box(key))));
}

criterion_group!(benches, bench_hit_path, bench_exists);
criterion_main!(benches);
