use criterion::{criterion_group, criterion_main, Criterion};
use skarn::{KvStore, MemoryConfig};

fn store_put(c: &mut Criterion) {
    let store = KvStore::<MemoryConfig>::create("unused", 1 << 16, 4).unwrap();

    let mut key = 0u64;
    c.bench_function("store put", |b| {
        b.iter(|| {
            key += 1;
            store.put(key, key * 2).unwrap();
        });
    });
}

fn store_get(c: &mut Criterion) {
    let store = KvStore::<MemoryConfig>::create("unused", 1 << 16, 4).unwrap();

    let count = 500_000u64;
    for key in 0..count {
        store.put(key, key * 2).unwrap();
    }

    let mut rng = rand::rng();

    c.bench_function("store get, present", |b| {
        b.iter(|| {
            use rand::Rng;

            let key = rng.random_range(0..count);
            assert_eq!(Some(key * 2), store.get(key).unwrap());
        });
    });

    c.bench_function("store get, absent", |b| {
        b.iter(|| {
            use rand::Rng;

            let key = rng.random_range(count..2 * count);
            assert_eq!(None, store.get(key).unwrap());
        });
    });
}

criterion_group!(benches, store_put, store_get,);
criterion_main!(benches);
