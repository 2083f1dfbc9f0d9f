use criterion::{criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};

use vitrine::store::Store;

fn bench_get(c: &mut Criterion) {
    let store: Store<Vec<u8>> = Store::new();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let keys: Vec<Vec<u8>> = (0..10_000)
        .map(|_| (0..16).map(|_| rng.gen()).collect())
        .collect();
    for key in &keys {
        store.put_if_absent(key, key.clone());
    }

    c.bench_function("store_get", |b| {
        let mut index = 0;
        b.iter(|| {
            index = (index + 1) % keys.len();
            store.get(&keys[index])
        })
    });
}

fn bench_cas_loop(c: &mut Criterion) {
    let store: Store<u64> = Store::new();
    store.put_if_absent(b"counter", 0);

    c.bench_function("store_replace_if_equal", |b| {
        b.iter(|| loop {
            let current = store.get(b"counter").unwrap();
            if store.replace_if_equal(b"counter", &current, current.wrapping_add(1)) {
                break;
            }
        })
    });
}

fn bench_put_if_absent_miss(c: &mut Criterion) {
    let store: Store<u64> = Store::new();
    store.put_if_absent(b"present", 1);

    c.bench_function("store_put_if_absent_hit", |b| {
        b.iter(|| store.put_if_absent(b"present", 2))
    });
}

criterion_group!(benches, bench_get, bench_cas_loop, bench_put_if_absent_miss);
criterion_main!(benches);
