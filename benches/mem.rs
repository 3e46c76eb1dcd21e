use criterion::{criterion_group, criterion_main, Criterion};
use vinyl_tree::{value::InternalValue, Mem, ValueType};

fn mem_get_upper_bound(c: &mut Criterion) {
    c.bench_function("mem get", |b| {
        let mem = Mem::new(0);

        for x in 0..1_000_000u64 {
            mem.insert(InternalValue::from_components(
                format!("abc_{x}").as_bytes(),
                vec![],
                0,
                ValueType::Value,
            ));
        }

        b.iter(|| mem.get(b"abc_500000", u64::MAX));
    });
}

fn mem_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("mem insert");

    group.bench_function("sequential keys", |b| {
        let mem = Mem::new(0);
        let mut x = 0u64;

        b.iter(|| {
            mem.insert(InternalValue::from_components(
                format!("abc_{x}").as_bytes(),
                vec![],
                x,
                ValueType::Value,
            ));
            x += 1;
        });
    });
}

criterion_group!(benches, mem_get_upper_bound, mem_insert);
criterion_main!(benches);
