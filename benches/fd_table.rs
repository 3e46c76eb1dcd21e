use criterion::{criterion_group, criterion_main, Criterion};
use vinyl_tree::{descriptor_table::FileDescriptorTable, GlobalRunId};
use std::sync::Arc;

fn file_descriptor_table(c: &mut Criterion) {
    let file = tempfile::NamedTempFile::new().expect("create temp file");

    let mut group = c.benchmark_group("FileDescriptorTable::access");

    let id = GlobalRunId::from((0, 523));
    let descriptor_table = FileDescriptorTable::new(100, 4);
    descriptor_table.insert(file.path(), id);

    group.bench_function("hit", |b| {
        b.iter(|| descriptor_table.access(&id).expect("should not error"));
    });

    group.finish();
}

criterion_group!(benches, file_descriptor_table);
criterion_main!(benches);
