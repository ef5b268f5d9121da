use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use nvr_integrity::IntegrityTable;
use nvr_shm::Registry;

fn bench_record_write(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::with_base(dir.path());
    let table = IntegrityTable::create(&reg, "bench", 1 << 20).unwrap();

    const LBA_SIZE: usize = 4096;
    const NLB: u32 = 32;
    let mut data = vec![0u8; NLB as usize * LBA_SIZE];
    for (i, chunk) in data.chunks_mut(LBA_SIZE).enumerate() {
        chunk[0..8].copy_from_slice(&(i as u64).to_le_bytes());
        chunk.iter_mut().skip(8).for_each(|b| *b = i as u8);
    }

    let mut group = c.benchmark_group("integrity");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("record_write_32x4k", |b| {
        b.iter(|| table.record_write(&data, 0, NLB, LBA_SIZE))
    });
    group.bench_function("verify_read_32x4k", |b| {
        table.set_enabled(true);
        b.iter(|| table.verify_read(&data, 0, NLB, LBA_SIZE).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_record_write);
criterion_main!(benches);
