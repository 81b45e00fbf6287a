//! Benchmarks: buffered puts, file flushes and selection reads

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bpio::{Adios, Mode};

const NX: u64 = 256;
const NY: u64 = 256;

fn field() -> Vec<f64> {
    (0..NX * NY).map(|i| (i % 1024) as f64 * 0.5).collect()
}

fn bench_write(c: &mut Criterion) {
    let values = field();
    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Bytes(values.len() as u64 * 8));

    for steps in [1u64, 8] {
        group.bench_with_input(BenchmarkId::new("steps", steps), &steps, |b, &steps| {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("bench.bp");
            let path = path.to_str().unwrap();
            b.iter(|| {
                let adios = Adios::default();
                let io = adios.declare_io("bench").unwrap();
                io.set_parameters([("Profile", "off"), ("FlushStepsCount", "4")]);
                let v = io
                    .define_variable::<f64>("field", &[NX, NY], &[0, 0], &[NX, NY], true)
                    .unwrap();
                let mut writer = io.open(path, Mode::Write).unwrap();
                for _ in 0..steps {
                    writer.begin_step().unwrap();
                    writer.put(&v, &values, Mode::Sync).unwrap();
                    writer.end_step().unwrap();
                }
                writer.close().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("read.bp");
    let path = path.to_str().unwrap();
    let adios = Adios::default();
    {
        let io = adios.declare_io("writer").unwrap();
        io.set_parameter("Profile", "off");
        let v = io
            .define_variable::<f64>("field", &[NX, NY], &[0, 0], &[NX, NY], true)
            .unwrap();
        let mut writer = io.open(path, Mode::Write).unwrap();
        writer.put(&v, &field(), Mode::Sync).unwrap();
        writer.close().unwrap();
    }

    let mut group = c.benchmark_group("read");
    for library in ["posix", "mmap"] {
        let io = adios.declare_io(&format!("reader-{library}")).unwrap();
        io.set_parameter("Library", library);
        let mut reader = io.open(path, Mode::ReadRandomAccess).unwrap();
        let v = io.inquire_variable::<f64>("field").unwrap().unwrap();

        group.bench_function(BenchmarkId::new("whole", library), |b| {
            v.set_selection(&[0, 0], &[NX, NY]).unwrap();
            b.iter(|| black_box(reader.get(&v).unwrap()))
        });
        group.bench_function(BenchmarkId::new("column", library), |b| {
            v.set_selection(&[0, NY / 2], &[NX, 1]).unwrap();
            b.iter(|| black_box(reader.get(&v).unwrap()))
        });
        reader.close().unwrap();
    }
    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
