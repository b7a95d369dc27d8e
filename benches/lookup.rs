use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use svcreg::{
    Clock, EntryClassDesc, EntryRep, Item, LeaseDuration, ManualClock, Registrar, RegistrarConfig, ServiceHandle,
    Template, TypeDesc,
};

const TYPES: [&str; 4] = ["Printer", "Scanner", "Camera", "Sensor"];

fn location(floor: i64) -> EntryRep {
    EntryRep::empty(EntryClassDesc::new("Location", &["building", "floor"]))
        .with("building", "HQ")
        .with("floor", floor)
}

/// `services` registrations spread over four types and ten floors.
fn seeded_registrar(services: usize) -> Registrar {
    let registrar = Registrar::builder(RegistrarConfig::transient())
        .clock(Arc::new(ManualClock::new(0)) as Arc<dyn Clock>)
        .open()
        .unwrap();
    for i in 0..services {
        let ty = TypeDesc::new(TYPES[i % TYPES.len()]).extends("Device");
        let floor = i64::try_from(i % 10).unwrap();
        let item = Item::new(ty, ServiceHandle::new(i.to_le_bytes().to_vec())).with_attribute(location(floor));
        registrar.register(item, LeaseDuration::Any).unwrap();
    }
    registrar
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    for services in [100usize, 1_000, 10_000] {
        let registrar = seeded_registrar(services);
        let by_type = Template::by_type("Scanner");
        let by_attr = Template::by_type("Device").with_attribute(
            EntryRep::empty(EntryClassDesc::new("Location", &["building", "floor"])).with("floor", 7),
        );
        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::new("by_type", services), &by_type, |b, t| {
            b.iter(|| black_box(registrar.lookup(t).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("by_attribute", services), &by_attr, |b, t| {
            b.iter(|| black_box(registrar.lookup(t).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("many_by_type", services), &by_type, |b, t| {
            b.iter(|| black_box(registrar.lookup_many(t, 16).unwrap()));
        });
        registrar.destroy().unwrap();
    }
    group.finish();
}

fn bench_register(c: &mut Criterion) {
    let registrar = seeded_registrar(1_000);
    let mut n = 0usize;
    c.bench_function("register/transient", |b| {
        b.iter(|| {
            n += 1;
            let item = Item::new(TypeDesc::new("Printer"), ServiceHandle::new(n.to_le_bytes().to_vec()));
            black_box(registrar.register(item, LeaseDuration::Any).unwrap())
        });
    });
    registrar.destroy().unwrap();
}

criterion_group!(benches, bench_lookup, bench_register);
criterion_main!(benches);
