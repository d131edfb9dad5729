use criterion::black_box;
use criterion::{criterion_group, criterion_main, Criterion};
use pharmtran::*;

const DEPOT_SOURCE: &str = "ka = tvka * exp(iiv_ka)\n\
                            cl = tvcl * exp(iiv_cl) * (wt / 70.0) ^ 0.75\n\
                            v = tvv * exp(iiv_v)\n\
                            dadt(1) = -ka * a(1)\n\
                            dadt(2) = ka * a(1) - cl / v * a(2)\n\
                            return a(2) / v * (1 + prop)\n";

fn depot_descriptor() -> ModuleDescriptor {
    ModuleBuilder::ode(2)
        .theta("tvka", 1.0)
        .theta("tvcl", 4.0)
        .theta("tvv", 70.0)
        .eta("iiv_ka")
        .eta("iiv_cl")
        .eta("iiv_v")
        .eps("prop")
        .covariate("wt")
        .defdose(1)
        .defobs(2)
        .build()
        .unwrap()
}

fn translate_first_order() {
    let t = Translator::new(depot_descriptor())
        .with_source(DEPOT_SOURCE)
        .with_order(SensitivityOrder::First)
        .translate()
        .unwrap();
    black_box(t);
}

fn translate_second_order() {
    let t = Translator::new(depot_descriptor())
        .with_source(DEPOT_SOURCE)
        .with_order(SensitivityOrder::Second)
        .translate()
        .unwrap();
    black_box(t);
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("translate_first_order", |b| b.iter(|| translate_first_order()));
    c.bench_function("translate_second_order", |b| b.iter(|| translate_second_order()));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
