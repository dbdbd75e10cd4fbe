//! Performance benchmarks for range calibration and HQQ refinement.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cuantizar::quant::{
    generate_gaussian_weights, minmax_range, mse_range, HqqConfig, HqqRefiner, MseOptions, QuantOptions,
    QuantizationSpec, Quantizer,
};

/// Benchmark min-max range calibration per channel
fn bench_minmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("MinmaxRange");

    for size in [64, 256, 1024].iter() {
        let weight = generate_gaussian_weights(*size, *size, 1.0, 42);
        group.throughput(Throughput::Elements((size * size) as u64));
        group.bench_with_input(BenchmarkId::new("per_channel", size), size, |b, _| {
            b.iter(|| black_box(minmax_range(&weight, false)));
        });
    }
    group.finish();
}

/// Benchmark the MSE grid search
fn bench_mse(c: &mut Criterion) {
    let mut group = c.benchmark_group("MseRange");
    group.sample_size(20);

    let quantizer = Quantizer::new(QuantizationSpec::new(4, false).per_channel()).unwrap();
    for size in [64, 256].iter() {
        let weight = generate_gaussian_weights(*size, *size, 1.0, 7);
        let options = MseOptions {
            bs: *size,
            ..MseOptions::default()
        };
        group.bench_with_input(BenchmarkId::new("grid_100", size), size, |b, _| {
            b.iter(|| black_box(mse_range(&quantizer, &weight, &options).unwrap()));
        });
    }
    group.finish();
}

/// Benchmark HQQ zero-point refinement
fn bench_hqq(c: &mut Criterion) {
    let mut group = c.benchmark_group("HqqRefine");
    group.sample_size(10);

    let quantizer = Quantizer::new(QuantizationSpec::new(4, false).per_group(64)).unwrap();
    let refiner = HqqRefiner::new(quantizer, HqqConfig::default()).unwrap();
    for size in [128, 512].iter() {
        let weight = generate_gaussian_weights(*size, *size, 0.02, 3);
        group.bench_with_input(BenchmarkId::new("iters_20", size), size, |b, _| {
            b.iter(|| black_box(refiner.refine(&weight).unwrap()));
        });
    }
    group.finish();
}

/// Benchmark dynamic weight fake quantization
fn bench_fake_quant(c: &mut Criterion) {
    let mut group = c.benchmark_group("FakeQuantWeight");

    let quantizer = Quantizer::new(QuantizationSpec::new(8, true).per_channel()).unwrap();
    for size in [256, 1024].iter() {
        let weight = generate_gaussian_weights(*size, *size, 1.0, 11);
        group.throughput(Throughput::Elements((size * size) as u64));
        group.bench_with_input(BenchmarkId::new("int8_per_channel", size), size, |b, _| {
            b.iter(|| {
                black_box(
                    quantizer
                        .fake_quant_weight_dynamic(&weight, &QuantOptions::default())
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_minmax, bench_mse, bench_hqq, bench_fake_quant);
criterion_main!(benches);
