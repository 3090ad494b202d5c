//! Benchmarks for the OpenCC bridge.
//!
//! Run with: cargo bench
//!
//! Uses the real module at assets/opencc.wasm (with dictionaries under
//! assets/data) when present, and the WAT stand-in from tests/fixtures
//! otherwise.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use wasm_opencc_rs::prelude::*;
use wasm_opencc_rs::StdioMode;

const MOCK_OPENCC: &str = include_str!("../tests/fixtures/mock_opencc.wat");

/// Pick the real module if it has been built, else the stand-in.
fn bench_config() -> BridgeConfig {
    let module = std::path::PathBuf::from("assets/opencc.wasm");
    if module.exists() {
        BridgeConfig::builder()
            .module_path(module)
            .data_dir("assets/data")
            .stdio(StdioMode::Discard)
            .build()
    } else {
        eprintln!("assets/opencc.wasm not found, benchmarking the WAT stand-in");
        BridgeConfig::builder()
            .module_bytes(MOCK_OPENCC.as_bytes().to_vec())
            .no_data_dir()
            .stdio(StdioMode::Discard)
            .build()
    }
}

const SAMPLE: &str = "这是一个很长的测试文本，用来测试转换性能。包含了很多常用的汉字。";

/// Benchmark cold start (fresh runtime, compile included).
fn bench_cold_start(c: &mut Criterion) {
    let config = bench_config();
    let mut group = c.benchmark_group("cold_start");
    group.sample_size(10); // Reduced sample size due to compilation time

    group.bench_function("runtime_and_first_instance", |b| {
        b.iter(|| {
            let runtime = SandboxRuntime::new(config.clone());
            let instance = runtime.new_instance().unwrap();
            black_box(instance)
        });
    });

    group.finish();
}

/// Benchmark one-shot conversions against a warm runtime.
fn bench_oneshot(c: &mut Criterion) {
    let runtime = SandboxRuntime::new(bench_config());
    runtime.acquire().unwrap();

    let mut group = c.benchmark_group("oneshot");
    group.throughput(Throughput::Bytes(SAMPLE.len() as u64));

    group.bench_function("convert_s2t", |b| {
        b.iter(|| {
            let output = runtime
                .convert(Direction::SimplifiedToTraditional, black_box(SAMPLE))
                .unwrap();
            black_box(output)
        });
    });

    group.finish();
}

/// Benchmark a long-lived converter across input sizes.
fn bench_converter(c: &mut Criterion) {
    let runtime = SandboxRuntime::new(bench_config());
    let mut converter = Converter::open_with(&runtime, configs::S2T).unwrap();

    let mut group = c.benchmark_group("converter");
    for repeat in [1usize, 16, 256] {
        let input = SAMPLE.repeat(repeat);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("convert", input.len()), &input, |b, input| {
            b.iter(|| black_box(converter.convert(input).unwrap()));
        });
    }
    group.finish();

    converter.close().unwrap();
}

criterion_group!(benches, bench_cold_start, bench_oneshot, bench_converter);
criterion_main!(benches);
