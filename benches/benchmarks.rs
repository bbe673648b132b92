use std::time::Duration;

use criterion::{criterion_group, criterion_main, Bencher, BenchmarkId, Criterion};

use faultline::config::JobConfig;
use faultline::pipeline::Pipeline;
use faultline::run::Cluster;
use faultline::testing::{standard_config, CollectOutput, MaxCountOutput, TestingInput};
use serde_json::json;

fn bench_pipeline(b: &mut Bencher, config: &JobConfig, build: impl Fn() -> Pipeline) {
    let cluster = Cluster::new(config.clone()).unwrap();
    b.iter(|| {
        let completion = cluster.execute(&build()).unwrap();
        assert!(completion.is_finished(), "{completion:?}");
    });
}

fn wordcount(items: u64) -> Pipeline {
    let mut pipeline = Pipeline::new("wordcount");
    pipeline
        .input(
            "inp",
            TestingInput::new((0..items).map(|i| json!(format!("w{}", i % 100))).collect()),
        )
        .stateful_map(
            "count",
            |word| word.as_str().unwrap_or_default().to_string(),
            || json!(0),
            |count, word| {
                let next = count.as_u64().unwrap_or(0) + 1;
                *count = json!(next);
                Some(json!({"prefix": word, "value": word, "count": next}))
            },
        )
        .output("out", MaxCountOutput::new());
    pipeline
}

fn passthrough(items: u64) -> Pipeline {
    let mut pipeline = Pipeline::new("passthrough");
    pipeline
        .input("inp", TestingInput::new((0..items).map(|i| json!(i)).collect()))
        .map("plus-one", |x| json!(x.as_u64().unwrap_or(0) + 1))
        .output("out", CollectOutput::new());
    pipeline
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut checkpointing = standard_config();
    checkpointing.checkpoint.interval = Duration::from_millis(10);

    let mut group = c.benchmark_group("execute");
    group.sample_size(10);
    for items in [1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("passthrough", items), &items, |b, &n| {
            bench_pipeline(b, &standard_config(), || passthrough(n));
        });
        group.bench_with_input(BenchmarkId::new("wordcount", items), &items, |b, &n| {
            bench_pipeline(b, &standard_config(), || wordcount(n));
        });
        group.bench_with_input(
            BenchmarkId::new("wordcount_checkpointing", items),
            &items,
            |b, &n| {
                bench_pipeline(b, &checkpointing, || wordcount(n));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
