//! Benchmarks for pipeline execution.

use conveyor::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn pipeline_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    c.bench_function("double_chain_1k", |b| {
        b.iter(|| {
            let processed = runtime.block_on(async {
                let double: Stage<u64, u64> = Stage::from_fn("double", |n: u64| Ok(n.wrapping_mul(2)));
                let sink: Stage<u64, ()> = Stage::from_fn("sink", |_n: u64| Ok(()));
                double.add_consumer(&sink);
                let feed = double.inlet();

                let mut manager = StageManager::new();
                manager.register(double);
                manager.register(sink);
                let run = tokio::spawn(manager.run());

                for n in 0..1_000_u64 {
                    let _ = feed.send(n).await;
                }
                feed.close();

                run.await.map(|outcome| outcome.processed_total()).unwrap_or(0)
            });
            black_box(processed)
        })
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
