use criterion::{black_box, criterion_group, criterion_main, Criterion};
use metasched::config::{ProblemDescription, SchedulerOptions};
use metasched::environment::run_local;
use metasched::scheduler::{partition, peer_job_blocks, ProcessorEstimate};
use std::sync::Arc;

const MULTI_START: &str = r#"{
    "top_method": "ms",
    "methods": [
        {"id": "ms", "method": {"type": "multi_start", "method_name": "pattern_search", "random_starts": 16}}
    ],
    "models": [
        {"id": "rosen", "function": {"type": "rosenbrock"},
         "lower_bounds": [-2, -2], "upper_bounds": [2, 2], "initial_point": [-1.2, 1.0]}
    ]
}"#;

fn bench_partition(c: &mut Criterion) {
    let opts = SchedulerOptions::default();
    c.bench_function("partition 1000 jobs on 512 processes", |b| {
        b.iter(|| {
            let p = partition(black_box(1000), 1000, ProcessorEstimate::new(2, 8), black_box(512), &opts).unwrap();
            peer_job_blocks(1000, p.num_servers)
        })
    });
}

fn bench_local_rounds(c: &mut Criterion) {
    let description = Arc::new(ProblemDescription::from_json(MULTI_START).unwrap());
    let mut group = c.benchmark_group("multi-start on thread ranks");
    group.sample_size(10);
    for ranks in [1, 2, 4] {
        group.bench_function(format!("{ranks} rank(s)"), |b| {
            b.iter(|| run_local(Arc::clone(&description), ranks).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_partition, bench_local_rounds);
criterion_main!(benches);
