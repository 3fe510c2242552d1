//! Benchmarks for pipeline recomputation and render coalescing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use treevis_rs::builtin;
use treevis_rs::config::{AppConfig, ModuleRoots};
use treevis_rs::module::{DenyAll, Registry};
use treevis_rs::params::{ParameterMap, ParameterValue};
use treevis_rs::pipeline::{InputFile, Pipeline, PipelineConfig, StageConfig, StageIndex};
use treevis_rs::render::{coalesce, LayerContent, LayerUpdate, Primitives, UpdateRequest};
use treevis_rs::tree::parse_newick;

/// Balanced tree with `2^depth` leaves and unit branch lengths.
fn balanced_newick(depth: u32) -> String {
    fn clade(depth: u32, next: &mut usize) -> String {
        if depth == 0 {
            *next += 1;
            return format!("L{}:1", next);
        }
        format!("({},{}):1", clade(depth - 1, next), clade(depth - 1, next))
    }
    let mut next = 0;
    format!("{};", clade(depth, &mut next))
}

fn registry(dir: &std::path::Path) -> Arc<Registry> {
    let roots = ModuleRoots::with_executable_dir(dir.join("data"), dir.join("bin"));
    let registry = Registry::open(roots, Arc::new(DenyAll), &AppConfig::default())
        .expect("registry")
        .with_builtins();
    Arc::new(registry)
}

fn bench_newick_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("newick_parsing");

    for depth in [6u32, 10, 13] {
        let text = balanced_newick(depth);
        group.throughput(Throughput::Elements(1 << depth));
        group.bench_with_input(BenchmarkId::new("parse", 1u32 << depth), &text, |b, text| {
            b.iter(|| black_box(parse_newick(text).expect("valid newick")));
        });
    }

    group.finish();
}

fn bench_incremental_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_from");
    let dir = tempfile::tempdir().expect("temp dir");
    let registry = registry(dir.path());

    for depth in [6u32, 10] {
        let mut config = PipelineConfig::default();
        config.further.push(StageConfig::new(builtin::SORT_NODES_ID));
        config.further.push(
            StageConfig::new(builtin::SCALE_BRANCHES_ID)
                .with_parameters(ParameterMap::new().with(builtin::transforms::FACTOR, ParameterValue::Double(2.0))),
        );
        let pipeline = Pipeline::new(registry.clone()).with_config(config);
        pipeline.set_input(InputFile::new("bench.nwk", balanced_newick(depth)));
        pipeline.run_from(StageIndex::Load).expect("initial run");

        let leaves = 1u32 << depth;
        group.bench_with_input(BenchmarkId::new("further_1", leaves), &pipeline, |b, pipeline| {
            b.iter(|| black_box(pipeline.run_from(StageIndex::Further(1)).expect("run")));
        });
        group.bench_with_input(BenchmarkId::new("plot_1", leaves), &pipeline, |b, pipeline| {
            b.iter(|| black_box(pipeline.run_from(StageIndex::Plot(1)).expect("run")));
        });
    }

    group.finish();
}

fn bench_coalesce(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalesce");
    let content: Arc<dyn LayerContent> = Arc::new(Primitives::new());

    for size in [16usize, 256, 4096] {
        let batch: Vec<UpdateRequest> = (0..size)
            .map(|i| UpdateRequest {
                layer_index: i % 8,
                recompute_global_bounds: i % 3 == 0,
                update: LayerUpdate::Content(content.clone()),
            })
            .collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("batch", size), &batch, |b, batch| {
            b.iter(|| black_box(coalesce(batch.clone())));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_newick_parsing, bench_incremental_run, bench_coalesce);
criterion_main!(benches);
