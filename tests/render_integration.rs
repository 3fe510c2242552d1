//! Integration tests for the pipeline feeding the render coordinator
//!
//! Plot stages submit layers to a live coordinator with a headless surface.

mod common;

use common::builders::{ConfigBuilder, TestHost};
use common::mock_helpers::never_asked;
use common::test_timeout;
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};
use treevis_rs::builtin;
use treevis_rs::params::ParameterMap;
use treevis_rs::pipeline::{InputFile, Pipeline, StageIndex};
use treevis_rs::render::{HeadlessSurface, PassSummary, RenderCoordinator, RenderEvent};

fn next_pass(events: &crossbeam_channel::Receiver<RenderEvent>) -> PassSummary {
    match events.recv_timeout(test_timeout()).expect("render pass") {
        RenderEvent::PassCompleted(summary) => summary,
    }
}

#[test]
#[serial]
fn test_repeated_plot_runs_coalesce_into_one_update() {
    let host = TestHost::new(never_asked());
    let surface = HeadlessSurface::new();
    let view = surface.state();
    let interval = Duration::from_millis(300);
    let coordinator = Arc::new(RenderCoordinator::start(Box::new(surface), interval).unwrap());
    let events = coordinator.events();

    let config = ConfigBuilder::new()
        .plot(builtin::BRANCHES_ID, ParameterMap::new())
        .plot(builtin::LABELS_ID, ParameterMap::new())
        .build();
    let pipeline = Pipeline::new(host.registry.clone())
        .with_sink(coordinator.clone())
        .with_config(config);
    pipeline.set_input(InputFile::new("sample.nwk", common::SAMPLE_NEWICK));
    pipeline.run_from(StageIndex::Load).unwrap();

    // Layer 3 is submitted last, so its pass is the final one of the run
    while !next_pass(&events).layers_updated.contains(&3) {}
    assert_eq!(view.lock().layers.len(), 4);
    let before = view.lock().apply_counts.get(&3).copied().unwrap_or(0);
    let started = Instant::now();

    // The worker is sleeping out its interval, so these share one batch
    for _ in 0..3 {
        pipeline.run_from(StageIndex::Plot(3)).unwrap();
    }
    let summary = next_pass(&events);

    assert!(started.elapsed() >= interval / 2);
    assert_eq!(summary.layers_updated, vec![3]);
    assert_eq!(view.lock().apply_counts.get(&3).copied(), Some(before + 1));
    assert_eq!(view.lock().apply_counts.get(&0).copied(), Some(1));
}

#[test]
#[serial]
fn test_layers_share_global_bounds() {
    let host = TestHost::new(never_asked());
    let surface = HeadlessSurface::new();
    let view = surface.state();
    let coordinator = Arc::new(RenderCoordinator::start(Box::new(surface), Duration::from_millis(1)).unwrap());

    let pipeline = Pipeline::new(host.registry.clone()).with_sink(coordinator.clone());
    pipeline.set_input(InputFile::new("sample.nwk", common::SAMPLE_NEWICK));
    pipeline.run_from(StageIndex::Load).unwrap();

    assert!(common::wait_until(test_timeout(), || view.lock().layers.len() == 2));
    let bounds = coordinator.global_bounds().expect("bounds");
    let coordinates = pipeline.coordinates().unwrap();
    for point in coordinates.values() {
        assert!(point.x >= bounds.min.x && point.x <= bounds.max.x);
        assert!(point.y >= bounds.min.y && point.y <= bounds.max.y);
    }

    // Dropping the labels plot removes its layer from the surface
    let from = pipeline.remove_plot(1).unwrap();
    pipeline.run_from(from).unwrap();
    assert!(common::wait_until(test_timeout(), || view.lock().layers.len() == 1));
    assert_eq!(coordinator.layer_count(), 1);
}
