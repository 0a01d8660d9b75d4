// SPDX-License-Identifier: MPL-2.0

//! Recording rotation and quota, driven through the pipeline engine

use pitv::config::PipelineConfig;
use pitv::errors::PipelineError;
use pitv::pipeline::Pipeline;
use pitv::pipeline::simulated::SimulatedGraph;

const HALF_MEGABYTE: usize = 600 * 1024;

fn running(config: PipelineConfig) -> (Pipeline, SimulatedGraph) {
    let graph = SimulatedGraph::new();
    let mut pipeline = Pipeline::new(config, Box::new(graph.clone()));
    pipeline.construct().unwrap();
    pipeline.start().unwrap();
    (pipeline, graph)
}

#[test]
fn oldest_fragments_are_pruned_once_the_quota_is_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let (mut pipeline, graph) = running(PipelineConfig {
        recording_path: dir.path().to_path_buf(),
        recording_max_size_mb: 1,
        ..PipelineConfig::default()
    });

    graph.write_to_fragment(HALF_MEGABYTE).unwrap();
    pipeline.split_now().unwrap();
    graph.write_to_fragment(HALF_MEGABYTE).unwrap();
    pipeline.split_now().unwrap();

    let fragments = graph.fragments();
    assert_eq!(fragments.len(), 3);
    assert!(!fragments[0].exists(), "oldest fragment should be pruned");
    assert!(fragments[1].exists());
    assert!(fragments[2].exists());
    assert_eq!(
        pipeline.recording_store().lock().active_fragment(),
        Some(fragments[2].as_path())
    );
}

#[test]
fn unbounded_quota_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let (mut pipeline, graph) = running(PipelineConfig {
        recording_path: dir.path().to_path_buf(),
        recording_max_size_mb: 0,
        ..PipelineConfig::default()
    });

    for _ in 0..3 {
        graph.write_to_fragment(HALF_MEGABYTE).unwrap();
        pipeline.split_now().unwrap();
    }

    let fragments = graph.fragments();
    assert_eq!(fragments.len(), 4);
    assert!(fragments.iter().all(|f| f.exists()));
}

#[test]
fn fragments_are_named_by_start_time_and_index() {
    let dir = tempfile::tempdir().unwrap();
    let (mut pipeline, graph) = running(PipelineConfig {
        recording_path: dir.path().to_path_buf(),
        ..PipelineConfig::default()
    });
    pipeline.split_now().unwrap();

    let names: Vec<String> = graph
        .fragments()
        .iter()
        .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names[0].ends_with("[0].mp4"), "{}", names[0]);
    assert!(names[1].ends_with("[1].mp4"), "{}", names[1]);
    // YYYY-MM-DD--HH-MM-SS prefix
    assert_eq!(&names[0][10..12], "--");
}

#[test]
fn new_recording_directory_applies_to_the_next_fragment() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        recording_path: first.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let (mut pipeline, graph) = running(config.clone());

    pipeline
        .set_config(PipelineConfig {
            recording_path: second.path().join("clips"),
            ..config
        })
        .unwrap();
    pipeline.split_now().unwrap();

    let fragments = graph.fragments();
    assert!(fragments[0].starts_with(first.path().canonicalize().unwrap()));
    assert!(fragments[1].starts_with(second.path().canonicalize().unwrap()));
    assert!(second.path().join("clips").is_dir());
}

#[test]
fn missing_directory_without_mkdirs_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let graph = SimulatedGraph::new();
    let mut pipeline = Pipeline::new(
        PipelineConfig {
            recording_path: dir.path().join("absent"),
            force_mkdirs: false,
            ..PipelineConfig::default()
        },
        Box::new(graph.clone()),
    );
    pipeline.construct().unwrap();

    assert!(matches!(pipeline.start(), Err(PipelineError::Storage(_))));
    assert!(!pipeline.is_playing());
    assert!(graph.fragments().is_empty());
}
