mod common;

use chrono::Utc;
use common::{toy, toy_on_disk};
use spikesort::launcher::{run_sorters, LaunchOptions};
use spikesort::{collect_sorting_outputs, name_recordings, SorterRegistry};
use spikesort_core::log::{is_log_ok, ExecutionLog};
use spikesort_core::types::{Engine, RunMode, GROUP_PROPERTY};
use spikesort_core::SortError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn sorters(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

fn key(recording: &str, sorter: &str) -> (String, String) {
    (recording.to_string(), sorter.to_string())
}

fn log_datetime(folder: &Path) -> chrono::DateTime<Utc> {
    ExecutionLog::read(folder).unwrap().datetime
}

#[tokio::test]
async fn serial_batch_fills_every_job_folder() {
    let dir = TempDir::new().unwrap();
    let recordings = name_recordings(vec![toy(2, 1.0, 1), toy(3, 1.0, 2)]);
    let options = LaunchOptions::new(dir.path());

    let results = run_sorters(&SorterRegistry::new(), &sorters(&["threshold"]), recordings, &options)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[&key("recording_0", "threshold")].as_ref().unwrap().num_units(), 2);
    assert_eq!(results[&key("recording_1", "threshold")].as_ref().unwrap().num_units(), 3);
    assert!(is_log_ok(&dir.path().join("recording_1/threshold")));
}

#[tokio::test]
async fn keep_mode_reruns_failed_jobs_and_skips_completed_ones() {
    let dir = TempDir::new().unwrap();
    let registry = SorterRegistry::new();
    let names = sorters(&["threshold"]);
    let recordings = || vec![("done".to_string(), toy(2, 1.0, 1)), ("failed".to_string(), toy(2, 1.0, 2))];

    let mut options = LaunchOptions::new(dir.path());
    run_sorters(&registry, &names, recordings(), &options).await.unwrap();

    let done = dir.path().join("done/threshold");
    let failed = dir.path().join("failed/threshold");
    let done_at = log_datetime(&done);
    ExecutionLog::failure("threshold", "0.1.0", Utc::now(), "killed".to_string())
        .write(&failed)
        .unwrap();
    assert!(!is_log_ok(&failed));

    options.mode = RunMode::Keep;
    let results = run_sorters(&registry, &names, recordings(), &options)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(log_datetime(&done), done_at);
    assert!(is_log_ok(&failed));
    assert!(results.values().all(Option::is_some));
}

#[tokio::test]
async fn raise_mode_refuses_completed_jobs_and_overwrite_reruns_them() {
    let dir = TempDir::new().unwrap();
    let registry = SorterRegistry::new();
    let names = sorters(&["threshold"]);
    let mut options = LaunchOptions::new(dir.path());

    run_sorters(&registry, &names, name_recordings(vec![toy(2, 1.0, 1)]), &options)
        .await
        .unwrap();
    let folder = dir.path().join("recording_0/threshold");
    let first = log_datetime(&folder);
    std::fs::write(folder.join("stale.txt"), "left over").unwrap();

    let err = run_sorters(&registry, &names, name_recordings(vec![toy(2, 1.0, 1)]), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, SortError::Configuration(_)));
    assert_eq!(log_datetime(&folder), first);

    options.mode = RunMode::Overwrite;
    run_sorters(&registry, &names, name_recordings(vec![toy(2, 1.0, 1)]), &options)
        .await
        .unwrap();
    assert!(is_log_ok(&folder));
    assert!(!folder.join("stale.txt").exists());
}

#[tokio::test]
async fn grouped_batch_is_collected_with_group_tags() {
    let dir = TempDir::new().unwrap();
    let registry = SorterRegistry::new();
    let mut options = LaunchOptions::new(dir.path());
    options.settings.grouping_key = Some(GROUP_PROPERTY.to_string());
    options.with_output = false;

    let results = run_sorters(&registry, &sorters(&["threshold"]), name_recordings(vec![toy(4, 1.0, 3)]), &options)
        .await
        .unwrap();
    assert!(results.is_none());

    let first = collect_sorting_outputs(&registry, dir.path()).unwrap();
    let second = collect_sorting_outputs(&registry, dir.path()).unwrap();
    assert_eq!(first, second);

    let sorting = &first[&key("recording_0", "threshold")];
    assert_eq!(sorting.num_units(), 4);
    assert_eq!(
        sorting.unit_property(2, GROUP_PROPERTY).and_then(spikesort_core::PropertyValue::as_i64),
        Some(1)
    );
}

#[tokio::test]
async fn failed_jobs_are_none_when_not_raising() {
    let dir = TempDir::new().unwrap();
    let mut options = LaunchOptions::new(dir.path().join("work"));
    options.settings.raise_error = false;

    #[cfg(unix)]
    let registry = {
        let matlab = common::fake_program(dir.path(), "matlab", "exit 2");
        common::fake_kilosort(dir.path(), matlab)
    };
    #[cfg(not(unix))]
    let registry = SorterRegistry::new();
    let names = if cfg!(unix) {
        sorters(&["threshold", "kilosort"])
    } else {
        sorters(&["threshold"])
    };

    let results = run_sorters(&registry, &names, name_recordings(vec![toy(2, 1.0, 4)]), &options)
        .await
        .unwrap()
        .unwrap();
    assert!(results[&key("recording_0", "threshold")].is_some());
    if cfg!(unix) {
        assert!(results[&key("recording_0", "kilosort")].is_none());
        let collected = collect_sorting_outputs(&registry, &options.working_folder).unwrap();
        assert_eq!(collected.len(), 1);
    }
}

#[tokio::test]
async fn process_pool_runs_jobs_in_worker_processes() {
    let dir = TempDir::new().unwrap();
    let recordings = vec![
        ("a".to_string(), toy_on_disk(dir.path(), "a", 2, 1)),
        ("b".to_string(), toy_on_disk(dir.path(), "b", 3, 2)),
        ("c".to_string(), toy(2, 1.0, 3)),
    ];
    let mut options = LaunchOptions::new(dir.path().join("work"));
    options.engine = Engine::ProcessPool;
    options.engine_options.processes = 2;
    options.engine_options.worker_bin = Some(PathBuf::from(env!("CARGO_BIN_EXE_spikesort")));

    let results = run_sorters(&SorterRegistry::new(), &sorters(&["threshold"]), recordings, &options)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[&key("b", "threshold")].as_ref().unwrap().num_units(), 3);
    assert!(results.values().all(Option::is_some));
    // only the in-memory recording had to be written out
    assert!(options.working_folder.join(".recordings/c.raw").is_file());
    assert!(!options.working_folder.join(".recordings/a.raw").exists());
}

#[tokio::test]
async fn kilosort2_cannot_use_worker_engines() {
    let dir = TempDir::new().unwrap();
    let install = dir.path().join("ks2");
    std::fs::create_dir_all(&install).unwrap();
    std::fs::write(install.join("master_kilosort.m"), "").unwrap();
    let registry = SorterRegistry::new().with_backend_config(
        spikesort::backends::BackendKind::Kilosort2,
        spikesort::BackendConfig {
            install_path: Some(install),
            ..spikesort::BackendConfig::default()
        },
    );
    let mut options = LaunchOptions::new(dir.path().join("work"));
    options.engine = Engine::ProcessPool;

    let err = run_sorters(&registry, &sorters(&["kilosort2"]), name_recordings(vec![toy(2, 1.0, 1)]), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, SortError::Configuration(_)));
    assert!(!options.working_folder.exists());
}

#[tokio::test]
async fn unknown_sorter_fails_before_any_job() {
    let dir = TempDir::new().unwrap();
    let options = LaunchOptions::new(dir.path().join("work"));
    let err = run_sorters(
        &SorterRegistry::new(),
        &sorters(&["threshold", "klusta"]),
        name_recordings(vec![toy(2, 1.0, 1)]),
        &options,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SortError::Configuration(_)));
    assert!(!options.working_folder.exists());
}

#[tokio::test]
async fn collected_spike_past_recording_end_is_parsing_error() {
    let dir = TempDir::new().unwrap();
    let registry = SorterRegistry::new();
    let mut options = LaunchOptions::new(dir.path());
    options.settings.grouping_key = Some(GROUP_PROPERTY.to_string());
    options.with_output = false;
    run_sorters(&registry, &sorters(&["threshold"]), name_recordings(vec![toy(4, 1.0, 5)]), &options)
        .await
        .unwrap();

    let mut bogus = spikesort_core::SortingResult::new(Some(30_000.0));
    bogus.add_unit(0, vec![1_030_000]);
    bogus
        .write_json(&dir.path().join("recording_0/threshold/1/sorting.json"))
        .unwrap();

    let err = collect_sorting_outputs(&registry, dir.path()).unwrap_err();
    match err {
        SortError::ResultParsing { folder, .. } => assert!(folder.ends_with("threshold/1")),
        other => panic!("unexpected: {other:?}"),
    }
}
