mod common;

use common::toy;
use serde_json::json;
use spikesort::{run_sorter, Sorter, SorterOptions, SorterRegistry};
use spikesort_core::log::ExecutionLog;
use spikesort_core::params::{read_params, Params, PARAMS_FILE};
use spikesort_core::types::{PropertyValue, CHANNEL_PROPERTY, GROUP_PROPERTY};
use spikesort_core::{Recording, SortError, SortingResult};
use std::collections::BTreeSet;
use tempfile::TempDir;

fn threshold_params() -> Params {
    [("detect_threshold", json!(5)), ("detect_sign", json!(-1))]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn spikes_by_channel(sorting: &SortingResult) -> Vec<(i64, BTreeSet<u64>)> {
    let mut by_channel: Vec<_> = sorting
        .unit_ids()
        .into_iter()
        .map(|id| {
            let channel = sorting
                .unit_property(id, CHANNEL_PROPERTY)
                .and_then(PropertyValue::as_i64)
                .unwrap();
            let train = sorting.spike_train(id).unwrap().iter().copied().collect();
            (channel, train)
        })
        .collect();
    by_channel.sort();
    by_channel
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_serial_and_parallel_agree_per_channel() {
    let dir = TempDir::new().unwrap();
    let registry = SorterRegistry::new();
    let recording = toy(4, 20.0, 42);

    let serial = run_sorter(
        &registry,
        "threshold",
        recording.clone(),
        SorterOptions::new(dir.path().join("serial")),
        &threshold_params(),
        true,
    )
    .await
    .unwrap()
    .unwrap();

    let parallel = run_sorter(
        &registry,
        "threshold",
        recording.clone(),
        SorterOptions::new(dir.path().join("parallel"))
            .grouping_key(GROUP_PROPERTY)
            .parallel(true),
        &threshold_params(),
        true,
    )
    .await
    .unwrap()
    .unwrap();

    let serial_channels = spikes_by_channel(&serial);
    let channels: Vec<i64> = serial_channels.iter().map(|(c, _)| *c).collect();
    assert_eq!(channels, vec![0, 1, 2, 3]);
    assert!(serial_channels.iter().all(|(_, train)| !train.is_empty()));
    assert_eq!(serial_channels, spikes_by_channel(&parallel));

    let num_frames = recording.num_frames();
    for sorting in [&serial, &parallel] {
        assert!(sorting.max_frame().is_some_and(|f| f < num_frames));
    }
}

#[tokio::test]
async fn grouping_creates_one_folder_per_value_and_keeps_every_unit() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("job");
    let mut sorter = Sorter::new(
        &SorterRegistry::new(),
        "threshold",
        toy(6, 2.0, 9),
        SorterOptions::new(&base).grouping_key(GROUP_PROPERTY),
    )
    .unwrap();
    sorter.set_params(&Params::new()).unwrap();
    sorter.run(true).await.unwrap();

    assert_eq!(sorter.partitions().len(), 3);
    let mut per_partition = 0;
    for i in 0..3 {
        let folder = base.join(i.to_string());
        assert!(folder.is_dir());
        per_partition += SortingResult::read_json(&folder.join("sorting.json")).unwrap().num_units();
    }
    let merged = sorter.get_result().unwrap();
    assert_eq!(merged.num_units(), per_partition);
    assert_eq!(merged.unit_property(5, GROUP_PROPERTY), Some(&PropertyValue::Int(2)));
}

#[test]
fn bogus_parameter_leaves_previous_file_untouched() {
    let dir = TempDir::new().unwrap();
    let mut sorter = Sorter::new(
        &SorterRegistry::new(),
        "threshold",
        toy(2, 1.0, 1),
        SorterOptions::new(dir.path()),
    )
    .unwrap();
    sorter.set_params(&threshold_params()).unwrap();
    let before = std::fs::read(dir.path().join(PARAMS_FILE)).unwrap();

    let mut bogus = Params::new();
    bogus.insert("bogus_key".to_string(), json!(1));
    match sorter.set_params(&bogus) {
        Err(SortError::Parameter { unknown, .. }) => assert_eq!(unknown, vec!["bogus_key"]),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(std::fs::read(dir.path().join(PARAMS_FILE)).unwrap(), before);
    assert_eq!(read_params(dir.path()).unwrap()["detect_threshold"], json!(5));
}

#[cfg(unix)]
mod exit_code {
    use super::*;
    use crate::common::{fake_kilosort, fake_program};

    #[tokio::test]
    async fn nonzero_exit_raises_backend_execution() {
        let dir = TempDir::new().unwrap();
        let matlab = fake_program(dir.path(), "matlab", "echo \"matlab $*\"\nexit 3");
        let registry = fake_kilosort(dir.path(), matlab);
        let output = dir.path().join("ks");

        let err = run_sorter(&registry, "kilosort", toy(2, 1.0, 2), SorterOptions::new(&output), &Params::new(), true)
            .await
            .unwrap_err();
        match &err {
            SortError::BackendExecution { backend, message } => {
                assert_eq!(backend, "kilosort");
                assert!(message.contains("(3)"), "{message}");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let log = ExecutionLog::read(&output).unwrap();
        assert!(log.error);
        assert_eq!(log.run_time, None);
        let transcript = std::fs::read_to_string(output.join("kilosort.log")).unwrap();
        assert!(transcript.contains("kilosort_master"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_logged_when_not_raising() {
        let dir = TempDir::new().unwrap();
        let matlab = fake_program(dir.path(), "matlab", "exit 1");
        let registry = fake_kilosort(dir.path(), matlab);
        let output = dir.path().join("ks");

        let result = run_sorter(&registry, "kilosort", toy(2, 1.0, 2), SorterOptions::new(&output), &Params::new(), false)
            .await
            .unwrap();
        assert!(result.is_none());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(output.join("log.json")).unwrap()).unwrap();
        assert_eq!(raw["error"], json!(true));
        assert_eq!(raw["run_time"], serde_json::Value::Null);
        assert!(raw["error_trace"].as_str().unwrap().contains("kilosort"));
    }

    #[tokio::test]
    async fn missing_output_is_backend_execution() {
        let dir = TempDir::new().unwrap();
        let matlab = fake_program(dir.path(), "matlab", "exit 0");
        let registry = fake_kilosort(dir.path(), matlab);

        let err = run_sorter(
            &registry,
            "kilosort",
            toy(2, 1.0, 2),
            SorterOptions::new(dir.path().join("ks")),
            &Params::new(),
            true,
        )
        .await
        .unwrap_err();
        assert!(err.is_execution_failure(), "{err}");
    }
}
