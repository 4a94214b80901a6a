//! Rebuild sorting results from a working folder.
//!
//! Walks `<working_folder>/<recording>/<sorter>/`, keeps leaves with a
//! completed log and parses them with the backend named by the folder.
//! Nothing is executed, so collecting twice gives the same result.

use crate::backends::BackendKind;
use crate::partition::{check_frame_range, recombine, PartitionManifest, PartitionOutput};
use crate::registry::SorterRegistry;
use spikesort_core::log::is_log_ok;
use spikesort_core::sorting::SortingResult;
use spikesort_core::{Result, SortError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Completed results keyed by `(recording_name, sorter_name)`.
pub type SortingOutputs = BTreeMap<(String, String), SortingResult>;

/// Visible sub-directories of `folder`, sorted by name.
fn subdirs(folder: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type()?.is_dir() {
            continue;
        }
        dirs.push((name, entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

/// Result of one completed job folder.
///
/// Partitioned jobs are recombined from their manifest; units are tagged with
/// the partition group as in the original run.
pub fn load_job_result(kind: BackendKind, folder: &Path) -> Result<SortingResult> {
    let Some(manifest) = PartitionManifest::read(folder)? else {
        return kind
            .result_from_folder(folder)?
            .ok_or_else(|| SortError::parsing(kind.name(), folder, "no sorting output found"));
    };
    let outputs = manifest
        .partitions
        .iter()
        .map(|entry| -> Result<PartitionOutput> {
            let partition_folder = manifest.folder_of(folder, entry);
            let sorting = kind.result_from_folder(&partition_folder)?;
            if let (Some(sorting), Some(num_frames)) = (&sorting, entry.num_frames) {
                check_frame_range(kind.name(), &partition_folder, sorting, num_frames)?;
            }
            Ok(PartitionOutput {
                index: entry.index,
                sorting,
                folder: partition_folder,
                group: entry.group.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    recombine(kind.name(), outputs, manifest.sampling_frequency)
}

/// Collect every completed job under `working_folder`.
pub fn collect_sorting_outputs(registry: &SorterRegistry, working_folder: &Path) -> Result<SortingOutputs> {
    let mut outputs = SortingOutputs::new();
    for (recording_name, recording_folder) in subdirs(working_folder)? {
        for (sorter_name, folder) in subdirs(&recording_folder)? {
            let Ok(entry) = registry.get(&sorter_name) else {
                warn!(folder = %folder.display(), sorter = %sorter_name, "unknown sorter folder; skipped");
                continue;
            };
            if !is_log_ok(&folder) {
                debug!(folder = %folder.display(), "no completed run; skipped");
                continue;
            }
            let sorting = load_job_result(entry.kind, &folder)?;
            outputs.insert((recording_name.clone(), sorter_name), sorting);
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use spikesort_core::log::ExecutionLog;
    use spikesort_core::sorting::SORTING_FILE;
    use tempfile::TempDir;

    fn completed_job(folder: &Path, ids: &[u32]) {
        std::fs::create_dir_all(folder).unwrap();
        let mut sorting = SortingResult::new(Some(1000.0));
        for id in ids {
            sorting.add_unit(*id, vec![u64::from(*id) + 1]);
        }
        sorting.write_json(&folder.join(SORTING_FILE)).unwrap();
        ExecutionLog::success("threshold", "0.1.0", Utc::now(), 0.5).write(folder).unwrap();
    }

    #[test]
    fn collects_completed_jobs_only() {
        let dir = TempDir::new().unwrap();
        completed_job(&dir.path().join("rec_a/threshold"), &[0, 1]);
        completed_job(&dir.path().join("rec_b/threshold"), &[2]);

        let failed = dir.path().join("rec_c/threshold");
        std::fs::create_dir_all(&failed).unwrap();
        ExecutionLog::failure("threshold", "0.1.0", Utc::now(), "boom".to_string())
            .write(&failed)
            .unwrap();
        std::fs::create_dir_all(dir.path().join("rec_a/klusta")).unwrap();
        std::fs::create_dir_all(dir.path().join(".recordings/threshold")).unwrap();

        let outputs = collect_sorting_outputs(&SorterRegistry::new(), dir.path()).unwrap();
        let keys: Vec<_> = outputs.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                ("rec_a".to_string(), "threshold".to_string()),
                ("rec_b".to_string(), "threshold".to_string()),
            ]
        );
        assert_eq!(outputs[&keys[0]].unit_ids(), vec![0, 1]);
    }

    #[test]
    fn collecting_twice_is_identical() {
        let dir = TempDir::new().unwrap();
        completed_job(&dir.path().join("rec/threshold"), &[3, 4]);
        let registry = SorterRegistry::new();
        let first = collect_sorting_outputs(&registry, dir.path()).unwrap();
        let second = collect_sorting_outputs(&registry, dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn completed_log_without_output_is_parsing_error() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("rec/threshold");
        std::fs::create_dir_all(&folder).unwrap();
        ExecutionLog::success("threshold", "0.1.0", Utc::now(), 0.5).write(&folder).unwrap();
        assert!(matches!(
            collect_sorting_outputs(&SorterRegistry::new(), dir.path()),
            Err(SortError::ResultParsing { .. })
        ));
    }
}
