//! Splitting a recording by a channel property and recombining results.
//!
//! Without a grouping key there is exactly one partition whose folder is the
//! job folder itself. With a key there is one partition per distinct value
//! (first-appearance order) in `<base>/0`, `<base>/1`, ...

use crate::registry::BackendConfig;
use serde::{Deserialize, Serialize};
use spikesort_core::params::Params;
use spikesort_core::recording::{Recording, RecordingRef, SubRecording};
use spikesort_core::sorting::SortingResult;
use spikesort_core::types::{ChannelId, PropertyValue, GROUP_PROPERTY};
use spikesort_core::{Result, SortError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub const PARTITIONS_FILE: &str = "partitions.json";

/// One independent unit of work: a sub-recording and its exclusive folder.
#[derive(Debug, Clone)]
pub struct Partition {
    pub index: usize,
    pub recording: RecordingRef,
    pub folder: PathBuf,
    /// Grouping value shared by the partition's channels.
    pub group: Option<PropertyValue>,
}

/// Immutable inputs handed to a backend stage.
#[derive(Debug, Clone)]
pub struct PartitionContext {
    pub index: usize,
    pub recording: RecordingRef,
    pub folder: PathBuf,
    pub params: Arc<Params>,
    pub config: Arc<BackendConfig>,
    pub verbose: bool,
}

/// Distinct values of `key` in channel order of first appearance.
fn distinct_values(recording: &RecordingRef, key: &str) -> Result<Vec<(PropertyValue, Vec<ChannelId>)>> {
    let mut groups: Vec<(PropertyValue, Vec<ChannelId>)> = Vec::new();
    for channel in recording.channels() {
        let value = channel.properties.get(key).ok_or_else(|| {
            SortError::Configuration(format!(
                "'{key}' is not a property of every channel (missing on channel {})",
                channel.id
            ))
        })?;
        match groups.iter_mut().find(|(v, _)| v == value) {
            Some((_, ids)) => ids.push(channel.id),
            None => groups.push((value.clone(), vec![channel.id])),
        }
    }
    Ok(groups)
}

/// Partition `recording` under `base`.
pub fn split(recording: &RecordingRef, grouping_key: Option<&str>, base: &Path) -> Result<Vec<Partition>> {
    let Some(key) = grouping_key else {
        if recording.has_shared_property(GROUP_PROPERTY) {
            warn!(
                "recording has a '{GROUP_PROPERTY}' property; pass grouping_key=\"{GROUP_PROPERTY}\" to sort each group separately"
            );
        }
        return Ok(vec![Partition {
            index: 0,
            recording: Arc::clone(recording),
            folder: base.to_path_buf(),
            group: None,
        }]);
    };

    if !recording.has_shared_property(key) {
        return Err(SortError::Configuration(format!(
            "'{key}' is not one of the channel properties"
        )));
    }

    distinct_values(recording, key)?
        .into_iter()
        .enumerate()
        .map(|(index, (value, ids))| {
            let sub = SubRecording::new(Arc::clone(recording), &ids)
                .map_err(|e| SortError::Configuration(e.to_string()))?;
            // group of the first channel; uniform by construction
            let group = sub
                .channel_property(ids[0], key)
                .cloned()
                .unwrap_or(value);
            Ok(Partition {
                index,
                recording: Arc::new(sub),
                folder: base.join(index.to_string()),
                group: Some(group),
            })
        })
        .collect()
}

/// Job-level description of the partitions, stored in the job folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub sorter_name: String,
    pub sampling_frequency: f64,
    #[serde(default)]
    pub grouping_key: Option<String>,
    pub partitions: Vec<PartitionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub index: usize,
    /// Folder relative to the job folder; empty for an unpartitioned job.
    pub folder: String,
    #[serde(default)]
    pub group: Option<PropertyValue>,
    pub channel_ids: Vec<ChannelId>,
    /// Length of the partition recording; absent in older manifests.
    #[serde(default)]
    pub num_frames: Option<u64>,
}

impl PartitionManifest {
    pub fn new(sorter_name: &str, grouping_key: Option<&str>, base: &Path, partitions: &[Partition]) -> Self {
        let sampling_frequency = partitions
            .first()
            .map_or(0.0, |p| p.recording.sampling_frequency());
        Self {
            sorter_name: sorter_name.to_string(),
            sampling_frequency,
            grouping_key: grouping_key.map(str::to_string),
            partitions: partitions
                .iter()
                .map(|p| PartitionEntry {
                    index: p.index,
                    folder: p
                        .folder
                        .strip_prefix(base)
                        .map(|rel| rel.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    group: p.group.clone(),
                    channel_ids: p.recording.channel_ids(),
                    num_frames: Some(p.recording.num_frames()),
                })
                .collect(),
        }
    }

    pub fn write(&self, base: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(base.join(PARTITIONS_FILE), json)?;
        Ok(())
    }

    /// `None` when the job folder has no manifest.
    pub fn read(base: &Path) -> Result<Option<Self>> {
        let path = base.join(PARTITIONS_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn folder_of(&self, base: &Path, entry: &PartitionEntry) -> PathBuf {
        if entry.folder.is_empty() {
            base.to_path_buf()
        } else {
            base.join(&entry.folder)
        }
    }
}

/// Every spike of a parsed result must lie in `[0, num_frames)`.
pub fn check_frame_range(backend: &str, folder: &Path, sorting: &SortingResult, num_frames: u64) -> Result<()> {
    match sorting.max_frame() {
        Some(frame) if frame >= num_frames => Err(SortError::parsing(
            backend,
            folder,
            format!("spike at frame {frame} is past the recording end ({num_frames} frames)"),
        )),
        _ => Ok(()),
    }
}

/// Parsed output of one partition, `None` when the backend wrote nothing.
#[derive(Debug)]
pub struct PartitionOutput {
    pub index: usize,
    pub folder: PathBuf,
    pub group: Option<PropertyValue>,
    pub sorting: Option<SortingResult>,
}

/// Merge per-partition outputs into one result.
///
/// Grouped partitions tag their units with `group`. Absent and empty
/// partitions are excluded with a warning. An ungrouped job without output
/// is a parsing error.
pub fn recombine(backend: &str, outputs: Vec<PartitionOutput>, sampling_frequency: f64) -> Result<SortingResult> {
    if let [single] = outputs.as_slice() {
        if single.group.is_none() {
            let folder = single.folder.clone();
            let mut sorting = outputs
                .into_iter()
                .next()
                .and_then(|o| o.sorting)
                .ok_or_else(|| SortError::parsing(backend, folder, "no sorting output found"))?;
            sorting.sampling_frequency = Some(sampling_frequency);
            return Ok(sorting);
        }
    }

    let mut parts = Vec::with_capacity(outputs.len());
    for output in outputs {
        match output.sorting {
            None => warn!(
                backend,
                partition = output.index,
                folder = %output.folder.display(),
                "partition produced no output; excluded from merge"
            ),
            Some(sorting) if sorting.is_empty() => warn!(
                backend,
                partition = output.index,
                "partition produced no units; excluded from merge"
            ),
            Some(mut sorting) => {
                if let Some(group) = &output.group {
                    sorting.set_property_for_all(GROUP_PROPERTY, group);
                }
                parts.push((output.index, sorting));
            }
        }
    }
    let mut merged = SortingResult::merge(parts);
    merged.sampling_frequency = Some(sampling_frequency);
    Ok(merged)
}
