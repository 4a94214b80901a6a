//! Recording contract consumed by the sorters.
//!
//! A recording is a multi-channel timeseries with per-channel metadata.
//! Three implementations are provided:
//! - `InMemoryRecording`: traces held in memory (synthetic data, tests)
//! - `BinaryRecording`: interleaved raw file on disk (time-major)
//! - `SubRecording`: a channel-subset view over another recording
//!
//! Recordings that can describe themselves return a `RecordingSpec`, which is
//! what travels to worker processes.

use crate::types::{ChannelId, DataType, PropertyValue, LOCATION_PROPERTY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Frames written per chunk when dumping a recording to disk.
const WRITE_CHUNK_FRAMES: u64 = 65_536;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("channel {0} is not part of the recording")]
    UnknownChannel(ChannelId),
    #[error("frame range {start}..{end} outside recording of {num_frames} frames")]
    FrameRange { start: u64, end: u64, num_frames: u64 },
    #[error("invalid recording: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, RecordingError>;

/// Per-channel metadata.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Shared handle to a recording.
pub type RecordingRef = Arc<dyn Recording>;

/// One channel and its properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    #[serde(default)]
    pub properties: Properties,
}

impl ChannelInfo {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            properties: Properties::new(),
        }
    }
}

/// Read contract for a multi-channel recording.
pub trait Recording: Send + Sync + fmt::Debug {
    fn channels(&self) -> &[ChannelInfo];

    fn sampling_frequency(&self) -> f64;

    fn num_frames(&self) -> u64;

    /// Traces for `channel_ids` over frames `start..end`, one vector per channel.
    fn traces(&self, channel_ids: &[ChannelId], start: u64, end: u64) -> Result<Vec<Vec<f32>>>;

    /// Whether a filter was already applied upstream.
    fn is_filtered(&self) -> bool {
        false
    }

    /// Self-description for transport to another process, if possible.
    fn spec(&self) -> Option<RecordingSpec> {
        None
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels().iter().map(|c| c.id).collect()
    }

    fn num_channels(&self) -> usize {
        self.channels().len()
    }

    fn channel_property(&self, channel: ChannelId, name: &str) -> Option<&PropertyValue> {
        self.channels()
            .iter()
            .find(|c| c.id == channel)
            .and_then(|c| c.properties.get(name))
    }

    /// Property names carried by every channel.
    fn shared_property_names(&self) -> Vec<String> {
        let channels = self.channels();
        let Some(first) = channels.first() else {
            return Vec::new();
        };
        first
            .properties
            .keys()
            .filter(|name| channels.iter().all(|c| c.properties.contains_key(*name)))
            .cloned()
            .collect()
    }

    fn has_shared_property(&self, name: &str) -> bool {
        !self.channels().is_empty()
            && self
                .channels()
                .iter()
                .all(|c| c.properties.contains_key(name))
    }

    /// Locations of every channel, if all of them carry one.
    fn channel_locations(&self) -> Option<Vec<Vec<f64>>> {
        self.channels()
            .iter()
            .map(|c| {
                c.properties
                    .get(LOCATION_PROPERTY)
                    .and_then(PropertyValue::as_vector)
                    .map(<[f64]>::to_vec)
            })
            .collect()
    }
}

fn check_range(start: u64, end: u64, num_frames: u64) -> Result<()> {
    if start > end || end > num_frames {
        return Err(RecordingError::FrameRange {
            start,
            end,
            num_frames,
        });
    }
    Ok(())
}

fn channel_index(channels: &[ChannelInfo], id: ChannelId) -> Result<usize> {
    channels
        .iter()
        .position(|c| c.id == id)
        .ok_or(RecordingError::UnknownChannel(id))
}

// --- In-memory recording ---

/// Recording whose traces live in memory, one vector per channel.
#[derive(Debug, Clone)]
pub struct InMemoryRecording {
    sampling_frequency: f64,
    channels: Vec<ChannelInfo>,
    traces: Vec<Vec<f32>>,
    filtered: bool,
}

impl InMemoryRecording {
    /// Build from per-channel traces; channel ids are `0..traces.len()`.
    pub fn new(sampling_frequency: f64, traces: Vec<Vec<f32>>) -> Result<Self> {
        let frames = traces.first().map_or(0, Vec::len);
        if traces.iter().any(|t| t.len() != frames) {
            return Err(RecordingError::Invalid(
                "all channels must have the same number of frames".to_string(),
            ));
        }
        if sampling_frequency <= 0.0 {
            return Err(RecordingError::Invalid(format!(
                "sampling frequency must be positive, got {sampling_frequency}"
            )));
        }
        let channels = (0..traces.len())
            .map(|i| ChannelInfo::new(i as ChannelId))
            .collect();
        Ok(Self {
            sampling_frequency,
            channels,
            traces,
            filtered: false,
        })
    }

    pub fn set_channel_property(
        &mut self,
        channel: ChannelId,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        let index = channel_index(&self.channels, channel)?;
        self.channels[index]
            .properties
            .insert(name.to_string(), value.into());
        Ok(())
    }

    pub fn with_filtered(mut self, filtered: bool) -> Self {
        self.filtered = filtered;
        self
    }
}

impl Recording for InMemoryRecording {
    fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn num_frames(&self) -> u64 {
        self.traces.first().map_or(0, |t| t.len() as u64)
    }

    fn traces(&self, channel_ids: &[ChannelId], start: u64, end: u64) -> Result<Vec<Vec<f32>>> {
        check_range(start, end, self.num_frames())?;
        channel_ids
            .iter()
            .map(|id| {
                let index = channel_index(&self.channels, *id)?;
                Ok(self.traces[index][start as usize..end as usize].to_vec())
            })
            .collect()
    }

    fn is_filtered(&self) -> bool {
        self.filtered
    }
}

// --- Binary recording ---

/// Interleaved (time-major) raw recording file.
#[derive(Debug, Clone)]
pub struct BinaryRecording {
    path: PathBuf,
    dtype: DataType,
    offset: u64,
    sampling_frequency: f64,
    channels: Vec<ChannelInfo>,
    num_frames: u64,
    filtered: bool,
}

impl BinaryRecording {
    /// Open a raw file; the frame count is derived from the file size.
    pub fn open(
        path: impl Into<PathBuf>,
        dtype: DataType,
        offset: u64,
        sampling_frequency: f64,
        channels: Vec<ChannelInfo>,
    ) -> Result<Self> {
        let path = path.into();
        if channels.is_empty() {
            return Err(RecordingError::Invalid(format!(
                "{} declares no channels",
                path.display()
            )));
        }
        let len = std::fs::metadata(&path)?.len();
        let frame_bytes = (channels.len() * dtype.byte_width()) as u64;
        let data_bytes = len.saturating_sub(offset);
        if data_bytes % frame_bytes != 0 {
            return Err(RecordingError::Invalid(format!(
                "{} has {data_bytes} data bytes, not a multiple of {frame_bytes}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            dtype,
            offset,
            sampling_frequency,
            num_frames: data_bytes / frame_bytes,
            channels,
            filtered: false,
        })
    }

    pub fn with_filtered(mut self, filtered: bool) -> Self {
        self.filtered = filtered;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Recording for BinaryRecording {
    fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn num_frames(&self) -> u64 {
        self.num_frames
    }

    fn traces(&self, channel_ids: &[ChannelId], start: u64, end: u64) -> Result<Vec<Vec<f32>>> {
        check_range(start, end, self.num_frames)?;
        let indices = channel_ids
            .iter()
            .map(|id| channel_index(&self.channels, *id))
            .collect::<Result<Vec<_>>>()?;

        let width = self.dtype.byte_width();
        let frame_bytes = self.channels.len() * width;
        let frames = (end - start) as usize;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset + start * frame_bytes as u64))?;
        let mut raw = vec![0u8; frames * frame_bytes];
        file.read_exact(&mut raw)?;

        let mut out = vec![Vec::with_capacity(frames); indices.len()];
        for frame in raw.chunks_exact(frame_bytes) {
            for (slot, &index) in out.iter_mut().zip(&indices) {
                let at = index * width;
                let value = match self.dtype {
                    DataType::Int16 => f32::from(i16::from_le_bytes([frame[at], frame[at + 1]])),
                    DataType::Float32 => f32::from_le_bytes([
                        frame[at],
                        frame[at + 1],
                        frame[at + 2],
                        frame[at + 3],
                    ]),
                };
                slot.push(value);
            }
        }
        Ok(out)
    }

    fn is_filtered(&self) -> bool {
        self.filtered
    }

    fn spec(&self) -> Option<RecordingSpec> {
        Some(RecordingSpec::Binary {
            path: self.path.clone(),
            dtype: self.dtype,
            offset: self.offset,
            sampling_frequency: self.sampling_frequency,
            channels: self.channels.clone(),
            is_filtered: self.filtered,
        })
    }
}

// --- Sub-recording ---

/// View over a subset of another recording's channels.
#[derive(Debug, Clone)]
pub struct SubRecording {
    parent: RecordingRef,
    channels: Vec<ChannelInfo>,
}

impl SubRecording {
    pub fn new(parent: RecordingRef, channel_ids: &[ChannelId]) -> Result<Self> {
        let channels = channel_ids
            .iter()
            .map(|id| {
                let index = channel_index(parent.channels(), *id)?;
                Ok(parent.channels()[index].clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { parent, channels })
    }

    pub fn parent(&self) -> &RecordingRef {
        &self.parent
    }
}

impl Recording for SubRecording {
    fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    fn sampling_frequency(&self) -> f64 {
        self.parent.sampling_frequency()
    }

    fn num_frames(&self) -> u64 {
        self.parent.num_frames()
    }

    fn traces(&self, channel_ids: &[ChannelId], start: u64, end: u64) -> Result<Vec<Vec<f32>>> {
        for id in channel_ids {
            channel_index(&self.channels, *id)?;
        }
        self.parent.traces(channel_ids, start, end)
    }

    fn is_filtered(&self) -> bool {
        self.parent.is_filtered()
    }

    fn spec(&self) -> Option<RecordingSpec> {
        self.parent.spec().map(|parent| RecordingSpec::Sub {
            parent: Box::new(parent),
            channel_ids: self.channel_ids(),
        })
    }
}

// --- Transport ---

/// Serializable description of a recording, used to rebuild it in a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordingSpec {
    Binary {
        path: PathBuf,
        dtype: DataType,
        #[serde(default)]
        offset: u64,
        sampling_frequency: f64,
        channels: Vec<ChannelInfo>,
        #[serde(default)]
        is_filtered: bool,
    },
    Sub {
        parent: Box<RecordingSpec>,
        channel_ids: Vec<ChannelId>,
    },
}

impl RecordingSpec {
    /// Rebuild the described recording.
    pub fn load(&self) -> Result<RecordingRef> {
        match self {
            Self::Binary {
                path,
                dtype,
                offset,
                sampling_frequency,
                channels,
                is_filtered,
            } => Ok(Arc::new(
                BinaryRecording::open(
                    path.clone(),
                    *dtype,
                    *offset,
                    *sampling_frequency,
                    channels.clone(),
                )?
                .with_filtered(*is_filtered),
            )),
            Self::Sub {
                parent,
                channel_ids,
            } => Ok(Arc::new(SubRecording::new(parent.load()?, channel_ids)?)),
        }
    }
}

/// Write `recording` as an interleaved binary file and return its spec.
///
/// Int16 output is rounded and saturated.
pub fn write_binary(recording: &dyn Recording, path: &Path, dtype: DataType) -> Result<RecordingSpec> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let ids = recording.channel_ids();
    let num_frames = recording.num_frames();
    let mut writer = BufWriter::new(File::create(path)?);

    let mut start = 0;
    while start < num_frames {
        let end = (start + WRITE_CHUNK_FRAMES).min(num_frames);
        let chunk = recording.traces(&ids, start, end)?;
        for frame in 0..(end - start) as usize {
            for channel in &chunk {
                let value = channel[frame];
                match dtype {
                    DataType::Int16 => {
                        let v = value.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
                        writer.write_all(&v.to_le_bytes())?;
                    }
                    DataType::Float32 => writer.write_all(&value.to_le_bytes())?,
                }
            }
        }
        start = end;
    }
    writer.flush()?;

    Ok(RecordingSpec::Binary {
        path: path.to_path_buf(),
        dtype,
        offset: 0,
        sampling_frequency: recording.sampling_frequency(),
        channels: recording.channels().to_vec(),
        is_filtered: recording.is_filtered(),
    })
}
