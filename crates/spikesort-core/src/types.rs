//! Core types shared by recordings, sortings and the launcher.

use serde::{Deserialize, Serialize};

/// Channel identifier within a recording.
pub type ChannelId = u32;

/// Unit identifier within a sorting result.
pub type UnitId = u32;

/// Name of the channel property holding the electrode group.
pub const GROUP_PROPERTY: &str = "group";

/// Name of the channel property holding the spatial location.
pub const LOCATION_PROPERTY: &str = "location";

/// Name of the unit property holding the detection channel.
pub const CHANNEL_PROPERTY: &str = "channel";

/// A channel or unit property value.
///
/// Untagged so that `parameters.json`, `sorting.json` and recording specs
/// stay plain JSON (`1`, `2.5`, `"a"`, `[0.0, 25.0]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
    Text(String),
    Vector(Vec<f64>),
}

impl PropertyValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Vector(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<f64>> for PropertyValue {
    fn from(value: Vec<f64>) -> Self {
        Self::Vector(value)
    }
}

/// What the launcher does when a job folder already holds a completed log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fail the batch.
    #[default]
    Raise,
    /// Delete the folder and run again.
    Overwrite,
    /// Skip the job; its previous output is reused.
    Keep,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raise => "raise",
            Self::Overwrite => "overwrite",
            Self::Keep => "keep",
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raise" => Ok(Self::Raise),
            "overwrite" => Ok(Self::Overwrite),
            "keep" => Ok(Self::Keep),
            _ => Err(format!(
                "mode must be 'raise', 'overwrite', or 'keep', got '{s}'"
            )),
        }
    }
}

/// Execution engine used by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// In-process loop, job order = recording x sorter iteration order.
    #[default]
    Serial,
    /// One worker process per job, bounded by a process count.
    ProcessPool,
    /// Jobs submitted through an external scheduler command.
    Distributed,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::ProcessPool => "process_pool",
            Self::Distributed => "distributed",
        }
    }
}

impl std::str::FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(Self::Serial),
            "process_pool" => Ok(Self::ProcessPool),
            "distributed" => Ok(Self::Distributed),
            _ => Err(format!(
                "engine must be 'serial', 'process_pool', or 'distributed', got '{s}'"
            )),
        }
    }
}

/// Sample encoding of a binary recording file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Int16,
    Float32,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::Float32 => "float32",
        }
    }

    pub fn byte_width(&self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Float32 => 4,
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int16" => Ok(Self::Int16),
            "float32" => Ok(Self::Float32),
            _ => Err(format!("dtype must be 'int16' or 'float32', got '{s}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_value_is_plain_json() {
        assert_eq!(serde_json::to_string(&PropertyValue::Int(3)).unwrap(), "3");
        assert_eq!(
            serde_json::to_string(&PropertyValue::Vector(vec![0.0, 25.0])).unwrap(),
            "[0.0,25.0]"
        );
        let back: PropertyValue = serde_json::from_str("\"shank\"").unwrap();
        assert_eq!(back, PropertyValue::Text("shank".to_string()));
        let back: PropertyValue = serde_json::from_str("7").unwrap();
        assert_eq!(back, PropertyValue::Int(7));
    }

    #[test]
    fn run_mode_default_is_raise() {
        assert_eq!(RunMode::default(), RunMode::Raise);
        assert_eq!(serde_json::to_string(&RunMode::Keep).unwrap(), "\"keep\"");
    }

    #[test]
    fn engine_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&Engine::ProcessPool).unwrap(),
            "\"process_pool\""
        );
        assert_eq!(Engine::Distributed.as_str(), "distributed");
        assert_eq!("process_pool".parse::<Engine>().unwrap(), Engine::ProcessPool);
        assert!("threads".parse::<Engine>().is_err());
    }

    #[test]
    fn data_type_widths() {
        assert_eq!(DataType::Int16.byte_width(), 2);
        assert_eq!(DataType::Float32.byte_width(), 4);
    }
}
