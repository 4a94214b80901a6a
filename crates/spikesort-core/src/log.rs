//! Execution log (`log.json`) persisted after every run.
//!
//! A job is complete iff its log exists and `run_time` is not null. Failed
//! runs still write a log, with `error` set and `run_time` null, so that a
//! `keep` batch re-executes them.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const LOG_FILE: &str = "log.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub sorter_name: String,
    pub sorter_version: String,
    pub datetime: DateTime<Utc>,
    pub run_time: Option<f64>,
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
}

impl ExecutionLog {
    pub fn success(sorter_name: &str, sorter_version: &str, started: DateTime<Utc>, run_time: f64) -> Self {
        Self {
            sorter_name: sorter_name.to_string(),
            sorter_version: sorter_version.to_string(),
            datetime: started,
            run_time: Some(run_time),
            error: false,
            error_trace: None,
        }
    }

    pub fn failure(sorter_name: &str, sorter_version: &str, started: DateTime<Utc>, trace: String) -> Self {
        Self {
            sorter_name: sorter_name.to_string(),
            sorter_version: sorter_version.to_string(),
            datetime: started,
            run_time: None,
            error: true,
            error_trace: Some(trace),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.run_time.is_some()
    }

    pub fn write(&self, folder: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(folder.join(LOG_FILE), json)?;
        Ok(())
    }

    pub fn read(folder: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(folder.join(LOG_FILE))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Whether `folder` holds a log of a completed run.
///
/// Missing or unreadable logs count as incomplete.
pub fn is_log_ok(folder: &Path) -> bool {
    ExecutionLog::read(folder).is_ok_and(|log| log.is_complete())
}
