//! Worker side of the process-pool and distributed engines.
//!
//! The parent writes one `WorkerJob` file per job; the worker rebuilds the
//! recording and a one-entry registry from it and runs the same `run_job`
//! the serial engine uses. The exit code is the only thing reported back.

use crate::backends::BackendKind;
use crate::launcher::{run_job, Job, JobSettings};
use crate::registry::{BackendConfig, SorterRegistry};
use serde::{Deserialize, Serialize};
use spikesort_core::params::Params;
use spikesort_core::recording::RecordingSpec;
use spikesort_core::{Result, SortError};
use std::path::{Path, PathBuf};
use tracing::info;

/// Job files for worker processes, under the working folder.
pub const JOBS_DIR: &str = ".jobs";

/// Everything a worker needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub recording: RecordingSpec,
    pub recording_name: String,
    pub sorter_name: String,
    pub output_folder: PathBuf,
    #[serde(default)]
    pub params: Params,
    pub settings: JobSettings,
    pub backend_config: BackendConfig,
}

impl WorkerJob {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Run the job described by `path`.
pub async fn run_job_file(path: &Path) -> Result<()> {
    let job = WorkerJob::read(path)?;
    let kind = BackendKind::from_name(&job.sorter_name)
        .ok_or_else(|| SortError::Configuration(format!("unknown sorter '{}'", job.sorter_name)))?;
    let registry = SorterRegistry::new().with_backend_config(kind, job.backend_config);
    let recording = job.recording.load().map_err(|e| {
        SortError::Configuration(format!("cannot load recording '{}': {e}", job.recording_name))
    })?;

    info!(
        recording = %job.recording_name,
        sorter = %job.sorter_name,
        folder = %job.output_folder.display(),
        "worker started"
    );
    let job_spec = Job {
        recording_name: job.recording_name,
        sorter_name: job.sorter_name,
        recording,
        output_folder: job.output_folder,
        params: job.params,
    };
    run_job(&registry, &job_spec, &job.settings).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikesort_core::log::is_log_ok;
    use spikesort_core::recording::write_binary;
    use spikesort_core::synthetic::toy_recording;
    use spikesort_core::types::DataType;
    use tempfile::TempDir;

    fn job(dir: &Path, sorter_name: &str) -> WorkerJob {
        let (rec, _) = toy_recording(2, 1.0, 3).unwrap();
        let spec = write_binary(&rec, &dir.join("rec.raw"), DataType::Float32).unwrap();
        WorkerJob {
            recording: spec,
            recording_name: "rec".to_string(),
            sorter_name: sorter_name.to_string(),
            output_folder: dir.join("rec").join(sorter_name),
            params: Params::new(),
            settings: JobSettings {
                raise_error: true,
                ..JobSettings::default()
            },
            backend_config: BackendConfig::default(),
        }
    }

    #[test]
    fn job_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let original = job(dir.path(), "threshold");
        let path = dir.path().join(JOBS_DIR).join("job.json");
        original.write(&path).unwrap();
        assert_eq!(WorkerJob::read(&path).unwrap(), original);
    }

    #[tokio::test]
    async fn worker_runs_job_into_its_folder() {
        let dir = TempDir::new().unwrap();
        let worker_job = job(dir.path(), "threshold");
        let path = dir.path().join("job.json");
        worker_job.write(&path).unwrap();

        run_job_file(&path).await.unwrap();
        assert!(is_log_ok(&worker_job.output_folder));
    }

    #[tokio::test]
    async fn unknown_sorter_in_job_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.json");
        job(dir.path(), "klusta").write(&path).unwrap();
        assert!(matches!(run_job_file(&path).await, Err(SortError::Configuration(_))));
    }
}
