//! Batch execution over the recording x sorter job matrix.
//!
//! Every job owns `<working_folder>/<recording_name>/<sorter_name>/`. Before
//! anything runs, each job gets a disposition from its folder and the run
//! mode; then one of three engines executes the same unit of work
//! (`run_job`). Results are read back from the folders afterwards, never
//! passed across a worker boundary.

use crate::backends::template::{fill, Values};
use crate::collector::load_job_result;
use crate::registry::SorterRegistry;
use crate::sorter::{Sorter, SorterOptions};
use crate::worker::{WorkerJob, JOBS_DIR};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use spikesort_core::log::is_log_ok;
use spikesort_core::params::{validate, Params};
use spikesort_core::recording::{write_binary, Recording, RecordingRef, RecordingSpec};
use spikesort_core::sorting::SortingResult;
use spikesort_core::types::{DataType, Engine, RunMode};
use spikesort_core::{Config, Result, SortError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Materialised recordings for worker processes.
pub const RECORDINGS_DIR: &str = ".recordings";

const ENGINE: &str = "launcher";

/// Per-job run settings shared by every engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default)]
    pub grouping_key: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    /// Run partitions of one job concurrently.
    #[serde(default)]
    pub parallel: bool,
    pub raise_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOptions {
    /// Concurrent worker processes for the process-pool engine.
    pub processes: usize,
    /// Worker executable; the running binary when unset.
    pub worker_bin: Option<PathBuf>,
    /// Submission command for the distributed engine, with a `{command}` placeholder.
    pub submit_template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub working_folder: PathBuf,
    /// Parameter overrides by sorter name.
    pub sorter_params: BTreeMap<String, Params>,
    pub mode: RunMode,
    pub engine: Engine,
    pub engine_options: EngineOptions,
    pub settings: JobSettings,
    pub with_output: bool,
}

impl LaunchOptions {
    pub fn new(working_folder: impl Into<PathBuf>) -> Self {
        Self {
            working_folder: working_folder.into(),
            sorter_params: BTreeMap::new(),
            mode: RunMode::Raise,
            engine: Engine::Serial,
            engine_options: EngineOptions {
                processes: 1,
                ..EngineOptions::default()
            },
            settings: JobSettings {
                raise_error: true,
                ..JobSettings::default()
            },
            with_output: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            working_folder: config.working_folder.clone(),
            sorter_params: BTreeMap::new(),
            mode: config.mode,
            engine: config.engine,
            engine_options: EngineOptions {
                processes: config.processes,
                worker_bin: config.worker_bin.clone(),
                submit_template: config.submit_template.clone(),
            },
            settings: JobSettings {
                grouping_key: config.grouping_key.clone(),
                verbose: config.verbose,
                parallel: config.parallel,
                raise_error: config.raise_error,
            },
            with_output: true,
        }
    }
}

/// One cell of the job matrix.
#[derive(Debug, Clone)]
pub struct Job {
    pub recording_name: String,
    pub sorter_name: String,
    pub recording: RecordingRef,
    pub output_folder: PathBuf,
    pub params: Params,
}

/// Results by `(recording_name, sorter_name)`; `None` for a failed job.
pub type BatchResults = BTreeMap<(String, String), Option<SortingResult>>;

/// Name an unnamed list of recordings `recording_0`, `recording_1`, ...
pub fn name_recordings(recordings: Vec<RecordingRef>) -> Vec<(String, RecordingRef)> {
    recordings
        .into_iter()
        .enumerate()
        .map(|(i, rec)| (format!("recording_{i}"), rec))
        .collect()
}

/// The unit of work every engine executes: construct, parameterise, run.
///
/// The result is not collected here.
pub async fn run_job(registry: &SorterRegistry, job: &Job, settings: &JobSettings) -> Result<Option<f64>> {
    let mut options = SorterOptions::new(&job.output_folder)
        .verbose(settings.verbose)
        .parallel(settings.parallel);
    options.grouping_key = settings.grouping_key.clone();
    let mut sorter = Sorter::new(registry, &job.sorter_name, Arc::clone(&job.recording), options)?;
    sorter.set_params(&job.params)?;
    sorter.run(settings.raise_error).await
}

/// Check names, safety flags and parameters before any job starts.
fn validate_batch(registry: &SorterRegistry, sorter_names: &[String], options: &LaunchOptions) -> Result<()> {
    for name in sorter_names {
        let entry = registry.get(name)?;
        let kind = entry.kind;
        if !kind.check_installed(&entry.config) {
            return Err(SortError::Installation {
                backend: kind.name().to_string(),
                instructions: kind.installation_instructions().to_string(),
            });
        }
        if options.engine != Engine::Serial && !kind.descriptor().process_safe {
            return Err(SortError::Configuration(format!(
                "{kind} cannot run with the {} engine; use the serial engine",
                options.engine.as_str()
            )));
        }
        if let Some(params) = options.sorter_params.get(name) {
            validate(kind.name(), &kind.param_specs(), params)?;
        }
    }
    for name in options.sorter_params.keys() {
        if !sorter_names.contains(name) {
            warn!(sorter = %name, "parameters given for a sorter that is not in the batch");
        }
    }
    Ok(())
}

/// Decide which jobs run, honouring the run mode.
///
/// Completed folders error under `raise`, are cleared under `overwrite` and
/// skipped under `keep`. Incomplete folders are always cleared and re-run.
fn plan_jobs(
    sorter_names: &[String],
    recordings: &[(String, RecordingRef)],
    options: &LaunchOptions,
) -> Result<(Vec<Job>, Vec<(String, String)>)> {
    let mut seen = BTreeSet::new();
    let mut to_run = Vec::new();
    let mut to_clear = Vec::new();
    let mut all = Vec::new();

    for (recording_name, recording) in recordings {
        if !seen.insert(recording_name.as_str()) {
            return Err(SortError::Configuration(format!(
                "duplicate recording name '{recording_name}'"
            )));
        }
        for sorter_name in sorter_names {
            let folder = options.working_folder.join(recording_name).join(sorter_name);
            all.push((recording_name.clone(), sorter_name.clone()));
            if folder.exists() {
                if is_log_ok(&folder) {
                    match options.mode {
                        RunMode::Raise => {
                            return Err(SortError::Configuration(format!(
                                "{} already holds a completed run; use mode 'overwrite' or 'keep'",
                                folder.display()
                            )))
                        }
                        RunMode::Keep => {
                            info!(recording = %recording_name, sorter = %sorter_name, "already done; skipped");
                            continue;
                        }
                        RunMode::Overwrite => {}
                    }
                }
                to_clear.push(folder.clone());
            }
            to_run.push(Job {
                recording_name: recording_name.clone(),
                sorter_name: sorter_name.clone(),
                recording: Arc::clone(recording),
                output_folder: folder,
                params: options.sorter_params.get(sorter_name).cloned().unwrap_or_default(),
            });
        }
    }

    for folder in to_clear {
        debug!(folder = %folder.display(), "clearing job folder");
        std::fs::remove_dir_all(&folder)?;
    }
    Ok((to_run, all))
}

/// Run `sorter_names` on every recording under `options.working_folder`.
///
/// Returns the results of every job in the matrix (skipped ones included)
/// when `with_output` is set.
pub async fn run_sorters(
    registry: &SorterRegistry,
    sorter_names: &[String],
    recordings: Vec<(String, RecordingRef)>,
    options: &LaunchOptions,
) -> Result<Option<BatchResults>> {
    validate_batch(registry, sorter_names, options)?;
    std::fs::create_dir_all(&options.working_folder)?;
    let (jobs, all) = plan_jobs(sorter_names, &recordings, options)?;

    info!(
        jobs = jobs.len(),
        skipped = all.len() - jobs.len(),
        engine = options.engine.as_str(),
        "starting batch"
    );

    match options.engine {
        Engine::Serial => {
            for job in &jobs {
                info!(recording = %job.recording_name, sorter = %job.sorter_name, "running job");
                run_job(registry, job, &options.settings).await?;
            }
        }
        Engine::ProcessPool | Engine::Distributed => {
            run_in_workers(registry, &jobs, options).await?;
        }
    }

    if !options.with_output {
        return Ok(None);
    }
    let mut results = BatchResults::new();
    for (recording_name, sorter_name) in all {
        let folder = options.working_folder.join(&recording_name).join(&sorter_name);
        let sorting = if is_log_ok(&folder) {
            Some(load_job_result(registry.get(&sorter_name)?.kind, &folder)?)
        } else {
            None
        };
        results.insert((recording_name, sorter_name), sorting);
    }
    Ok(Some(results))
}

/// Describe `recording`, writing it to disk first when it cannot describe itself.
fn transportable(recording: &RecordingRef, name: &str, working_folder: &Path) -> Result<RecordingSpec> {
    if let Some(spec) = recording.spec() {
        return Ok(spec);
    }
    let path = working_folder.join(RECORDINGS_DIR).join(format!("{name}.raw"));
    debug!(recording = %name, path = %path.display(), "materialising recording");
    write_binary(recording.as_ref(), &path, DataType::Float32).map_err(|e| SortError::Configuration(e.to_string()))
}

fn worker_bin(options: &EngineOptions) -> Result<PathBuf> {
    match &options.worker_bin {
        Some(path) => Ok(path.clone()),
        None => Ok(std::env::current_exe()?),
    }
}

async fn run_in_workers(registry: &SorterRegistry, jobs: &[Job], options: &LaunchOptions) -> Result<()> {
    let jobs_dir = options.working_folder.join(JOBS_DIR);
    std::fs::create_dir_all(&jobs_dir)?;
    let worker = worker_bin(&options.engine_options)?;

    let mut specs: BTreeMap<&str, RecordingSpec> = BTreeMap::new();
    let mut job_files = Vec::with_capacity(jobs.len());
    for job in jobs {
        if !specs.contains_key(job.recording_name.as_str()) {
            let spec = transportable(&job.recording, &job.recording_name, &options.working_folder)?;
            specs.insert(&job.recording_name, spec);
        }
        let worker_job = WorkerJob {
            recording: specs[job.recording_name.as_str()].clone(),
            recording_name: job.recording_name.clone(),
            sorter_name: job.sorter_name.clone(),
            output_folder: job.output_folder.clone(),
            params: job.params.clone(),
            settings: options.settings.clone(),
            backend_config: registry.get(&job.sorter_name)?.config.as_ref().clone(),
        };
        let path = jobs_dir.join(format!("{}.json", uuid::Uuid::now_v7()));
        worker_job.write(&path)?;
        job_files.push((job, path));
    }

    let semaphore = Arc::new(Semaphore::new(options.engine_options.processes.max(1)));
    let engine = options.engine;
    let submit_template = options.engine_options.submit_template.as_deref();
    let runs = job_files.iter().map(|(job, path)| {
        let semaphore = Arc::clone(&semaphore);
        let worker = &worker;
        async move {
            let code = match engine {
                Engine::Distributed => submit(worker, path, submit_template).await,
                _ => {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|e| SortError::execution(ENGINE, e.to_string()))?;
                    spawn_worker(worker, path).await
                }
            }?;
            if code == 0 {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!(job = %path.display(), error = %err, "failed to remove job file");
                }
            } else {
                warn!(
                    recording = %job.recording_name,
                    sorter = %job.sorter_name,
                    exit_code = code,
                    "worker failed"
                );
            }
            Ok::<_, SortError>((job, code))
        }
    });

    let mut failed = Vec::new();
    for outcome in join_all(runs).await {
        let (job, code) = outcome?;
        if code != 0 {
            failed.push(format!("{}/{}", job.recording_name, job.sorter_name));
        }
    }
    if !failed.is_empty() {
        return Err(SortError::execution(
            ENGINE,
            format!("{} job(s) failed: {}", failed.len(), failed.join(", ")),
        ));
    }
    Ok(())
}

async fn spawn_worker(worker: &Path, job_file: &Path) -> Result<i32> {
    debug!(job = %job_file.display(), "spawning worker");
    let status = Command::new(worker)
        .arg("worker")
        .arg("--job")
        .arg(job_file)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| SortError::execution(ENGINE, format!("failed to start {}: {e}", worker.display())))?;
    Ok(status.code().unwrap_or(-1))
}

/// Hand the worker invocation to an external scheduler and wait for it.
async fn submit(worker: &Path, job_file: &Path, template: Option<&str>) -> Result<i32> {
    let template = template.ok_or_else(|| {
        SortError::Configuration("the distributed engine needs a submit_template".to_string())
    })?;
    let mut values = Values::new();
    values.set(
        "command",
        format!("\"{}\" worker --job \"{}\"", worker.display(), job_file.display()),
    );
    let command = fill(template, &values).map_err(|e| SortError::Configuration(e.to_string()))?;
    debug!(command = %command, "submitting job");

    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&command);
        cmd
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(&command);
        cmd
    };
    let status = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| SortError::execution(ENGINE, format!("failed to submit job: {e}")))?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikesort_core::synthetic::toy_recording;
    use tempfile::TempDir;

    fn recordings() -> Vec<(String, RecordingRef)> {
        let rec: RecordingRef = Arc::new(toy_recording(2, 1.0, 5).unwrap().0);
        name_recordings(vec![Arc::clone(&rec), rec])
    }

    #[test]
    fn recordings_are_named_by_position() {
        let names: Vec<_> = recordings().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["recording_0", "recording_1"]);
    }

    #[test]
    fn unsafe_backend_rejected_for_worker_engines() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("master_kilosort.m"), "").unwrap();
        let registry = SorterRegistry::new().with_backend_config(
            crate::backends::BackendKind::Kilosort2,
            crate::registry::BackendConfig {
                install_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        );
        let mut options = LaunchOptions::new(dir.path().join("work"));
        options.engine = Engine::ProcessPool;
        let err = validate_batch(&registry, &["kilosort2".to_string()], &options).unwrap_err();
        assert!(matches!(err, SortError::Configuration(_)));

        options.engine = Engine::Serial;
        assert!(validate_batch(&registry, &["kilosort2".to_string()], &options).is_ok());
    }

    #[test]
    fn unknown_params_fail_before_any_job() {
        let dir = TempDir::new().unwrap();
        let mut options = LaunchOptions::new(dir.path());
        let mut params = Params::new();
        params.insert("bogus".to_string(), serde_json::json!(1));
        options.sorter_params.insert("threshold".to_string(), params);
        let err = validate_batch(&SorterRegistry::new(), &["threshold".to_string()], &options).unwrap_err();
        assert!(matches!(err, SortError::Parameter { .. }));
    }

    #[test]
    fn duplicate_recording_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut recs = recordings();
        recs[1].0 = "recording_0".to_string();
        let err = plan_jobs(&["threshold".to_string()], &recs, &LaunchOptions::new(dir.path())).unwrap_err();
        assert!(matches!(err, SortError::Configuration(_)));
    }

    #[test]
    fn materialises_recordings_without_spec() {
        let dir = TempDir::new().unwrap();
        let (name, rec) = recordings().remove(0);
        let spec = transportable(&rec, &name, dir.path()).unwrap();
        assert!(dir.path().join(RECORDINGS_DIR).join("recording_0.raw").is_file());
        let loaded = spec.load().unwrap();
        assert_eq!(loaded.num_frames(), rec.num_frames());
        assert_eq!(loaded.channel_ids(), rec.channel_ids());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn distributed_submit_fills_command() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("submitted");
        let template = format!("echo {{command}} > '{}'", marker.display());
        let code = submit(Path::new("/usr/bin/worker"), Path::new("/tmp/job.json"), Some(&template))
            .await
            .unwrap();
        assert_eq!(code, 0);
        let line = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(line.trim(), "/usr/bin/worker worker --job /tmp/job.json");
    }

    #[tokio::test]
    async fn distributed_requires_template() {
        let err = submit(Path::new("w"), Path::new("j"), None).await.unwrap_err();
        assert!(matches!(err, SortError::Configuration(_)));
    }
}
