//! Stage-based sorter lifecycle: setup, run, collect.
//!
//! A `Sorter` is bound to one recording and one output folder. Construction
//! checks preconditions and lays out the partition folders; `run` sequences
//! the backend stages and always persists `log.json`; `get_result` parses and
//! recombines the per-partition outputs.

use crate::backends::BackendKind;
use crate::partition::{
    check_frame_range, recombine, split, Partition, PartitionContext, PartitionManifest, PartitionOutput,
};
use crate::registry::{BackendConfig, SorterRegistry};
use chrono::Utc;
use spikesort_core::log::ExecutionLog;
use spikesort_core::params::{defaults, resolve, write_params, Params};
use spikesort_core::recording::{Recording, RecordingRef};
use spikesort_core::sorting::SortingResult;
use spikesort_core::{Result, SortError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Construction options of a sorter run.
#[derive(Debug, Clone)]
pub struct SorterOptions {
    pub output_folder: PathBuf,
    pub verbose: bool,
    /// Channel property to split the recording by.
    pub grouping_key: Option<String>,
    /// Run partitions concurrently when the backend allows it.
    pub parallel: bool,
    /// Remove the output folder once the result is in memory.
    pub delete_output_folder: bool,
}

impl SorterOptions {
    pub fn new(output_folder: impl Into<PathBuf>) -> Self {
        Self {
            output_folder: output_folder.into(),
            verbose: false,
            grouping_key: None,
            parallel: false,
            delete_output_folder: false,
        }
    }

    pub fn grouping_key(mut self, key: impl Into<String>) -> Self {
        self.grouping_key = Some(key.into());
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn delete_output_folder(mut self, delete: bool) -> Self {
        self.delete_output_folder = delete;
        self
    }
}

#[derive(Debug)]
pub struct Sorter {
    kind: BackendKind,
    config: Arc<BackendConfig>,
    recording: RecordingRef,
    output_folder: PathBuf,
    partitions: Vec<Partition>,
    params: Params,
    verbose: bool,
    parallel: bool,
    delete_output_folder: bool,
}

fn stage_done(verbose: bool, backend: &str, stage: &str, partition: usize, elapsed: Duration) {
    let elapsed_sec = elapsed.as_secs_f64();
    if verbose {
        info!(backend, stage, partition, elapsed_sec, "stage finished");
    } else {
        debug!(backend, stage, partition, elapsed_sec, "stage finished");
    }
}

/// Filesystem and JSON errors raised inside a stage are failures of the
/// backend run, not of the caller.
fn stage_error(backend: &str, stage: &str, err: SortError) -> SortError {
    match err {
        SortError::Io(e) => SortError::execution(backend, format!("{stage} stage: {e}")),
        SortError::Json(e) => SortError::execution(backend, format!("{stage} stage: {e}")),
        other => other,
    }
}

impl Sorter {
    /// Bind `name` to `recording` and create the partition folders.
    ///
    /// Fails with `Installation` when the backend is unavailable and with
    /// `Configuration` when it needs channel locations the recording lacks or
    /// the grouping key is not a channel property.
    pub fn new(
        registry: &SorterRegistry,
        name: &str,
        recording: RecordingRef,
        options: SorterOptions,
    ) -> Result<Self> {
        let entry = registry.get(name)?;
        let kind = entry.kind;
        if !kind.check_installed(&entry.config) {
            return Err(SortError::Installation {
                backend: kind.name().to_string(),
                instructions: kind.installation_instructions().to_string(),
            });
        }
        if kind.descriptor().requires_locations && recording.channel_locations().is_none() {
            return Err(SortError::Configuration(format!(
                "{kind} requires a 'location' property on every channel"
            )));
        }

        let output_folder = options.output_folder;
        let partitions = split(&recording, options.grouping_key.as_deref(), &output_folder)?;
        std::fs::create_dir_all(&output_folder)?;
        for partition in &partitions {
            std::fs::create_dir_all(&partition.folder)?;
        }
        PartitionManifest::new(
            kind.name(),
            options.grouping_key.as_deref(),
            &output_folder,
            &partitions,
        )
        .write(&output_folder)?;

        debug!(
            backend = kind.name(),
            partitions = partitions.len(),
            folder = %output_folder.display(),
            "sorter ready"
        );

        Ok(Self {
            kind,
            config: Arc::clone(&entry.config),
            params: defaults(&kind.param_specs()),
            recording,
            output_folder,
            partitions,
            verbose: options.verbose,
            parallel: options.parallel,
            delete_output_folder: options.delete_output_folder,
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn output_folder(&self) -> &Path {
        &self.output_folder
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Resolve `overrides` against the defaults and persist `parameters.json`.
    ///
    /// Every unknown key is reported in one `Parameter` error and no file is
    /// touched in that case.
    pub fn set_params(&mut self, overrides: &Params) -> Result<()> {
        let specs = self.kind.param_specs();
        self.params = resolve(self.kind.name(), &specs, &defaults(&specs), overrides)?;
        self.persist_params()
    }

    fn is_partitioned(&self) -> bool {
        self.partitions.iter().any(|p| p.folder != self.output_folder)
    }

    fn persist_params(&self) -> Result<()> {
        for partition in &self.partitions {
            write_params(&partition.folder, &self.params)?;
        }
        if self.is_partitioned() {
            write_params(&self.output_folder, &self.params)?;
        }
        Ok(())
    }

    fn write_logs(&self, log: &ExecutionLog) -> Result<()> {
        for partition in &self.partitions {
            log.write(&partition.folder)?;
        }
        if self.is_partitioned() {
            log.write(&self.output_folder)?;
        }
        Ok(())
    }

    fn contexts(&self) -> Vec<PartitionContext> {
        let params = Arc::new(self.params.clone());
        self.partitions
            .iter()
            .map(|p| PartitionContext {
                index: p.index,
                recording: Arc::clone(&p.recording),
                folder: p.folder.clone(),
                params: Arc::clone(&params),
                config: Arc::clone(&self.config),
                verbose: self.verbose,
            })
            .collect()
    }

    /// Run every stage and persist the execution log.
    ///
    /// Returns the run-stage duration in seconds. With `raise_error` unset a
    /// backend execution failure is recorded in the log and `Ok(None)` is
    /// returned; every other error propagates.
    pub async fn run(&mut self, raise_error: bool) -> Result<Option<f64>> {
        let started = Utc::now();
        let outcome = self.run_stages().await;
        let version = self.kind.version(&self.config);

        match outcome {
            Ok(run_time) => {
                self.write_logs(&ExecutionLog::success(self.kind.name(), &version, started, run_time))?;
                if self.verbose {
                    info!(backend = self.kind.name(), run_time_sec = run_time, "sorter run finished");
                }
                Ok(Some(run_time))
            }
            Err(err) => {
                let trace = format!("{err}\n\n{err:?}");
                self.write_logs(&ExecutionLog::failure(self.kind.name(), &version, started, trace))?;
                if !raise_error && err.is_execution_failure() {
                    warn!(
                        backend = self.kind.name(),
                        folder = %self.output_folder.display(),
                        error = %err,
                        "sorter failed; error recorded in log"
                    );
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn run_stages(&self) -> Result<f64> {
        let kind = self.kind;
        let name = kind.name();
        let contexts = self.contexts();

        for ctx in &contexts {
            let t0 = Instant::now();
            kind.setup(ctx).await.map_err(|e| stage_error(name, "setup", e))?;
            stage_done(self.verbose, name, "setup", ctx.index, t0.elapsed());
        }
        // setup may have rewritten the folder
        self.persist_params().map_err(|e| stage_error(name, "setup", e))?;

        let t0 = Instant::now();
        let mut parallel = self.parallel && contexts.len() > 1;
        if parallel && !kind.descriptor().thread_safe {
            warn!(backend = name, "backend is not thread-safe; running partitions sequentially");
            parallel = false;
        }

        if parallel {
            let mut tasks = JoinSet::new();
            for ctx in contexts {
                let verbose = self.verbose;
                tasks.spawn(async move {
                    let started = Instant::now();
                    let result = kind.run(&ctx).await.map_err(|e| stage_error(name, "run", e));
                    stage_done(verbose, name, "run", ctx.index, started.elapsed());
                    (ctx.index, result)
                });
            }
            let mut results = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                results.push(joined.unwrap_or_else(|e| {
                    (usize::MAX, Err(SortError::execution(name, format!("partition task failed: {e}"))))
                }));
            }
            results.sort_by_key(|(index, _)| *index);
            if let Some((_, Err(err))) = results.into_iter().find(|(_, r)| r.is_err()) {
                return Err(err);
            }
        } else {
            for ctx in &contexts {
                let started = Instant::now();
                kind.run(ctx).await.map_err(|e| stage_error(name, "run", e))?;
                stage_done(self.verbose, name, "run", ctx.index, started.elapsed());
            }
        }
        Ok(t0.elapsed().as_secs_f64())
    }

    /// Parse every partition folder and recombine into one result.
    ///
    /// Grouped units carry the `group` property of their partition. A spike
    /// past the end of its partition is a parsing error. The output folder is
    /// removed afterwards when requested.
    pub fn get_result(&self) -> Result<SortingResult> {
        let name = self.kind.name();
        let outputs = self
            .partitions
            .iter()
            .map(|p| -> Result<PartitionOutput> {
                let sorting = self.kind.result_from_folder(&p.folder)?;
                if let Some(sorting) = &sorting {
                    check_frame_range(name, &p.folder, sorting, p.recording.num_frames())?;
                }
                Ok(PartitionOutput {
                    index: p.index,
                    folder: p.folder.clone(),
                    group: p.group.clone(),
                    sorting,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let sorting = recombine(self.kind.name(), outputs, self.recording.sampling_frequency())?;

        if self.delete_output_folder {
            std::fs::remove_dir_all(&self.output_folder)?;
            debug!(folder = %self.output_folder.display(), "removed output folder");
        }
        Ok(sorting)
    }
}

/// Construct, parameterise, run and collect in one call.
///
/// `Ok(None)` when the backend failed and `raise_error` is unset.
pub async fn run_sorter(
    registry: &SorterRegistry,
    name: &str,
    recording: RecordingRef,
    options: SorterOptions,
    params: &Params,
    raise_error: bool,
) -> Result<Option<SortingResult>> {
    let mut sorter = Sorter::new(registry, name, recording, options)?;
    sorter.set_params(params)?;
    match sorter.run(raise_error).await? {
        Some(_) => sorter.get_result().map(Some),
        None => Ok(None),
    }
}
