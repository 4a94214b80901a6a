//! Backend implementations of the three stage hooks.
//!
//! The backend set is closed: `BackendKind` names every supported sorter and
//! dispatches `setup`, `run` and `result_from_folder` by match. Orchestration
//! (partitioning, logging, parallelism) lives in `crate::sorter`.

pub mod formats;
pub mod template;

mod ironclust;
mod kilosort;
mod kilosort2;
mod mountainsort4;
mod threshold;

use crate::partition::PartitionContext;
use crate::registry::BackendConfig;
use crate::shell::{ShellScript, SCRIPT_EXTENSION};
use serde::{Deserialize, Serialize};
use spikesort_core::params::ParamSpec;
use spikesort_core::recording::Recording;
use spikesort_core::sorting::SortingResult;
use spikesort_core::{Result, SortError};
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Threshold,
    Kilosort,
    Kilosort2,
    Ironclust,
    Mountainsort4,
}

/// Static facts about a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SorterDescriptor {
    pub name: &'static str,
    /// Needs a `location` on every channel.
    pub requires_locations: bool,
    /// Partitions may run concurrently in one process.
    pub thread_safe: bool,
    /// Jobs may run concurrently in separate processes.
    pub process_safe: bool,
    /// Environment variable holding the installation path, if any.
    pub install_env: Option<&'static str>,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        Self::Threshold,
        Self::Kilosort,
        Self::Kilosort2,
        Self::Ironclust,
        Self::Mountainsort4,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Kilosort => "kilosort",
            Self::Kilosort2 => "kilosort2",
            Self::Ironclust => "ironclust",
            Self::Mountainsort4 => "mountainsort4",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn descriptor(self) -> SorterDescriptor {
        let (requires_locations, thread_safe, process_safe, install_env) = match self {
            Self::Threshold => (false, true, true, None),
            // GPU-bound MATLAB sorters are not reentrant
            Self::Kilosort => (false, false, true, Some("KILOSORT_PATH")),
            Self::Kilosort2 => (true, false, false, Some("KILOSORT2_PATH")),
            Self::Ironclust => (true, true, true, Some("IRONCLUST_PATH")),
            Self::Mountainsort4 => (false, true, true, None),
        };
        SorterDescriptor {
            name: self.name(),
            requires_locations,
            thread_safe,
            process_safe,
            install_env,
        }
    }

    pub fn param_specs(self) -> Vec<ParamSpec> {
        match self {
            Self::Threshold => threshold::param_specs(),
            Self::Kilosort => kilosort::param_specs(),
            Self::Kilosort2 => kilosort2::param_specs(),
            Self::Ironclust => ironclust::param_specs(),
            Self::Mountainsort4 => mountainsort4::param_specs(),
        }
    }

    pub fn check_installed(self, config: &BackendConfig) -> bool {
        match self {
            Self::Threshold => true,
            Self::Kilosort => installed_file(config, "preprocessData.m"),
            Self::Kilosort2 => installed_file(config, "master_kilosort.m"),
            Self::Ironclust => installed_file(config, "matlab/irc.m"),
            Self::Mountainsort4 => mountainsort4::check_installed(config),
        }
    }

    pub fn installation_instructions(self) -> &'static str {
        match self {
            Self::Threshold => "",
            Self::Kilosort => kilosort::INSTALLATION,
            Self::Kilosort2 => kilosort2::INSTALLATION,
            Self::Ironclust => ironclust::INSTALLATION,
            Self::Mountainsort4 => mountainsort4::INSTALLATION,
        }
    }

    pub fn version(self, config: &BackendConfig) -> String {
        match self {
            Self::Threshold => env!("CARGO_PKG_VERSION").to_string(),
            Self::Kilosort | Self::Kilosort2 | Self::Ironclust => git_version(config.install_path.as_deref()),
            Self::Mountainsort4 => mountainsort4::version(config),
        }
    }

    /// Prepare backend inputs in the partition folder.
    pub async fn setup(self, ctx: &PartitionContext) -> Result<()> {
        match self {
            Self::Threshold => Ok(()),
            Self::Kilosort => kilosort::setup(ctx).await,
            Self::Kilosort2 => kilosort2::setup(ctx).await,
            Self::Ironclust => ironclust::setup(ctx).await,
            Self::Mountainsort4 => mountainsort4::setup(ctx).await,
        }
    }

    /// Run the sorter on one partition.
    pub async fn run(self, ctx: &PartitionContext) -> Result<()> {
        match self {
            Self::Threshold => threshold::run(ctx).await,
            Self::Kilosort => kilosort::run(ctx).await,
            Self::Kilosort2 => kilosort2::run(ctx).await,
            Self::Ironclust => ironclust::run(ctx).await,
            Self::Mountainsort4 => mountainsort4::run(ctx).await,
        }
    }

    /// Parse the native output of one partition folder.
    ///
    /// `Ok(None)` when the output file does not exist; malformed output is a
    /// `ResultParsing` error.
    pub fn result_from_folder(self, folder: &Path) -> Result<Option<SortingResult>> {
        match self {
            Self::Threshold => threshold::result_from_folder(folder),
            Self::Kilosort => kilosort::result_from_folder(folder),
            Self::Kilosort2 => kilosort2::result_from_folder(folder),
            Self::Ironclust => ironclust::result_from_folder(folder),
            Self::Mountainsort4 => mountainsort4::result_from_folder(folder),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn installed_file(config: &BackendConfig, marker: &str) -> bool {
    config
        .install_path
        .as_ref()
        .is_some_and(|path| path.join(marker).is_file())
}

/// `git-<commit>` of an installation folder, or `unknown`.
fn git_version(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return "unknown".to_string();
    };
    Command::new("git")
        .arg("-C")
        .arg(path)
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|commit| !commit.is_empty())
        .map_or_else(|| "unknown".to_string(), |commit| format!("git-{commit}"))
}

/// Installation path or the backend's `Installation` error.
fn install_path(kind: BackendKind, config: &BackendConfig) -> Result<std::path::PathBuf> {
    match &config.install_path {
        Some(path) if kind.check_installed(config) => Ok(path.canonicalize().unwrap_or_else(|_| path.clone())),
        _ => Err(SortError::Installation {
            backend: kind.name().to_string(),
            instructions: kind.installation_instructions().to_string(),
        }),
    }
}

/// Run blocking stage work off the async workers.
async fn blocking<T, F>(backend: &'static str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SortError::execution(backend, format!("stage task failed: {e}")))?
}

/// Stage-level failure of an external program or its inputs.
fn execution_error(backend: &str, err: impl std::fmt::Display) -> SortError {
    SortError::execution(backend, err.to_string())
}

/// Channel locations, or a vertical line at unit pitch when absent.
fn locations_or_linear(recording: &dyn Recording) -> Vec<Vec<f64>> {
    recording.channel_locations().unwrap_or_else(|| {
        (0..recording.num_channels())
            .map(|i| vec![0.0, i as f64])
            .collect()
    })
}

/// Run `matlab -r <script>` from `dir` and require a zero exit code.
async fn run_matlab(backend: &'static str, ctx: &PartitionContext, dir: &Path, script: &str) -> Result<()> {
    let matlab = &ctx.config.matlab_bin;
    #[cfg(not(windows))]
    let body = format!(
        "cd \"{}\"\n\"{}\" -nosplash -nodisplay -r {script}\n",
        dir.display(),
        matlab.display()
    );
    #[cfg(windows)]
    let body = format!(
        "cd /d \"{}\"\r\n\"{}\" -nosplash -nodisplay -wait -r {script}\r\n",
        dir.display(),
        matlab.display()
    );
    run_script(backend, ctx, dir, &body).await
}

/// Run a generated shell script for `backend` and require a zero exit code.
async fn run_script(backend: &'static str, ctx: &PartitionContext, dir: &Path, body: &str) -> Result<()> {
    let script_path = dir.join(format!("run_{backend}.{SCRIPT_EXTENSION}"));
    let log_path = dir.join(format!("{backend}.log"));
    let mut script = ShellScript::new(body, script_path, &log_path)
        .keep_temp_files(ctx.config.keep_temp_files)
        .verbose(ctx.verbose)
        .current_dir(dir);
    let code = script.run().await.map_err(|e| execution_error(backend, e))?;
    if code != 0 {
        return Err(SortError::execution(
            backend,
            format!(
                "{backend} returned a non-zero exit code ({code}); see {}",
                log_path.display()
            ),
        ));
    }
    Ok(())
}

/// Require an output file after a run.
fn expect_output(backend: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(SortError::execution(
            backend,
            format!("result file does not exist: {}", path.display()),
        ))
    }
}
