//! spikesort - spike-sorter orchestration
//!
//! Runs external spike-sorting backends through a uniform setup/run/collect
//! lifecycle, splits recordings by a channel property, and executes batches
//! of (recording, sorter) jobs with resumable on-disk state.

pub mod backends;
pub mod collector;
pub mod launcher;
pub mod partition;
pub mod registry;
pub mod shell;
pub mod sorter;
pub mod worker;

use backends::BackendKind;
use spikesort_core::params::{defaults, descriptions, Params};
use spikesort_core::{Result, SortError};
use std::collections::BTreeMap;

pub use collector::{collect_sorting_outputs, load_job_result, SortingOutputs};
pub use launcher::{name_recordings, run_job, run_sorters, BatchResults, EngineOptions, JobSettings, LaunchOptions};
pub use registry::{BackendConfig, SorterRegistry};
pub use sorter::{run_sorter, Sorter, SorterOptions};

/// Every backend name, sorted.
pub fn available_sorters() -> Vec<&'static str> {
    let mut names: Vec<_> = BackendKind::ALL.iter().map(|k| k.name()).collect();
    names.sort_unstable();
    names
}

/// Backends whose installation check passes with `registry`'s settings.
pub fn installed_sorters(registry: &SorterRegistry) -> Vec<&'static str> {
    registry.installed()
}

pub fn sorter_versions(registry: &SorterRegistry) -> BTreeMap<&'static str, String> {
    registry.versions()
}

fn kind(name: &str) -> Result<BackendKind> {
    BackendKind::from_name(name).ok_or_else(|| {
        SortError::Configuration(format!(
            "unknown sorter '{name}'; available: {}",
            available_sorters().join(", ")
        ))
    })
}

/// Default parameters of a backend.
pub fn default_params(name: &str) -> Result<Params> {
    Ok(defaults(&kind(name)?.param_specs()))
}

/// Parameter descriptions of a backend.
pub fn params_description(name: &str) -> Result<BTreeMap<String, String>> {
    Ok(descriptions(&kind(name)?.param_specs()))
}
