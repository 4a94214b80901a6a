//! Sorter registry: backend name to kind plus per-process configuration.
//!
//! Built once at startup from `Config`; sorters receive their entry at
//! construction instead of reading shared mutable state.

use crate::backends::BackendKind;
use serde::{Deserialize, Serialize};
use spikesort_core::{Config, Result, SortError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Installation and invocation settings for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Installation folder for backends shipped as source trees.
    pub install_path: Option<PathBuf>,
    pub matlab_bin: PathBuf,
    pub python_bin: PathBuf,
    /// Keep generated scripts after a successful run.
    pub keep_temp_files: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            install_path: None,
            matlab_bin: PathBuf::from("matlab"),
            python_bin: PathBuf::from("python3"),
            keep_temp_files: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendEntry {
    pub kind: BackendKind,
    pub config: Arc<BackendConfig>,
}

#[derive(Debug, Clone)]
pub struct SorterRegistry {
    entries: BTreeMap<&'static str, BackendEntry>,
}

impl Default for SorterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SorterRegistry {
    /// Every backend with default settings and no installation paths.
    pub fn new() -> Self {
        let entries = BackendKind::ALL
            .iter()
            .map(|kind| {
                (
                    kind.name(),
                    BackendEntry {
                        kind: *kind,
                        config: Arc::new(BackendConfig::default()),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn from_config(config: &Config) -> Self {
        let base = BackendConfig {
            install_path: None,
            matlab_bin: config.matlab_bin.clone(),
            python_bin: config.python_bin.clone(),
            keep_temp_files: config.keep_temp_files,
        };
        let mut registry = Self::new();
        for kind in BackendKind::ALL {
            let install_path = match kind {
                BackendKind::Kilosort => config.kilosort_path.clone(),
                BackendKind::Kilosort2 => config.kilosort2_path.clone(),
                BackendKind::Ironclust => config.ironclust_path.clone(),
                BackendKind::Threshold | BackendKind::Mountainsort4 => None,
            };
            registry = registry.with_backend_config(
                kind,
                BackendConfig {
                    install_path,
                    ..base.clone()
                },
            );
        }
        registry
    }

    /// Replace the configuration of one backend.
    pub fn with_backend_config(mut self, kind: BackendKind, config: BackendConfig) -> Self {
        self.entries.insert(
            kind.name(),
            BackendEntry {
                kind,
                config: Arc::new(config),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Result<&BackendEntry> {
        self.entries.get(name).ok_or_else(|| {
            SortError::Configuration(format!(
                "unknown sorter '{name}'; available: {}",
                self.names().join(", ")
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    pub fn installed(&self) -> Vec<&'static str> {
        self.entries
            .values()
            .filter(|e| e.kind.check_installed(&e.config))
            .map(|e| e.kind.name())
            .collect()
    }

    pub fn versions(&self) -> BTreeMap<&'static str, String> {
        self.entries
            .values()
            .map(|e| (e.kind.name(), e.kind.version(&e.config)))
            .collect()
    }
}
