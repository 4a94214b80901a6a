//! Configuration for sorter runs and batches.
//!
//! key=value format read from `--config <file>` or `.spikesort/config`.
//! Precedence: CLI flags > config file > environment > defaults.

use crate::params::Params;
use crate::types::{Engine, RunMode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Project-local config file, relative to the current directory.
pub const LOCAL_CONFIG: &str = ".spikesort/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid sorter params file {path}: {message}")]
    SorterParams { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Launcher
    pub working_folder: PathBuf,
    pub mode: RunMode,
    pub engine: Engine,
    /// Worker processes for the process-pool engine.
    pub processes: usize,
    /// Shell command used by the distributed engine; `{command}` is replaced
    /// by the worker invocation.
    pub submit_template: Option<String>,
    /// Worker binary; defaults to the running executable.
    pub worker_bin: Option<PathBuf>,
    /// YAML file mapping sorter name to parameter overrides.
    pub sorter_params: Option<PathBuf>,

    // Sorter run
    pub verbose: bool,
    pub raise_error: bool,
    pub parallel: bool,
    pub grouping_key: Option<String>,
    pub delete_output_folder: bool,
    pub keep_temp_files: bool,

    // Backend installations
    pub matlab_bin: PathBuf,
    pub python_bin: PathBuf,
    pub kilosort_path: Option<PathBuf>,
    pub kilosort2_path: Option<PathBuf>,
    pub ironclust_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_folder: PathBuf::from("spikesort_output"),
            mode: RunMode::Raise,
            engine: Engine::Serial,
            processes: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            submit_template: None,
            worker_bin: None,
            sorter_params: None,
            verbose: false,
            raise_error: true,
            parallel: false,
            grouping_key: None,
            delete_output_folder: false,
            keep_temp_files: false,
            matlab_bin: PathBuf::from("matlab"),
            python_bin: PathBuf::from("python3"),
            kilosort_path: None,
            kilosort2_path: None,
            ironclust_path: None,
        }
    }
}

impl Config {
    /// Defaults, then environment, then the first config file found.
    ///
    /// `explicit` must exist when given; the implicit locations are optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        match explicit {
            Some(path) => config.load_file(path)?,
            None => {
                if let Some(path) = Self::discover() {
                    config.load_file(&path)?;
                }
            }
        }
        Ok(config)
    }

    /// First existing config file: `.spikesort/config`, then the user config dir.
    pub fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|d| d.join("spikesort/config"))
            .filter(|p| p.is_file())
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Backend installation defaults from their dedicated environment variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("KILOSORT_PATH") {
            self.kilosort_path = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("KILOSORT2_PATH") {
            self.kilosort2_path = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("IRONCLUST_PATH") {
            self.ironclust_path = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("MOUNTAINSORT4_PYTHON") {
            self.python_bin = PathBuf::from(v);
        }
        if let Some(v) = non_empty("MATLAB_BIN") {
            self.matlab_bin = PathBuf::from(v);
        }
        if let Some(v) = non_empty("SPIKESORT_WORKER") {
            self.worker_bin = Some(PathBuf::from(v));
        }
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn optional_path(value: &str) -> Option<PathBuf> {
        (!value.is_empty()).then(|| PathBuf::from(value))
    }

    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        match key {
            "working_folder" => self.working_folder = PathBuf::from(value),
            "mode" => self.mode = value.parse().map_err(ConfigError::InvalidLine)?,
            "engine" => self.engine = value.parse().map_err(ConfigError::InvalidLine)?,
            "processes" => {
                self.processes = value
                    .parse()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "submit_template" => {
                self.submit_template = (!value.is_empty()).then(|| value.to_string());
            }
            "worker_bin" => self.worker_bin = Self::optional_path(value),
            "sorter_params" => self.sorter_params = Self::optional_path(value),
            "verbose" => self.verbose = Self::parse_bool(key, value)?,
            "raise_error" => self.raise_error = Self::parse_bool(key, value)?,
            "parallel" => self.parallel = Self::parse_bool(key, value)?,
            "grouping_key" => {
                self.grouping_key = (!value.is_empty()).then(|| value.to_string());
            }
            "delete_output_folder" => self.delete_output_folder = Self::parse_bool(key, value)?,
            "keep_temp_files" => self.keep_temp_files = Self::parse_bool(key, value)?,
            "matlab_bin" => self.matlab_bin = PathBuf::from(value),
            "python_bin" => self.python_bin = PathBuf::from(value),
            "kilosort_path" => self.kilosort_path = Self::optional_path(value),
            "kilosort2_path" => self.kilosort2_path = Self::optional_path(value),
            "ironclust_path" => self.ironclust_path = Self::optional_path(value),
            _ => {
                warn!(key, source, "unknown config key");
            }
        }
        Ok(())
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a base directory.
    pub fn resolve_paths(&mut self, root: &Path) {
        if self.working_folder.is_relative() {
            self.working_folder = root.join(&self.working_folder);
        }
        if let Some(ref path) = self.sorter_params {
            if path.is_relative() {
                self.sorter_params = Some(root.join(path));
            }
        }
    }
}

/// Read per-sorter parameter overrides from a YAML mapping.
///
/// ```yaml
/// threshold:
///   detect_threshold: 4.5
/// kilosort2:
///   car: false
/// ```
pub fn load_sorter_params(path: &Path) -> Result<BTreeMap<String, Params>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_sorter_params(&content).map_err(|message| ConfigError::SorterParams {
        path: path.to_path_buf(),
        message,
    })
}

fn parse_sorter_params(content: &str) -> Result<BTreeMap<String, Params>, String> {
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let parsed: Option<BTreeMap<String, Option<Params>>> =
        serde_yaml::from_str(content).map_err(|e| e.to_string())?;
    Ok(parsed
        .unwrap_or_default()
        .into_iter()
        .map(|(name, params)| (name, params.unwrap_or_default()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.working_folder, PathBuf::from("spikesort_output"));
        assert_eq!(config.mode, RunMode::Raise);
        assert_eq!(config.engine, Engine::Serial);
        assert!(config.processes >= 1);
        assert!(config.raise_error);
        assert!(!config.parallel);
        assert_eq!(config.matlab_bin, PathBuf::from("matlab"));
        assert_eq!(config.python_bin, PathBuf::from("python3"));
        assert!(config.kilosort_path.is_none());
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# batch settings
working_folder="/data/sorted"
mode=keep
engine=process_pool
processes=4
verbose=yes
grouping_key='group'
"#;
        config.parse_content(content, "test").unwrap();
        assert_eq!(config.working_folder, PathBuf::from("/data/sorted"));
        assert_eq!(config.mode, RunMode::Keep);
        assert_eq!(config.engine, Engine::ProcessPool);
        assert_eq!(config.processes, 4);
        assert!(config.verbose);
        assert_eq!(config.grouping_key.as_deref(), Some("group"));
    }

    #[test]
    fn invalid_values_are_errors() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("mode=sometimes", "test"),
            Err(ConfigError::InvalidLine(_))
        ));
        assert!(matches!(
            config.parse_content("processes=0", "test"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("parallel=maybe", "test"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("no equals sign", "test"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("colour=blue\nverbose=1", "test").unwrap();
        assert!(config.verbose);
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "1").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
        assert!(!Config::parse_bool("test", "No").unwrap());
    }

    #[test]
    fn env_sets_backend_paths_and_file_wins() {
        let env: HashMap<&str, &str> = [
            ("KILOSORT_PATH", "/opt/kilosort"),
            ("IRONCLUST_PATH", ""),
            ("MOUNTAINSORT4_PYTHON", "/venv/bin/python"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.kilosort_path, Some(PathBuf::from("/opt/kilosort")));
        assert!(config.ironclust_path.is_none());
        assert_eq!(config.python_bin, PathBuf::from("/venv/bin/python"));

        config.parse_content("kilosort_path=/srv/ks", "test").unwrap();
        assert_eq!(config.kilosort_path, Some(PathBuf::from("/srv/ks")));
    }

    #[test]
    fn resolve_paths_joins_relative_folders() {
        let mut config = Config::default();
        config.sorter_params = Some(PathBuf::from("params.yaml"));
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.working_folder, PathBuf::from("/work/spikesort_output"));
        assert_eq!(config.sorter_params, Some(PathBuf::from("/work/params.yaml")));
    }

    #[test]
    fn sorter_params_yaml() {
        let content = r"
threshold:
  detect_threshold: 4.5
  detect_sign: -1
kilosort2:
";
        let parsed = parse_sorter_params(content).unwrap();
        assert_eq!(parsed["threshold"]["detect_threshold"], json!(4.5));
        assert_eq!(parsed["threshold"]["detect_sign"], json!(-1));
        assert!(parsed["kilosort2"].is_empty());
        assert!(parse_sorter_params("").unwrap().is_empty());
        assert!(parse_sorter_params("- not\n- a mapping").is_err());
    }
}
