//! Sorter parameters: defaults, validation and `parameters.json`.

use crate::error::{Result, SortError};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

pub const PARAMS_FILE: &str = "parameters.json";

/// Resolved parameter mapping for one run.
pub type Params = BTreeMap<String, Value>;

/// One declared parameter of a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub default: Value,
    pub description: &'static str,
}

impl ParamSpec {
    pub fn new(name: &'static str, default: impl Into<Value>, description: &'static str) -> Self {
        Self {
            name,
            default: default.into(),
            description,
        }
    }

    /// A parameter whose default is JSON null.
    pub fn unset(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            default: Value::Null,
            description,
        }
    }
}

pub fn defaults(specs: &[ParamSpec]) -> Params {
    specs
        .iter()
        .map(|s| (s.name.to_string(), s.default.clone()))
        .collect()
}

pub fn descriptions(specs: &[ParamSpec]) -> BTreeMap<String, String> {
    specs
        .iter()
        .map(|s| (s.name.to_string(), s.description.to_string()))
        .collect()
}

/// Reject every override key the backend does not declare.
///
/// All unknown keys are reported together.
pub fn validate(backend: &str, specs: &[ParamSpec], overrides: &Params) -> Result<()> {
    let unknown: Vec<String> = overrides
        .keys()
        .filter(|key| !specs.iter().any(|s| s.name == key.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(SortError::Parameter {
            backend: backend.to_string(),
            unknown,
        })
    }
}

/// Merge `overrides` over `base` after validating them.
pub fn resolve(backend: &str, specs: &[ParamSpec], base: &Params, overrides: &Params) -> Result<Params> {
    validate(backend, specs, overrides)?;
    let mut resolved = base.clone();
    resolved.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(resolved)
}

pub fn write_params(folder: &Path, params: &Params) -> Result<()> {
    let json = serde_json::to_string_pretty(params)?;
    std::fs::write(folder.join(PARAMS_FILE), json)?;
    Ok(())
}

pub fn read_params(folder: &Path) -> Result<Params> {
    let contents = std::fs::read_to_string(folder.join(PARAMS_FILE))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Typed accessors used by backends when generating their inputs.
pub trait ParamsExt {
    fn f64_param(&self, key: &str) -> Result<f64>;
    fn i64_param(&self, key: &str) -> Result<i64>;
    fn bool_param(&self, key: &str) -> Result<bool>;
    fn opt_f64_param(&self, key: &str) -> Result<Option<f64>>;
}

fn lookup<'a>(params: &'a Params, key: &str) -> Result<&'a Value> {
    params
        .get(key)
        .ok_or_else(|| SortError::Configuration(format!("parameter '{key}' is not set")))
}

fn type_error(key: &str, expected: &str, value: &Value) -> SortError {
    SortError::Configuration(format!("parameter '{key}' must be {expected}, got {value}"))
}

impl ParamsExt for Params {
    fn f64_param(&self, key: &str) -> Result<f64> {
        let value = lookup(self, key)?;
        value.as_f64().ok_or_else(|| type_error(key, "a number", value))
    }

    fn i64_param(&self, key: &str) -> Result<i64> {
        let value = lookup(self, key)?;
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(|| type_error(key, "an integer", value)),
            _ => Err(type_error(key, "an integer", value)),
        }
    }

    fn bool_param(&self, key: &str) -> Result<bool> {
        let value = lookup(self, key)?;
        value.as_bool().ok_or_else(|| type_error(key, "a boolean", value))
    }

    fn opt_f64_param(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| type_error(key, "a number or null", value)),
        }
    }
}
