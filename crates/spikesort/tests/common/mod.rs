#![allow(dead_code)]

use spikesort::backends::BackendKind;
use spikesort::{BackendConfig, SorterRegistry};
use spikesort_core::recording::{write_binary, RecordingRef};
use spikesort_core::synthetic::toy_recording;
use spikesort_core::types::DataType;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn toy(num_channels: usize, duration_s: f64, seed: u64) -> RecordingRef {
    Arc::new(toy_recording(num_channels, duration_s, seed).unwrap().0)
}

/// A toy recording backed by a binary file, transportable to workers.
pub fn toy_on_disk(dir: &Path, name: &str, num_channels: usize, seed: u64) -> RecordingRef {
    let (rec, _) = toy_recording(num_channels, 1.0, seed).unwrap();
    write_binary(&rec, &dir.join(format!("{name}.raw")), DataType::Float32)
        .unwrap()
        .load()
        .unwrap()
}

/// An executable shell script standing in for an external program.
#[cfg(unix)]
pub fn fake_program(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Registry whose `kilosort` points at a fake installation and MATLAB.
pub fn fake_kilosort(dir: &Path, matlab_bin: PathBuf) -> SorterRegistry {
    let install = dir.join("kilosort");
    std::fs::create_dir_all(&install).unwrap();
    std::fs::write(install.join("preprocessData.m"), "").unwrap();
    SorterRegistry::new().with_backend_config(
        BackendKind::Kilosort,
        BackendConfig {
            install_path: Some(install),
            matlab_bin,
            ..BackendConfig::default()
        },
    )
}
