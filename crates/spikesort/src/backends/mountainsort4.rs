//! MountainSort4 through a generated Python launcher.
//!
//! The library runs in a separate interpreter (`python_bin`). The launcher
//! reads the MDA dataset and `parameters.json` and writes `firings.mda`.

use super::formats::{read_firings, write_geom_csv, write_recording_mda};
use super::template::{fill, Values};
use super::{blocking, execution_error, expect_output, locations_or_linear, run_script};
use crate::partition::PartitionContext;
use crate::registry::BackendConfig;
use serde_json::json;
use spikesort_core::params::{ParamSpec, ParamsExt, PARAMS_FILE};
use spikesort_core::recording::Recording;
use spikesort_core::sorting::SortingResult;
use spikesort_core::{Result, SortError};
use std::path::Path;
use std::process::Command;
use tracing::warn;

const NAME: &str = "mountainsort4";
const DATASET_DIR: &str = "mountainsort4_dataset";
const FIRINGS_FILE: &str = "firings.mda";
const LAUNCHER: &str = "run_mountainsort4.py";

pub(super) const INSTALLATION: &str = "To use MountainSort4 run:
    pip install ml_ms4alg

More information on mountainsort at:
    https://github.com/flatironinstitute/mountainsort";

const LAUNCHER_SCRIPT: &str = r"import json

import ml_ms4alg
import spikeextractors as se

with open(r'{params_path}') as f:
    p = json.load(f)

recording = se.MdaRecordingExtractor(r'{dataset_dir}')
if p['filter'] and p['freq_min'] is not None and p['freq_max'] is not None:
    from spiketoolkit.preprocessing import bandpass_filter
    recording = bandpass_filter(recording=recording, freq_min=p['freq_min'], freq_max=p['freq_max'])
if p['whiten']:
    from spiketoolkit.preprocessing import whiten
    recording = whiten(recording=recording)

sorting = ml_ms4alg.mountainsort4(
    recording=recording,
    detect_sign=p['detect_sign'],
    adjacency_radius=p['adjacency_radius'],
    clip_size=p['clip_size'],
    detect_threshold=p['detect_threshold'],
    detect_interval=p['detect_interval'],
    num_workers=p['num_workers'],
    verbose={verbose},
)

if p['noise_overlap_threshold'] is not None and p['curation']:
    sorting = ml_ms4alg.mountainsort4_curation(
        recording=recording,
        sorting=sorting,
        noise_overlap_threshold=p['noise_overlap_threshold'],
    )

se.MdaSortingExtractor.write_sorting(sorting, r'{firings_path}')
";

pub(super) fn param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("detect_sign", -1, "-1, 0 or 1 depending on the sign of the spikes"),
        ParamSpec::new("adjacency_radius", -1, "Neighbourhood radius; -1 includes all channels"),
        ParamSpec::new("freq_min", 300, "High-pass cutoff (Hz)"),
        ParamSpec::new("freq_max", 6000, "Low-pass cutoff (Hz)"),
        ParamSpec::new("filter", false, "Bandpass filter the recording"),
        ParamSpec::new("whiten", true, "Whiten the recording"),
        ParamSpec::new("curation", false, "Curate the output"),
        ParamSpec::unset("num_workers", "Number of parallel workers"),
        ParamSpec::new("clip_size", 50, "Clip size"),
        ParamSpec::new("detect_threshold", 3, "Detection threshold"),
        ParamSpec::new("detect_interval", 10, "Minimum samples between events on one channel"),
        ParamSpec::new("noise_overlap_threshold", 0.15, "Curation threshold; null disables curation"),
    ]
}

fn python(config: &BackendConfig, code: &str) -> Option<String> {
    Command::new(&config.python_bin)
        .args(["-c", code])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
}

pub(super) fn check_installed(config: &BackendConfig) -> bool {
    python(config, "import ml_ms4alg").is_some()
}

pub(super) fn version(config: &BackendConfig) -> String {
    python(config, "import ml_ms4alg; print(getattr(ml_ms4alg, '__version__', 'unknown'))")
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub(super) async fn setup(ctx: &PartitionContext) -> Result<()> {
    if ctx.params.bool_param("filter")? && ctx.recording.is_filtered() {
        warn!(
            backend = NAME,
            "recording is already filtered; filter=true filters it a second time"
        );
    }
    let ctx = ctx.clone();
    blocking(NAME, move || {
        let dataset = ctx.folder.join(DATASET_DIR);
        std::fs::create_dir_all(&dataset)?;
        let recording = ctx.recording.as_ref();
        write_recording_mda(recording, &dataset.join("raw.mda")).map_err(|e| execution_error(NAME, e))?;
        write_geom_csv(&dataset.join("geom.csv"), &locations_or_linear(recording))
            .map_err(|e| execution_error(NAME, e))?;
        let params = json!({ "samplerate": recording.sampling_frequency() });
        std::fs::write(dataset.join("params.json"), serde_json::to_string_pretty(&params)?)?;
        Ok(())
    })
    .await
}

fn launcher(ctx: &PartitionContext) -> Result<String> {
    let mut values = Values::new();
    values
        .set("params_path", ctx.folder.join(PARAMS_FILE).display())
        .set("dataset_dir", ctx.folder.join(DATASET_DIR).display())
        .set("firings_path", ctx.folder.join(FIRINGS_FILE).display())
        .set("verbose", if ctx.verbose { "True" } else { "False" });
    fill(LAUNCHER_SCRIPT, &values).map_err(|e| execution_error(NAME, e))
}

pub(super) async fn run(ctx: &PartitionContext) -> Result<()> {
    tokio::fs::write(ctx.folder.join(LAUNCHER), launcher(ctx)?).await?;
    #[cfg(not(windows))]
    let body = format!(
        "cd \"{}\"\n\"{}\" {LAUNCHER}\n",
        ctx.folder.display(),
        ctx.config.python_bin.display()
    );
    #[cfg(windows)]
    let body = format!(
        "cd /d \"{}\"\r\n\"{}\" {LAUNCHER}\r\n",
        ctx.folder.display(),
        ctx.config.python_bin.display()
    );
    run_script(NAME, ctx, &ctx.folder, &body).await?;
    expect_output(NAME, &ctx.folder.join(FIRINGS_FILE))
}

pub(super) fn result_from_folder(folder: &Path) -> Result<Option<SortingResult>> {
    let path = folder.join(FIRINGS_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    read_firings(&path)
        .map(Some)
        .map_err(|e| SortError::parsing(NAME, folder, e.to_string()))
}
