//! IronClust (MATLAB) backend on an MDA dataset.

use super::formats::{read_firings, write_geom_csv, write_recording_mda};
use super::template::{fill, matlab_bool, Values};
use super::{blocking, execution_error, expect_output, install_path, run_matlab, BackendKind};
use crate::partition::PartitionContext;
use serde_json::{json, Value};
use spikesort_core::params::{ParamSpec, Params};
use spikesort_core::recording::Recording;
use spikesort_core::sorting::SortingResult;
use spikesort_core::{Result, SortError};
use std::fmt::Write as _;
use std::path::Path;
use tracing::debug;

const NAME: &str = "ironclust";
const DATASET_DIR: &str = "ironclust_dataset";
const TMP_DIR: &str = "tmp";

pub(super) const INSTALLATION: &str = "To use IronClust run:
    git clone https://github.com/jamesjun/ironclust
and provide the installation path with IRONCLUST_PATH or `ironclust_path` in the config file.";

const RUN_SCRIPT: &str = r"addpath('{ironclust_path}', '{ironclust_path}/matlab', '{ironclust_path}/matlab/mdaio');
try
    p_ironclust('{tmpdir}', '{dataset_dir}/raw.mda', '{dataset_dir}/geom.csv', '', '', '{tmpdir}/firings.mda', '{dataset_dir}/argfile.txt');
catch
    fprintf('----------------------------------------');
    fprintf(lasterr());
    quit(1);
end
quit(0);
";

pub(super) fn param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("detect_sign", -1, "-1, 0 or 1 depending on the sign of the spikes"),
        ParamSpec::new("adjacency_radius", 50, "Neighbourhood radius; -1 includes all channels"),
        ParamSpec::new("adjacency_radius_out", 75, "Outer neighbourhood radius; -1 includes all channels"),
        ParamSpec::new("detect_threshold", 4.5, "Detection threshold"),
        ParamSpec::new("prm_template_name", "", ".prm template file name"),
        ParamSpec::new("freq_min", 300, "High-pass cutoff (Hz)"),
        ParamSpec::new("freq_max", 6000, "Low-pass cutoff (Hz)"),
        ParamSpec::new("merge_thresh", 0.985, "Threshold for automated merging"),
        ParamSpec::new("pc_per_chan", 2, "Principal components per channel"),
        ParamSpec::new("whiten", true, "Whiten channels during preprocessing"),
        ParamSpec::new("filter_type", "bandpass", "none, bandpass, wiener, fftdiff or ndiff"),
        ParamSpec::new("filter_detect_type", "none", "none, bandpass, wiener, fftdiff or ndiff"),
        ParamSpec::new("common_ref_type", "none", "none, mean or median"),
        ParamSpec::new("batch_sec_drift", 300, "Clustering batch duration (s)"),
        ParamSpec::new("step_sec_drift", 20, "Anatomical similarity step (s)"),
        ParamSpec::new("knn", 30, "K nearest neighbours"),
        ParamSpec::new("min_count", 30, "Minimum cluster size"),
        ParamSpec::new("fGpu", true, "Use the GPU if available"),
        ParamSpec::new("fft_thresh", 8, "FFT-based noise peak threshold"),
        ParamSpec::new("fft_thresh_low", 0, "FFT noise peak lower threshold; 0 disables"),
        ParamSpec::new("nSites_whiten", 32, "Adjacent channels to whiten"),
        ParamSpec::new("feature_type", "gpca", "gpca, pca, vpp, vmin, vminmax, cov, energy or xcov"),
        ParamSpec::new("delta_cut", 1, "Cluster detection threshold (delta cut-off)"),
        ParamSpec::new("post_merge_mode", 1, "Post merge mode"),
        ParamSpec::new("sort_mode", 1, "Sort mode"),
    ]
}

fn argfile_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => matlab_bool(*b).to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(argfile_value).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

/// `key=value` lines for `p_ironclust`, followed by the sample rate.
fn argfile(params: &Params, samplerate: f64) -> String {
    let mut out = String::new();
    for (key, value) in params {
        let _ = writeln!(out, "{key}={}", argfile_value(value));
    }
    let _ = writeln!(out, "samplerate={samplerate}");
    out
}

pub(super) async fn setup(ctx: &PartitionContext) -> Result<()> {
    install_path(BackendKind::Ironclust, &ctx.config)?;
    let locations = ctx.recording.channel_locations().ok_or_else(|| {
        SortError::Configuration(format!("{NAME} requires a 'location' on every channel"))
    })?;
    let ctx = ctx.clone();
    blocking(NAME, move || {
        let dataset = ctx.folder.join(DATASET_DIR);
        std::fs::create_dir_all(&dataset)?;
        write_recording_mda(ctx.recording.as_ref(), &dataset.join("raw.mda"))
            .map_err(|e| execution_error(NAME, e))?;
        write_geom_csv(&dataset.join("geom.csv"), &locations).map_err(|e| execution_error(NAME, e))?;
        let params = json!({ "samplerate": ctx.recording.sampling_frequency() });
        std::fs::write(dataset.join("params.json"), serde_json::to_string_pretty(&params)?)?;
        Ok(())
    })
    .await
}

pub(super) async fn run(ctx: &PartitionContext) -> Result<()> {
    let ironclust_path = install_path(BackendKind::Ironclust, &ctx.config)?;
    let dataset = ctx.folder.join(DATASET_DIR);
    let tmpdir = ctx.folder.join(TMP_DIR);
    let recording = ctx.recording.as_ref();
    let samplerate = recording.sampling_frequency();

    debug!(
        backend = NAME,
        channels = recording.num_channels(),
        frames = recording.num_frames(),
        minutes = recording.num_frames() as f64 / samplerate / 60.0,
        "creating argfile"
    );
    tokio::fs::write(dataset.join("argfile.txt"), argfile(&ctx.params, samplerate)).await?;
    tokio::fs::create_dir_all(&tmpdir).await?;

    let mut values = Values::new();
    values
        .set("ironclust_path", ironclust_path.display())
        .set("tmpdir", tmpdir.display())
        .set("dataset_dir", dataset.display());
    let script = fill(RUN_SCRIPT, &values).map_err(|e| execution_error(NAME, e))?;
    tokio::fs::write(tmpdir.join("run_ironclust.m"), script).await?;

    run_matlab(NAME, ctx, &tmpdir, "run_ironclust").await?;

    expect_output(NAME, &tmpdir.join("firings.mda"))?;
    tokio::fs::write(tmpdir.join("samplerate.txt"), samplerate.to_string()).await?;
    Ok(())
}

pub(super) fn result_from_folder(folder: &Path) -> Result<Option<SortingResult>> {
    let tmpdir = folder.join(TMP_DIR);
    let firings = tmpdir.join("firings.mda");
    if !firings.is_file() {
        return Ok(None);
    }
    let parse_error = |message: String| SortError::parsing(NAME, folder, message);
    let samplerate: f64 = std::fs::read_to_string(tmpdir.join("samplerate.txt"))
        .map_err(|e| parse_error(format!("samplerate.txt: {e}")))?
        .trim()
        .parse()
        .map_err(|e| parse_error(format!("samplerate.txt: {e}")))?;
    let mut sorting = read_firings(&firings).map_err(|e| parse_error(e.to_string()))?;
    sorting.sampling_frequency = Some(samplerate);
    Ok(Some(sorting))
}
