//! Kilosort2 (MATLAB) backend.
//!
//! Needs 2-D channel locations. `NT` is derived from `ntbuff` when unset and
//! is never written back into the parameters.

use super::formats::{read_kilosort_folder, read_ks_labels};
use super::template::{fill, matlab_bool, matlab_vector, Values};
use super::{blocking, execution_error, expect_output, install_path, run_matlab, BackendKind};
use crate::partition::PartitionContext;
use spikesort_core::params::{read_params, ParamSpec, Params, ParamsExt, PARAMS_FILE};
use spikesort_core::recording::{write_binary, Recording};
use spikesort_core::sorting::SortingResult;
use spikesort_core::types::DataType;
use spikesort_core::{Result, SortError};
use std::path::Path;

const NAME: &str = "kilosort2";
const LABELS_FILE: &str = "cluster_KSLabel.tsv";

pub(super) const INSTALLATION: &str = "To use Kilosort2 run:
    git clone https://github.com/MouseLand/Kilosort2
and provide the installation path with KILOSORT2_PATH or `kilosort2_path` in the config file.

More information on Kilosort2 at:
    https://github.com/MouseLand/Kilosort2";

const MASTER: &str = r"try
    addpath(genpath('{kilosort2_path}'));
    run('{config_path}');
    run('{channel_path}');
    ops.chanMap = fullfile('{output_folder}', 'chanMap.mat');
    gpuDevice(1);

    rez = preprocessDataSub(ops);
    rez = clusterSingleBatches(rez);
    rez = learnAndSolve8b(rez);
    rez = find_merges(rez, 1);
    rez = splitAllClusters(rez, 1);
    rez = splitAllClusters(rez, 0);
    rez = set_cutoff(rez);

    fprintf('found %d good units\n', sum(rez.good > 0));
    rezToPhy(rez, '{output_folder}');
catch err
    disp(getReport(err));
    quit(1);
end
quit(0);
";

const CONFIG: &str = r"ops.fs = {sample_rate};
ops.NchanTOT = {nchan};
ops.fbinary = '{dat_file}';
ops.fproc = fullfile(fileparts('{dat_file}'), 'temp_wh.dat');
ops.trange = [0 Inf];
ops.fshigh = {freq_min};
ops.minfr_goodchannels = {minfr_goodchannels};
ops.Th = {projection_threshold};
ops.lam = 10;
ops.AUCsplit = 0.9;
ops.minFR = {minFR};
ops.momentum = [20 400];
ops.sigmaMask = {sigmaMask};
ops.ThPre = {preclust_threshold};
ops.spkTh = -{kilo_thresh};
ops.reorder = 1;
ops.nskip = 25;
ops.CAR = {use_car};
ops.GPU = 1;
ops.nfilt_factor = {nfilt_factor};
ops.ntbuff = {ntbuff};
ops.NT = {nt};
ops.whiteningRange = 32;
ops.nSkipCov = 25;
ops.scaleproc = 200;
ops.nPCs = {nPCs};
ops.useRAM = 0;
";

const CHANNEL_MAP: &str = r"Nchannels = {nchan};
connected = true(Nchannels, 1);
chanMap = 1:Nchannels;
chanMap0ind = chanMap - 1;
xcoords = {xcoords};
ycoords = {ycoords};
kcoords = ones(1, Nchannels);
fs = {sample_rate};
save(fullfile('{output_folder}', 'chanMap.mat'), 'chanMap', 'connected', 'xcoords', 'ycoords', 'kcoords', 'chanMap0ind', 'fs');
";

pub(super) fn param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("detect_threshold", 5, "Spike detection threshold"),
        ParamSpec::new("projection_threshold", vec![10, 4], "Template projection thresholds"),
        ParamSpec::new("preclust_threshold", 8, "Threshold crossings for pre-clustering"),
        ParamSpec::new("car", true, "Common average referencing"),
        ParamSpec::new("minFR", 0.1, "Minimum firing rate of a kept cluster (Hz)"),
        ParamSpec::new("minfr_goodchannels", 0.1, "Minimum firing rate of a good channel (Hz)"),
        ParamSpec::new("freq_min", 150, "High-pass cutoff (Hz)"),
        ParamSpec::new("sigmaMask", 30, "Spatial constant for channel masking (um)"),
        ParamSpec::new("nPCs", 3, "PCA dimensions per channel"),
        ParamSpec::new("ntbuff", 64, "Samples of symmetric batch padding"),
        ParamSpec::new("nfilt_factor", 4, "Maximum templates per channel"),
        ParamSpec::unset("NT", "Batch size in samples; derived from ntbuff when unset"),
        ParamSpec::new("keep_good_only", false, "Return only clusters labelled 'good'"),
    ]
}

/// Batch size: `64 * 1024 + ntbuff`, or `NT` rounded down to a multiple of 32.
fn batch_size(params: &Params) -> Result<i64> {
    let ntbuff = params.i64_param("ntbuff")?;
    Ok(match params.opt_f64_param("NT")? {
        None => 64 * 1024 + ntbuff,
        Some(_) => params.i64_param("NT")? / 32 * 32,
    })
}

fn projection_threshold(params: &Params) -> Result<String> {
    let values = params
        .get("projection_threshold")
        .and_then(|v| v.as_array())
        .and_then(|items| items.iter().map(serde_json::Value::as_f64).collect::<Option<Vec<_>>>())
        .ok_or_else(|| {
            SortError::Configuration("projection_threshold must be a list of numbers".to_string())
        })?;
    Ok(matlab_vector(&values))
}

fn scripts(ctx: &PartitionContext, kilosort2_path: &Path) -> Result<[(&'static str, String); 3]> {
    let recording = ctx.recording.as_ref();
    let params = &ctx.params;
    let folder = &ctx.folder;

    let locations = recording.channel_locations().ok_or_else(|| {
        SortError::Configuration(format!("{NAME} requires a 'location' on every channel"))
    })?;
    if locations.iter().any(|loc| loc.len() != 2) {
        return Err(SortError::Configuration(
            "3D 'location' are not supported; set 2D locations instead".to_string(),
        ));
    }
    let xcoords: Vec<f64> = locations.iter().map(|loc| loc[0]).collect();
    let ycoords: Vec<f64> = locations.iter().map(|loc| loc[1]).collect();

    let mut values = Values::new();
    values
        .set("kilosort2_path", kilosort2_path.display())
        .set("output_folder", folder.display())
        .set("config_path", folder.join("kilosort2_config.m").display())
        .set("channel_path", folder.join("kilosort2_channelmap.m").display())
        .set("dat_file", folder.join("recording.dat").display())
        .set("sample_rate", recording.sampling_frequency())
        .set("nchan", recording.num_channels())
        .set("projection_threshold", projection_threshold(params)?)
        .set("preclust_threshold", params.f64_param("preclust_threshold")?)
        .set("minfr_goodchannels", params.f64_param("minfr_goodchannels")?)
        .set("minFR", params.f64_param("minFR")?)
        .set("freq_min", params.f64_param("freq_min")?)
        .set("sigmaMask", params.f64_param("sigmaMask")?)
        .set("kilo_thresh", params.f64_param("detect_threshold")?)
        .set("use_car", matlab_bool(params.bool_param("car")?))
        .set("nPCs", params.i64_param("nPCs")?)
        .set("ntbuff", params.i64_param("ntbuff")?)
        .set("nfilt_factor", params.i64_param("nfilt_factor")?)
        .set("nt", batch_size(params)?)
        .set("xcoords", matlab_vector(&xcoords))
        .set("ycoords", matlab_vector(&ycoords));

    let render = |template: &str| fill(template, &values).map_err(|e| execution_error(NAME, e));
    Ok([
        ("kilosort2_master.m", render(MASTER)?),
        ("kilosort2_config.m", render(CONFIG)?),
        ("kilosort2_channelmap.m", render(CHANNEL_MAP)?),
    ])
}

pub(super) async fn setup(ctx: &PartitionContext) -> Result<()> {
    let kilosort2_path = install_path(BackendKind::Kilosort2, &ctx.config)?;
    let ctx = ctx.clone();
    blocking(NAME, move || {
        for (name, contents) in scripts(&ctx, &kilosort2_path)? {
            std::fs::write(ctx.folder.join(name), contents)?;
        }
        write_binary(ctx.recording.as_ref(), &ctx.folder.join("recording.dat"), DataType::Int16)
            .map_err(|e| execution_error(NAME, e))?;
        Ok(())
    })
    .await
}

pub(super) async fn run(ctx: &PartitionContext) -> Result<()> {
    run_matlab(NAME, ctx, &ctx.folder, "kilosort2_master").await?;
    expect_output(NAME, &ctx.folder.join("spike_times.npy"))
}

/// Spikes from the folder, restricted to `good` clusters when the run asked for it.
pub(super) fn result_from_folder(folder: &Path) -> Result<Option<SortingResult>> {
    if !folder.join("spike_times.npy").is_file() {
        return Ok(None);
    }
    let parse_error = |message: String| SortError::parsing(NAME, folder, message);

    let mut sorting = read_kilosort_folder(folder).map_err(|e| parse_error(e.to_string()))?;
    let labels_path = folder.join(LABELS_FILE);
    let labels = if labels_path.is_file() {
        read_ks_labels(&labels_path).map_err(|e| parse_error(e.to_string()))?
    } else {
        Default::default()
    };
    for (id, label) in &labels {
        sorting.set_unit_property(*id, "KSLabel", label.as_str());
    }

    let keep_good_only = if folder.join(PARAMS_FILE).is_file() {
        let params = read_params(folder).map_err(|e| parse_error(e.to_string()))?;
        params.get("keep_good_only").and_then(serde_json::Value::as_bool).unwrap_or(false)
    } else {
        false
    };
    if keep_good_only {
        sorting.retain_units(|id| labels.get(&id).is_some_and(|l| l == "good"));
    }
    Ok(Some(sorting))
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::formats::write_npy_i64;
    use spikesort_core::params::{defaults, write_params};
    use serde_json::json;

    #[test]
    fn batch_size_is_derived_without_mutating_params() {
        let mut params = defaults(&param_specs());
        assert_eq!(batch_size(&params).unwrap(), 65_600);
        params.insert("NT".to_string(), json!(70_000));
        assert_eq!(batch_size(&params).unwrap(), 69_984);
        assert_eq!(params["NT"], json!(70_000));
    }

    #[test]
    fn projection_threshold_is_a_matlab_vector() {
        let params = defaults(&param_specs());
        assert_eq!(projection_threshold(&params).unwrap(), "[10 4]");
    }

    fn write_output(folder: &Path, keep_good_only: bool) {
        write_npy_i64(&folder.join("spike_times.npy"), &[10, 20, 30, 40]).unwrap();
        write_npy_i64(&folder.join("spike_clusters.npy"), &[0, 1, 0, 2]).unwrap();
        std::fs::write(folder.join(LABELS_FILE), "cluster_id\tKSLabel\n0\tgood\n1\tmua\n2\tgood\n").unwrap();
        let mut params = defaults(&param_specs());
        params.insert("keep_good_only".to_string(), json!(keep_good_only));
        write_params(folder, &params).unwrap();
    }

    #[test]
    fn keep_good_only_filters_by_label() {
        let dir = tempfile::TempDir::new().unwrap();
        write_output(dir.path(), true);
        let sorting = result_from_folder(dir.path()).unwrap().unwrap();
        assert_eq!(sorting.unit_ids(), vec![0, 2]);
        assert_eq!(sorting.spike_train(0).unwrap(), &[10, 30]);
    }

    #[test]
    fn all_clusters_by_default() {
        let dir = tempfile::TempDir::new().unwrap();
        write_output(dir.path(), false);
        let sorting = result_from_folder(dir.path()).unwrap().unwrap();
        assert_eq!(sorting.unit_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn no_output_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(result_from_folder(dir.path()).unwrap().is_none());
    }
}
