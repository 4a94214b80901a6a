//! Kilosort (MATLAB) backend.

use super::formats::read_kilosort_folder;
use super::template::{fill, matlab_bool, matlab_vector, Values};
use super::{blocking, execution_error, expect_output, install_path, run_matlab, BackendKind};
use crate::partition::PartitionContext;
use serde_json::Value;
use spikesort_core::params::{ParamSpec, ParamsExt};
use spikesort_core::recording::{write_binary, Recording};
use spikesort_core::sorting::SortingResult;
use spikesort_core::types::{DataType, GROUP_PROPERTY};
use spikesort_core::{Result, SortError};
use std::path::Path;
use tracing::warn;

const NAME: &str = "kilosort";

pub(super) const INSTALLATION: &str = "To use Kilosort run:
    git clone https://github.com/cortex-lab/KiloSort
and provide the installation path with KILOSORT_PATH or `kilosort_path` in the config file.

More information on KiloSort at:
    https://github.com/cortex-lab/KiloSort";

const MASTER: &str = r"try
    addpath(genpath('{kilosort_path}'));
    run('{config_path}');
    run('{channel_path}');
    ops.chanMap = fullfile('{output_folder}', 'chanMap.mat');
    if {use_gpu}
        gpuDevice(1);
    end
    [rez, DATA, uproj] = preprocessData(ops);
    rez = fitTemplates(rez, DATA, uproj);
    rez = fullMPMU(rez, DATA);
    rezToPhy(rez, '{output_folder}');
catch err
    disp(getReport(err));
    quit(1);
end
quit(0);
";

const CONFIG: &str = r"ops.GPU = {use_gpu};
ops.parfor = 0;
ops.verbose = 1;
ops.showfigures = 0;
ops.datatype = 'dat';
ops.fbinary = '{dat_file}';
ops.fproc = fullfile(fileparts('{dat_file}'), 'temp_wh.dat');
ops.root = fileparts('{dat_file}');
ops.fs = {sample_rate};
ops.NchanTOT = {nchan_tot};
ops.Nchan = {nchan};
ops.Nfilt = {nfilt};
ops.nNeighPC = min(12, ops.Nchan);
ops.nNeigh = 16;
ops.whitening = 'full';
ops.nSkipCov = 1;
ops.whiteningRange = 32;
ops.criterionNoiseChannels = 0.2;
ops.Nrank = 3;
ops.nfullpasses = 6;
ops.maxFR = 20000;
ops.fshigh = {freq_min};
ops.fslow = {freq_max};
ops.ntbuff = 64;
ops.scaleproc = 200;
ops.NT = {nt};
ops.Th = [4 10 10];
ops.lam = [5 5 5];
ops.nannealpasses = 4;
ops.momentum = 1./[20 400];
ops.shuffle_clusters = 1;
ops.mergeT = .1;
ops.splitT = .1;
ops.initialize = 'no';
ops.spkTh = -{detect_threshold};
ops.loc_range = [3 1];
ops.long_range = [30 6];
ops.maskMaxChannels = 5;
ops.crit = .65;
ops.nFiltMax = 10000;
ops.CAR = {use_car};
";

const CHANNEL_MAP: &str = r"Nchannels = {nchan};
connected = true(Nchannels, 1);
chanMap = 1:Nchannels;
chanMap0ind = chanMap - 1;
xcoords = {xcoords};
ycoords = {ycoords};
kcoords = {kcoords};
fs = {sample_rate};
save(fullfile('{output_folder}', 'chanMap.mat'), 'chanMap', 'connected', 'xcoords', 'ycoords', 'kcoords', 'chanMap0ind', 'fs');
";

pub(super) fn param_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("detect_threshold", 6, "Relative detection threshold"),
        ParamSpec::new("car", true, "Common average referencing"),
        ParamSpec::new("useGPU", true, "Run on the GPU"),
        ParamSpec::unset("electrode_dimensions", "Two location axes used as x and y"),
        ParamSpec::new("freq_min", 300, "High-pass cutoff (Hz)"),
        ParamSpec::new("freq_max", 6000, "Low-pass cutoff (Hz)"),
    ]
}

fn nfilt(nchan: usize) -> usize {
    match (nchan / 32) * 32 * 8 {
        0 => nchan * 8,
        n => n,
    }
}

/// Location axes to use as `(x, y)`.
fn electrode_dimensions(value: Option<&Value>) -> Result<[usize; 2]> {
    match value {
        None | Some(Value::Null) => Ok([0, 1]),
        Some(Value::Array(items)) if items.len() == 2 => {
            let axis = |v: &Value| {
                v.as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| SortError::Configuration(format!("bad electrode dimension {v}")))
            };
            Ok([axis(&items[0])?, axis(&items[1])?])
        }
        Some(other) => Err(SortError::Configuration(format!(
            "electrode_dimensions must be null or a pair of axes, got {other}"
        ))),
    }
}

fn coordinates(locations: &[Vec<f64>], axis: usize) -> Result<Vec<f64>> {
    locations
        .iter()
        .map(|loc| {
            loc.get(axis).copied().ok_or_else(|| {
                SortError::Configuration(format!("location {loc:?} has no axis {axis}"))
            })
        })
        .collect()
}

fn scripts(ctx: &PartitionContext, kilosort_path: &Path) -> Result<[(&'static str, String); 3]> {
    let recording = ctx.recording.as_ref();
    let params = &ctx.params;
    let nchan = recording.num_channels();
    let folder = &ctx.folder;

    let (locations, dims) = match recording.channel_locations() {
        Some(locations) => (locations, electrode_dimensions(params.get("electrode_dimensions"))?),
        None => {
            warn!(backend = NAME, "'location' information is not found; using a linear layout");
            ((0..nchan).map(|i| vec![0.0, i as f64]).collect(), [0, 1])
        }
    };
    let groups: Vec<i64> = recording
        .channel_ids()
        .into_iter()
        .map(|ch| {
            recording
                .channel_property(ch, GROUP_PROPERTY)
                .and_then(|g| g.as_i64())
                .unwrap_or(1)
        })
        .collect();

    let use_gpu = matlab_bool(params.bool_param("useGPU")?);
    let mut values = Values::new();
    values
        .set("kilosort_path", kilosort_path.display())
        .set("output_folder", folder.display())
        .set("config_path", folder.join("kilosort_config.m").display())
        .set("channel_path", folder.join("kilosort_channelmap.m").display())
        .set("dat_file", folder.join("recording.dat").display())
        .set("use_gpu", use_gpu)
        .set("use_car", matlab_bool(params.bool_param("car")?))
        .set("sample_rate", recording.sampling_frequency())
        .set("nchan_tot", nchan)
        .set("nchan", nchan)
        .set("nfilt", nfilt(nchan))
        .set("nt", 128 * 1024 + 64)
        .set("detect_threshold", params.f64_param("detect_threshold")?)
        .set("freq_min", params.f64_param("freq_min")?)
        .set("freq_max", params.f64_param("freq_max")?)
        .set("xcoords", matlab_vector(&coordinates(&locations, dims[0])?))
        .set("ycoords", matlab_vector(&coordinates(&locations, dims[1])?))
        .set("kcoords", matlab_vector(&groups));

    let render = |template: &str| fill(template, &values).map_err(|e| execution_error(NAME, e));
    Ok([
        ("kilosort_master.m", render(MASTER)?),
        ("kilosort_config.m", render(CONFIG)?),
        ("kilosort_channelmap.m", render(CHANNEL_MAP)?),
    ])
}

pub(super) async fn setup(ctx: &PartitionContext) -> Result<()> {
    let kilosort_path = install_path(BackendKind::Kilosort, &ctx.config)?;
    let ctx = ctx.clone();
    blocking(NAME, move || {
        for (name, contents) in scripts(&ctx, &kilosort_path)? {
            std::fs::write(ctx.folder.join(name), contents)?;
        }
        write_binary(ctx.recording.as_ref(), &ctx.folder.join("recording.dat"), DataType::Int16)
            .map_err(|e| execution_error(NAME, e))?;
        Ok(())
    })
    .await
}

pub(super) async fn run(ctx: &PartitionContext) -> Result<()> {
    run_matlab(NAME, ctx, &ctx.folder, "kilosort_master").await?;
    expect_output(NAME, &ctx.folder.join("spike_times.npy"))
}

pub(super) fn result_from_folder(folder: &Path) -> Result<Option<SortingResult>> {
    if !folder.join("spike_times.npy").is_file() {
        return Ok(None);
    }
    read_kilosort_folder(folder)
        .map(Some)
        .map_err(|e| SortError::parsing(NAME, folder, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendConfig;
    use spikesort_core::params::defaults;
    use spikesort_core::recording::InMemoryRecording;
    use std::sync::Arc;

    fn context(folder: &Path, with_locations: bool) -> PartitionContext {
        let mut rec = InMemoryRecording::new(30_000.0, vec![vec![0.0; 16]; 3]).unwrap();
        if with_locations {
            for ch in 0..3u32 {
                rec.set_channel_property(ch, "location", vec![f64::from(ch) * 10.0, 5.0])
                    .unwrap();
            }
        }
        PartitionContext {
            index: 0,
            recording: Arc::new(rec),
            folder: folder.to_path_buf(),
            params: Arc::new(defaults(&param_specs())),
            config: Arc::new(BackendConfig::default()),
            verbose: false,
        }
    }

    #[test]
    fn nfilt_rounds_to_blocks_of_32() {
        assert_eq!(nfilt(4), 32);
        assert_eq!(nfilt(32), 256);
        assert_eq!(nfilt(70), 512);
    }

    #[test]
    fn scripts_fill_every_placeholder() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), true);
        let [master, config, chanmap] = scripts(&ctx, Path::new("/opt/KiloSort")).unwrap();

        assert!(master.1.contains("addpath(genpath('/opt/KiloSort'))"));
        assert!(config.1.contains("ops.Nfilt = 24;"));
        assert!(config.1.contains("ops.spkTh = -6;"));
        assert!(chanmap.1.contains("xcoords = [0 10 20];"));
        assert!(chanmap.1.contains("kcoords = [1 1 1];"));
    }

    #[test]
    fn linear_layout_without_locations() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path(), false);
        let [_, _, chanmap] = scripts(&ctx, Path::new("/opt/KiloSort")).unwrap();
        assert!(chanmap.1.contains("ycoords = [0 1 2];"));
    }

    #[test]
    fn electrode_dimensions_accepts_pair_or_null() {
        assert_eq!(electrode_dimensions(None).unwrap(), [0, 1]);
        assert_eq!(electrode_dimensions(Some(&serde_json::json!([1, 0]))).unwrap(), [1, 0]);
        assert!(electrode_dimensions(Some(&serde_json::json!([1]))).is_err());
    }
}
