//! spikesort - run spike sorters on recordings
//!
//! Single runs, batches over a working folder, collection of finished
//! batches, and the hidden worker entry point used by the process-pool and
//! distributed engines.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use eyre::{bail, Result, WrapErr};
use spikesort::launcher::{run_sorters, LaunchOptions};
use spikesort::{
    available_sorters, collect_sorting_outputs, default_params, params_description, run_sorter,
    worker, SorterOptions, SorterRegistry,
};
use spikesort_core::config::load_sorter_params;
use spikesort_core::params::Params;
use spikesort_core::recording::{write_binary, RecordingRef, RecordingSpec};
use spikesort_core::synthetic::toy_recording;
use spikesort_core::types::{DataType, Engine, RunMode};
use spikesort_core::{Config, SortingResult};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "spikesort", about = "Spike-sorter orchestration", version)]
struct Cli {
    /// Config file path (overrides .spikesort/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Promote progress messages to info
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sorter on one recording
    Run {
        /// Sorter name
        sorter: String,

        /// Recording description (JSON), as written by `simulate`
        recording: PathBuf,

        /// Output folder
        #[arg(short, long)]
        output: PathBuf,

        /// Parameter overrides (YAML or JSON mapping)
        #[arg(long)]
        params: Option<PathBuf>,

        /// Channel property to split the recording by
        #[arg(long)]
        grouping_key: Option<String>,

        /// Run partitions concurrently
        #[arg(long)]
        parallel: bool,

        /// Record backend failures in the log instead of failing
        #[arg(long)]
        no_raise: bool,

        /// Remove the output folder after collecting the result
        #[arg(long)]
        delete_output_folder: bool,
    },

    /// Run several sorters on several recordings
    Batch {
        /// Sorter names
        #[arg(short, long = "sorter", required = true, num_args = 1..)]
        sorters: Vec<String>,

        /// Recording descriptions (JSON); named by file stem
        #[arg(short, long = "recording", required = true, num_args = 1..)]
        recordings: Vec<PathBuf>,

        /// Working folder (overrides config)
        #[arg(short, long)]
        working_folder: Option<PathBuf>,

        /// Existing completed jobs: raise, overwrite, or keep
        #[arg(long, value_parser = parse_mode)]
        mode: Option<RunMode>,

        /// Execution engine: serial, process_pool, or distributed
        #[arg(long, value_parser = parse_engine)]
        engine: Option<Engine>,

        /// Worker processes for the process-pool engine
        #[arg(long)]
        processes: Option<usize>,

        /// Per-sorter parameter overrides (YAML)
        #[arg(long)]
        sorter_params: Option<PathBuf>,

        /// Channel property to split recordings by
        #[arg(long)]
        grouping_key: Option<String>,

        /// Record backend failures in the log instead of failing
        #[arg(long)]
        no_raise: bool,
    },

    /// Summarise finished jobs of a working folder
    Collect {
        /// Working folder (overrides config)
        working_folder: Option<PathBuf>,
    },

    /// List sorters with installation status and version
    Sorters,

    /// Show default parameters of a sorter
    Params {
        sorter: String,
    },

    /// Write a synthetic recording and its ground truth
    Simulate {
        /// Output folder
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "4")]
        channels: usize,

        /// Duration in seconds
        #[arg(long, default_value = "10")]
        duration: f64,

        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Run one job file (used by worker engines)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        job: PathBuf,
    },
}

fn parse_mode(s: &str) -> Result<RunMode, String> {
    s.parse()
}

fn parse_engine(s: &str) -> Result<Engine, String> {
    s.parse()
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    if let Err(e) = runtime.block_on(dispatch(cli)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.verbose |= cli.verbose;
    let registry = SorterRegistry::from_config(&config);

    match cli.command {
        Command::Run {
            sorter,
            recording,
            output,
            params,
            grouping_key,
            parallel,
            no_raise,
            delete_output_folder,
        } => {
            let recording = load_recording(&recording)?;
            let params = match params {
                Some(path) => read_param_file(&path)?,
                None => Params::new(),
            };
            let mut options = SorterOptions::new(output)
                .verbose(config.verbose)
                .parallel(parallel || config.parallel)
                .delete_output_folder(delete_output_folder || config.delete_output_folder);
            options.grouping_key = grouping_key.or(config.grouping_key);
            let raise_error = config.raise_error && !no_raise;

            match run_sorter(&registry, &sorter, recording, options, &params, raise_error).await? {
                Some(sorting) => print_sorting(&sorter, &sorting),
                None => println!("{sorter}: failed; see log.json in the output folder"),
            }
        }
        Command::Batch {
            sorters,
            recordings,
            working_folder,
            mode,
            engine,
            processes,
            sorter_params,
            grouping_key,
            no_raise,
        } => {
            if let Some(folder) = working_folder {
                config.working_folder = folder;
            }
            config.mode = mode.unwrap_or(config.mode);
            config.engine = engine.unwrap_or(config.engine);
            config.processes = processes.unwrap_or(config.processes);
            config.grouping_key = grouping_key.or(config.grouping_key);
            config.raise_error &= !no_raise;

            let mut options = LaunchOptions::from_config(&config);
            if let Some(path) = sorter_params.or(config.sorter_params.clone()) {
                options.sorter_params = load_sorter_params(&path)?;
            }

            let mut named = Vec::with_capacity(recordings.len());
            for path in &recordings {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .ok_or_else(|| eyre::eyre!("cannot name recording {}", path.display()))?;
                named.push((name, load_recording(path)?));
            }

            info!(
                working_folder = %config.working_folder.display(),
                sorters = sorters.len(),
                recordings = named.len(),
                "batch started"
            );
            if let Some(results) = run_sorters(&registry, &sorters, named, &options).await? {
                for ((recording, sorter), sorting) in &results {
                    match sorting {
                        Some(sorting) => print_sorting(&format!("{recording}/{sorter}"), sorting),
                        None => println!("{recording}/{sorter}: failed"),
                    }
                }
            }
        }
        Command::Collect { working_folder } => {
            let folder = working_folder.unwrap_or(config.working_folder);
            if !folder.is_dir() {
                bail!("working folder {} does not exist", folder.display());
            }
            let outputs = collect_sorting_outputs(&registry, &folder)?;
            for ((recording, sorter), sorting) in &outputs {
                print_sorting(&format!("{recording}/{sorter}"), sorting);
            }
        }
        Command::Sorters => {
            let installed = registry.installed();
            let versions = registry.versions();
            for name in available_sorters() {
                let status = if installed.contains(&name) { "installed" } else { "not installed" };
                let version = versions.get(name).map_or("unknown", String::as_str);
                println!("{name:<14} {status:<14} {version}");
            }
        }
        Command::Params { sorter } => {
            let defaults = default_params(&sorter)?;
            let descriptions = params_description(&sorter)?;
            for (name, value) in &defaults {
                let value = value.to_string();
                let description = descriptions.get(name).map_or("", String::as_str);
                println!("{name:<28} {value:<12} {description}");
            }
        }
        Command::Simulate {
            output,
            channels,
            duration,
            seed,
        } => {
            if channels == 0 || duration <= 0.0 {
                bail!("channels and duration must be positive");
            }
            std::fs::create_dir_all(&output)?;
            let (recording, truth) = toy_recording(channels, duration, seed)?;
            let spec = write_binary(&recording, &output.join("recording.raw"), DataType::Float32)?;
            std::fs::write(output.join("recording.json"), serde_json::to_string_pretty(&spec)?)?;
            truth.write_json(&output.join("ground_truth.json"))?;
            info!(
                folder = %output.display(),
                channels,
                duration_sec = duration,
                units = truth.num_units(),
                spikes = truth.total_spikes(),
                "synthetic recording written"
            );
        }
        Command::Worker { job } => {
            worker::run_job_file(&job)
                .await
                .wrap_err_with(|| format!("job {} failed", job.display()))?;
        }
    }
    Ok(())
}

fn load_recording(path: &Path) -> Result<RecordingRef> {
    let content = std::fs::read_to_string(path).wrap_err_with(|| format!("cannot read {}", path.display()))?;
    let spec: RecordingSpec =
        serde_json::from_str(&content).wrap_err_with(|| format!("invalid recording description {}", path.display()))?;
    Ok(spec.load()?)
}

fn read_param_file(path: &Path) -> Result<Params> {
    let content = std::fs::read_to_string(path).wrap_err_with(|| format!("cannot read {}", path.display()))?;
    let params: Option<Params> =
        serde_yaml::from_str(&content).wrap_err_with(|| format!("invalid parameter file {}", path.display()))?;
    Ok(params.unwrap_or_default())
}

fn print_sorting(label: &str, sorting: &SortingResult) {
    println!(
        "{label}: {} units, {} spikes",
        sorting.num_units(),
        sorting.total_spikes()
    );
}
