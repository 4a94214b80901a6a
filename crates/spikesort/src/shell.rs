//! Generated shell scripts run as child processes.
//!
//! A `ShellScript` owns one script file and one log file. Child stdout and
//! stderr are streamed line by line into the log as they arrive, so partial
//! output survives a crash of the external program. A heartbeat is logged
//! while the process runs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages while a backend is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[cfg(not(windows))]
const PROLOGUE: &str = "#!/bin/sh\n";
#[cfg(windows)]
const PROLOGUE: &str = "@echo off\r\n";

/// File extension for generated scripts on this platform.
#[cfg(not(windows))]
pub const SCRIPT_EXTENSION: &str = "sh";
#[cfg(windows)]
pub const SCRIPT_EXTENSION: &str = "bat";

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("script was not started")]
    NotStarted,
}

pub type Result<T> = std::result::Result<T, ShellError>;

type LogSink = Arc<Mutex<tokio::fs::File>>;

#[derive(Debug)]
struct Running {
    child: Child,
    streams: Vec<JoinHandle<std::io::Result<()>>>,
    started: Instant,
}

#[derive(Debug)]
pub struct ShellScript {
    body: String,
    script_path: PathBuf,
    log_path: PathBuf,
    working_dir: Option<PathBuf>,
    keep_temp_files: bool,
    verbose: bool,
    running: Option<Running>,
}

impl ShellScript {
    /// Script at `script_path` with output captured into `log_path`.
    ///
    /// Common leading indentation of `body` is removed.
    pub fn new(body: &str, script_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            body: dedent(body),
            script_path: script_path.into(),
            log_path: log_path.into(),
            working_dir: None,
            keep_temp_files: false,
            verbose: false,
            running: None,
        }
    }

    pub fn keep_temp_files(mut self, keep: bool) -> Self {
        self.keep_temp_files = keep;
        self
    }

    /// Echo child output lines at `info` instead of `debug`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Full script text, prologue included.
    pub fn contents(&self) -> String {
        format!("{PROLOGUE}{}", self.body)
    }

    pub fn write(&self) -> Result<()> {
        if let Some(parent) = self.script_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.script_path, self.contents())?;
        Ok(())
    }

    /// Spawn the script without waiting for it.
    ///
    /// A spawn failure is also recorded in the log file.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = tokio::fs::File::create(&self.log_path).await?;
        let sink: LogSink = Arc::new(Mutex::new(log));

        let mut cmd = interpreter(&self.script_path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(script = %self.script_path.display(), log = %self.log_path.display(), "spawning script");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let mut log = sink.lock().await;
                log.write_all(format!("failed to start script: {source}\n").as_bytes())
                    .await?;
                log.flush().await?;
                return Err(ShellError::Spawn {
                    path: self.script_path.clone(),
                    source,
                });
            }
        };

        let mut streams = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            streams.push(tokio::spawn(stream_lines(stdout, Arc::clone(&sink), self.verbose)));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(tokio::spawn(stream_lines(stderr, Arc::clone(&sink), self.verbose)));
        }

        self.running = Some(Running {
            child,
            streams,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Block until the process exits and return its exit code.
    ///
    /// Termination by signal is reported as -1. On exit code 0 the script
    /// file is removed unless temp files are kept.
    pub async fn wait(&mut self) -> Result<i32> {
        let Some(mut running) = self.running.take() else {
            return Err(ShellError::NotStarted);
        };

        let status = loop {
            tokio::select! {
                result = running.child.wait() => break result?,
                () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    info!(
                        script = %self.script_path.display(),
                        elapsed_sec = running.started.elapsed().as_secs(),
                        "backend still running"
                    );
                }
            }
        };

        for stream in running.streams {
            match stream.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "output capture failed"),
                Err(err) => warn!(error = %err, "output capture task panicked"),
            }
        }

        let exit_code = status.code().unwrap_or(-1);
        debug!(
            script = %self.script_path.display(),
            exit_code,
            duration_ms = running.started.elapsed().as_millis() as u64,
            "script finished"
        );

        if exit_code == 0 && !self.keep_temp_files {
            if let Err(err) = std::fs::remove_file(&self.script_path) {
                warn!(script = %self.script_path.display(), error = %err, "failed to remove script");
            }
        }
        Ok(exit_code)
    }

    /// Write, start and wait.
    ///
    /// A failure to write the script is recorded in the log file.
    pub async fn run(&mut self) -> Result<i32> {
        if let Err(err) = self.write() {
            if let Err(log_err) = self.log_failure(&format!("failed to write script: {err}")).await {
                warn!(log = %self.log_path.display(), error = %log_err, "failed to record script error");
            }
            return Err(err);
        }
        self.start().await?;
        self.wait().await
    }

    async fn log_failure(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log = tokio::fs::File::create(&self.log_path).await?;
        log.write_all(format!("{message}\n").as_bytes()).await?;
        log.flush().await?;
        Ok(())
    }
}

#[cfg(not(windows))]
fn interpreter(script: &Path) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg(script);
    cmd
}

#[cfg(windows)]
fn interpreter(script: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(script);
    cmd
}

async fn stream_lines<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    sink: LogSink,
    verbose: bool,
) -> std::io::Result<()> {
    let mut lines = tokio::io::BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if verbose {
            info!(target: "spikesort::backend", "{line}");
        } else {
            debug!(target: "spikesort::backend", "{line}");
        }
        let mut file = sink.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    sink.lock().await.flush().await
}

/// Strip the indentation shared by every non-blank line and surrounding blank lines.
pub fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| &l[..l.len() - l.trim_start().len()])
        .reduce(common_prefix)
        .unwrap_or("");
    let lines: Vec<&str> = text
        .lines()
        .map(|l| l.strip_prefix(indent).unwrap_or_else(|| l.trim_start()))
        .collect();
    let start = lines.iter().position(|l| !l.trim().is_empty()).unwrap_or(lines.len());
    let end = lines.iter().rposition(|l| !l.trim().is_empty()).map_or(start, |i| i + 1);
    let mut out = lines[start..end].join("\n");
    out.push('\n');
    out
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let end = a
        .char_indices()
        .zip(b.chars())
        .take_while(|((_, x), y)| x == y)
        .last()
        .map_or(0, |((i, c), _)| i + c.len_utf8());
    &a[..end]
}
