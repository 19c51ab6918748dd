use std::{
    env,
    fmt,
    fs::{self, File},
    io::{self, stderr, Stderr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, info, log_enabled, Level};
use serde::{Deserialize, Serialize};
use tokio::{signal::ctrl_c, sync::mpsc::UnboundedReceiver, task};

use otalib::{
    checkpoint::{CheckpointStore, JsonFileStore},
    control::job_channel,
    storage::FsStorageProbe,
    verify::md5_file,
    ArtifactMetadata, DownloadEvent, DownloadState, Orchestrator, OrchestratorConfig,
};
use progresslib::{Phase, ProgressDrawMode, TransferBar};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Resumable, verified downloader for OTA update packages.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Opts {
    #[command(subcommand)]
    command: Command,
    /// Set logging verbosity
    ///
    /// By default, only warnings are printed. If set to 'debug', state
    /// transitions and retry decisions are printed out. If set to 'trace', every
    /// buffer write and checkpoint update is also printed out, which can be
    /// extremely verbose. This option overrides the RUST_LOG environment
    /// variable.
    #[arg(value_enum, long, global = true)]
    loglevel: Option<LogLevel>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. A missing config
    /// file is not an error.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory to store downloaded packages in
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    /// Path to the download checkpoint file
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download and verify a package
    ///
    /// If a previous download of the same package was interrupted, it is
    /// resumed from where it left off.
    Download(DownloadOpts),
    /// Resume a paused or interrupted download
    Resume,
    /// Show the state of the current download
    Status,
    /// Cancel the current download and remove the partial file
    Cancel,
    /// Remove the current package and any partial download
    Delete,
    /// Check a file against an MD5 checksum
    Verify {
        file: PathBuf,
        checksum: String,
    },
}

#[derive(Debug, Args)]
struct DownloadOpts {
    /// HTTP(S) URL of the package
    #[arg(long)]
    url: String,
    /// Expected size in bytes
    #[arg(long)]
    size: u64,
    /// Expected MD5 checksum (hex)
    #[arg(long)]
    md5: String,
    /// Output filename (defaults to the last component of the URL)
    #[arg(long)]
    filename: Option<String>,
    /// Version label for display purposes
    #[arg(long, default_value = "")]
    version_label: String,
}

impl DownloadOpts {
    fn artifact(&self) -> Result<ArtifactMetadata> {
        let filename = match &self.filename {
            Some(f) => f.clone(),
            None => self.url
                .split(['?', '#'])
                .next()
                .and_then(|p| p.rsplit('/').next())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| anyhow!("Cannot determine filename from URL; use --filename"))?
                .to_owned(),
        };

        Ok(ArtifactMetadata {
            download_url: self.url.clone(),
            filename,
            expected_size: self.size,
            expected_checksum: self.md5.clone(),
            version_label: self.version_label.clone(),
        })
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct Config {
    download_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    retry_base_delay_secs: Option<u64>,
    max_retries: Option<u32>,
    launch_install: bool,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{PKG_NAME}.conf"));
        p
    })
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|mut p| {
        p.push(PKG_NAME);
        p
    })
}

fn load_config_file(user_path: Option<&Path>) -> Result<Config> {
    let default_path = default_config_path();
    let Some(path) = user_path.or(default_path.as_deref()) else {
        return Ok(Config::default());
    };

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e).context(format!("Could not open file: {path:?}")),
    };

    serde_json::from_reader(file)
        .context(format!("Could not parse config file: {path:?}"))
}

/// Paths and options after merging the command line over the config file.
#[derive(Debug)]
struct Settings {
    download_dir: PathBuf,
    state_file: PathBuf,
    orchestrator: OrchestratorConfig,
}

impl Settings {
    fn new(opts: &Opts, config: Config) -> Result<Self> {
        let data_dir = default_data_dir();

        let download_dir = opts.download_dir.clone()
            .or(config.download_dir)
            .or_else(|| data_dir.as_ref().map(|d| d.join("downloads")))
            .ok_or_else(|| anyhow!("No download directory specified"))?;
        let state_file = opts.state_file.clone()
            .or(config.state_file)
            .or_else(|| data_dir.as_ref().map(|d| d.join("state.json")))
            .ok_or_else(|| anyhow!("No state file specified"))?;

        let mut orchestrator = OrchestratorConfig::new(download_dir.clone());
        if let Some(secs) = config.connect_timeout_secs {
            orchestrator.http.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = config.read_timeout_secs {
            orchestrator.http.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = config.retry_base_delay_secs {
            orchestrator.retry.base_delay = Duration::from_secs(secs);
        }
        if let Some(n) = config.max_retries {
            orchestrator.retry.max_retries = n;
        }
        orchestrator.launch_install = config.launch_install;

        Ok(Self {
            download_dir,
            state_file,
            orchestrator,
        })
    }

    fn open_store(&self) -> Result<JsonFileStore> {
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent)
                .context(format!("Could not create directory: {parent:?}"))?;
        }

        JsonFileStore::open(&self.state_file)
            .context(format!("Could not load state file: {:?}", self.state_file))
    }

    fn orchestrator(&self) -> Result<Orchestrator> {
        Orchestrator::new(
            self.orchestrator.clone(),
            Box::new(self.open_store()?),
            Box::new(FsStorageProbe),
        ).context("Could not initialize downloader")
    }
}

/// Create a new progress bar with the specified length. The progress bar is not
/// immediately rendered.
fn create_progress_bar(len: u64) -> TransferBar<Stderr> {
    let mut bar = TransferBar::new(stderr(), len);
    if log_enabled!(Level::Debug) {
        // The escape sequences for the interactive progress bar would clobber
        // log messages.
        bar.set_mode(Some(ProgressDrawMode::Append));
    }

    bar
}

/// Whether Ctrl-C should pause the download and wait for its job to exit.
/// While waiting to retry or verifying, the checkpoint already says where to
/// pick up and the process can exit right away.
fn pause_on_interrupt(state: DownloadState) -> bool {
    matches!(state, DownloadState::Queued | DownloadState::Downloading)
}

/// Render events until the download finishes, fails, or is paused. Ctrl-C
/// pauses an active transfer and waits for the checkpoint to be written.
async fn watch(
    orchestrator: &Orchestrator,
    events: &mut UnboundedReceiver<DownloadEvent>,
    total: u64,
) -> Result<()> {
    let mut bar = create_progress_bar(total);
    let interrupt = ctrl_c();
    tokio::pin!(interrupt);

    loop {
        let event = tokio::select! {
            e = events.recv() => e.ok_or_else(|| anyhow!("Downloader stopped unexpectedly"))?,
            r = &mut interrupt => {
                r.context("Could not listen for Ctrl-C")?;

                let state = orchestrator.query_status().state;
                if !pause_on_interrupt(state) {
                    drop(bar);
                    eprintln!("Interrupted in state {state}. Run `{PKG_NAME} resume` to continue.");
                    return Ok(());
                }

                bar.println("Pausing download")?;
                orchestrator.pause();
                orchestrator.wait_for_jobs().await;
                bar.set_phase(Phase::Paused)?;
                drop(bar);

                eprintln!("Download paused. Run `{PKG_NAME} resume` to continue.");
                return Ok(());
            }
        };

        debug!("Event: {:?}", event);

        match event {
            DownloadEvent::Started => bar.set_phase(Phase::Downloading)?,
            DownloadEvent::Progress { bytes_done, total_bytes, eta_seconds, .. } => {
                bar.update(bytes_done, total_bytes, eta_seconds)?;
            }
            DownloadEvent::Paused { queued: true } => {
                bar.println("Connection problem; waiting to retry")?;
                bar.set_phase(Phase::Waiting)?;
            }
            DownloadEvent::Paused { queued: false } => {
                bar.set_phase(Phase::Paused)?;
                return Ok(());
            }
            DownloadEvent::VerifyStarted => bar.set_phase(Phase::Verifying)?,
            DownloadEvent::VerifyFailed => bar.println("Verification failed")?,
            DownloadEvent::VerifyComplete { should_launch_install } => {
                drop(bar);
                println!("Download complete and verified");
                if should_launch_install {
                    println!("Package is ready to be installed");
                }
                return Ok(());
            }
            DownloadEvent::Error { kind, .. } => {
                drop(bar);
                if kind.is_retryable() {
                    eprintln!("Run `{PKG_NAME} download` again to retry.");
                } else {
                    eprintln!("Retrying will not help. Check the package details or run `{PKG_NAME} delete`.");
                }
                bail!("Download failed: {kind}");
            }
            DownloadEvent::Cancelled => {
                drop(bar);
                bail!("Download was cancelled");
            }
            DownloadEvent::StatusSnapshot { state: DownloadState::Completed, .. } => {
                drop(bar);
                println!("Package is already downloaded");
                return Ok(());
            }
            DownloadEvent::StatusSnapshot { .. } => {}
        }
    }
}

async fn download(settings: &Settings, opts: &DownloadOpts) -> Result<()> {
    let artifact = opts.artifact()?;
    debug!("Artifact: {:#?}", artifact);

    let orchestrator = settings.orchestrator()?;
    let mut events = orchestrator.subscribe();
    orchestrator.restore();

    let status = orchestrator.query_status();
    if status.state.is_active() {
        info!("Continuing previous download instead");
    } else {
        orchestrator.enqueue(artifact.clone());

        let state = orchestrator.query_status().state;
        if matches!(state, DownloadState::Paused | DownloadState::PausedAwaitingConnection) {
            bail!("A different download is paused. Run `{PKG_NAME} cancel` first.");
        }
    }

    println!("Downloading {} to {:?}", artifact.filename, settings.download_dir);

    watch(&orchestrator, &mut events, artifact.expected_size).await
}

async fn resume(settings: &Settings) -> Result<()> {
    let orchestrator = settings.orchestrator()?;
    let mut events = orchestrator.subscribe();
    orchestrator.restore();

    let status = orchestrator.query_status();
    match status.state {
        DownloadState::Paused | DownloadState::PausedAwaitingConnection => orchestrator.resume(),
        s if s.is_active() => {}
        s => {
            println!("Nothing to resume ({s})");
            return Ok(());
        }
    }

    watch(&orchestrator, &mut events, status.total_bytes).await
}

fn status(settings: &Settings) -> Result<()> {
    let store = CheckpointStore::new(Box::new(settings.open_store()?));
    let checkpoint = store.load().context("Could not read checkpoint")?;

    let Some(checkpoint) = checkpoint else {
        println!("State: {}", DownloadState::Idle);
        return Ok(());
    };

    println!("State: {}", checkpoint.state);

    if let Some(artifact) = &checkpoint.artifact {
        let done = checkpoint.resume_offset();
        let percent = done.min(artifact.expected_size) * 100 / artifact.expected_size.max(1);

        println!("File: {:?}", artifact.paths(&settings.download_dir).final_path);
        if !artifact.version_label.is_empty() {
            println!("Version: {}", artifact.version_label);
        }
        println!("Progress: {}% ({}/{} bytes)", percent, done, artifact.expected_size);
    }

    debug!("Work ID: {}", checkpoint.work_id);
    for transition in &checkpoint.history {
        debug!("History: {}", transition);
    }

    Ok(())
}

async fn discard(settings: &Settings, delete: bool) -> Result<()> {
    let orchestrator = settings.orchestrator()?;
    orchestrator.restore();

    let state = orchestrator.query_status().state;
    if delete {
        orchestrator.delete();
    } else if state == DownloadState::Idle || state.is_terminal() {
        println!("Nothing to cancel ({state})");
        return Ok(());
    } else {
        orchestrator.cancel();
    }

    orchestrator.wait_for_jobs().await;
    println!("Done");

    Ok(())
}

async fn verify(path: &Path, checksum: &str) -> Result<()> {
    let expected = checksum.trim().to_ascii_lowercase();
    let (_control, listener) = job_channel();

    let digest = task::spawn_blocking({
        let path = path.to_owned();
        move || md5_file(&path, &listener)
    }).await?
        .context(format!("Could not read file: {path:?}"))?
        .ok_or_else(|| anyhow!("Checksum computation was interrupted"))?;

    if digest != expected {
        bail!("File checksum ({digest}) does not match expected checksum ({expected})");
    }

    println!("{digest}  {}", path.display());

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        env::set_var("RUST_LOG", format!("{PKG_NAME}={l},otalib={l}"));
    }

    env_logger::init();

    debug!("Arguments: {:#?}", opts);

    let config = load_config_file(opts.config.as_deref())?;
    debug!("Config: {:#?}", config);

    let settings = Settings::new(&opts, config)?;
    debug!("Settings: {:#?}", settings);

    match &opts.command {
        Command::Download(d) => download(&settings, d).await,
        Command::Resume => resume(&settings).await,
        Command::Status => status(&settings),
        Command::Cancel => discard(&settings, false).await,
        Command::Delete => discard(&settings, true).await,
        Command::Verify { file, checksum } => verify(file, checksum).await,
    }
}
