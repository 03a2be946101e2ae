use clap::{Parser, Subcommand};
use jetsond::builder;
use jetsond::config::Config;
use jetsond::ipc::{Client, Command, Daemon, Endpoint};
use jetsond::metrics::Metrics;
use jetsond::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "jetsond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "/etc/jetsond/config.yaml")]
    config: PathBuf,
    /// Default tick in milliseconds.
    #[arg(long)]
    refresh: Option<u64>,
    #[arg(long)]
    debug: bool,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Run the daemon in the foreground.
    Start {
        /// Replace a socket left behind by a crashed daemon.
        #[arg(long)]
        force: bool,
    },
    /// Ask a running daemon to exit.
    Stop {
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
    /// Print the daemon's self-metrics.
    Metrics,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return ExitCode::SUCCESS;
    }

    let cfg = match load_config(&cli.config, cli.refresh) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.action.unwrap_or(Action::Start { force: false }) {
        Action::Start { force } => run_daemon(cfg, force).await,
        Action::Stop { timeout } => stop_daemon(&cfg, timeout).await,
        Action::Metrics => print_metrics(&cfg).await,
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, kind = err.kind(), "jetsond failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path, refresh: Option<u64>) -> std::result::Result<Config, String> {
    let mut cfg = if path.exists() {
        Config::load_from_file(path).map_err(|err| err.to_string())?
    } else {
        info!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };
    if let Some(ms) = refresh {
        cfg.interval_ms = ms;
        cfg.validate().map_err(|err| err.to_string())?;
    }
    Ok(cfg)
}

async fn run_daemon(cfg: Config, force: bool) -> Result<()> {
    let endpoint = Endpoint::bind(&cfg.socket_path, cfg.group.as_deref(), force)?;
    let _pid = PidFile::create(&cfg.pid_file)?;
    let metrics = Metrics::new().map_err(|err| Error::Io(io::Error::other(err.to_string())))?;

    info!(
        socket = %cfg.socket_path.display(),
        interval_ms = cfg.interval_ms,
        "starting jetsond"
    );
    let (source, services) = builder::assemble(&cfg).await;
    services.restore().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let outcome = Daemon::new(cfg, source, services, metrics)
        .run(endpoint, shutdown_rx)
        .await;
    signals.abort();
    if outcome.is_ok() {
        info!("jetsond stopped");
    }
    outcome
}

async fn wait_for_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!(error = %err, "SIGTERM handler not installed, waiting for Ctrl+C only");
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to wait for Ctrl+C");
            }
            return;
        }
    };
    tokio::select! {
        _ = terminate.recv() => info!("SIGTERM received"),
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("Ctrl+C received"),
            Err(err) => error!(error = %err, "failed to wait for Ctrl+C"),
        },
    }
}

async fn stop_daemon(cfg: &Config, timeout: Duration) -> Result<()> {
    let pid_path = cfg.pid_file.display().to_string();
    let text = fs::read_to_string(&cfg.pid_file)
        .map_err(|err| Error::not_found(pid_path.clone(), err.to_string()))?;
    let pid: i32 = text
        .trim()
        .parse()
        .map_err(|_| Error::Invalid(format!("{pid_path} does not hold a pid")))?;

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            return Err(Error::not_found(format!("process {pid}"), "stale pid file"));
        }
        Err(errno) => return Err(io::Error::from(errno).into()),
    }
    info!(pid, "SIGTERM sent, waiting for the daemon to exit");

    let socket = cfg.socket_path.clone();
    time::timeout(timeout, async {
        while socket.exists() {
            time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .map_err(|_| Error::timeout("daemon shutdown", timeout))
}

async fn print_metrics(cfg: &Config) -> Result<()> {
    let mut client = Client::connect(&cfg.socket_path, cfg.interval()).await?;
    let reply = client.send(Command::Metrics).await?;
    client.close();
    if !reply.ok {
        return Err(Error::Invalid(reply.error.unwrap_or_default()));
    }
    print!("{}", reply.body.unwrap_or_default());
    Ok(())
}

/// Holds the daemon's pid on disk for `jetsond stop`.
struct PidFile(PathBuf);

impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            warn!(path = %self.0.display(), error = %err, "pid file not removed");
        }
    }
}
