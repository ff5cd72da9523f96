use anyhow::{Context, Result};
use clap::Parser;
use daemonize::Daemonize;
use fetchfs::config::{Config, LogConfig};
use fetchfs::fuse::FetchFs;
use fetchfs::fuse::mount::mount_fetchfs;
use fetchfs::{OverlayFs, load_config};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fetchfs")]
#[command(about = "Mount a remote SFTP tree through a local fetch-on-demand cache", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Directory to mount the overlay on
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Stay attached to the terminal instead of detaching
    #[arg(short, long)]
    foreground: bool,

    /// Where the detached daemon writes its pid
    #[arg(long, value_name = "PATH")]
    pid_file: Option<PathBuf>,
}

fn init_tracing(cfg: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    match &cfg.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    let mountpoint = std::fs::canonicalize(&cli.mountpoint)
        .with_context(|| format!("Failed to resolve mountpoint {}", cli.mountpoint.display()))?;

    // detach before any runtime thread exists
    if !cli.foreground {
        let mut daemonize = Daemonize::new().working_directory("/");
        if let Some(pid) = &cli.pid_file {
            let pid = std::path::absolute(pid)
                .with_context(|| format!("Failed to resolve pid file {}", pid.display()))?;
            daemonize = daemonize.pid_file(pid);
        }
        daemonize.start().context("Failed to daemonize")?;
    }
    init_tracing(&cfg.log)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run(cfg, mountpoint))
}

async fn run(cfg: Config, mountpoint: PathBuf) -> Result<()> {
    info!(
        "serving {}@{}:{} from cache {}",
        cfg.ssh.login,
        cfg.ssh.host,
        cfg.ssh.port,
        cfg.cache_root().display()
    );
    let fs = FetchFs::new(OverlayFs::from_config(&cfg));
    let mut handle = mount_fetchfs(fs, &mountpoint, &cfg.mount)
        .await
        .with_context(|| format!("Failed to mount at {}", mountpoint.display()))?;

    let mounted = &mut handle;
    tokio::select! {
        res = mounted => {
            if let Err(e) = res {
                error!("fuse session ended with error: {e}");
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("interrupted, unmounting {}", mountpoint.display());
            handle.unmount().await.context("Failed to unmount")?;
        }
    }
    Ok(())
}
