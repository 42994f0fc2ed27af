//! The replayd launcher.
//!
//! Parses the command line, picks a run mode (replay server or offline
//! archive replay), wires the process-wide pieces together, and runs it.

use anyhow::Context as _;
use clap::Parser;
use replayd_core::arena::MemoryArena;
use replayd_core::auth::AuthToken;
use replayd_core::crash::CrashHandler;
use replayd_server::archive::{ArchiveOptions, replay_archive};
use replayd_server::cache_manager::{DiskCacheOptions, create_cache};
use replayd_server::server::{Server, ServerConfig};
use replayd_server::vm::PayloadContextFactory;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "replayd", version, about = "Replay daemon")]
struct Options {
    /// Replay the archive in this directory instead of serving.
    #[arg(long, value_name = "DIR")]
    replay_archive: Option<PathBuf>,

    /// Directory receiving archive-replay outputs.
    #[arg(long, value_name = "DIR")]
    postback_dir: Option<PathBuf>,

    /// File holding the pre-shared client auth token.
    #[arg(long, value_name = "FILE")]
    auth_token_file: Option<PathBuf>,

    /// Cache resources on disk instead of in memory.
    #[arg(long)]
    enable_disk_cache: bool,

    /// Directory for the on-disk cache; a temp directory when omitted.
    #[arg(long, value_name = "DIR")]
    disk_cache_path: Option<PathBuf>,

    /// Delete the on-disk cache files when the server exits.
    #[arg(long)]
    cleanup_on_disk_cache: bool,

    /// Port to listen on; 0 or omitted lets the OS pick one.
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Close the connection after this many seconds without a request.
    #[arg(long, value_name = "SECONDS")]
    idle_timeout_sec: Option<u64>,

    /// Log level: F, E, W, I, D or V.
    #[arg(long, default_value = "I", value_parser = parse_log_level)]
    log_level: LevelFilter,

    /// Write the log to this file instead of stderr.
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Block at startup until a debugger attaches.
    #[arg(long)]
    wait_for_debugger: bool,

    // Internal watchdog re-execution flags; spawned, never typed.
    #[arg(long, hide = true, value_name = "PID")]
    watchdog_parent: Option<u32>,
    #[arg(long, hide = true, value_name = "DIR")]
    watchdog_path: Option<PathBuf>,
    #[arg(long, hide = true)]
    watchdog_remove_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayMode {
    Unknown,
    Conflict,
    Server,
    Archive,
}

fn merge(mode: ReplayMode, wanted: ReplayMode) -> ReplayMode {
    match mode {
        ReplayMode::Unknown => wanted,
        m if m == wanted => m,
        _ => ReplayMode::Conflict,
    }
}

fn resolve_mode(opts: &Options) -> ReplayMode {
    let mut mode = ReplayMode::Unknown;
    if opts.replay_archive.is_some() {
        mode = merge(mode, ReplayMode::Archive);
    }
    if opts.postback_dir.is_some() {
        mode = merge(mode, ReplayMode::Archive);
    }
    let server_flags = [
        opts.auth_token_file.is_some(),
        opts.idle_timeout_sec.is_some(),
        opts.enable_disk_cache,
        opts.disk_cache_path.is_some(),
        opts.cleanup_on_disk_cache,
        opts.port.is_some(),
    ];
    if server_flags.into_iter().any(|set| set) {
        mode = merge(mode, ReplayMode::Server);
    }
    mode
}

fn parse_log_level(value: &str) -> Result<LevelFilter, String> {
    match value.to_ascii_uppercase().as_str() {
        "F" | "FATAL" | "E" | "ERROR" => Ok(LevelFilter::ERROR),
        "W" | "WARNING" => Ok(LevelFilter::WARN),
        "I" | "INFO" => Ok(LevelFilter::INFO),
        "D" | "DEBUG" => Ok(LevelFilter::DEBUG),
        "V" | "VERBOSE" => Ok(LevelFilter::TRACE),
        other => Err(format!(
            "unknown log level '{other}', expected F, E, W, I, D or V"
        )),
    }
}

fn init_logging(level: LevelFilter, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn wait_for_debugger() {
    info!("waiting for a debugger to attach");
    loop {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return;
        };
        let traced = status
            .lines()
            .find_map(|line| line.strip_prefix("TracerPid:"))
            .map(|pid| pid.trim() != "0")
            .unwrap_or(false);
        if traced {
            info!("debugger attached");
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

#[cfg(not(target_os = "linux"))]
fn wait_for_debugger() {
    tracing::warn!("--wait-for-debugger is not supported on this platform");
}

fn run_server(opts: &Options) -> anyhow::Result<()> {
    let auth_token = match &opts.auth_token_file {
        Some(path) => Some(AuthToken::load(path)?),
        None => None,
    };

    let arena = Arc::new(MemoryArena::reserve_default()?);
    info!(arena = ?arena, "replay arena reserved");

    let crash = CrashHandler::new();
    crash.install();

    let mut cache_opts = DiskCacheOptions::new();
    cache_opts.enabled = opts.enable_disk_cache;
    cache_opts.clean_up = opts.cleanup_on_disk_cache;
    cache_opts.path = opts.disk_cache_path.clone();
    let created = create_cache(&cache_opts, &arena);

    let factory = Arc::new(PayloadContextFactory::new(Arc::clone(&arena)));
    let server = Server::bind(
        ServerConfig {
            port: opts.port.unwrap_or(0),
            idle_timeout: opts.idle_timeout_sec.map(Duration::from_secs),
            auth_token,
        },
        factory,
        Some(created.cache),
        crash,
    )?;
    server.announce();
    server.run()?;
    Ok(())
}

fn run_archive(opts: &Options, archive_dir: &Path) -> anyhow::Result<()> {
    let arena = Arc::new(MemoryArena::reserve_default()?);
    let factory = PayloadContextFactory::new(arena);
    replay_archive(
        &ArchiveOptions {
            archive_dir: archive_dir.to_path_buf(),
            postback_dir: opts.postback_dir.clone(),
        },
        &factory,
    )?;
    Ok(())
}

fn main() -> ExitCode {
    let opts = Options::parse();

    // Watchdog children skip everything else, logging included: their
    // stdio is already detached and they must not touch the arena.
    #[cfg(unix)]
    if let (Some(parent), Some(path)) = (opts.watchdog_parent, &opts.watchdog_path) {
        replayd_server::watchdog::run(parent, path, opts.watchdog_remove_dir);
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_logging(opts.log_level, opts.log.as_ref()) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    if opts.wait_for_debugger {
        wait_for_debugger();
    }

    let outcome = match resolve_mode(&opts) {
        ReplayMode::Conflict => {
            error!("conflicting options: archive replay and server flags are mutually exclusive");
            return ExitCode::FAILURE;
        }
        ReplayMode::Archive => {
            // resolve_mode only reports Archive when one of these is set;
            // a bare --postback-dir still needs the archive itself.
            match &opts.replay_archive {
                Some(dir) => run_archive(&opts, dir),
                None => {
                    error!("--postback-dir requires --replay-archive");
                    return ExitCode::FAILURE;
                }
            }
        }
        ReplayMode::Server | ReplayMode::Unknown => run_server(&opts),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "replayd failed");
            ExitCode::FAILURE
        }
    }
}
