use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use range::config::StoreDaemonConfig;
use range_stored::supervisor::Supervisor;

const MAX_LOG_FILES: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "range-stored", version, about = "Range configuration graph store daemon")]
struct Args {
    /// Configuration file path
    #[clap(short = 'c', long = "config", default_value = "/etc/range/stored.yaml")]
    config: PathBuf,

    /// Detach from the terminal; only needed when not running under a
    /// process monitor
    #[clap(short = 'D', long)]
    daemonize: bool,

    /// Specify repeatedly to increase verbosity
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable debugging output not normally emitted even at max verbosity
    #[clap(short = 'd', long)]
    debug: bool,
}

fn log_level(args: &Args) -> LevelFilter {
    if args.debug {
        return LevelFilter::Trace;
    }
    match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

/// File logging with daily rotation, plus warnings on stderr while still
/// attached to a terminal.
#[allow(dyn_drop)]
fn init_logging(dir: &str, level: LevelFilter) -> Result<Vec<Box<dyn Drop + Send + Sync>>> {
    let mut guards: Vec<Box<dyn Drop + Send + Sync>> = Vec::new();

    let rolling = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("range-stored.log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)?;
    let (non_blocking, flush_guard) = tracing_appender::non_blocking(rolling);
    guards.push(Box::new(flush_guard));
    let buffered = BufWriter::with_capacity(64 * 1024, non_blocking);

    let dispatch_file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] - {} - [{}] {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(Box::new(buffered) as Box<dyn Write + Send>);

    let dispatch_stderr = fern::Dispatch::new()
        .level(LevelFilter::Warn)
        .format(|out, message, record| {
            out.finish(format_args!("{}: {}", record.level(), message))
        })
        .chain(std::io::stderr());

    if fern::Dispatch::new().chain(dispatch_file).chain(dispatch_stderr).apply().is_err() {
        eprintln!("logger has already been set");
    }
    Ok(guards)
}

/// Classic double-fork detach for running outside a process monitor.
fn daemonize() -> Result<()> {
    // SAFETY: single-threaded at this point; the supervisor threads are
    // spawned after the fork.
    unsafe {
        match libc::fork() {
            -1 => anyhow::bail!("fork failed"),
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() == -1 {
            anyhow::bail!("setsid failed");
        }
        match libc::fork() {
            -1 => anyhow::bail!("fork failed"),
            0 => {}
            _ => std::process::exit(0),
        }
        for fd in 0..3 {
            libc::close(fd);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = StoreDaemonConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let log_dir = format!(
        "{}/.range-stored",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let level = log_level(&args);
    let _guards = init_logging(&log_dir, level)?;
    log::info!("range-stored starting, node {} port {}", cfg.node_id, cfg.port);
    if args.debug {
        log::debug!("configuration: {:?}", cfg);
    }

    if !cfg.use_stored {
        log::warn!("use_stored is disabled in the configuration, exiting");
        return Ok(());
    }

    if args.daemonize {
        daemonize()?;
    }

    let supervisor = Supervisor::new(cfg);
    supervisor.run().context("range-stored failed")?;
    log::info!("clean shutdown");
    Ok(())
}
