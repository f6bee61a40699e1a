use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use fanout::reader::DEFAULT_DELAY_MS;
use fanout::{signal, sink, ExitStatus, StopFlag, Tee, TeeConfig};

/// Copies standard input to standard output and to every file given, with
/// one writer thread per output.
#[derive(clap::Parser)]
#[clap(name = "tee", version)]
struct Opts {
    /// Append to the files instead of truncating them
    #[clap(short = 'a', long, action)]
    append: bool,
    /// Flush file outputs to disk after every write
    #[clap(short = 'f', long, action)]
    flush: bool,
    /// Keep going after SIGINT/SIGTERM until the input ends
    #[clap(short = 'i', long, action)]
    ignore: bool,
    /// Pause briefly after every chunk to coalesce bursts
    #[clap(short = 'd', long, action)]
    delay: bool,
    /// Combine small reads into full chunks
    #[clap(short = 'b', long, action)]
    buffer: bool,
    /// Let the terminal interpret escape sequences
    #[clap(short = 'e', long, action)]
    escape: bool,
    /// Load defaults from a TOML file
    #[clap(short = 'c', long = "config", value_parser)]
    config: Option<PathBuf>,
    /// Output files
    #[clap(value_parser, required = true)]
    files: Vec<PathBuf>,
}

fn main() {
    process::exit(run().code());
}

fn run() -> ExitStatus {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => return usage(e),
    };
    let cfg = match load_config(&opts) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("tee: failed to load configuration: {}", e);
            return ExitStatus::Failure;
        }
    };
    init_logging(&cfg.log_level);
    if opts.escape {
        // Unix terminals interpret escape sequences on their own.
        debug!("escape sequences are passed through unchanged");
    }

    let sinks = match sink::open_all(&opts.files, cfg.append, cfg.flush) {
        Ok(sinks) => sinks,
        Err(e) => {
            error!(error = %e, "cannot open output");
            return ExitStatus::Failure;
        }
    };

    let stop = StopFlag::new();
    if let Err(e) = signal::install(stop.clone(), cfg.reader.ignore_stop) {
        error!(error = %e, "cannot install signal handling");
        return ExitStatus::Failure;
    }

    let outcome = Tee::new(cfg).run(io::stdin().lock(), sinks, stop);
    info!(
        published = outcome.published,
        bytes = outcome.bytes,
        status = ?outcome.status,
        "finished"
    );
    outcome.status
}

fn usage(e: clap::Error) -> ExitStatus {
    let _ = e.print();
    match e.kind() {
        clap::ErrorKind::DisplayHelp | clap::ErrorKind::DisplayVersion => ExitStatus::Success,
        _ => ExitStatus::Usage,
    }
}

fn load_config(opts: &Opts) -> Result<TeeConfig, confy::ConfyError> {
    let cfg: TeeConfig = match &opts.config {
        Some(path) => confy::load_path(path)?,
        None => TeeConfig::default(),
    };
    Ok(apply_flags(cfg, opts))
}

/// Command-line flags can only switch features on.
fn apply_flags(mut cfg: TeeConfig, opts: &Opts) -> TeeConfig {
    cfg.append |= opts.append;
    cfg.flush |= opts.flush;
    cfg.reader.ignore_stop |= opts.ignore;
    if opts.buffer {
        cfg.reader.min_chunk = cfg.ring.slot_size;
    }
    if opts.delay && cfg.reader.delay_ms == 0 {
        cfg.reader.delay_ms = DEFAULT_DELAY_MS;
    }
    cfg
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_env("TEE_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();
}
