//! Output destinations.
//!
//! A `Sink` wraps one writable destination together with the two flags the
//! writers care about: whether to force a durability flush after each
//! chunk, and whether the destination is an interactive terminal (which
//! never gets forced flushes).

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::errors::{FanoutError, Result};

/// Files beyond this many are ignored; together with stdout that makes 64
/// writer threads at most.
pub const MAX_FILE_SINKS: usize = 63;

#[cfg(unix)]
pub const NULL_DEVICE: &str = "/dev/null";
#[cfg(windows)]
pub const NULL_DEVICE: &str = "NUL";

/// A writable destination that knows how to make its data durable.
pub trait Destination: Write + Send {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Destination for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_data()
    }
}

impl Destination for io::Stdout {}

impl Destination for Vec<u8> {}

pub struct Sink {
    name: String,
    out: Box<dyn Destination>,
    flush_after_write: bool,
    interactive: bool,
}

impl Sink {
    pub fn new<D>(name: impl Into<String>, out: D, flush_after_write: bool, interactive: bool) -> Sink
    where
        D: Destination + 'static,
    {
        Sink {
            name: name.into(),
            out: Box::new(out),
            flush_after_write,
            interactive,
        }
    }

    pub fn stdout(flush_after_write: bool) -> Sink {
        let stdout = io::stdout();
        let interactive = stdout.is_terminal();
        Sink::new("<stdout>", stdout, flush_after_write, interactive)
    }

    /// Opens `path` for writing, truncating it unless `append` is set.
    pub fn open_file(path: &Path, append: bool, flush_after_write: bool) -> Result<Sink> {
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options
            .open(path)
            .map_err(|e| FanoutError::open_sink(path, e))?;
        let interactive = file.is_terminal();
        debug!(path = %path.display(), append, interactive, "opened sink");
        Ok(Sink::new(
            path.display().to_string(),
            file,
            flush_after_write,
            interactive,
        ))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interactive terminals never get forced flushes.
    #[inline]
    pub fn requires_flush(&self) -> bool {
        self.flush_after_write && !self.interactive
    }

    #[inline]
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    /// Pushes user-space buffering (e.g. the stdout line buffer) to the OS.
    #[inline]
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    #[inline]
    pub fn sync(&mut self) -> io::Result<()> {
        self.out.sync()
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("name", &self.name)
            .field("flush_after_write", &self.flush_after_write)
            .field("interactive", &self.interactive)
            .finish()
    }
}

pub fn is_null_device(path: &Path) -> bool {
    #[cfg(windows)]
    {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .map_or(false, |stem| stem.eq_ignore_ascii_case(NULL_DEVICE))
    }
    #[cfg(not(windows))]
    {
        path == Path::new(NULL_DEVICE)
    }
}

/// Builds the sink set: standard output first, then the files in order.
///
/// Null-device names are skipped, names beyond `MAX_FILE_SINKS` are ignored.
/// On failure the sinks opened so far are dropped (closed).
pub fn open_all(paths: &[PathBuf], append: bool, flush_after_write: bool) -> Result<Vec<Sink>> {
    let mut sinks = Vec::with_capacity(1 + paths.len().min(MAX_FILE_SINKS));
    sinks.push(Sink::stdout(flush_after_write));

    let mut files = 0;
    for path in paths {
        if is_null_device(path) {
            debug!(path = %path.display(), "skipping null device");
            continue;
        }
        if files == MAX_FILE_SINKS {
            warn!(
                path = %path.display(),
                limit = MAX_FILE_SINKS,
                "too many output files, ignoring"
            );
            continue;
        }
        sinks.push(Sink::open_file(path, append, flush_after_write)?);
        files += 1;
    }
    Ok(sinks)
}
