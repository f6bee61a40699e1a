use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("failed to open '{}' for writing: {source}", .path.display())]
    OpenSink { path: PathBuf, source: io::Error },

    #[error("failed to read from the input stream: {0}")]
    Read(#[source] io::Error),

    #[error("failed to spawn thread '{name}': {source}")]
    Spawn { name: String, source: io::Error },

    // signal_hook reports registration failures as io::Error
    #[error("signal handling error: {0}")]
    Signal(#[source] io::Error),

    #[error("ring was poisoned during shutdown")]
    Poisoned,
}

impl FanoutError {
    pub fn open_sink(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FanoutError::OpenSink {
            path: path.into(),
            source,
        }
    }

    pub fn spawn(name: impl Into<String>, source: io::Error) -> Self {
        FanoutError::Spawn {
            name: name.into(),
            source,
        }
    }
}
