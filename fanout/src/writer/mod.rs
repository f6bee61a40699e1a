use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use super::core::{Consumed, Ring, Sequence};
use super::errors::{FanoutError, Result};
use super::sink::Sink;

/// What a writer hands back to the coordinator when it terminates.
#[derive(Debug)]
pub struct WriterReport {
    pub id: usize,
    pub sink: Sink,
    pub chunks: u64,
    pub bytes: u64,
    /// Publications that could not be written completely.
    pub failures: u64,
    pub first_error: Option<io::Error>,
    pub broken: bool,
}

/// Drains ring publications into exactly one sink.
pub struct SinkWriter {
    id: usize,
    sink: Sink,
    next: Sequence,
    progress: Arc<AtomicU64>,
    chunks: u64,
    bytes: u64,
    failures: u64,
    first_error: Option<io::Error>,
    broken: bool,
}

impl SinkWriter {
    pub fn new(id: usize, sink: Sink) -> SinkWriter {
        SinkWriter {
            id,
            sink,
            next: Sequence::ZERO,
            progress: Arc::new(AtomicU64::new(0)),
            chunks: 0,
            bytes: 0,
            failures: 0,
            first_error: None,
            broken: false,
        }
    }

    /// Number of publications this writer has released so far. Lets the
    /// coordinator tell a slow writer from a stalled one.
    pub fn progress(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.progress)
    }

    /// Starts the writer on its own thread. `done` receives the writer id
    /// right before the thread exits.
    pub fn spawn(self, ring: Arc<Ring>, done: Sender<usize>) -> Result<JoinHandle<WriterReport>> {
        let name = format!("tee-writer-{}", self.id);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let id = self.id;
                let report = self.run(&ring);
                let _ = done.send(id);
                report
            })
            .map_err(|e| FanoutError::spawn(name, e))
    }

    pub fn run(mut self, ring: &Ring) -> WriterReport {
        debug!(sink = self.sink.name(), "writer started");
        loop {
            match ring.consume(self.next) {
                Consumed::Chunk(chunk) => {
                    self.drain(&chunk);
                    ring.release(chunk);
                    self.after_chunk();
                    self.progress.fetch_add(1, Ordering::Release);
                    self.next = self.next.next();
                }
                Consumed::Sentinel => break,
                Consumed::Poisoned => {
                    warn!(sink = self.sink.name(), seq = %self.next, "ring poisoned, writer giving up");
                    break;
                }
            }
        }

        if self.failures > 0 {
            let reason = self
                .first_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            error!(
                sink = self.sink.name(),
                failures = self.failures,
                error = %reason,
                "not all data could be written"
            );
        }
        debug!(sink = self.sink.name(), chunks = self.chunks, bytes = self.bytes, "writer finished");

        WriterReport {
            id: self.id,
            sink: self.sink,
            chunks: self.chunks,
            bytes: self.bytes,
            failures: self.failures,
            first_error: self.first_error,
            broken: self.broken,
        }
    }

    fn drain(&mut self, data: &[u8]) {
        self.chunks += 1;
        if self.broken {
            self.failures += 1;
            return;
        }
        let mut offset = 0;
        while offset < data.len() {
            match self.sink.write(&data[offset..]) {
                Ok(0) => {
                    self.fail(io::Error::new(ErrorKind::WriteZero, "sink accepted zero bytes"));
                    break;
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        self.bytes += offset as u64;
    }

    // Runs after the chunk went back to the ring, so a slow flush never
    // holds up the dispatcher or the other writers.
    fn after_chunk(&mut self) {
        if self.broken {
            return;
        }
        let flushed = if self.sink.requires_flush() {
            self.sink.sync()
        } else {
            self.sink.flush()
        };
        if let Err(e) = flushed {
            self.fail(e);
        }
    }

    fn fail(&mut self, e: io::Error) {
        self.failures += 1;
        if e.kind() == ErrorKind::BrokenPipe {
            self.broken = true;
        }
        if self.first_error.is_none() {
            self.first_error = Some(e);
        }
    }
}
