//! Wires the ring, the dispatcher and the writers together and owns the
//! shutdown sequence.
//!
//! Shutdown runs the same way whatever ended the dispatch loop:
//!
//! 1. publish the sentinel at the dispatcher's next sequence; writers drain
//!    everything before it and stop,
//! 2. wait for the writers; a writer that releases nothing for a whole
//!    shutdown timeout is detached and reported, slow but moving writers
//!    are waited for,
//! 3. poison the ring if anything was detached, so an abandoned writer
//!    that wakes up stops instead of writing,
//! 4. join the rest in sink order, give every returned sink that asked for
//!    it a last durability flush and close it.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::core::{Ring, RingConfig, Sequence};
use super::reader::{Dispatcher, ReadEnd, ReaderConfig};
use super::signal::StopFlag;
use super::sink::Sink;
use super::writer::{SinkWriter, WriterReport};

pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeeConfig {
    pub append: bool,
    pub flush: bool,
    pub log_level: String,
    pub shutdown_timeout_ms: u64,
    pub ring: RingConfig,
    pub reader: ReaderConfig,
}

impl Default for TeeConfig {
    fn default() -> Self {
        TeeConfig {
            append: false,
            flush: false,
            log_level: "warn".to_string(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            ring: RingConfig::default(),
            reader: ReaderConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Usage,
    Failure,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Usage => 1,
            ExitStatus::Failure => -1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkSummary {
    pub name: String,
    pub bytes: u64,
    pub failures: u64,
}

#[derive(Debug)]
pub struct Outcome {
    pub status: ExitStatus,
    /// `None` when the dispatch loop failed or never ran.
    pub end: Option<ReadEnd>,
    pub published: u64,
    pub bytes: u64,
    /// Sinks whose writers terminated, in sink order.
    pub sinks: Vec<SinkSummary>,
    /// Ids of writers that had to be detached.
    pub abandoned: Vec<usize>,
}

pub struct Tee {
    cfg: TeeConfig,
}

impl Tee {
    pub fn new(cfg: TeeConfig) -> Tee {
        Tee { cfg }
    }

    pub fn run<R: Read>(&self, input: R, sinks: Vec<Sink>, stop: StopFlag) -> Outcome {
        let ring = Arc::new(Ring::new(&self.cfg.ring, sinks.len()));
        info!(
            sinks = sinks.len(),
            slots = ring.slot_count(),
            slot_size = ring.slot_size(),
            "starting"
        );

        let mut status = ExitStatus::Success;
        let (done_tx, done_rx) = mpsc::channel();
        let mut writers = Vec::with_capacity(sinks.len());
        for (id, sink) in sinks.into_iter().enumerate() {
            let writer = SinkWriter::new(id, sink);
            let progress = writer.progress();
            match writer.spawn(Arc::clone(&ring), done_tx.clone()) {
                Ok(handle) => writers.push(Running {
                    id,
                    handle,
                    progress,
                }),
                Err(e) => {
                    error!(error = %e, "failed to start writer");
                    status = ExitStatus::Failure;
                    break;
                }
            }
        }
        drop(done_tx);

        let mut end = None;
        let mut next = Sequence::ZERO;
        let mut bytes = 0;
        if status == ExitStatus::Success {
            let mut dispatcher = Dispatcher::new(&ring, input, self.cfg.reader.clone(), stop);
            match dispatcher.run() {
                Ok(how) => end = Some(how),
                Err(e) => {
                    error!(error = %e, "dispatch aborted");
                    status = ExitStatus::Failure;
                }
            }
            next = dispatcher.next_sequence();
            bytes = dispatcher.bytes();
        }

        let timeout = Duration::from_millis(self.cfg.shutdown_timeout_ms);
        let joined = shutdown(&ring, next, writers, done_rx, timeout);
        if !joined.clean {
            status = ExitStatus::Failure;
        }

        let sinks = joined.reports.into_iter().map(close_sink).collect();
        Outcome {
            status,
            end,
            published: next.value(),
            bytes,
            sinks,
            abandoned: joined.abandoned,
        }
    }
}

struct Running {
    id: usize,
    handle: JoinHandle<WriterReport>,
    progress: Arc<AtomicU64>,
}

struct Joined {
    reports: Vec<WriterReport>,
    abandoned: Vec<usize>,
    clean: bool,
}

fn shutdown(
    ring: &Ring,
    next: Sequence,
    writers: Vec<Running>,
    done: Receiver<usize>,
    timeout: Duration,
) -> Joined {
    ring.publish_sentinel(next);
    debug!(seq = %next, "sentinel published");

    // writer ids are the sink positions 0..n
    let mut finished = vec![false; writers.len()];
    let mut remaining = writers.len();
    let start = Instant::now();
    let mut seen: Vec<(u64, Instant)> = writers
        .iter()
        .map(|w| (w.progress.load(Ordering::Acquire), start))
        .collect();
    while remaining > 0 {
        match done.recv_timeout(JOIN_POLL) {
            Ok(id) => {
                finished[id] = true;
                remaining -= 1;
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let now = Instant::now();
        let mut moving = false;
        for w in writers.iter().filter(|w| !finished[w.id]) {
            let progress = w.progress.load(Ordering::Acquire);
            let last = &mut seen[w.id];
            if progress != last.0 {
                *last = (progress, now);
            }
            moving |= now - last.1 < timeout;
        }
        if !moving {
            break;
        }
    }

    let mut clean = true;
    let mut reports = Vec::with_capacity(writers.len());
    let mut abandoned = Vec::new();
    for Running { id, handle, .. } in writers {
        if !(finished[id] || handle.is_finished()) {
            // Dropping the handle detaches the thread; it dies with the process.
            error!(writer = id, "writer made no progress in time, abandoning it");
            abandoned.push(id);
            clean = false;
            continue;
        }
        match handle.join() {
            Ok(report) => reports.push(report),
            Err(_) => {
                error!(writer = id, "writer thread panicked");
                clean = false;
            }
        }
    }
    if !abandoned.is_empty() {
        warn!(writers = ?abandoned, "poisoning the ring behind abandoned writers");
        ring.poison();
    }

    Joined {
        reports,
        abandoned,
        clean,
    }
}

fn close_sink(mut report: WriterReport) -> SinkSummary {
    if report.sink.requires_flush() && !report.broken {
        if let Err(e) = report.sink.sync() {
            error!(sink = report.sink.name(), error = %e, "final flush failed");
        }
    }
    let summary = SinkSummary {
        name: report.sink.name().to_string(),
        bytes: report.bytes,
        failures: report.failures,
    };
    drop(report.sink);
    summary
}
