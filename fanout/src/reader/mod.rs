use std::io::{self, ErrorKind, Read};
use std::thread;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::core::{Ring, RingError, Sequence, SlotFill};
use super::errors::{FanoutError, Result};
use super::signal::StopFlag;

/// Delay used by `--delay` when the configuration does not set one.
pub const DEFAULT_DELAY_MS: u64 = 1;

// How often a dispatcher blocked on a full ring looks at the stop flag.
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Keep reading into a slot until at least this many bytes are there.
    /// `0` publishes whatever a single read returns.
    pub min_chunk: usize,
    /// Pause after every publication, in milliseconds.
    pub delay_ms: u64,
    pub ignore_stop: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadEnd {
    EndOfStream,
    Stopped,
}

#[derive(Debug)]
enum FillEnd {
    Eof,
    Failed(io::Error),
}

#[derive(Debug)]
struct Filled {
    length: usize,
    end: Option<FillEnd>,
}

/// Reads the input into successive ring slots and publishes them.
pub struct Dispatcher<'a, R> {
    ring: &'a Ring,
    input: R,
    cfg: ReaderConfig,
    stop: StopFlag,
    next: Sequence,
    bytes: u64,
}

impl<'a, R: Read> Dispatcher<'a, R> {
    pub fn new(ring: &'a Ring, input: R, cfg: ReaderConfig, stop: StopFlag) -> Self {
        Dispatcher {
            ring,
            input,
            cfg,
            stop,
            next: Sequence::ZERO,
            bytes: 0,
        }
    }

    /// The sequence the next publication (or the sentinel) goes to.
    #[inline]
    pub fn next_sequence(&self) -> Sequence {
        self.next
    }

    #[inline]
    pub fn published(&self) -> u64 {
        self.next.value()
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn run(&mut self) -> Result<ReadEnd> {
        let ring = self.ring;
        let delay = Duration::from_millis(self.cfg.delay_ms);
        loop {
            let mut fill = match self.acquire()? {
                Some(fill) => fill,
                None => {
                    debug!(published = self.published(), "stop requested while the ring was full");
                    return Ok(ReadEnd::Stopped);
                }
            };
            let filled = self.fill(&mut fill);

            if filled.length > 0 {
                ring.publish(fill, filled.length);
                trace!(seq = %self.next, length = filled.length, "published");
                self.bytes += filled.length as u64;
                self.next = self.next.next();
            } else {
                drop(fill);
            }

            match filled.end {
                Some(FillEnd::Eof) => {
                    debug!(published = self.published(), bytes = self.bytes, "end of input");
                    return Ok(ReadEnd::EndOfStream);
                }
                Some(FillEnd::Failed(e)) => return Err(FanoutError::Read(e)),
                None => {}
            }

            if self.stop_requested() {
                debug!(published = self.published(), "stop requested");
                return Ok(ReadEnd::Stopped);
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    #[inline]
    fn stop_requested(&self) -> bool {
        self.stop.is_requested() && !self.cfg.ignore_stop
    }

    /// Waits for the next slot to drain. `None` when a stop is requested
    /// while waiting.
    fn acquire(&self) -> Result<Option<SlotFill<'a>>> {
        loop {
            match self.ring.acquire_until(self.next, Some(Instant::now() + STOP_POLL)) {
                Ok(fill) => return Ok(Some(fill)),
                Err(RingError::Timeout) if self.stop_requested() => return Ok(None),
                Err(RingError::Timeout) => {}
                Err(RingError::Poisoned) => return Err(FanoutError::Poisoned),
            }
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Filled {
        let want = self.cfg.min_chunk.clamp(1, buf.len());
        let mut length = 0;
        while length < want {
            match self.input.read(&mut buf[length..]) {
                Ok(0) => {
                    return Filled {
                        length,
                        end: Some(FillEnd::Eof),
                    }
                }
                Ok(n) => length += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if length > 0 {
                        break;
                    }
                    thread::yield_now();
                }
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    return Filled {
                        length,
                        end: Some(FillEnd::Eof),
                    }
                }
                Err(e) => {
                    return Filled {
                        length,
                        end: Some(FillEnd::Failed(e)),
                    }
                }
            }
        }
        Filled { length, end: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use crate::core::{Consumed, RingConfig};

    /// Hands out scripted results one read call at a time.
    struct Scripted {
        steps: VecDeque<io::Result<Vec<u8>>>,
        calls: usize,
    }

    impl Scripted {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Scripted {
                steps: steps.into(),
                calls: 0,
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.steps.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(mut bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.steps.push_front(Ok(bytes.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    fn drain(ring: &Ring, upto: Sequence) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut seq = Sequence::ZERO;
        while seq < upto {
            match ring.consume(seq) {
                Consumed::Chunk(chunk) => out.push(chunk.to_vec()),
                _ => break,
            }
            seq = seq.next();
        }
        out
    }

    fn ring(writers: usize) -> Ring {
        Ring::new(
            &RingConfig {
                slot_count: 8,
                slot_size: 8,
            },
            writers,
        )
    }

    #[test]
    fn single_reads_become_publications() {
        let ring = ring(1);
        let input = Scripted::new(vec![Ok(b"ab".to_vec()), Ok(b"cde".to_vec())]);
        let mut dispatcher = Dispatcher::new(&ring, input, ReaderConfig::default(), StopFlag::new());

        assert_eq!(dispatcher.run().unwrap(), ReadEnd::EndOfStream);
        assert_eq!(dispatcher.published(), 2);
        assert_eq!(dispatcher.bytes(), 5);
        assert_eq!(
            drain(&ring, dispatcher.next_sequence()),
            vec![b"ab".to_vec(), b"cde".to_vec()]
        );
    }

    #[test]
    fn min_chunk_combines_small_reads() {
        let ring = ring(1);
        let input = Scripted::new(vec![
            Ok(b"a".to_vec()),
            Ok(b"b".to_vec()),
            Ok(b"c".to_vec()),
            Ok(b"defghijk".to_vec()),
        ]);
        let cfg = ReaderConfig {
            min_chunk: 8,
            ..ReaderConfig::default()
        };
        let mut dispatcher = Dispatcher::new(&ring, input, cfg, StopFlag::new());

        dispatcher.run().unwrap();
        assert_eq!(
            drain(&ring, dispatcher.next_sequence()),
            vec![b"abcdefgh".to_vec(), b"ijk".to_vec()]
        );
    }

    #[test]
    fn would_block_flushes_partial_chunk() {
        let ring = ring(1);
        let input = Scripted::new(vec![
            Ok(b"ab".to_vec()),
            Err(ErrorKind::WouldBlock.into()),
            Err(ErrorKind::Interrupted.into()),
            Ok(b"cd".to_vec()),
        ]);
        let cfg = ReaderConfig {
            min_chunk: 8,
            ..ReaderConfig::default()
        };
        let mut dispatcher = Dispatcher::new(&ring, input, cfg, StopFlag::new());

        dispatcher.run().unwrap();
        assert_eq!(
            drain(&ring, dispatcher.next_sequence()),
            vec![b"ab".to_vec(), b"cd".to_vec()]
        );
    }

    #[test]
    fn broken_pipe_is_end_of_stream() {
        let ring = ring(1);
        let input = Scripted::new(vec![Ok(b"xy".to_vec()), Err(ErrorKind::BrokenPipe.into())]);
        let mut dispatcher = Dispatcher::new(&ring, input, ReaderConfig::default(), StopFlag::new());

        assert_eq!(dispatcher.run().unwrap(), ReadEnd::EndOfStream);
        assert_eq!(dispatcher.published(), 1);
    }

    #[test]
    fn read_error_publishes_what_was_read() {
        let ring = ring(1);
        let input = Scripted::new(vec![
            Ok(b"abc".to_vec()),
            Err(io::Error::new(ErrorKind::Other, "device gone")),
        ]);
        let cfg = ReaderConfig {
            min_chunk: 8,
            ..ReaderConfig::default()
        };
        let mut dispatcher = Dispatcher::new(&ring, input, cfg, StopFlag::new());

        match dispatcher.run() {
            Err(FanoutError::Read(e)) => assert_eq!(e.to_string(), "device gone"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(drain(&ring, dispatcher.next_sequence()), vec![b"abc".to_vec()]);
    }

    #[test]
    fn stop_finishes_current_publication_only() {
        let ring = ring(1);
        let stop = StopFlag::new();
        stop.request();
        let input = Scripted::new(vec![Ok(b"one".to_vec()), Ok(b"two".to_vec())]);
        let mut dispatcher = Dispatcher::new(&ring, input, ReaderConfig::default(), stop);

        assert_eq!(dispatcher.run().unwrap(), ReadEnd::Stopped);
        assert_eq!(dispatcher.published(), 1);
        assert_eq!(dispatcher.input.calls, 1);
    }

    #[test]
    fn ignore_stop_reads_to_the_end() {
        let ring = ring(1);
        let stop = StopFlag::new();
        stop.request();
        let input = Scripted::new(vec![Ok(b"one".to_vec()), Ok(b"two".to_vec())]);
        let cfg = ReaderConfig {
            ignore_stop: true,
            ..ReaderConfig::default()
        };
        let mut dispatcher = Dispatcher::new(&ring, input, cfg, stop);

        assert_eq!(dispatcher.run().unwrap(), ReadEnd::EndOfStream);
        assert_eq!(dispatcher.published(), 2);
    }

    #[test]
    fn stop_releases_a_dispatcher_waiting_on_a_full_ring() {
        let ring = Ring::new(
            &RingConfig {
                slot_count: 1,
                slot_size: 8,
            },
            1,
        );
        let stop = StopFlag::new();
        let input = Scripted::new(vec![Ok(b"one".to_vec()), Ok(b"two".to_vec())]);
        let mut dispatcher = Dispatcher::new(&ring, input, ReaderConfig::default(), stop.clone());

        // nobody consumes, so the second acquire can only end through the stop
        let requester = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.request();
        });
        assert_eq!(dispatcher.run().unwrap(), ReadEnd::Stopped);
        requester.join().unwrap();

        assert_eq!(dispatcher.published(), 1);
        assert_eq!(dispatcher.input.calls, 1);
    }
}
