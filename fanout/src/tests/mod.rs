mod ring_stress_tests;

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::sink::Destination;

pub(crate) fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// In-memory sink whose contents stay inspectable after the writer is gone.
#[derive(Clone, Default)]
pub(crate) struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Destination for Capture {}

/// Sink whose writes block until the gate is opened.
#[derive(Clone, Default)]
pub(crate) struct Gate {
    open: Arc<(Mutex<bool>, Condvar)>,
    inner: Capture,
}

impl Gate {
    pub(crate) fn open(&self) {
        let (open, cond) = &*self.open;
        *open.lock() = true;
        cond.notify_all();
    }
}

impl Write for Gate {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (open, cond) = &*self.open;
        let mut open = open.lock();
        while !*open {
            cond.wait(&mut open);
        }
        drop(open);
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Destination for Gate {}

/// Sink that takes `delay` for every write call.
#[derive(Clone)]
pub(crate) struct Slow {
    delay: Duration,
    inner: Capture,
}

impl Slow {
    pub(crate) fn new(delay: Duration) -> Self {
        Slow {
            delay,
            inner: Capture::default(),
        }
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.inner.bytes()
    }
}

impl Write for Slow {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        thread::sleep(self.delay);
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Destination for Slow {}

/// Sink that rejects every write.
pub(crate) struct Broken;

impl Write for Broken {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Destination for Broken {}

/// Input that returns at most `max` bytes per read call.
pub(crate) struct Chunked<R> {
    inner: R,
    max: usize,
}

impl<R> Chunked<R> {
    pub(crate) fn new(inner: R, max: usize) -> Self {
        Chunked { inner, max }
    }
}

impl<R: Read> Read for Chunked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.max);
        self.inner.read(&mut buf[..n])
    }
}
