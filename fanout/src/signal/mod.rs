use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use super::coordinator::ExitStatus;
use super::errors::{FanoutError, Result};

/// Cooperative "stop requested" flag shared between the signal thread and
/// the dispatcher.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> StopFlag {
        StopFlag::default()
    }

    #[inline]
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reaction {
    Stop,
    Exit,
}

fn react(stop: &StopFlag, ignore: bool) -> Reaction {
    if !ignore && stop.is_requested() {
        return Reaction::Exit;
    }
    stop.request();
    Reaction::Stop
}

/// Routes termination signals into `stop`.
///
/// With `ignore` unset, a second signal while a stop is already pending
/// exits right away with the failure status, since the dispatcher may be
/// parked in a blocking read and pending output is lost.
pub fn install(stop: StopFlag, ignore: bool) -> Result<()> {
    let mut signals =
        Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM]).map_err(FanoutError::Signal)?;
    thread::Builder::new()
        .name("tee-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                match react(&stop, ignore) {
                    Reaction::Stop if ignore => {
                        info!(signal, "stop signal received, ignoring until end of input")
                    }
                    Reaction::Stop => {
                        info!(signal, "stop signal received, finishing the current chunk")
                    }
                    Reaction::Exit => {
                        error!(signal, "second stop signal received, exiting without draining");
                        process::exit(ExitStatus::Failure.code());
                    }
                }
            }
        })
        .map_err(|e| FanoutError::spawn("tee-signals", e))?;
    Ok(())
}
