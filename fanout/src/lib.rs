pub mod core;
pub mod coordinator;
mod errors;
pub mod reader;
pub mod signal;
pub mod sink;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::coordinator::{ExitStatus, Outcome, Tee, TeeConfig};
pub use crate::core::{RingConfig, DEFAULT_SLOT_COUNT, DEFAULT_SLOT_SIZE};
pub use crate::errors::FanoutError;
pub use crate::signal::StopFlag;
pub use crate::sink::{Destination, Sink};
