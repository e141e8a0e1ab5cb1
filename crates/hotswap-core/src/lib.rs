//! hotswap-core: handoff protocol and cooperative state-machine runtime
//!
//! This crate provides the framework half of live process replacement:
//! - Serializable snapshot of execution state that crosses the process
//!   boundary during a swap
//! - Non-blocking console watching for the out-of-band upgrade/quit signals
//! - A state-machine runtime that defers swaps to payload-declared safe
//!   states
//! - The pipe + fork + exec handoff between generations

pub mod input;
pub mod runtime;
pub mod snapshot;

#[cfg(unix)]
pub mod handoff;

pub use input::{Signal, SignalSource};
pub use runtime::{Outcome, StateHandler, StateMachineRuntime};
pub use snapshot::{StateSnapshot, StateTag};

#[cfg(unix)]
pub use handoff::{handoff, resume_if_applicable, HandoffError, RESUME_FLAG};
#[cfg(unix)]
pub use input::TerminalSignalWatcher;
