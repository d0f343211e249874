//! ferry-rt: Cooperative async runtime for callback-driven component exports.
//!
//! The host never calls into a long-running event loop. It calls
//! [`first_poll`] when an async export is invoked and [`callback`] whenever an
//! event arrives for one of the export's waitables. Each call drains the root
//! task's ready queue on the calling thread and then tells the host to either
//! exit or wait on the task's waitable set.
//!
//! Everything the runtime needs from the host goes through the [`Host`] trait.
//! Enable the `mock` feature for an in-memory implementation.

mod abi;
mod executor;
mod host;
mod spawn;
mod task;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use abi::{AbiError, CallbackCode, Event, ReturnCode, SubtaskStatus, BLOCKED};
pub use executor::{callback, callback_raw, first_poll};
pub use host::{expect_payload, AwaitResult, Completion, Host, Payload, Promise};
pub use spawn::Outcome;
pub use task::TaskContext;
