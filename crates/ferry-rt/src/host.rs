//! The primitives this runtime consumes from the host.
//!
//! A `Host` is the whole boundary: waitable sets, the single-slot context
//! cell, task return, subtask bookkeeping, and the future/stream intrinsics.
//! Binding glue implements it over the real imports; tests use
//! [`crate::mock::MockHost`].

use std::any::Any;
use std::fmt;

use crate::abi::{ReturnCode, SubtaskStatus};
use crate::task::TaskContext;

/// A lifted value crossing the boundary. Its concrete type is fixed by the
/// operation that produced it (see [`Host`]).
pub type Payload = Box<dyn Any>;

/// Opaque token the host hands out with a pending operation and takes back in
/// [`Host::promise_get_result`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Promise(u32);

impl Promise {
    pub fn new(raw: u32) -> Self {
        Promise(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Result of starting a host operation.
pub enum AwaitResult {
    /// Finished synchronously.
    Immediate(Payload),
    /// Will finish later; an event for `waitable` signals it.
    Pending { waitable: u32, promise: Promise },
}

impl fmt::Debug for AwaitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwaitResult::Immediate(_) => f.write_str("Immediate(..)"),
            AwaitResult::Pending { waitable, promise } => f
                .debug_struct("Pending")
                .field("waitable", waitable)
                .field("promise", promise)
                .finish(),
        }
    }
}

/// Status carried by the event that finishes a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Subtask(SubtaskStatus),
    Copy(ReturnCode),
}

/// Host runtime primitives.
///
/// Payload types by operation:
/// - `future_read` → `T`
/// - `future_write` → [`ReturnCode`]
/// - `stream_read` → `(ReturnCode, Vec<T>)`
/// - `stream_write` → [`ReturnCode`], whose count is the number accepted
/// - subtasks → whatever the import returns
///
/// Handles and waitable ids are never zero.
pub trait Host {
    fn waitable_set_new(&self) -> u32;
    fn waitable_set_drop(&self, set: u32);
    /// Join `waitable` to `set`, or detach it from whatever set it is in.
    fn waitable_join(&self, waitable: u32, set: Option<u32>);

    /// Park the root task between polls. Holds at most one value.
    fn context_set(&self, task: Option<TaskContext>);
    fn context_get(&self) -> Option<TaskContext>;

    /// Deliver the top-level result of export `export_index`.
    fn task_return(&self, export_index: u32, borrows: u32, result: Payload)
        -> anyhow::Result<()>;

    fn subtask_drop(&self, subtask: u32);

    /// Create a future; returns `(readable, writable)` handles.
    fn future_new(&self, ty: u32) -> (u32, u32);
    fn future_read(&self, ty: u32, handle: u32) -> AwaitResult;
    fn future_write(&self, ty: u32, handle: u32, value: Payload) -> AwaitResult;
    fn future_drop_readable(&self, ty: u32, handle: u32);
    fn future_drop_writable(&self, ty: u32, handle: u32);

    /// Create a stream; returns `(readable, writable)` handles.
    fn stream_new(&self, ty: u32) -> (u32, u32);
    fn stream_read(&self, ty: u32, handle: u32, max_count: usize) -> AwaitResult;
    fn stream_write(&self, ty: u32, handle: u32, values: Payload) -> AwaitResult;
    fn stream_drop_readable(&self, ty: u32, handle: u32);
    fn stream_drop_writable(&self, ty: u32, handle: u32);

    /// Exchange a fired completion and its promise for the operation's result.
    fn promise_get_result(&self, completion: Completion, promise: Promise) -> Payload;
}

/// Downcast a payload whose type the protocol fixes. A mismatch means the
/// host and the bindings disagree about the operation, which is fatal.
pub fn expect_payload<T: 'static>(payload: Payload) -> T {
    match payload.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => panic!(
            "host payload is not a `{}`",
            std::any::type_name::<T>()
        ),
    }
}
