//! The scheduler trampoline behind an async export.
//!
//! The host calls [`first_poll`] once per export invocation and then
//! [`callback`] once per event until the root task reports
//! [`CallbackCode::Exit`]. Between calls the root task is parked in the host's
//! context slot.

use std::future::Future;
use std::rc::Rc;

use crate::abi::{CallbackCode, Event, SubtaskStatus};
use crate::host::{Completion, Host};
use crate::task::TaskContext;

/// Start a root task for export `export_index`.
///
/// `entry` builds the top-level coroutine from the new task's context. When
/// that coroutine finishes, its output is handed to [`Host::task_return`].
/// An `Err` from this function is a failure the host must treat as a trap;
/// application errors travel inside the coroutine's output instead.
pub fn first_poll<F, Fut>(
    host: Rc<dyn Host>,
    export_index: u32,
    borrows: u32,
    entry: F,
) -> anyhow::Result<CallbackCode>
where
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future + 'static,
    Fut::Output: 'static,
{
    let cx = TaskContext::new(host);
    log::debug!("export {export_index}: starting root task");

    // The top-level coroutine is the first unit of pending work.
    cx.begin_unit();
    let future = entry(cx.clone());
    let task = cx.clone();
    cx.schedule(async move {
        let result = future.await;
        if let Err(err) = task.host().task_return(export_index, borrows, Box::new(result)) {
            task.defer_failure(err);
        }
        task.end_unit();
    });

    poll(cx)
}

/// Deliver one event to the parked root task and run it as far as it goes.
pub fn callback(host: &dyn Host, event: Event) -> anyhow::Result<CallbackCode> {
    let Some(cx) = host.context_get() else {
        panic!("callback with no root task parked in the context slot");
    };
    host.context_set(None);
    log::trace!("callback: {event:?}");

    match event {
        Event::None => {}
        Event::Subtask { subtask, status } => match status {
            SubtaskStatus::Starting => {
                panic!("subtask {subtask} reported as starting after it was awaited")
            }
            SubtaskStatus::Started => {}
            SubtaskStatus::Returned => {
                host.waitable_join(subtask, None);
                host.subtask_drop(subtask);
                cx.resolve(subtask, Completion::Subtask(status));
            }
            SubtaskStatus::StartCancelled | SubtaskStatus::ReturnCancelled => {
                unimplemented!("subtask {subtask} cancellation ({status:?})")
            }
        },
        Event::StreamRead { end, code }
        | Event::StreamWrite { end, code }
        | Event::FutureRead { end, code }
        | Event::FutureWrite { end, code } => {
            host.waitable_join(end, None);
            cx.resolve(end, Completion::Copy(code));
        }
        Event::Cancelled => unimplemented!("task cancellation"),
    }

    poll(cx)
}

/// [`callback`] over the raw `(event, waitable, payload)` triple, returning
/// the packed callback code. Malformed events are fatal.
pub fn callback_raw(host: &dyn Host, event0: u32, event1: u32, event2: u32) -> anyhow::Result<u32> {
    let event = match Event::decode(event0, event1, event2) {
        Ok(event) => event,
        Err(err) => panic!("malformed event from host: {err}"),
    };
    Ok(callback(host, event)?.encode())
}

/// Drain ready work, then either exit or park the task and wait.
fn poll(cx: TaskContext) -> anyhow::Result<CallbackCode> {
    cx.drain()?;

    if cx.pending_work() == 0 {
        if let Some(set) = cx.take_waitable_set() {
            cx.host().waitable_set_drop(set);
        }
        cx.mark_exited();
        log::debug!("root task quiescent, exiting");
        return Ok(CallbackCode::Exit);
    }

    let Some(set) = cx.waitable_set() else {
        panic!(
            "{} units of work pending but no waitable to wait on",
            cx.pending_work()
        );
    };
    log::debug!("root task waiting on set {set} ({} pending)", cx.pending_work());
    let host = cx.host().clone();
    host.context_set(Some(cx));
    Ok(CallbackCode::Wait(set))
}
