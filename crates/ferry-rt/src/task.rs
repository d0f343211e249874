//! Root-task state and the await bridge.
//!
//! One `TaskContext` exists per externally invoked entry point. Every
//! coroutine running under that entry point holds a clone of it; there is no
//! ambient "current task" lookup.

use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use async_task::Runnable;
use concurrent_queue::ConcurrentQueue;
use futures::channel::oneshot;

use crate::host::{expect_payload, AwaitResult, Completion, Host, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Reported EXIT to the host; no more turns will come.
    Exited,
    /// A deferred failure was returned; the host traps.
    Failed,
}

struct RootState {
    host: Rc<dyn Host>,
    phase: Cell<Phase>,
    /// Created on the first suspension, dropped on exit.
    waitable_set: Cell<Option<u32>>,
    /// Waitable id → the signal a suspended coroutine is blocked on.
    signals: RefCell<HashMap<u32, oneshot::Sender<Completion>>>,
    /// Ready queue: tasks whose wakers have fired. async-task requires the
    /// schedule function to be `Send + Sync`, hence the `Arc`.
    ready: Arc<ConcurrentQueue<Runnable>>,
    /// Live tasks plus awaited operations still in flight.
    pending: Cell<usize>,
    /// First failure not yet reported to the host.
    failure: RefCell<Option<anyhow::Error>>,
}

/// Handle to the state of one root task.
#[derive(Clone)]
pub struct TaskContext(Rc<RootState>);

impl TaskContext {
    pub(crate) fn new(host: Rc<dyn Host>) -> Self {
        TaskContext(Rc::new(RootState {
            host,
            phase: Cell::new(Phase::Running),
            waitable_set: Cell::new(None),
            signals: RefCell::new(HashMap::new()),
            ready: Arc::new(ConcurrentQueue::unbounded()),
            pending: Cell::new(0),
            failure: RefCell::new(None),
        }))
    }

    pub fn host(&self) -> &Rc<dyn Host> {
        &self.0.host
    }

    /// Units of work that keep this root task alive.
    pub fn pending_work(&self) -> usize {
        self.0.pending.get()
    }

    pub fn waitable_set(&self) -> Option<u32> {
        self.0.waitable_set.get()
    }

    /// Turn a host operation result into a value, suspending if the host
    /// reported the operation as pending.
    pub async fn await_result(&self, result: AwaitResult) -> Payload {
        match result {
            AwaitResult::Immediate(value) => value,
            AwaitResult::Pending { waitable, promise } => {
                let signal = self.register(waitable);
                let completion = match signal.await {
                    Ok(completion) => completion,
                    Err(_) => panic!("completion signal for waitable {waitable} was dropped"),
                };
                self.0.host.promise_get_result(completion, promise)
            }
        }
    }

    /// [`await_result`](Self::await_result) for an operation whose payload
    /// type is known.
    pub async fn await_as<T: 'static>(&self, result: AwaitResult) -> T {
        expect_payload(self.await_result(result).await)
    }

    fn register(&self, waitable: u32) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        match self.0.signals.borrow_mut().entry(waitable) {
            Entry::Occupied(_) => panic!("waitable {waitable} is already being awaited"),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        self.begin_unit();

        let set = match self.0.waitable_set.get() {
            Some(set) => set,
            None => {
                let set = self.0.host.waitable_set_new();
                self.0.waitable_set.set(Some(set));
                set
            }
        };
        self.0.host.waitable_join(waitable, Some(set));
        log::trace!("waitable {waitable} joined set {set}");
        rx
    }

    /// Fire the signal registered for `waitable`. The caller has already
    /// detached the waitable from the set.
    pub(crate) fn resolve(&self, waitable: u32, completion: Completion) {
        let signal = self.0.signals.borrow_mut().remove(&waitable);
        let Some(signal) = signal else {
            panic!("event for waitable {waitable}, which nothing is awaiting");
        };
        log::trace!("waitable {waitable} resolved with {completion:?}");
        // The awaiting future may have been dropped; the operation still ended.
        let _ = signal.send(completion);
        self.end_unit();
    }

    pub(crate) fn begin_unit(&self) {
        assert!(
            self.0.phase.get() != Phase::Exited,
            "work added to a root task after it exited"
        );
        self.0.pending.set(self.0.pending.get() + 1);
    }

    pub(crate) fn end_unit(&self) {
        let pending = self.0.pending.get();
        assert!(pending > 0, "pending work count would go negative");
        self.0.pending.set(pending - 1);
    }

    pub(crate) fn defer_failure(&self, err: anyhow::Error) {
        let mut failure = self.0.failure.borrow_mut();
        if failure.is_some() {
            log::error!("dropping failure while an earlier one is unreported: {err:#}");
        } else {
            *failure = Some(err);
        }
    }

    pub(crate) fn take_waitable_set(&self) -> Option<u32> {
        self.0.waitable_set.take()
    }

    pub(crate) fn mark_exited(&self) {
        self.0.phase.set(Phase::Exited);
    }

    /// Whether this root task has reported EXIT to the host.
    pub fn has_exited(&self) -> bool {
        self.0.phase.get() == Phase::Exited
    }

    /// Cancel everything still owned by a root task whose failure is about
    /// to be reported. Tasks woken from here on are dropped by the schedule
    /// function instead of queued.
    fn abandon(&self) {
        self.0.phase.set(Phase::Failed);
        self.0.ready.close();
        let signals = std::mem::take(&mut *self.0.signals.borrow_mut());
        let queued: Vec<Runnable> = std::iter::from_fn(|| self.0.ready.pop().ok()).collect();
        log::debug!(
            "root task failed, cancelling {} queued tasks and {} awaited operations",
            queued.len(),
            signals.len()
        );
        drop(queued);
        drop(signals);
    }

    /// Put a future on this root task's ready queue for its first poll.
    pub(crate) fn schedule<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let queue = self.0.ready.clone();
        let (runnable, task) = async_task::spawn_local(future, move |runnable| {
            // Closed once the root task failed; dropping the runnable
            // cancels the task.
            if queue.push(runnable).is_err() {
                log::trace!("root task failed, dropping woken task");
            }
        });
        task.detach();
        runnable.schedule();
    }

    /// Run ready tasks until a pass runs nothing. Tasks woken during a pass
    /// run in the next one, in wake order. A failure recorded during a pass
    /// is returned once the pass ends, after every task still owned by the
    /// root has been cancelled.
    pub(crate) fn drain(&self) -> anyhow::Result<()> {
        loop {
            let batch: Vec<Runnable> = std::iter::from_fn(|| self.0.ready.pop().ok()).collect();
            if batch.is_empty() {
                return Ok(());
            }
            for runnable in batch {
                runnable.run();
            }
            let failure = self.0.failure.borrow_mut().take();
            if let Some(err) = failure {
                self.abandon();
                return Err(err);
            }
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("waitable_set", &self.0.waitable_set.get())
            .field("pending", &self.0.pending.get())
            .field("awaiting", &self.0.signals.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ReturnCode;
    use crate::host::Promise;
    use crate::mock::{Call, MockHost};

    fn context() -> (Rc<MockHost>, TaskContext) {
        let host = Rc::new(MockHost::new());
        let cx = TaskContext::new(host.clone());
        (host, cx)
    }

    #[test]
    fn immediate_result_needs_no_set() {
        let (host, cx) = context();
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        let cx2 = cx.clone();
        cx.schedule(async move {
            let value: u32 = cx2.await_as(AwaitResult::Immediate(Box::new(7u32))).await;
            seen2.set(value);
        });
        cx.drain().unwrap();
        assert_eq!(seen.get(), 7);
        assert_eq!(cx.waitable_set(), None);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn pending_result_joins_lazily_created_set() {
        let (host, cx) = context();
        let op = host.import_pending(5u8);
        let AwaitResult::Pending { waitable, .. } = &op else {
            panic!("expected a pending import");
        };
        let waitable = *waitable;
        let cx2 = cx.clone();
        cx.schedule(async move {
            let _: u8 = cx2.await_as(op).await;
        });
        cx.drain().unwrap();

        let set = cx.waitable_set().expect("set created on suspension");
        assert_eq!(cx.pending_work(), 1);
        assert_eq!(
            host.calls(),
            vec![
                Call::WaitableSetNew(set),
                Call::WaitableJoin {
                    waitable,
                    set: Some(set)
                },
            ]
        );
    }

    #[test]
    fn resolve_wakes_the_awaiting_task() {
        let (host, cx) = context();
        let (reader, writer) = host.future_new(0);
        let op = host.future_write(0, writer, Box::new(3i64));
        let cx2 = cx.clone();
        let code = Rc::new(Cell::new(None));
        let code2 = code.clone();
        cx.schedule(async move {
            code2.set(Some(cx2.await_as::<ReturnCode>(op).await));
        });
        cx.drain().unwrap();
        assert_eq!(code.get(), None);

        let value: i64 = match host.future_read(0, reader) {
            AwaitResult::Immediate(value) => *value.downcast::<i64>().unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(value, 3);
        cx.resolve(writer, Completion::Copy(ReturnCode::Completed(0)));
        assert_eq!(cx.pending_work(), 0);
        cx.drain().unwrap();
        assert_eq!(code.get(), Some(ReturnCode::Completed(0)));
    }

    #[test]
    #[should_panic(expected = "already being awaited")]
    fn double_registration_fails_fast() {
        let (_host, cx) = context();
        let _first = cx.register(4);
        let _second = cx.register(4);
    }

    #[test]
    #[should_panic(expected = "which nothing is awaiting")]
    fn resolving_unknown_waitable_fails_fast() {
        let (_host, cx) = context();
        cx.resolve(9, Completion::Copy(ReturnCode::Completed(0)));
    }

    #[test]
    #[should_panic(expected = "go negative")]
    fn negative_pending_count_fails_fast() {
        let (_host, cx) = context();
        cx.end_unit();
    }

    #[test]
    fn drain_runs_work_woken_during_a_pass() {
        let (_host, cx) = context();
        let order = Rc::new(RefCell::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let cx2 = cx.clone();
        cx.schedule(async move {
            o1.borrow_mut().push("outer");
            cx2.schedule(async move {
                o2.borrow_mut().push("inner");
            });
        });
        cx.drain().unwrap();
        assert_eq!(*order.borrow(), ["outer", "inner"]);
    }

    #[test]
    fn first_deferred_failure_wins() {
        let (_host, cx) = context();
        cx.defer_failure(anyhow::anyhow!("first"));
        cx.defer_failure(anyhow::anyhow!("second"));
        cx.schedule(async {});
        let err = cx.drain().unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[test]
    fn promise_is_opaque_round_trip() {
        let promise = Promise::new(41);
        assert_eq!(promise.raw(), 41);
    }
}
