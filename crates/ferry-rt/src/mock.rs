//! In-memory host for tests.
//!
//! Futures and streams are rendezvous channels: whichever end arrives second
//! completes immediately and the end that blocked gets an event. The host can
//! also own one end of a stream itself (a feed or a sink), and can run
//! imports that finish now or on request. Every boundary call is recorded.
//!
//! Misuse of the boundary (unknown handles, double drops, a second root task
//! parked in the context slot) panics.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::rc::Rc;

use slab::Slab;

use crate::abi::{CallbackCode, Event, ReturnCode, SubtaskStatus};
use crate::executor::callback;
use crate::host::{expect_payload, AwaitResult, Completion, Host, Payload, Promise};
use crate::task::TaskContext;

/// A recorded boundary call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    WaitableSetNew(u32),
    WaitableSetDrop(u32),
    WaitableJoin { waitable: u32, set: Option<u32> },
    ContextSet(bool),
    TaskReturn { export_index: u32, borrows: u32 },
    SubtaskDrop(u32),
    FutureNew { reader: u32, writer: u32 },
    FutureRead(u32),
    FutureWrite(u32),
    FutureDropReadable(u32),
    FutureDropWritable(u32),
    StreamNew { reader: u32, writer: u32 },
    StreamRead(u32),
    StreamWrite(u32),
    StreamDropReadable(u32),
    StreamDropWritable(u32),
    PromiseGetResult(u32),
}

/// When a host-fed stream reports that its writer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hangup {
    /// On the read after the last chunk, with no data.
    AfterLast,
    /// Together with the last chunk.
    WithLast,
}

// ── Element plumbing ────────────────────────────────────────────────

/// Operations on a type-erased `Vec<T>` payload.
trait Elements {
    fn len(&self, values: &Payload) -> usize;
    fn split(&self, values: Payload, at: usize) -> (Payload, Payload);
    fn empty(&self) -> Payload;
    fn append(&self, into: &mut Payload, values: Payload);
    fn read_result(&self, code: ReturnCode, values: Payload) -> Payload;
}

struct Typed<T>(PhantomData<fn() -> T>);

impl<T: 'static> Typed<T> {
    fn erased() -> Rc<dyn Elements> {
        Rc::new(Typed::<T>(PhantomData))
    }
}

impl<T: 'static> Elements for Typed<T> {
    fn len(&self, values: &Payload) -> usize {
        values
            .downcast_ref::<Vec<T>>()
            .map(Vec::len)
            .expect("mock: stream payload of the wrong element type")
    }

    fn split(&self, values: Payload, at: usize) -> (Payload, Payload) {
        let mut head: Vec<T> = expect_payload(values);
        let tail = head.split_off(at);
        (Box::new(head), Box::new(tail))
    }

    fn empty(&self) -> Payload {
        Box::new(Vec::<T>::new())
    }

    fn append(&self, into: &mut Payload, values: Payload) {
        into.downcast_mut::<Vec<T>>()
            .expect("mock: stream payload of the wrong element type")
            .extend(expect_payload::<Vec<T>>(values));
    }

    fn read_result(&self, code: ReturnCode, values: Payload) -> Payload {
        Box::new((code, expect_payload::<Vec<T>>(values)))
    }
}

// ── State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Future,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Reader,
    Writer,
}

enum Handle {
    End { channel: usize, side: Side },
    Subtask { promise: usize, result: Option<Payload> },
}

struct BlockedRead {
    promise: usize,
    max: usize,
}

struct BlockedWrite {
    promise: usize,
    values: Payload,
}

struct Feed {
    chunks: VecDeque<Payload>,
    hangup: Hangup,
}

struct Sink {
    per_write: usize,
    drop_after: Option<usize>,
    received: Payload,
    accepted: usize,
}

struct Channel {
    kind: Kind,
    /// Guest handles; 0 when the host owns that end.
    reader: u32,
    writer: u32,
    reader_open: bool,
    writer_open: bool,
    blocked_read: Option<BlockedRead>,
    blocked_write: Option<BlockedWrite>,
    elements: Option<Rc<dyn Elements>>,
    feed: Option<Feed>,
    sink: Option<Sink>,
}

impl Channel {
    fn new(kind: Kind, elements: Option<Rc<dyn Elements>>) -> Self {
        Channel {
            kind,
            reader: 0,
            writer: 0,
            reader_open: true,
            writer_open: true,
            blocked_read: None,
            blocked_write: None,
            elements,
            feed: None,
            sink: None,
        }
    }

    fn elements(&self) -> Rc<dyn Elements> {
        self.elements
            .clone()
            .expect("mock: stream channel without an element type")
    }
}

#[derive(Default)]
struct State {
    handles: Slab<Handle>,
    sets: Slab<()>,
    promises: Slab<Option<Payload>>,
    channels: Slab<Channel>,
    joined: HashMap<u32, u32>,
    events: VecDeque<Event>,
    context: Option<TaskContext>,
    returns: Vec<(u32, Payload)>,
    calls: Vec<Call>,
    stream_types: HashMap<u32, Rc<dyn Elements>>,
    task_return_failure: Option<String>,
    /// Payloads the guest handed over that no peer will ever read. Kept
    /// until the mock drops so that no destructor runs mid-call.
    retired: Vec<Payload>,
}

impl State {
    fn insert_handle(&mut self, handle: Handle) -> u32 {
        self.handles.insert(handle) as u32 + 1
    }

    fn end(&self, handle: u32, kind: Kind, side: Side) -> usize {
        match self.handles.get(handle.wrapping_sub(1) as usize) {
            Some(Handle::End { channel, side: s }) if *s == side => {
                assert_eq!(
                    self.channels[*channel].kind, kind,
                    "mock: handle {handle} is the wrong kind of end"
                );
                *channel
            }
            Some(_) => panic!("mock: handle {handle} is not a {kind:?} {side:?}"),
            None => panic!("mock: unknown handle {handle}"),
        }
    }

    fn new_promise(&mut self) -> usize {
        self.promises.insert(None)
    }

    fn fulfill(&mut self, promise: usize, value: Payload) {
        let slot = &mut self.promises[promise];
        assert!(slot.is_none(), "mock: promise {promise} fulfilled twice");
        *slot = Some(value);
    }

    fn new_channel(&mut self, kind: Kind, elements: Option<Rc<dyn Elements>>) -> usize {
        self.channels.insert(Channel::new(kind, elements))
    }

    fn guest_end(&mut self, channel: usize, side: Side) -> u32 {
        let handle = self.insert_handle(Handle::End { channel, side });
        match side {
            Side::Reader => self.channels[channel].reader = handle,
            Side::Writer => self.channels[channel].writer = handle,
        }
        handle
    }

    fn release(&mut self, handle: u32) {
        self.handles.remove(handle as usize - 1);
    }
}

/// See the module docs.
#[derive(Default)]
pub struct MockHost {
    state: RefCell<State>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// All boundary calls so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Handles currently held by the guest or pending subtasks.
    pub fn live_handles(&self) -> usize {
        self.state.borrow().handles.len()
    }

    pub fn is_live(&self, handle: u32) -> bool {
        handle != 0 && self.state.borrow().handles.contains(handle as usize - 1)
    }

    /// Make `stream_new(ty)` carry elements of type `T`.
    pub fn register_stream<T: 'static>(&self, ty: u32) {
        self.state
            .borrow_mut()
            .stream_types
            .insert(ty, Typed::<T>::erased());
    }

    /// Make the next `task_return` calls fail with `message`.
    pub fn fail_task_return(&self, message: &str) {
        self.state.borrow_mut().task_return_failure = Some(message.to_string());
    }

    /// Take the result delivered for `export_index`, if any.
    pub fn take_return<T: 'static>(&self, export_index: u32) -> Option<T> {
        let mut state = self.state.borrow_mut();
        let position = state
            .returns
            .iter()
            .position(|(index, _)| *index == export_index)?;
        let (_, payload) = state.returns.remove(position);
        Some(expect_payload(payload))
    }

    // ── Imports ─────────────────────────────────────────────────────

    /// An import call that returned synchronously.
    pub fn import_ready<T: 'static>(&self, value: T) -> AwaitResult {
        AwaitResult::Immediate(Box::new(value))
    }

    /// An import call that is still running; finish it with
    /// [`finish_subtask`](Self::finish_subtask).
    pub fn import_pending<T: 'static>(&self, value: T) -> AwaitResult {
        let mut state = self.state.borrow_mut();
        let promise = state.new_promise();
        let subtask = state.insert_handle(Handle::Subtask {
            promise,
            result: Some(Box::new(value)),
        });
        AwaitResult::Pending {
            waitable: subtask,
            promise: Promise::new(promise as u32),
        }
    }

    /// Subtasks whose result has not been delivered yet.
    pub fn pending_subtasks(&self) -> Vec<u32> {
        let state = self.state.borrow();
        state
            .handles
            .iter()
            .filter_map(|(key, handle)| match handle {
                Handle::Subtask {
                    result: Some(_), ..
                } => Some(key as u32 + 1),
                _ => None,
            })
            .collect()
    }

    /// Queue the started and returned events for `subtask`.
    pub fn finish_subtask(&self, subtask: u32) {
        let mut state = self.state.borrow_mut();
        let (promise, result) = match state.handles.get_mut(subtask as usize - 1) {
            Some(Handle::Subtask { promise, result }) => (
                *promise,
                result.take().expect("mock: subtask already finished"),
            ),
            _ => panic!("mock: {subtask} is not a subtask"),
        };
        state.fulfill(promise, result);
        state.events.push_back(Event::Subtask {
            subtask,
            status: SubtaskStatus::Started,
        });
        state.events.push_back(Event::Subtask {
            subtask,
            status: SubtaskStatus::Returned,
        });
    }

    // ── Host-owned stream ends ──────────────────────────────────────

    /// A stream the host writes: each read returns up to one chunk.
    /// Returns the guest's readable handle.
    pub fn feed_stream<T: 'static>(&self, chunks: Vec<Vec<T>>, hangup: Hangup) -> u32 {
        let mut state = self.state.borrow_mut();
        let channel = state.new_channel(Kind::Stream, Some(Typed::<T>::erased()));
        state.channels[channel].feed = Some(Feed {
            chunks: chunks
                .into_iter()
                .map(|chunk| Box::new(chunk) as Payload)
                .collect(),
            hangup,
        });
        state.guest_end(channel, Side::Reader)
    }

    /// A stream the host reads: each write is accepted up to `per_write`
    /// elements, and the host drops its end once `drop_after` elements have
    /// arrived. Returns the guest's writable handle.
    pub fn sink_stream<T: 'static>(&self, per_write: usize, drop_after: Option<usize>) -> u32 {
        let mut state = self.state.borrow_mut();
        let elements = Typed::<T>::erased();
        let received = elements.empty();
        let channel = state.new_channel(Kind::Stream, Some(elements));
        state.channels[channel].sink = Some(Sink {
            per_write,
            drop_after,
            received,
            accepted: 0,
        });
        state.guest_end(channel, Side::Writer)
    }

    /// Everything a sink stream has accepted so far. Works after the guest
    /// released `writer`.
    pub fn sunk<T: Clone + 'static>(&self, writer: u32) -> Vec<T> {
        let state = self.state.borrow();
        let sink = state
            .channels
            .iter()
            .find(|(_, channel)| channel.writer == writer)
            .and_then(|(_, channel)| channel.sink.as_ref())
            .expect("mock: not a sink stream");
        sink.received
            .downcast_ref::<Vec<T>>()
            .expect("mock: sink of the wrong element type")
            .clone()
    }

    // ── Event delivery ──────────────────────────────────────────────

    /// Pop the next queued event. Its waitable must be joined to a set.
    pub fn next_event(&self) -> Option<Event> {
        let mut state = self.state.borrow_mut();
        let event = state.events.pop_front()?;
        if let Some(waitable) = event.waitable() {
            assert!(
                state.joined.contains_key(&waitable),
                "mock: event for waitable {waitable}, which is in no set"
            );
        }
        Some(event)
    }

    /// Feed queued events to the trampoline until it exits.
    pub fn run_to_exit(&self, mut code: anyhow::Result<CallbackCode>) -> anyhow::Result<()> {
        loop {
            match code? {
                CallbackCode::Exit => return Ok(()),
                CallbackCode::Wait(set) => {
                    let Some(event) = self.next_event() else {
                        panic!("mock: deadlock, waiting on set {set} with no events queued");
                    };
                    code = callback(self, event);
                }
                other => panic!("mock: unexpected callback code {other:?}"),
            }
        }
    }
}

impl Host for MockHost {
    fn waitable_set_new(&self) -> u32 {
        let mut state = self.state.borrow_mut();
        let set = state.sets.insert(()) as u32 + 1;
        state.calls.push(Call::WaitableSetNew(set));
        set
    }

    fn waitable_set_drop(&self, set: u32) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::WaitableSetDrop(set));
        assert!(
            !state.joined.values().any(|joined| *joined == set),
            "mock: dropping set {set} while waitables are still joined"
        );
        state.sets.remove(set as usize - 1);
    }

    fn waitable_join(&self, waitable: u32, set: Option<u32>) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::WaitableJoin { waitable, set });
        match set {
            Some(set) => {
                assert!(state.sets.contains(set as usize - 1), "mock: unknown set {set}");
                state.joined.insert(waitable, set);
            }
            None => {
                state.joined.remove(&waitable);
            }
        }
    }

    fn context_set(&self, task: Option<TaskContext>) {
        let previous = {
            let mut state = self.state.borrow_mut();
            state.calls.push(Call::ContextSet(task.is_some()));
            if task.is_some() {
                assert!(state.context.is_none(), "mock: context slot already occupied");
            }
            std::mem::replace(&mut state.context, task)
        };
        drop(previous);
    }

    fn context_get(&self) -> Option<TaskContext> {
        self.state.borrow().context.clone()
    }

    fn task_return(&self, export_index: u32, borrows: u32, result: Payload) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::TaskReturn {
            export_index,
            borrows,
        });
        if let Some(message) = &state.task_return_failure {
            let err = anyhow::anyhow!("{message}");
            state.retired.push(result);
            return Err(err);
        }
        state.returns.push((export_index, result));
        Ok(())
    }

    fn subtask_drop(&self, subtask: u32) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::SubtaskDrop(subtask));
        let returned = match state.handles.get(subtask as usize - 1) {
            Some(Handle::Subtask { result, .. }) => result.is_none(),
            _ => panic!("mock: {subtask} is not a subtask"),
        };
        assert!(returned, "mock: subtask {subtask} dropped before returning");
        state.release(subtask);
    }

    // ── Futures ─────────────────────────────────────────────────────

    fn future_new(&self, _ty: u32) -> (u32, u32) {
        let mut state = self.state.borrow_mut();
        let channel = state.new_channel(Kind::Future, None);
        let reader = state.guest_end(channel, Side::Reader);
        let writer = state.guest_end(channel, Side::Writer);
        state.calls.push(Call::FutureNew { reader, writer });
        (reader, writer)
    }

    fn future_read(&self, _ty: u32, handle: u32) -> AwaitResult {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::FutureRead(handle));
        let key = state.end(handle, Kind::Future, Side::Reader);
        let channel = &mut state.channels[key];
        assert!(channel.blocked_read.is_none(), "mock: future {handle} read twice");

        if let Some(write) = channel.blocked_write.take() {
            let writer = channel.writer;
            state.fulfill(write.promise, Box::new(ReturnCode::Completed(0)));
            state.events.push_back(Event::FutureWrite {
                end: writer,
                code: ReturnCode::Completed(0),
            });
            return AwaitResult::Immediate(write.values);
        }
        assert!(
            channel.writer_open,
            "mock: future {handle} read after its writer dropped without writing"
        );
        let promise = state.new_promise();
        state.channels[key].blocked_read = Some(BlockedRead { promise, max: 1 });
        AwaitResult::Pending {
            waitable: handle,
            promise: Promise::new(promise as u32),
        }
    }

    fn future_write(&self, _ty: u32, handle: u32, value: Payload) -> AwaitResult {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::FutureWrite(handle));
        let key = state.end(handle, Kind::Future, Side::Writer);
        let channel = &mut state.channels[key];
        assert!(channel.blocked_write.is_none(), "mock: future {handle} written twice");

        if !channel.reader_open {
            state.retired.push(value);
            return AwaitResult::Immediate(Box::new(ReturnCode::Dropped(0)));
        }
        if let Some(read) = channel.blocked_read.take() {
            let reader = channel.reader;
            state.fulfill(read.promise, value);
            state.events.push_back(Event::FutureRead {
                end: reader,
                code: ReturnCode::Completed(0),
            });
            return AwaitResult::Immediate(Box::new(ReturnCode::Completed(0)));
        }
        let promise = state.new_promise();
        state.channels[key].blocked_write = Some(BlockedWrite {
            promise,
            values: value,
        });
        AwaitResult::Pending {
            waitable: handle,
            promise: Promise::new(promise as u32),
        }
    }

    fn future_drop_readable(&self, _ty: u32, handle: u32) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::FutureDropReadable(handle));
        let key = state.end(handle, Kind::Future, Side::Reader);
        let channel = &mut state.channels[key];
        assert!(
            channel.blocked_read.is_none(),
            "mock: future {handle} dropped with a read in flight"
        );
        channel.reader_open = false;
        if let Some(write) = channel.blocked_write.take() {
            let writer = channel.writer;
            state.retired.push(write.values);
            state.fulfill(write.promise, Box::new(ReturnCode::Dropped(0)));
            state.events.push_back(Event::FutureWrite {
                end: writer,
                code: ReturnCode::Dropped(0),
            });
        }
        state.release(handle);
    }

    fn future_drop_writable(&self, _ty: u32, handle: u32) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::FutureDropWritable(handle));
        let key = state.end(handle, Kind::Future, Side::Writer);
        let channel = &mut state.channels[key];
        assert!(
            channel.blocked_write.is_none(),
            "mock: future {handle} dropped with a write in flight"
        );
        assert!(
            channel.blocked_read.is_none(),
            "mock: future {handle} dropped without writing while its reader waits"
        );
        channel.writer_open = false;
        state.release(handle);
    }

    // ── Streams ─────────────────────────────────────────────────────

    fn stream_new(&self, ty: u32) -> (u32, u32) {
        let mut state = self.state.borrow_mut();
        let elements = match state.stream_types.get(&ty) {
            Some(elements) => elements.clone(),
            None => panic!("mock: stream type {ty} was never registered"),
        };
        let channel = state.new_channel(Kind::Stream, Some(elements));
        let reader = state.guest_end(channel, Side::Reader);
        let writer = state.guest_end(channel, Side::Writer);
        state.calls.push(Call::StreamNew { reader, writer });
        (reader, writer)
    }

    fn stream_read(&self, _ty: u32, handle: u32, max_count: usize) -> AwaitResult {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::StreamRead(handle));
        let key = state.end(handle, Kind::Stream, Side::Reader);
        let channel = &mut state.channels[key];
        assert!(channel.blocked_read.is_none(), "mock: stream {handle} read twice");
        let elements = channel.elements();

        if let Some(feed) = channel.feed.as_mut() {
            let Some(chunk) = feed.chunks.pop_front() else {
                return AwaitResult::Immediate(
                    elements.read_result(ReturnCode::Dropped(0), elements.empty()),
                );
            };
            let take = elements.len(&chunk).min(max_count);
            let (head, tail) = elements.split(chunk, take);
            if elements.len(&tail) > 0 {
                feed.chunks.push_front(tail);
            }
            let count = take as u32;
            let code = if feed.chunks.is_empty() && feed.hangup == Hangup::WithLast {
                ReturnCode::Dropped(count)
            } else {
                ReturnCode::Completed(count)
            };
            return AwaitResult::Immediate(elements.read_result(code, head));
        }

        if let Some(write) = channel.blocked_write.take() {
            let writer = channel.writer;
            let take = elements.len(&write.values).min(max_count);
            let (head, rest) = elements.split(write.values, take);
            let code = ReturnCode::Completed(take as u32);
            state.retired.push(rest);
            state.fulfill(write.promise, Box::new(code));
            state.events.push_back(Event::StreamWrite { end: writer, code });
            return AwaitResult::Immediate(elements.read_result(code, head));
        }
        if !channel.writer_open {
            return AwaitResult::Immediate(
                elements.read_result(ReturnCode::Dropped(0), elements.empty()),
            );
        }
        let promise = state.new_promise();
        state.channels[key].blocked_read = Some(BlockedRead {
            promise,
            max: max_count,
        });
        AwaitResult::Pending {
            waitable: handle,
            promise: Promise::new(promise as u32),
        }
    }

    fn stream_write(&self, _ty: u32, handle: u32, values: Payload) -> AwaitResult {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::StreamWrite(handle));
        let key = state.end(handle, Kind::Stream, Side::Writer);
        let channel = &mut state.channels[key];
        assert!(channel.blocked_write.is_none(), "mock: stream {handle} written twice");
        let elements = channel.elements();

        if !channel.reader_open {
            state.retired.push(values);
            return AwaitResult::Immediate(Box::new(ReturnCode::Dropped(0)));
        }

        if let Some(sink) = channel.sink.as_mut() {
            let room = match sink.drop_after {
                Some(limit) => limit - sink.accepted,
                None => usize::MAX,
            };
            let take = elements.len(&values).min(sink.per_write).min(room);
            let (head, rest) = elements.split(values, take);
            elements.append(&mut sink.received, head);
            sink.accepted += take;
            if sink.drop_after == Some(sink.accepted) {
                channel.reader_open = false;
            }
            state.retired.push(rest);
            return AwaitResult::Immediate(Box::new(ReturnCode::Completed(take as u32)));
        }

        if let Some(read) = channel.blocked_read.take() {
            let reader = channel.reader;
            let take = elements.len(&values).min(read.max);
            let (head, rest) = elements.split(values, take);
            let code = ReturnCode::Completed(take as u32);
            state.retired.push(rest);
            state.fulfill(read.promise, elements.read_result(code, head));
            state.events.push_back(Event::StreamRead { end: reader, code });
            return AwaitResult::Immediate(Box::new(code));
        }
        let promise = state.new_promise();
        state.channels[key].blocked_write = Some(BlockedWrite { promise, values });
        AwaitResult::Pending {
            waitable: handle,
            promise: Promise::new(promise as u32),
        }
    }

    fn stream_drop_readable(&self, _ty: u32, handle: u32) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::StreamDropReadable(handle));
        let key = state.end(handle, Kind::Stream, Side::Reader);
        let channel = &mut state.channels[key];
        assert!(
            channel.blocked_read.is_none(),
            "mock: stream {handle} dropped with a read in flight"
        );
        channel.reader_open = false;
        if let Some(write) = channel.blocked_write.take() {
            let writer = channel.writer;
            state.retired.push(write.values);
            state.fulfill(write.promise, Box::new(ReturnCode::Dropped(0)));
            state.events.push_back(Event::StreamWrite {
                end: writer,
                code: ReturnCode::Dropped(0),
            });
        }
        state.release(handle);
    }

    fn stream_drop_writable(&self, _ty: u32, handle: u32) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::StreamDropWritable(handle));
        let key = state.end(handle, Kind::Stream, Side::Writer);
        let channel = &mut state.channels[key];
        assert!(
            channel.blocked_write.is_none(),
            "mock: stream {handle} dropped with a write in flight"
        );
        channel.writer_open = false;
        if let Some(read) = channel.blocked_read.take() {
            let reader = channel.reader;
            let elements = channel.elements();
            state.fulfill(
                read.promise,
                elements.read_result(ReturnCode::Dropped(0), elements.empty()),
            );
            state.events.push_back(Event::StreamRead {
                end: reader,
                code: ReturnCode::Dropped(0),
            });
        }
        state.release(handle);
    }

    fn promise_get_result(&self, completion: Completion, promise: Promise) -> Payload {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::PromiseGetResult(promise.raw()));
        if let Completion::Subtask(status) = completion {
            assert_eq!(status, SubtaskStatus::Returned, "mock: subtask not returned");
        }
        let key = promise.raw() as usize;
        match state.promises.try_remove(key) {
            Some(Some(value)) => value,
            Some(None) => panic!("mock: promise {key} collected before it completed"),
            None => panic!("mock: unknown promise {key}"),
        }
    }
}

impl std::fmt::Debug for MockHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("MockHost")
            .field("handles", &state.handles.len())
            .field("events", &state.events)
            .field("calls", &state.calls.len())
            .finish()
    }
}
