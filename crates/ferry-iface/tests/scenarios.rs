//! End-to-end runs of guest code against the in-memory host.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;

use ferry_iface::{
    future_new, stream_new, ByteStreamReader, ByteStreamWriter, FutureReader, FutureWriter,
};
use ferry_rt::mock::{Call, Hangup, MockHost};
use ferry_rt::{callback, first_poll, CallbackCode, Host};

fn count(host: &MockHost, call: Call) -> usize {
    host.calls().iter().filter(|c| **c == call).count()
}

#[test]
fn future_round_trip_between_tasks() {
    let host = Rc::new(MockHost::new());
    let code = first_poll(host.clone(), 0, 0, |cx| async move {
        let (tx, rx) = future_new::<String>(&cx, 7, String::new);
        cx.spawn(async move {
            assert!(tx.write("ping".to_string()).await);
        });
        rx.read().await
    })
    .unwrap();

    assert!(matches!(code, CallbackCode::Wait(_)));
    host.run_to_exit(Ok(code)).unwrap();
    assert_eq!(host.take_return::<String>(0).as_deref(), Some("ping"));
    assert_eq!(host.live_handles(), 0);
}

#[test]
fn writer_learns_which_reader_went_away() {
    let host = Rc::new(MockHost::new());
    let (tx1_reader, tx1_writer) = host.future_new(0);
    let (tx2_reader, tx2_writer) = host.future_new(0);

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let tx1 = FutureWriter::new(cx.clone(), 0, tx1_writer, || 0u32);
        let tx2 = FutureWriter::new(cx.clone(), 0, tx2_writer, || 0u32);
        let first = tx1.write(1).await;
        let second = tx2.write(2).await;
        (first, second)
    })
    .unwrap();

    assert!(matches!(code, CallbackCode::Wait(_)));
    // The host never reads tx1.
    host.future_drop_readable(0, tx1_reader);
    let code = callback(&*host, host.next_event().unwrap()).unwrap();
    assert!(matches!(code, CallbackCode::Wait(_)));

    let value = match host.future_read(0, tx2_reader) {
        ferry_rt::AwaitResult::Immediate(value) => ferry_rt::expect_payload::<u32>(value),
        other => panic!("expected the pending write to complete the read, got {other:?}"),
    };
    assert_eq!(value, 2);
    host.run_to_exit(Ok(code)).unwrap();

    assert_eq!(host.take_return::<(bool, bool)>(0), Some((false, true)));
    // Consumed writers do not send their default.
    assert_eq!(count(&host, Call::FutureWrite(tx1_writer)), 1);
    assert_eq!(count(&host, Call::FutureWrite(tx2_writer)), 1);
}

#[test]
fn stream_drop_with_data_ends_without_another_round_trip() {
    let host = Rc::new(MockHost::new());
    let reader = host.feed_stream::<u8>(vec![(0..10).collect()], Hangup::WithLast);

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let mut rx = ByteStreamReader::new(cx.clone(), 0, reader);
        let first = rx.read(16).await;
        let dropped = rx.is_writer_dropped();
        let second = rx.read(16).await;
        (first, dropped, second)
    })
    .unwrap();

    assert_eq!(code, CallbackCode::Exit);
    assert_eq!(
        host.take_return::<(Vec<u8>, bool, Vec<u8>)>(0),
        Some(((0..10).collect(), true, Vec::new()))
    );
    assert_eq!(count(&host, Call::StreamRead(reader)), 1);
    assert_eq!(count(&host, Call::StreamDropReadable(reader)), 1);
}

#[test]
fn stream_hangup_after_last_chunk_reads_empty() {
    let host = Rc::new(MockHost::new());
    let reader = host.feed_stream(vec![vec![1u32, 2], vec![3]], Hangup::AfterLast);

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let mut rx = ferry_iface::StreamReader::<u32>::new(cx.clone(), 0, reader);
        let mut all = Vec::new();
        while !rx.is_writer_dropped() {
            all.extend(rx.read(8).await);
        }
        let after = rx.read(8).await;
        (all, after)
    })
    .unwrap();

    assert_eq!(code, CallbackCode::Exit);
    assert_eq!(
        host.take_return::<(Vec<u32>, Vec<u32>)>(0),
        Some((vec![1, 2, 3], Vec::new()))
    );
    // Two data reads, the empty one that reported the drop, and nothing after.
    assert_eq!(count(&host, Call::StreamRead(reader)), 3);
}

#[test]
fn write_all_keeps_writing_short_accepts() {
    let host = Rc::new(MockHost::new());
    let writer = host.sink_stream::<u8>(3, None);

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let mut tx = ByteStreamWriter::new(cx.clone(), 0, writer);
        tx.write_all(b"hello world").await
    })
    .unwrap();

    assert_eq!(code, CallbackCode::Exit);
    assert_eq!(host.take_return::<usize>(0), Some(11));
    assert_eq!(host.sunk::<u8>(writer), b"hello world");
    assert_eq!(count(&host, Call::StreamWrite(writer)), 4);
}

#[test]
fn write_all_stops_when_reader_drops_early() {
    let host = Rc::new(MockHost::new());
    let writer = host.sink_stream::<u8>(4, Some(6));

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let mut tx = ByteStreamWriter::new(cx.clone(), 0, writer);
        let written = tx.write_all(&[7u8; 10]).await;
        let dropped = tx.is_reader_dropped();
        let after = tx.write(&[1, 2, 3]).await;
        (written, dropped, after)
    })
    .unwrap();

    assert_eq!(code, CallbackCode::Exit);
    assert_eq!(host.take_return::<(usize, bool, usize)>(0), Some((6, true, 0)));
    assert_eq!(host.sunk::<u8>(writer), vec![7u8; 6]);
    // Two accepted writes, then one that reported the drop.
    assert_eq!(count(&host, Call::StreamWrite(writer)), 3);
}

#[test]
fn guest_pipe_delivers_everything_then_ends() {
    let host = Rc::new(MockHost::new());
    host.register_stream::<u8>(5);

    let code = first_poll(host.clone(), 0, 0, |cx| async move {
        let (mut tx, mut rx) = stream_new::<u8>(&cx, 5);
        cx.spawn(async move {
            let written = tx.write_all(b"abcdef").await;
            tx.close();
            assert_eq!(written, 6);
        });
        let mut got = Vec::new();
        loop {
            let chunk = rx.read(4).await;
            if chunk.is_empty() && rx.is_writer_dropped() {
                break;
            }
            got.extend(chunk);
        }
        got
    })
    .unwrap();

    host.run_to_exit(Ok(code)).unwrap();
    assert_eq!(host.take_return::<Vec<u8>>(0).as_deref(), Some(&b"abcdef"[..]));
    assert_eq!(host.live_handles(), 0);
}

#[test]
fn release_happens_once() {
    let host = Rc::new(MockHost::new());
    host.register_stream::<u8>(1);
    let (future_reader, _future_writer) = host.future_new(0);

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let rx = FutureReader::<u8>::new(cx.clone(), 0, future_reader);
        rx.close();

        let (tx, rx) = stream_new::<u8>(&cx, 1);
        let handles = (tx.handle().unwrap(), rx.handle().unwrap());
        tx.close();
        drop(rx);
        handles
    })
    .unwrap();

    assert_eq!(code, CallbackCode::Exit);
    let (stream_writer, stream_reader) = host.take_return::<(u32, u32)>(0).unwrap();
    assert_eq!(count(&host, Call::FutureDropReadable(future_reader)), 1);
    assert_eq!(count(&host, Call::StreamDropWritable(stream_writer)), 1);
    assert_eq!(count(&host, Call::StreamDropReadable(stream_reader)), 1);
}

#[test]
fn unwritten_future_sends_its_default() {
    let host = Rc::new(MockHost::new());
    let (reader, writer) = host.future_new(0);

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let tx = FutureWriter::new(cx.clone(), 0, writer, || 99u32);
        drop(tx);
    })
    .unwrap();

    // The top-level coroutine returned but the default write is in flight.
    assert_eq!(host.take_return::<()>(0), Some(()));
    assert!(matches!(code, CallbackCode::Wait(_)));

    let value = match host.future_read(0, reader) {
        ferry_rt::AwaitResult::Immediate(value) => ferry_rt::expect_payload::<u32>(value),
        other => panic!("expected the default to be waiting, got {other:?}"),
    };
    assert_eq!(value, 99);
    host.run_to_exit(Ok(code)).unwrap();
    assert_eq!(count(&host, Call::FutureDropWritable(writer)), 1);
}

#[test]
fn write_to_dropped_reader_reports_false() {
    let host = Rc::new(MockHost::new());

    let code = first_poll(host.clone(), 0, 0, |cx| async move {
        let (tx, rx) = future_new::<u8>(&cx, 0, || 0);
        rx.close();
        tx.write(5).await
    })
    .unwrap();

    assert_eq!(code, CallbackCode::Exit);
    assert_eq!(host.take_return::<bool>(0), Some(false));
    assert_eq!(host.live_handles(), 0);
}

#[test]
#[should_panic(expected = "after it exited")]
fn writer_outliving_its_root_fails_fast() {
    let host = Rc::new(MockHost::new());
    let (_reader, writer) = host.future_new(0);
    let stash: Rc<RefCell<Option<FutureWriter<u32>>>> = Rc::default();
    let stash2 = stash.clone();

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        *stash2.borrow_mut() = Some(FutureWriter::new(cx.clone(), 0, writer, || 99));
    })
    .unwrap();
    assert_eq!(code, CallbackCode::Exit);

    // A later export drops the writer; its root can no longer send the default.
    let _ = first_poll(host.clone(), 1, 0, move |_cx| async move {
        stash.borrow_mut().take();
    });
}

#[test]
fn unpolled_read_releases_on_drop() {
    let host = Rc::new(MockHost::new());
    let (reader, _writer) = host.future_new(0);

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let read = FutureReader::<u8>::new(cx.clone(), 0, reader).read();
        drop(read);
    })
    .unwrap();

    assert_eq!(code, CallbackCode::Exit);
    assert_eq!(count(&host, Call::FutureDropReadable(reader)), 1);
    assert_eq!(count(&host, Call::FutureRead(reader)), 0);
}

#[test]
fn abandoned_read_stays_in_flight() {
    let host = Rc::new(MockHost::new());
    let (reader, _writer) = host.future_new(0);

    let code = first_poll(host.clone(), 0, 0, move |cx| async move {
        let mut read = Box::pin(FutureReader::<u8>::new(cx.clone(), 0, reader).read());
        assert!(futures::poll!(read.as_mut()).is_pending());
        drop(read);
    })
    .unwrap();

    // The read was never cancelled, so the root keeps waiting on it.
    assert!(matches!(code, CallbackCode::Wait(_)));
    assert!(host.is_live(reader));
    assert_eq!(count(&host, Call::FutureDropReadable(reader)), 0);
}

// ── Logging ─────────────────────────────────────────────────────────

thread_local! {
    static RECORDS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

struct Capture;

impl log::Log for Capture {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        RECORDS.with(|records| records.borrow_mut().push(record.args().to_string()));
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture;

fn capture_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        log::set_logger(&CAPTURE).unwrap();
        log::set_max_level(log::LevelFilter::Trace);
    });
    RECORDS.with(|records| records.borrow_mut().clear());
}

fn logged() -> Vec<String> {
    RECORDS.with(|records| records.borrow().clone())
}

#[test]
fn releasing_stream_ends_is_traced() {
    capture_logs();
    let host = Rc::new(MockHost::new());
    host.register_stream::<u8>(2);

    let code = first_poll(host.clone(), 0, 0, |cx| async move {
        let (tx, rx) = stream_new::<u8>(&cx, 2);
        (tx.handle().unwrap(), rx.handle().unwrap())
    })
    .unwrap();

    assert_eq!(code, CallbackCode::Exit);
    let (writer, reader) = host.take_return::<(u32, u32)>(0).unwrap();
    let lines = logged();
    assert!(lines.contains(&format!("stream writer {writer}: released")));
    assert!(lines.contains(&format!("stream reader {reader}: released")));
}

// ── Misbehaving host ────────────────────────────────────────────────

/// Reports five elements moved by every stream read and write.
struct Overcounting(MockHost);

impl Host for Overcounting {
    fn waitable_set_new(&self) -> u32 {
        self.0.waitable_set_new()
    }
    fn waitable_set_drop(&self, set: u32) {
        self.0.waitable_set_drop(set)
    }
    fn waitable_join(&self, waitable: u32, set: Option<u32>) {
        self.0.waitable_join(waitable, set)
    }
    fn context_set(&self, task: Option<ferry_rt::TaskContext>) {
        self.0.context_set(task)
    }
    fn context_get(&self) -> Option<ferry_rt::TaskContext> {
        self.0.context_get()
    }
    fn task_return(
        &self,
        export_index: u32,
        borrows: u32,
        result: ferry_rt::Payload,
    ) -> anyhow::Result<()> {
        self.0.task_return(export_index, borrows, result)
    }
    fn subtask_drop(&self, subtask: u32) {
        self.0.subtask_drop(subtask)
    }
    fn future_new(&self, ty: u32) -> (u32, u32) {
        self.0.future_new(ty)
    }
    fn future_read(&self, ty: u32, handle: u32) -> ferry_rt::AwaitResult {
        self.0.future_read(ty, handle)
    }
    fn future_write(&self, ty: u32, handle: u32, value: ferry_rt::Payload) -> ferry_rt::AwaitResult {
        self.0.future_write(ty, handle, value)
    }
    fn future_drop_readable(&self, ty: u32, handle: u32) {
        self.0.future_drop_readable(ty, handle)
    }
    fn future_drop_writable(&self, ty: u32, handle: u32) {
        self.0.future_drop_writable(ty, handle)
    }
    fn stream_new(&self, ty: u32) -> (u32, u32) {
        self.0.stream_new(ty)
    }
    fn stream_read(&self, _ty: u32, _handle: u32, _max_count: usize) -> ferry_rt::AwaitResult {
        ferry_rt::AwaitResult::Immediate(Box::new((
            ferry_rt::ReturnCode::Completed(5),
            vec![0u8; 5],
        )))
    }
    fn stream_write(&self, _ty: u32, _handle: u32, _values: ferry_rt::Payload) -> ferry_rt::AwaitResult {
        ferry_rt::AwaitResult::Immediate(Box::new(ferry_rt::ReturnCode::Completed(5)))
    }
    fn stream_drop_readable(&self, ty: u32, handle: u32) {
        self.0.stream_drop_readable(ty, handle)
    }
    fn stream_drop_writable(&self, ty: u32, handle: u32) {
        self.0.stream_drop_writable(ty, handle)
    }
    fn promise_get_result(
        &self,
        completion: ferry_rt::Completion,
        promise: ferry_rt::Promise,
    ) -> ferry_rt::Payload {
        self.0.promise_get_result(completion, promise)
    }
}

#[test]
#[should_panic(expected = "accepted 5 of 2")]
fn overreported_write_count_fails_fast() {
    let mock = MockHost::new();
    let writer = mock.sink_stream::<u8>(8, None);
    let host = Rc::new(Overcounting(mock));
    let _ = first_poll(host, 0, 0, move |cx| async move {
        let mut tx = ByteStreamWriter::new(cx.clone(), 0, writer);
        tx.write(&[1, 2]).await
    });
}

#[test]
#[should_panic(expected = "returned 5 elements for a read of at most 2")]
fn overreported_read_count_fails_fast() {
    let mock = MockHost::new();
    let reader = mock.feed_stream::<u8>(Vec::new(), Hangup::AfterLast);
    let host = Rc::new(Overcounting(mock));
    let _ = first_poll(host, 0, 0, move |cx| async move {
        let mut rx = ByteStreamReader::new(cx.clone(), 0, reader);
        rx.read(2).await
    });
}
