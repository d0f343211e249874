//! Single-value channel ends.
//!
//! A future carries exactly one value from its writable end to its readable
//! end. Both wrappers release their host handle exactly once: after the
//! read or write, on [`close`](FutureReader::close), or on drop.

use std::fmt;
use std::marker::PhantomData;

use ferry_rt::{ReturnCode, TaskContext};

/// Readable end of a future.
pub struct FutureReader<T> {
    cx: TaskContext,
    ty: u32,
    handle: Option<u32>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> FutureReader<T> {
    /// Take ownership of a readable handle the host passed in.
    pub fn new(cx: TaskContext, ty: u32, handle: u32) -> Self {
        FutureReader {
            cx,
            ty,
            handle: Some(handle),
            _marker: PhantomData,
        }
    }

    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    /// Wait for the value, then release the readable end.
    ///
    /// The handle belongs to the returned future from its first poll on.
    /// Dropping that future before it finishes leaves the read in flight and
    /// the handle unreleased, since an in-flight read cannot be cancelled.
    pub async fn read(mut self) -> T {
        let Some(handle) = self.handle.take() else {
            panic!("read on a released future reader");
        };
        let host = self.cx.host().clone();
        let value = self.cx.await_as::<T>(host.future_read(self.ty, handle)).await;
        host.future_drop_readable(self.ty, handle);
        value
    }

    /// Release the readable end without reading.
    pub fn close(self) {}
}

impl<T> Drop for FutureReader<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            log::trace!("future reader {handle}: released unread");
            self.cx.host().future_drop_readable(self.ty, handle);
        }
    }
}

impl<T> fmt::Debug for FutureReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureReader")
            .field("ty", &self.ty)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Writable end of a future.
///
/// A reader on the other side waits until something is written, so a writer
/// that goes away without writing still sends the `default` value it was
/// created with. That write is spawned on the root task, never performed
/// inline.
pub struct FutureWriter<T: 'static> {
    cx: TaskContext,
    ty: u32,
    handle: Option<u32>,
    default: Option<Box<dyn FnOnce() -> T>>,
}

impl<T: 'static> FutureWriter<T> {
    /// Take ownership of a writable handle the host passed in.
    pub fn new(cx: TaskContext, ty: u32, handle: u32, default: impl FnOnce() -> T + 'static) -> Self {
        FutureWriter {
            cx,
            ty,
            handle: Some(handle),
            default: Some(Box::new(default)),
        }
    }

    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    /// Send `value`. Returns `false` if the reader went away first.
    ///
    /// As with [`FutureReader::read`], dropping the returned future after its
    /// first poll leaves the write in flight and the handle unreleased.
    pub async fn write(mut self, value: T) -> bool {
        let Some(handle) = self.handle.take() else {
            panic!("write on a released future writer");
        };
        write_value(self.cx.clone(), self.ty, handle, value).await
    }

    /// Give up on writing; the reader receives the default value.
    pub fn close(self) {}
}

async fn write_value<T: 'static>(cx: TaskContext, ty: u32, handle: u32, value: T) -> bool {
    let host = cx.host().clone();
    let code = cx
        .await_as::<ReturnCode>(host.future_write(ty, handle, Box::new(value)))
        .await;
    host.future_drop_writable(ty, handle);
    match code {
        ReturnCode::Completed(_) => true,
        ReturnCode::Dropped(_) => {
            log::debug!("future writer {handle}: reader dropped before the write");
            false
        }
        ReturnCode::Cancelled(_) => unimplemented!("cancelled future write"),
    }
}

impl<T: 'static> Drop for FutureWriter<T> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Some(default) = self.default.take() else {
            return;
        };
        log::trace!("future writer {handle}: dropped unwritten, sending default");
        let cx = self.cx.clone();
        let ty = self.ty;
        self.cx.spawn(async move {
            write_value(cx, ty, handle, default()).await;
        });
    }
}

impl<T: 'static> fmt::Debug for FutureWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureWriter")
            .field("ty", &self.ty)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Create a fresh future of element type `ty`; returns `(writer, reader)`.
pub fn future_new<T: 'static>(
    cx: &TaskContext,
    ty: u32,
    default: impl FnOnce() -> T + 'static,
) -> (FutureWriter<T>, FutureReader<T>) {
    let (reader, writer) = cx.host().future_new(ty);
    (
        FutureWriter::new(cx.clone(), ty, writer, default),
        FutureReader::new(cx.clone(), ty, reader),
    )
}
