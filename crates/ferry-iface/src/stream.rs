//! Multi-value channel ends.
//!
//! Reads and writes move a batch at a time and may move fewer elements than
//! asked. Once an operation reports that the other end is gone, the wrapper
//! remembers it and stops calling the host.

use std::fmt;
use std::marker::PhantomData;

use ferry_rt::{ReturnCode, TaskContext};

/// Readable end of a stream.
pub struct StreamReader<T> {
    cx: TaskContext,
    ty: u32,
    handle: Option<u32>,
    writer_dropped: bool,
    _marker: PhantomData<fn() -> T>,
}

pub type ByteStreamReader = StreamReader<u8>;

impl<T: 'static> StreamReader<T> {
    /// Take ownership of a readable handle the host passed in.
    pub fn new(cx: TaskContext, ty: u32, handle: u32) -> Self {
        StreamReader {
            cx,
            ty,
            handle: Some(handle),
            writer_dropped: false,
            _marker: PhantomData,
        }
    }

    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    pub fn is_writer_dropped(&self) -> bool {
        self.writer_dropped
    }

    /// Read up to `max_count` elements.
    ///
    /// An empty result after the writer dropped means end of stream. Data
    /// delivered together with the drop notice is still returned. Dropping
    /// the returned future while the read is pending leaves the read in
    /// flight, since an in-flight read cannot be cancelled.
    pub async fn read(&mut self, max_count: usize) -> Vec<T> {
        let Some(handle) = self.handle else {
            panic!("read on a released stream reader");
        };
        if self.writer_dropped {
            return Vec::new();
        }
        let host = self.cx.host().clone();
        let (code, values) = self
            .cx
            .await_as::<(ReturnCode, Vec<T>)>(host.stream_read(self.ty, handle, max_count))
            .await;
        if let ReturnCode::Dropped(count) = code {
            log::debug!("stream reader {handle}: writer dropped after {count} more");
            self.writer_dropped = true;
        }
        assert!(
            values.len() <= max_count,
            "host returned {} elements for a read of at most {max_count}",
            values.len()
        );
        values
    }

    /// Release the readable end.
    pub fn close(self) {}
}

impl<T> Drop for StreamReader<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            log::trace!("stream reader {handle}: released");
            self.cx.host().stream_drop_readable(self.ty, handle);
        }
    }
}

impl<T> fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("ty", &self.ty)
            .field("handle", &self.handle)
            .field("writer_dropped", &self.writer_dropped)
            .finish()
    }
}

/// Writable end of a stream.
pub struct StreamWriter<T> {
    cx: TaskContext,
    ty: u32,
    handle: Option<u32>,
    reader_dropped: bool,
    _marker: PhantomData<fn(T)>,
}

pub type ByteStreamWriter = StreamWriter<u8>;

impl<T: Clone + 'static> StreamWriter<T> {
    /// Take ownership of a writable handle the host passed in.
    pub fn new(cx: TaskContext, ty: u32, handle: u32) -> Self {
        StreamWriter {
            cx,
            ty,
            handle: Some(handle),
            reader_dropped: false,
            _marker: PhantomData,
        }
    }

    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    pub fn is_reader_dropped(&self) -> bool {
        self.reader_dropped
    }

    /// Offer `values` to the reader; returns how many it accepted.
    pub async fn write(&mut self, values: &[T]) -> usize {
        let Some(handle) = self.handle else {
            panic!("write on a released stream writer");
        };
        if self.reader_dropped {
            return 0;
        }
        let host = self.cx.host().clone();
        let code = self
            .cx
            .await_as::<ReturnCode>(host.stream_write(self.ty, handle, Box::new(values.to_vec())))
            .await;
        if let ReturnCode::Dropped(_) = code {
            log::debug!("stream writer {handle}: reader dropped");
            self.reader_dropped = true;
        }
        let count = code.count() as usize;
        assert!(
            count <= values.len(),
            "host accepted {count} of {} offered elements",
            values.len()
        );
        count
    }

    /// Write until every element is accepted or the reader goes away;
    /// returns the number accepted.
    pub async fn write_all(&mut self, values: &[T]) -> usize {
        let mut offset = 0;
        while offset < values.len() && !self.reader_dropped {
            offset += self.write(&values[offset..]).await;
        }
        offset
    }

    /// Release the writable end.
    pub fn close(self) {}
}

impl<T> Drop for StreamWriter<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            log::trace!("stream writer {handle}: released");
            self.cx.host().stream_drop_writable(self.ty, handle);
        }
    }
}

impl<T> fmt::Debug for StreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("ty", &self.ty)
            .field("handle", &self.handle)
            .field("reader_dropped", &self.reader_dropped)
            .finish()
    }
}

/// Create a fresh stream of element type `ty`; returns `(writer, reader)`.
pub fn stream_new<T: Clone + 'static>(cx: &TaskContext, ty: u32) -> (StreamWriter<T>, StreamReader<T>) {
    let (reader, writer) = cx.host().stream_new(ty);
    (
        StreamWriter::new(cx.clone(), ty, writer),
        StreamReader::new(cx.clone(), ty, reader),
    )
}
