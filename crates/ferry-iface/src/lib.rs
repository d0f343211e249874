//! ferry-iface: Typed wrappers around host future and stream handles.
//!
//! Each wrapper owns one host handle, holds the [`TaskContext`] of the root
//! task it belongs to, and suspends through that task's await bridge. Handles
//! are released exactly once, on `close` or on drop.
//!
//! ```ignore
//! use ferry_iface::stream_new;
//!
//! ferry_rt::first_poll(host, 0, 0, |cx| async move {
//!     let (mut tx, rx) = stream_new::<u8>(&cx, BYTES);
//!     cx.spawn(async move {
//!         tx.write_all(b"hello").await;
//!     });
//!     rx
//! })?;
//! ```

pub mod future;
pub mod stream;

pub use ferry_rt::TaskContext;
pub use future::{future_new, FutureReader, FutureWriter};
pub use stream::{stream_new, ByteStreamReader, ByteStreamWriter, StreamReader, StreamWriter};
