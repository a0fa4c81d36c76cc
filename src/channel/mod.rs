//! Duplex byte-channel transports.
//!
//! The IPC engine is written against three small traits rather than a
//! concrete OS primitive: a [`Transport`] creates and connects channels by
//! name, a [`Listener`] accepts incoming channels, and a [`Channel`] is one
//! end of an established duplex byte stream. Two implementations are
//! provided: [`LocalSocketTransport`], backed by OS local sockets (named
//! pipes on Windows, Unix domain sockets elsewhere), and [`MemoryTransport`],
//! an in-process transport used by the test suite.

mod local;
pub(crate) mod memory;

pub use local::LocalSocketTransport;
pub use memory::MemoryTransport;

use std::{io, sync::Arc, time::Duration};

/// One end of an established duplex byte stream.
///
/// A channel is shared between a reader thread and a writer thread, so every
/// method takes `&self`; implementations synchronize the two directions
/// internally. Reads and writes must be able to proceed concurrently.
pub trait Channel: Send + Sync + 'static {
    /// Reads up to `buf.len()` bytes, blocking until at least one byte is
    /// available. Returns `Ok(0)` once the stream has ended.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Flushes buffered bytes towards the peer.
    fn flush(&self) -> io::Result<()>;

    /// Whether the channel is still usable. Turns `false` after [`close`]
    /// or once either direction has observed a broken or ended stream.
    ///
    /// [`close`]: Channel::close
    fn is_connected(&self) -> bool;

    /// Marks the channel closed. Idempotent and callable from any thread.
    ///
    /// Closing must eventually end the peer's read stream, either by still
    /// accepting the end-of-stream marker afterwards (local sockets) or by
    /// ending the byte stream directly (the in-memory transport). Writes
    /// after `close` are best-effort and may fail.
    fn close(&self);
}

/// Accepts incoming channels on a bound name.
pub trait Listener: Send {
    /// Blocks until the next peer connects.
    fn accept(&self) -> io::Result<Arc<dyn Channel>>;
}

/// Creates and connects channels by name.
pub trait Transport: Send + Sync + 'static {
    /// Binds `name` and returns a listener for it. Fails if the name is
    /// already taken. The name is released when the listener is dropped.
    fn bind(&self, name: &str) -> io::Result<Box<dyn Listener>>;

    /// Connects to a bound name, waiting up to `timeout` for it to appear.
    fn connect(&self, name: &str, timeout: Duration) -> io::Result<Arc<dyn Channel>>;
}
