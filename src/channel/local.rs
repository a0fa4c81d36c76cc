use std::{
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use interprocess::local_socket::{
    GenericFilePath, GenericNamespaced, ListenerOptions, Stream, prelude::*,
};

use super::{Channel, Listener, Transport};

/// How long to sleep between connect attempts while the name is not bound
/// yet. The server binds the private channel only after sending its name, so
/// the first attempt routinely races the bind.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Channel transport backed by OS local sockets: named pipes on Windows,
/// Unix domain sockets everywhere else.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalSocketTransport;

impl Transport for LocalSocketTransport {
    fn bind(&self, name: &str) -> io::Result<Box<dyn Listener>> {
        let listener = if GenericNamespaced::is_supported() {
            ListenerOptions::new()
                .name(name.to_ns_name::<GenericNamespaced>()?)
                .create_sync()?
        } else {
            let path = fs_fallback_path(name);
            ListenerOptions::new()
                .name(path.to_fs_name::<GenericFilePath>()?)
                .create_sync()?
        };
        Ok(Box::new(LocalSocketListener { listener }))
    }

    fn connect(&self, name: &str, timeout: Duration) -> io::Result<Arc<dyn Channel>> {
        let deadline = Instant::now() + timeout;
        loop {
            match connect_once(name) {
                Ok(stream) => return Ok(Arc::new(LocalSocketChannel::new(stream))),
                Err(e) if name_not_bound_yet(&e) && Instant::now() < deadline => {
                    thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn connect_once(name: &str) -> io::Result<Stream> {
    if GenericNamespaced::is_supported() {
        Stream::connect(name.to_ns_name::<GenericNamespaced>()?)
    } else {
        let path = fs_fallback_path(name);
        Stream::connect(path.to_fs_name::<GenericFilePath>()?)
    }
}

fn fs_fallback_path(name: &str) -> String {
    format!("{}/{name}.sock", std::env::temp_dir().display())
}

fn name_not_bound_yet(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable
    )
}

struct LocalSocketListener {
    listener: interprocess::local_socket::Listener,
}

impl Listener for LocalSocketListener {
    fn accept(&self) -> io::Result<Arc<dyn Channel>> {
        let stream = self.listener.accept()?;
        Ok(Arc::new(LocalSocketChannel::new(stream)))
    }
}

struct LocalSocketChannel {
    stream: Stream,
    connected: AtomicBool,
}

impl LocalSocketChannel {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            connected: AtomicBool::new(true),
        }
    }
}

impl Channel for LocalSocketChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = &self.stream;
        match stream.read(buf) {
            Ok(0) => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut stream = &self.stream;
        stream.write_all(buf).inspect_err(|_| {
            self.connected.store(false, Ordering::SeqCst);
        })
    }

    fn flush(&self) -> io::Result<()> {
        let mut stream = &self.stream;
        stream.flush()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
