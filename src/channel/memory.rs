use std::{
    cmp,
    collections::HashMap,
    io,
    sync::{
        Arc, Condvar, Mutex, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use super::{Channel, Listener, Transport};

/// In-process channel transport.
///
/// Channels are pairs of byte queues, names live in a registry private to
/// the transport instance. Connecting blocks on a condition variable until
/// the name is bound or the timeout elapses, so tests never race the server
/// bind. Server and client must share the same (cloned) transport.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<HashMap<String, mpsc::Sender<Arc<MemoryChannel>>>>,
    bound: Condvar,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for MemoryTransport {
    fn bind(&self, name: &str) -> io::Result<Box<dyn Listener>> {
        let mut entries = self.registry.entries.lock().unwrap();
        if entries.contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("channel name {name:?} is already bound"),
            ));
        }
        let (pending, incoming) = mpsc::channel();
        entries.insert(name.to_string(), pending);
        self.registry.bound.notify_all();
        Ok(Box::new(MemoryListener {
            name: name.to_string(),
            incoming,
            registry: Arc::clone(&self.registry),
        }))
    }

    fn connect(&self, name: &str, timeout: Duration) -> io::Result<Arc<dyn Channel>> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.registry.entries.lock().unwrap();
        loop {
            if let Some(pending) = entries.get(name) {
                let (ours, theirs) = pair();
                if pending.send(theirs).is_ok() {
                    return Ok(ours);
                }
                // Listener dropped without unbinding; treat as stale.
                entries.remove(name);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no listener bound to channel name {name:?}"),
                ));
            }
            let (guard, _) = self
                .registry
                .bound
                .wait_timeout(entries, deadline - now)
                .unwrap();
            entries = guard;
        }
    }
}

struct MemoryListener {
    name: String,
    incoming: mpsc::Receiver<Arc<MemoryChannel>>,
    registry: Arc<Registry>,
}

impl Listener for MemoryListener {
    fn accept(&self) -> io::Result<Arc<dyn Channel>> {
        self.incoming
            .recv()
            .map(|channel| -> Arc<dyn Channel> { channel })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "listener torn down"))
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.registry.entries.lock().unwrap().remove(&self.name);
    }
}

/// Builds a connected pair of in-memory channels.
pub(crate) fn pair() -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        Arc::new(MemoryChannel::new(a_tx, a_rx)),
        Arc::new(MemoryChannel::new(b_tx, b_rx)),
    )
}

pub(crate) struct MemoryChannel {
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    inbound: Mutex<Inbox>,
    connected: AtomicBool,
}

struct Inbox {
    receiver: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl MemoryChannel {
    fn new(outbound: mpsc::Sender<Vec<u8>>, inbound: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Inbox {
                receiver: inbound,
                pending: Vec::new(),
                offset: 0,
            }),
            connected: AtomicBool::new(true),
        }
    }
}

impl Channel for MemoryChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inbox = self.inbound.lock().unwrap();
        if inbox.offset >= inbox.pending.len() {
            match inbox.receiver.recv() {
                Ok(bytes) => {
                    inbox.pending = bytes;
                    inbox.offset = 0;
                }
                // Peer dropped its sending half: end of stream.
                Err(mpsc::RecvError) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Ok(0);
                }
            }
        }
        let n = cmp::min(buf.len(), inbox.pending.len() - inbox.offset);
        buf[..n].copy_from_slice(&inbox.pending[inbox.offset..inbox.offset + n]);
        inbox.offset += n;
        Ok(n)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let outbound = self.outbound.lock().unwrap();
        let sender = outbound
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))?;
        sender.send(buf.to_vec()).map_err(|_| {
            self.connected.store(false, Ordering::SeqCst);
            io::Error::new(io::ErrorKind::BrokenPipe, "peer closed the channel")
        })
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the sender gives the peer's blocked read an end of stream.
        self.outbound.lock().unwrap().take();
    }
}
