use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use log::{debug, trace};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    channel::Channel,
    codec::{Bincode, Serializer},
    frame::{self, Frame},
};

use super::{IpcError, worker::Worker};

/// Ids are unique across every connection the process creates, whichever
/// side of a channel it sits on.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

type MessageHandler<T, S> = Box<dyn Fn(&Connection<T, S>, &T) + Send + Sync>;
type DisconnectHandler<T, S> = Box<dyn Fn(&Connection<T, S>) + Send + Sync>;
type ErrorHandler<T, S> = Box<dyn Fn(&Connection<T, S>, &IpcError) + Send + Sync>;

/// One established duplex link carrying typed messages.
///
/// A connection owns its channel exclusively. [`open`](Connection::open)
/// starts a reader thread and a writer thread; from then on the owner
/// interacts only through [`push`](Connection::push),
/// [`close`](Connection::close) and the registered callbacks. Cloning is
/// cheap and shares the same underlying link.
pub struct Connection<T, S = Bincode> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for Connection<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T, S> {
    id: u64,
    name: String,
    channel: Arc<dyn Channel>,
    serializer: S,
    queue: Mutex<VecDeque<T>>,
    wake: Condvar,
    disconnect_notified: AtomicBool,
    on_message: Mutex<Vec<MessageHandler<T, S>>>,
    on_disconnect: Mutex<Vec<DisconnectHandler<T, S>>>,
    on_error: Mutex<Vec<ErrorHandler<T, S>>>,
}

impl<T, S> Connection<T, S>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    S: Serializer,
{
    pub(crate) fn new(channel: Arc<dyn Channel>) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            inner: Arc::new(Inner {
                id,
                name: format!("Client {id}"),
                channel,
                serializer: S::default(),
                queue: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                disconnect_notified: AtomicBool::new(false),
                on_message: Mutex::new(Vec::new()),
                on_disconnect: Mutex::new(Vec::new()),
                on_error: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_connected(&self) -> bool {
        self.inner.channel.is_connected()
    }

    /// Registers a callback for inbound messages. Register before
    /// [`open`](Connection::open); invoked on the reader thread.
    pub fn on_message(&self, handler: impl Fn(&Connection<T, S>, &T) + Send + Sync + 'static) {
        self.inner.on_message.lock().unwrap().push(Box::new(handler));
    }

    /// Registers a callback fired exactly once when the link goes down,
    /// whether by [`close`](Connection::close), peer shutdown or a broken
    /// channel.
    pub fn on_disconnect(&self, handler: impl Fn(&Connection<T, S>) + Send + Sync + 'static) {
        self.inner
            .on_disconnect
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    /// Registers a callback for read, write and serialization failures.
    pub fn on_error(
        &self,
        handler: impl Fn(&Connection<T, S>, &IpcError) + Send + Sync + 'static,
    ) {
        self.inner.on_error.lock().unwrap().push(Box::new(handler));
    }

    /// Starts the reader and writer threads. Call at most once.
    pub fn open(&self) {
        let reader = self.clone();
        let reader_finish = self.clone();
        Worker::spawn(
            &format!("conn-{}-reader", self.id()),
            move || reader.read_loop(),
            move |result| reader_finish.finish_loop(result),
        );

        let writer = self.clone();
        let writer_finish = self.clone();
        Worker::spawn(
            &format!("conn-{}-writer", self.id()),
            move || writer.write_loop(),
            move |result| writer_finish.finish_loop(result),
        );
    }

    /// Queues `message` for delivery and wakes the writer thread. Never
    /// blocks; a push to a closed connection drops the message.
    pub fn push(&self, message: T) {
        if !self.inner.channel.is_connected() {
            trace!("dropping message pushed to closed connection {}", self.name());
            return;
        }
        self.inner.queue.lock().unwrap().push_back(message);
        self.inner.wake.notify_one();
    }

    /// Closes the channel and wakes the writer thread so both loops can
    /// exit. Idempotent and callable from any thread.
    pub fn close(&self) {
        self.inner.channel.close();
        // Notify under the queue lock: the writer checks the connected flag
        // and parks while holding it, so an unlocked notify could land
        // between the check and the wait and be lost.
        let _queue = self.inner.queue.lock().unwrap();
        self.inner.wake.notify_one();
    }

    fn read_loop(&self) -> Result<(), IpcError> {
        let inner = &self.inner;
        while inner.channel.is_connected() {
            match frame::read_frame(inner.channel.as_ref())? {
                Frame::EndOfStream => break,
                Frame::Payload(bytes) => {
                    let message: T = inner.serializer.from_bytes(&bytes)?;
                    for handler in inner.on_message.lock().unwrap().iter() {
                        handler(self, &message);
                    }
                }
            }
        }
        Ok(())
    }

    fn write_loop(&self) -> Result<(), IpcError> {
        let inner = &self.inner;
        loop {
            match self.next_outbound() {
                Some(message) => {
                    let bytes = inner.serializer.to_bytes(&message)?;
                    frame::write_frame(inner.channel.as_ref(), &bytes)?;
                }
                None => {
                    // Closed locally: tell the peer, so its blocked reader
                    // returns even on transports without half-close.
                    let _ = frame::write_end_of_stream(inner.channel.as_ref());
                    return Ok(());
                }
            }
        }
    }

    /// Blocks until a message is queued or the channel closes; `None` means
    /// the writer loop should exit.
    fn next_outbound(&self) -> Option<T> {
        let inner = &self.inner;
        let mut queue = inner.queue.lock().unwrap();
        loop {
            if !inner.channel.is_connected() {
                return None;
            }
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            queue = inner.wake.wait(queue).unwrap();
        }
    }

    /// Common tail of both loops: surface the failure if any, make sure the
    /// channel is closed on every exit path, and report the disconnect at
    /// most once.
    fn finish_loop(&self, result: Result<(), IpcError>) {
        if let Err(error) = result {
            for handler in self.inner.on_error.lock().unwrap().iter() {
                handler(self, &error);
            }
        }
        self.close();
        self.notify_disconnected();
    }

    fn notify_disconnected(&self) {
        if self.inner.disconnect_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("connection {} disconnected", self.name());
        for handler in self.inner.on_disconnect.lock().unwrap().iter() {
            handler(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory;
    use std::{
        io,
        sync::mpsc,
        thread,
        time::Duration,
    };

    /// Close only marks the flag, the way OS local sockets behave: the peer
    /// learns about teardown solely through the end-of-stream frame the
    /// writer loop emits on its way out.
    struct FlagCloseChannel {
        inner: Arc<memory::MemoryChannel>,
        connected: AtomicBool,
    }

    impl FlagCloseChannel {
        fn wrap(inner: Arc<memory::MemoryChannel>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                connected: AtomicBool::new(true),
            })
        }
    }

    impl Channel for FlagCloseChannel {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }

        fn write_all(&self, buf: &[u8]) -> io::Result<()> {
            self.inner.write_all(buf)
        }

        fn flush(&self) -> io::Result<()> {
            self.inner.flush()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    fn open_pair() -> (Connection<String>, Connection<String>) {
        let (a, b) = memory::pair();
        let left: Connection<String> = Connection::new(a);
        let right: Connection<String> = Connection::new(b);
        (left, right)
    }

    #[test]
    fn messages_arrive_in_push_order() {
        let (left, right) = open_pair();
        let (tx, rx) = mpsc::channel();
        right.on_message(move |_, message: &String| tx.send(message.clone()).unwrap());
        left.open();
        right.open();

        left.push("m1".to_string());
        left.push("m2".to_string());
        left.push("m3".to_string());

        for expected in ["m1", "m2", "m3"] {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), expected);
        }

        left.close();
        right.close();
    }

    #[test]
    fn both_directions_carry_messages() {
        let (left, right) = open_pair();
        let (ltx, lrx) = mpsc::channel();
        let (rtx, rrx) = mpsc::channel();
        left.on_message(move |_, m: &String| ltx.send(m.clone()).unwrap());
        right.on_message(move |_, m: &String| rtx.send(m.clone()).unwrap());
        left.open();
        right.open();

        left.push("to-right".to_string());
        right.push("to-left".to_string());

        assert_eq!(rrx.recv_timeout(Duration::from_secs(2)).unwrap(), "to-right");
        assert_eq!(lrx.recv_timeout(Duration::from_secs(2)).unwrap(), "to-left");

        left.close();
        right.close();
    }

    #[test]
    fn disconnect_fires_exactly_once_on_each_side() {
        let (left, right) = open_pair();
        let (ltx, lrx) = mpsc::channel();
        let (rtx, rrx) = mpsc::channel();
        left.on_disconnect(move |_| ltx.send(()).unwrap());
        right.on_disconnect(move |_| rtx.send(()).unwrap());
        left.open();
        right.open();

        left.close();

        assert!(lrx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rrx.recv_timeout(Duration::from_secs(2)).is_ok());
        // Both loops on each side have observed the teardown by now; a
        // second notification would already be queued.
        assert!(lrx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(rrx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn push_after_close_is_dropped() {
        let (left, right) = open_pair();
        let (tx, rx) = mpsc::channel();
        right.on_message(move |_, m: &String| tx.send(m.clone()).unwrap());
        left.open();
        right.open();

        left.close();
        left.push("late".to_string());

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        right.close();
    }

    #[test]
    fn close_wakes_a_writer_parked_on_a_flag_only_transport() {
        let (a, b) = memory::pair();
        let left: Connection<String> = Connection::new(FlagCloseChannel::wrap(a));
        let right: Connection<String> = Connection::new(b);

        let (ltx, lrx) = mpsc::channel();
        let (rtx, rrx) = mpsc::channel();
        left.on_disconnect(move |_| ltx.send(()).unwrap());
        right.on_disconnect(move |_| rtx.send(()).unwrap());
        left.open();
        right.open();

        // Let the writer park on the condvar before closing, so a lost
        // wake-up would leave it parked with no second nudge coming.
        thread::sleep(Duration::from_millis(50));
        left.close();

        assert!(lrx.recv_timeout(Duration::from_secs(3)).is_ok());
        assert!(rrx.recv_timeout(Duration::from_secs(3)).is_ok());
    }

    #[test]
    fn close_is_idempotent() {
        let (left, _right) = open_pair();
        left.open();
        left.close();
        left.close();
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let (a, b) = open_pair();
        assert_ne!(a.id(), b.id());
        let (c, d) = open_pair();
        assert!(c.id() > a.id() && c.id() > b.id());
        assert_ne!(c.id(), d.id());
    }
}
