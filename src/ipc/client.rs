use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{info, trace, warn};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    channel::{LocalSocketTransport, Transport},
    codec::{Bincode, Serializer},
};

use super::{Connection, IpcError, handshake, signal::Signal, worker::Worker};

type ConnectionHandler<T, S> = Box<dyn Fn(&Connection<T, S>) + Send + Sync>;
type ServerMessageHandler<T, S> = Box<dyn Fn(&Connection<T, S>, &T) + Send + Sync>;
type ClientErrorHandler = Box<dyn Fn(&IpcError) + Send + Sync>;

/// Connects to a [`Server`](super::Server) by its well-known name.
///
/// [`start`](Client::start) runs the handshake on a background thread. When
/// the link later breaks, the client reconnects by itself unless auto
/// reconnection is disabled or [`stop`](Client::stop) was called.
pub struct Client<T, S = Bincode> {
    inner: Arc<ClientInner<T, S>>,
}

impl<T, S> Clone for Client<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<T, S> {
    pipe_name: String,
    transport: Arc<dyn Transport>,
    serializer: S,
    auto_reconnect: AtomicBool,
    reconnect_delay: Mutex<Duration>,
    connection: Mutex<Option<Connection<T, S>>>,
    closed_explicitly: AtomicBool,
    connected: Signal,
    disconnected: Signal,
    on_connected: Mutex<Vec<ConnectionHandler<T, S>>>,
    on_disconnected: Mutex<Vec<ConnectionHandler<T, S>>>,
    on_server_message: Mutex<Vec<ServerMessageHandler<T, S>>>,
    on_error: Mutex<Vec<ClientErrorHandler>>,
}

impl<T> Client<T, Bincode>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// A client over OS local sockets with the default binary codec.
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self::with_transport(pipe_name, Arc::new(LocalSocketTransport))
    }
}

impl<T, S> Client<T, S>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    S: Serializer,
{
    pub fn with_transport(pipe_name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                pipe_name: pipe_name.into(),
                transport,
                serializer: S::default(),
                auto_reconnect: AtomicBool::new(true),
                reconnect_delay: Mutex::new(Duration::ZERO),
                connection: Mutex::new(None),
                closed_explicitly: AtomicBool::new(false),
                connected: Signal::new(),
                disconnected: Signal::new(),
                on_connected: Mutex::new(Vec::new()),
                on_disconnected: Mutex::new(Vec::new()),
                on_server_message: Mutex::new(Vec::new()),
                on_error: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.inner.pipe_name
    }

    /// Whether the client reconnects on its own after losing the link.
    /// Enabled by default.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// How long to wait before a reconnection attempt. Zero by default.
    pub fn set_reconnect_delay(&self, delay: Duration) {
        *self.inner.reconnect_delay.lock().unwrap() = delay;
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(Connection::is_connected)
    }

    pub fn on_connected(&self, handler: impl Fn(&Connection<T, S>) + Send + Sync + 'static) {
        self.inner
            .on_connected
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    pub fn on_disconnected(&self, handler: impl Fn(&Connection<T, S>) + Send + Sync + 'static) {
        self.inner
            .on_disconnected
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    pub fn on_server_message(
        &self,
        handler: impl Fn(&Connection<T, S>, &T) + Send + Sync + 'static,
    ) {
        self.inner
            .on_server_message
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(&IpcError) + Send + Sync + 'static) {
        self.inner.on_error.lock().unwrap().push(Box::new(handler));
    }

    /// Runs the handshake on a background thread and returns immediately,
    /// usually before the connection exists. Use
    /// [`wait_for_connection`](Client::wait_for_connection) or
    /// [`on_connected`](Client::on_connected) to synchronize.
    pub fn start(&self) {
        self.inner.closed_explicitly.store(false, Ordering::SeqCst);
        let client = self.clone();
        let on_finish = self.clone();
        Worker::spawn(
            &format!("{}-connect", self.inner.pipe_name),
            move || client.connect_once(),
            move |result| {
                if let Err(error) = result {
                    warn!(
                        "connecting to {} failed: {error}",
                        on_finish.inner.pipe_name
                    );
                    on_finish.fire_error(&error);
                    on_finish.maybe_reconnect();
                }
            },
        );
    }

    /// Forwards `message` to the server. Dropped silently when not
    /// connected.
    pub fn push_message(&self, message: T) {
        let connection = self.inner.connection.lock().unwrap();
        match connection.as_ref() {
            Some(connection) => connection.push(message),
            None => trace!(
                "dropping message pushed before {} connected",
                self.inner.pipe_name
            ),
        }
    }

    /// Closes the connection and suppresses reconnection.
    pub fn stop(&self) {
        self.inner.closed_explicitly.store(true, Ordering::SeqCst);
        let connection = self.inner.connection.lock().unwrap().clone();
        if let Some(connection) = connection {
            connection.close();
        }
    }

    /// Blocks until the next successful connection.
    pub fn wait_for_connection(&self) {
        self.inner.connected.wait();
    }

    /// Blocks until the next successful connection or the timeout; returns
    /// whether the connection happened.
    pub fn wait_for_connection_timeout(&self, timeout: Duration) -> bool {
        self.inner.connected.wait_timeout(timeout)
    }

    /// Blocks until the next disconnection.
    pub fn wait_for_disconnection(&self) {
        self.inner.disconnected.wait();
    }

    /// Blocks until the next disconnection or the timeout; returns whether
    /// the disconnection happened.
    pub fn wait_for_disconnection_timeout(&self, timeout: Duration) -> bool {
        self.inner.disconnected.wait_timeout(timeout)
    }

    fn connect_once(&self) -> Result<(), IpcError> {
        let inner = &self.inner;
        let channel = handshake::connect(
            inner.transport.as_ref(),
            &inner.pipe_name,
            &inner.serializer,
            handshake::CONNECT_TIMEOUT,
        )?;

        let connection: Connection<T, S> = Connection::new(channel);
        let weak = Arc::downgrade(&self.inner);
        connection.on_message({
            let weak = weak.clone();
            move |conn, message| {
                if let Some(client) = upgrade(&weak) {
                    client.fire_server_message(conn, message);
                }
            }
        });
        connection.on_disconnect({
            let weak = weak.clone();
            move |conn| {
                if let Some(client) = upgrade(&weak) {
                    client.handle_disconnected(conn);
                }
            }
        });
        connection.on_error({
            let weak = weak.clone();
            move |_conn, error| {
                if let Some(client) = upgrade(&weak) {
                    client.fire_error(error);
                }
            }
        });

        *inner.connection.lock().unwrap() = Some(connection.clone());
        connection.open();

        info!("connected to {} as {}", inner.pipe_name, connection.name());
        for handler in inner.on_connected.lock().unwrap().iter() {
            handler(&connection);
        }
        inner.connected.set();
        Ok(())
    }

    fn handle_disconnected(&self, connection: &Connection<T, S>) {
        for handler in self.inner.on_disconnected.lock().unwrap().iter() {
            handler(connection);
        }
        self.inner.disconnected.set();
        self.maybe_reconnect();
    }

    fn maybe_reconnect(&self) {
        let inner = &self.inner;
        if !inner.auto_reconnect.load(Ordering::SeqCst)
            || inner.closed_explicitly.load(Ordering::SeqCst)
        {
            return;
        }
        let delay = *inner.reconnect_delay.lock().unwrap();
        thread::sleep(delay);
        if !inner.closed_explicitly.load(Ordering::SeqCst) {
            info!("reconnecting to {}", inner.pipe_name);
            self.start();
        }
    }

    fn fire_server_message(&self, connection: &Connection<T, S>, message: &T) {
        for handler in self.inner.on_server_message.lock().unwrap().iter() {
            handler(connection, message);
        }
    }

    fn fire_error(&self, error: &IpcError) {
        for handler in self.inner.on_error.lock().unwrap().iter() {
            handler(error);
        }
    }
}

fn upgrade<T, S>(weak: &Weak<ClientInner<T, S>>) -> Option<Client<T, S>> {
    weak.upgrade().map(|inner| Client { inner })
}
