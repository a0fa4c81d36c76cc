use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use log::{info, warn};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    channel::{Channel, LocalSocketTransport, Transport},
    codec::{Bincode, Serializer},
};

use super::{Client, Connection, IpcError, handshake, worker::Worker};

/// How long [`Server::stop`] waits for the wake-up client to connect and
/// disconnect.
const STOP_WAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Selects which connections an addressed push goes to. Matching is exact;
/// a target that matches nothing makes the push a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Id(u64),
    Name(String),
    Ids(Vec<u64>),
    Names(Vec<String>),
}

impl Target {
    fn matches(&self, id: u64, name: &str) -> bool {
        match self {
            Target::Id(target) => *target == id,
            Target::Name(target) => target == name,
            Target::Ids(targets) => targets.contains(&id),
            Target::Names(targets) => targets.iter().any(|t| t == name),
        }
    }
}

impl From<u64> for Target {
    fn from(id: u64) -> Self {
        Target::Id(id)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

impl From<Vec<u64>> for Target {
    fn from(ids: Vec<u64>) -> Self {
        Target::Ids(ids)
    }
}

impl From<&[u64]> for Target {
    fn from(ids: &[u64]) -> Self {
        Target::Ids(ids.to_vec())
    }
}

impl From<Vec<String>> for Target {
    fn from(names: Vec<String>) -> Self {
        Target::Names(names)
    }
}

impl From<Vec<&str>> for Target {
    fn from(names: Vec<&str>) -> Self {
        Target::Names(names.into_iter().map(str::to_string).collect())
    }
}

type ConnectionHandler<T, S> = Box<dyn Fn(&Connection<T, S>) + Send + Sync>;
type ClientMessageHandler<T, S> = Box<dyn Fn(&Connection<T, S>, &T) + Send + Sync>;
type ServerErrorHandler = Box<dyn Fn(&IpcError) + Send + Sync>;

/// Listens on a well-known channel name and serves many concurrent clients.
///
/// Each accepted client lives in the connection registry until it
/// disconnects; broadcast and addressed pushes go through the registry under
/// a single lock, so "connected clients" and "push recipients" never
/// diverge.
pub struct Server<T, S = Bincode> {
    inner: Arc<ServerInner<T, S>>,
}

impl<T, S> Clone for Server<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServerInner<T, S> {
    pipe_name: String,
    transport: Arc<dyn Transport>,
    serializer: S,
    next_pipe_id: AtomicU32,
    connections: Mutex<HashMap<u64, Connection<T, S>>>,
    running: AtomicBool,
    on_client_connected: Mutex<Vec<ConnectionHandler<T, S>>>,
    on_client_disconnected: Mutex<Vec<ConnectionHandler<T, S>>>,
    on_client_message: Mutex<Vec<ClientMessageHandler<T, S>>>,
    on_error: Mutex<Vec<ServerErrorHandler>>,
}

impl<T> Server<T, Bincode>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// A server over OS local sockets with the default binary codec.
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self::with_transport(pipe_name, Arc::new(LocalSocketTransport))
    }
}

impl<T, S> Server<T, S>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    S: Serializer,
{
    pub fn with_transport(pipe_name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                pipe_name: pipe_name.into(),
                transport,
                serializer: S::default(),
                next_pipe_id: AtomicU32::new(0),
                connections: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                on_client_connected: Mutex::new(Vec::new()),
                on_client_disconnected: Mutex::new(Vec::new()),
                on_client_message: Mutex::new(Vec::new()),
                on_error: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.inner.pipe_name
    }

    pub fn on_client_connected(
        &self,
        handler: impl Fn(&Connection<T, S>) + Send + Sync + 'static,
    ) {
        self.inner
            .on_client_connected
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    pub fn on_client_disconnected(
        &self,
        handler: impl Fn(&Connection<T, S>) + Send + Sync + 'static,
    ) {
        self.inner
            .on_client_disconnected
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    pub fn on_client_message(
        &self,
        handler: impl Fn(&Connection<T, S>, &T) + Send + Sync + 'static,
    ) {
        self.inner
            .on_client_message
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(&IpcError) + Send + Sync + 'static) {
        self.inner.on_error.lock().unwrap().push(Box::new(handler));
    }

    /// Starts the accept loop on a background thread and returns
    /// immediately.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        let server = self.clone();
        let on_finish = self.clone();
        Worker::spawn(
            &format!("{}-accept", self.inner.pipe_name),
            move || server.accept_loop(),
            move |result| {
                if let Err(error) = result {
                    warn!("accept loop on {} ended: {error}", on_finish.inner.pipe_name);
                    on_finish.fire_error(&error);
                }
            },
        );
    }

    /// Broadcasts `message` to every connected client.
    pub fn push_message(&self, message: T)
    where
        T: Clone,
    {
        let connections = self.inner.connections.lock().unwrap();
        for connection in connections.values() {
            connection.push(message.clone());
        }
    }

    /// Pushes `message` only to the connections matching `target`.
    pub fn push_message_to(&self, message: T, target: impl Into<Target>)
    where
        T: Clone,
    {
        let target = target.into();
        let connections = self.inner.connections.lock().unwrap();
        for connection in connections.values() {
            if target.matches(connection.id(), connection.name()) {
                connection.push(message.clone());
            }
        }
    }

    /// Ids of the currently registered connections.
    pub fn connection_ids(&self) -> Vec<u64> {
        self.inner.connections.lock().unwrap().keys().copied().collect()
    }

    /// Stops accepting, closes every client connection, and unblocks the
    /// accept loop by briefly connecting to our own well-known name.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let connections: Vec<Connection<T, S>> = {
            let registry = self.inner.connections.lock().unwrap();
            registry.values().cloned().collect()
        };
        for connection in &connections {
            connection.close();
        }

        // The accept loop sits in a blocking accept on the well-known name;
        // a throwaway local client gets it moving again so it can observe
        // the cleared running flag and exit.
        let wake: Client<T, S> =
            Client::with_transport(&self.inner.pipe_name, Arc::clone(&self.inner.transport));
        wake.start();
        wake.wait_for_connection_timeout(STOP_WAKE_TIMEOUT);
        wake.stop();
        wake.wait_for_disconnection_timeout(STOP_WAKE_TIMEOUT);
        info!("server on {} stopped", self.inner.pipe_name);
    }

    fn accept_loop(&self) -> Result<(), IpcError> {
        let inner = &self.inner;
        let listener = inner.transport.bind(&inner.pipe_name)?;
        info!("listening on {}", inner.pipe_name);

        while inner.running.load(Ordering::SeqCst) {
            let private_name = self.next_private_name();
            match handshake::accept(
                inner.transport.as_ref(),
                listener.as_ref(),
                &inner.serializer,
                &private_name,
            ) {
                Ok(channel) => self.register(channel),
                Err(error) => {
                    // One failed handshake must not take the accept loop
                    // down with it.
                    warn!("handshake on {} failed: {error}", inner.pipe_name);
                    self.fire_error(&error);
                }
            }
        }
        Ok(())
    }

    fn next_private_name(&self) -> String {
        let n = self.inner.next_pipe_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_{n}", self.inner.pipe_name)
    }

    fn register(&self, channel: Arc<dyn Channel>) {
        let connection: Connection<T, S> = Connection::new(channel);
        let weak = Arc::downgrade(&self.inner);

        connection.on_message({
            let weak = weak.clone();
            move |conn, message| {
                if let Some(server) = upgrade(&weak) {
                    server.fire_client_message(conn, message);
                }
            }
        });
        connection.on_disconnect({
            let weak = weak.clone();
            move |conn| {
                if let Some(server) = upgrade(&weak) {
                    server.unregister(conn);
                }
            }
        });
        connection.on_error({
            let weak = weak.clone();
            move |_conn, error| {
                if let Some(server) = upgrade(&weak) {
                    server.fire_error(error);
                }
            }
        });

        self.inner
            .connections
            .lock()
            .unwrap()
            .insert(connection.id(), connection.clone());
        connection.open();

        info!("{} connected on {}", connection.name(), self.inner.pipe_name);
        for handler in self.inner.on_client_connected.lock().unwrap().iter() {
            handler(&connection);
        }
    }

    fn unregister(&self, connection: &Connection<T, S>) {
        let removed = self
            .inner
            .connections
            .lock()
            .unwrap()
            .remove(&connection.id());
        if removed.is_some() {
            info!(
                "{} disconnected from {}",
                connection.name(),
                self.inner.pipe_name
            );
            for handler in self.inner.on_client_disconnected.lock().unwrap().iter() {
                handler(connection);
            }
        }
    }

    fn fire_client_message(&self, connection: &Connection<T, S>, message: &T) {
        for handler in self.inner.on_client_message.lock().unwrap().iter() {
            handler(connection, message);
        }
    }

    fn fire_error(&self, error: &IpcError) {
        for handler in self.inner.on_error.lock().unwrap().iter() {
            handler(error);
        }
    }
}

fn upgrade<T, S>(weak: &Weak<ServerInner<T, S>>) -> Option<Server<T, S>> {
    weak.upgrade().map(|inner| Server { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryTransport;
    use std::{sync::mpsc, thread, time::Duration};

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(300);

    fn start_server(
        transport: &MemoryTransport,
        name: &str,
    ) -> (Server<String>, mpsc::Receiver<(u64, String, String)>) {
        let server: Server<String> =
            Server::with_transport(name, Arc::new(transport.clone()));
        let (tx, rx) = mpsc::channel();
        server.on_client_message(move |conn, message| {
            tx.send((conn.id(), conn.name().to_string(), message.clone()))
                .unwrap();
        });
        server.start();
        (server, rx)
    }

    fn start_client(
        transport: &MemoryTransport,
        name: &str,
    ) -> (Client<String>, mpsc::Receiver<String>) {
        let client: Client<String> =
            Client::with_transport(name, Arc::new(transport.clone()));
        client.set_auto_reconnect(false);
        let (tx, rx) = mpsc::channel();
        client.on_server_message(move |_, message| tx.send(message.clone()).unwrap());
        client.start();
        assert!(client.wait_for_connection_timeout(WAIT));
        (client, rx)
    }

    #[test]
    fn client_message_reaches_only_the_server() {
        let transport = MemoryTransport::new();
        let (server, server_rx) = start_server(&transport, "test_pipe");
        let (client1, client1_rx) = start_client(&transport, "test_pipe");
        let (_client2, client2_rx) = start_client(&transport, "test_pipe");

        client1.push_message("hello".to_string());

        let (_, _, message) = server_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(message, "hello");
        assert!(client1_rx.recv_timeout(QUIET).is_err());
        assert!(client2_rx.recv_timeout(QUIET).is_err());

        server.stop();
    }

    #[test]
    fn broadcast_reaches_every_connected_client() {
        let transport = MemoryTransport::new();
        let (server, _server_rx) = start_server(&transport, "bcast_pipe");
        let (_c1, rx1) = start_client(&transport, "bcast_pipe");
        let (_c2, rx2) = start_client(&transport, "bcast_pipe");
        let (_c3, rx3) = start_client(&transport, "bcast_pipe");

        server.push_message("fanout".to_string());

        for rx in [&rx1, &rx2, &rx3] {
            assert_eq!(rx.recv_timeout(WAIT).unwrap(), "fanout");
        }

        server.stop();
    }

    #[test]
    fn targeted_push_is_isolated_to_its_target() {
        let transport = MemoryTransport::new();
        let (server, server_rx) = start_server(&transport, "target_pipe");
        let (client1, rx1) = start_client(&transport, "target_pipe");
        let (_client2, rx2) = start_client(&transport, "target_pipe");

        // Learn client1's server-side id by having it speak first.
        client1.push_message("who am I".to_string());
        let (id1, name1, _) = server_rx.recv_timeout(WAIT).unwrap();

        server.push_message_to("by id".to_string(), id1);
        assert_eq!(rx1.recv_timeout(WAIT).unwrap(), "by id");
        assert!(rx2.recv_timeout(QUIET).is_err());

        server.push_message_to("by name".to_string(), name1.as_str());
        assert_eq!(rx1.recv_timeout(WAIT).unwrap(), "by name");
        assert!(rx2.recv_timeout(QUIET).is_err());

        server.push_message_to("by id list".to_string(), vec![id1, id1]);
        assert_eq!(rx1.recv_timeout(WAIT).unwrap(), "by id list");
        assert!(rx2.recv_timeout(QUIET).is_err());

        server.push_message_to("by name list".to_string(), vec![name1.clone()]);
        assert_eq!(rx1.recv_timeout(WAIT).unwrap(), "by name list");
        assert!(rx2.recv_timeout(QUIET).is_err());

        server.stop();
    }

    #[test]
    fn unmatched_target_is_a_silent_no_op() {
        let transport = MemoryTransport::new();
        let (server, _server_rx) = start_server(&transport, "miss_pipe");
        let (_client, rx) = start_client(&transport, "miss_pipe");

        server.push_message_to("nobody home".to_string(), "no such client");
        assert!(rx.recv_timeout(QUIET).is_err());

        server.stop();
    }

    #[test]
    fn concurrent_clients_get_distinct_ids() {
        let transport = MemoryTransport::new();
        let server: Server<String> =
            Server::with_transport("ids_pipe", Arc::new(transport.clone()));
        let (connected_tx, connected_rx) = mpsc::channel();
        server.on_client_connected(move |conn| connected_tx.send(conn.id()).unwrap());
        server.start();

        let clients: Vec<_> = (0..4)
            .map(|_| {
                let transport = transport.clone();
                thread::spawn(move || {
                    let client: Client<String> =
                        Client::with_transport("ids_pipe", Arc::new(transport));
                    client.set_auto_reconnect(false);
                    client.start();
                    assert!(client.wait_for_connection_timeout(WAIT));
                    client
                })
            })
            .collect();
        let clients: Vec<_> = clients.into_iter().map(|h| h.join().unwrap()).collect();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(connected_rx.recv_timeout(WAIT).unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert_eq!(server.connection_ids().len(), 4);

        drop(clients);
        server.stop();
    }

    #[test]
    fn disconnect_event_fires_once_and_empties_the_registry() {
        let transport = MemoryTransport::new();
        let (server, _server_rx) = start_server(&transport, "dc_pipe");
        let (disc_tx, disc_rx) = mpsc::channel();
        server.on_client_disconnected(move |conn| disc_tx.send(conn.id()).unwrap());

        let (client, _rx) = start_client(&transport, "dc_pipe");
        client.stop();

        let gone = disc_rx.recv_timeout(WAIT).unwrap();
        assert!(disc_rx.recv_timeout(QUIET).is_err());
        assert!(!server.connection_ids().contains(&gone));

        server.stop();
    }

    #[test]
    fn stop_unblocks_the_accept_loop_and_closes_clients() {
        let transport = MemoryTransport::new();
        let (server, _server_rx) = start_server(&transport, "stop_pipe");
        let (disc_tx, disc_rx) = mpsc::channel();
        server.on_client_disconnected(move |conn| disc_tx.send(conn.id()).unwrap());
        let (client, _rx) = start_client(&transport, "stop_pipe");

        server.stop();
        assert!(client.wait_for_disconnection_timeout(WAIT));

        // Two unregistrations: our client and the internal wake-up client.
        disc_rx.recv_timeout(WAIT).unwrap();
        disc_rx.recv_timeout(WAIT).unwrap();
        assert!(server.connection_ids().is_empty());

        // The well-known name is free again once the accept loop exits; the
        // loop drops the listener on a worker thread, so allow a beat.
        let deadline = std::time::Instant::now() + WAIT;
        loop {
            match transport.bind("stop_pipe") {
                Ok(_) => break,
                Err(_) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("accept loop kept the name bound: {e}"),
            }
        }
    }

    #[test]
    fn json_codec_works_end_to_end() {
        use crate::codec::Json;

        let transport = MemoryTransport::new();
        let server: Server<String, Json> =
            Server::with_transport("json_pipe", Arc::new(transport.clone()));
        let (tx, rx) = mpsc::channel();
        server.on_client_message(move |_, message| tx.send(message.clone()).unwrap());
        server.start();

        let client: Client<String, Json> =
            Client::with_transport("json_pipe", Arc::new(transport));
        client.set_auto_reconnect(false);
        client.start();
        assert!(client.wait_for_connection_timeout(WAIT));

        client.push_message("structured".to_string());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "structured");

        server.stop();
    }
}
