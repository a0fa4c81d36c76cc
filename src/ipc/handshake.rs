//! The rendezvous handshake.
//!
//! A single well-known name cannot serve many concurrent clients on its own,
//! so every arrival is traded up: the server greets the client on the
//! well-known channel with the name of a freshly allocated private channel,
//! both sides drop the rendezvous channel, and the private channel becomes
//! the connection. One extra round trip buys unbounded concurrent clients.

use std::{io, sync::Arc, time::Duration};

use log::debug;

use crate::{
    channel::{Channel, Listener, Transport},
    codec::Serializer,
    frame::{self, Frame},
};

use super::IpcError;

/// How long connect attempts wait for a name to be bound before giving up.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Server half: greet the next client on the rendezvous listener and move it
/// to the private channel `private_name`.
///
/// Any failure closes whatever was opened so far and returns the error; the
/// caller decides whether to keep accepting.
pub(crate) fn accept<S: Serializer>(
    transport: &dyn Transport,
    listener: &dyn Listener,
    serializer: &S,
    private_name: &str,
) -> Result<Arc<dyn Channel>, IpcError> {
    let rendezvous = listener.accept()?;
    let greeted = greet(rendezvous.as_ref(), serializer, private_name);
    rendezvous.close();
    greeted?;

    let private = transport.bind(private_name)?;
    let channel = private.accept()?;
    debug!("client moved to private channel {private_name}");
    Ok(channel)
}

fn greet<S: Serializer>(
    rendezvous: &dyn Channel,
    serializer: &S,
    private_name: &str,
) -> Result<(), IpcError> {
    let bytes = serializer.to_bytes(&private_name)?;
    frame::write_frame(rendezvous, &bytes)?;
    Ok(())
}

/// Client half: learn the private channel name on the well-known channel,
/// then connect to it.
pub(crate) fn connect<S: Serializer>(
    transport: &dyn Transport,
    well_known_name: &str,
    serializer: &S,
    timeout: Duration,
) -> Result<Arc<dyn Channel>, IpcError> {
    let rendezvous = transport.connect(well_known_name, timeout)?;
    let greeting = read_greeting(rendezvous.as_ref(), serializer);
    rendezvous.close();
    let private_name = greeting?;

    debug!("moving to private channel {private_name}");
    let channel = transport.connect(&private_name, timeout)?;
    Ok(channel)
}

fn read_greeting<S: Serializer>(
    rendezvous: &dyn Channel,
    serializer: &S,
) -> Result<String, IpcError> {
    match frame::read_frame(rendezvous)? {
        Frame::Payload(bytes) => Ok(serializer.from_bytes(&bytes)?),
        Frame::EndOfStream => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "server closed the rendezvous channel before sending a private name",
        )
        .into()),
    }
}
