pub mod channel;
pub mod codec;
pub mod frame;
pub mod ipc;

pub use channel::{Channel, Listener, LocalSocketTransport, MemoryTransport, Transport};
pub use codec::{Bincode, CodecError, Json, Serializer};
pub use frame::Frame;
pub use ipc::{Client, Connection, IpcError, Server, Target};
