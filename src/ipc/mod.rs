//! Message-oriented IPC engine.
//!
//! This module turns the byte channels of [`crate::channel`] into typed,
//! event-driven connections between one [`Server`] and many [`Client`]s.
//!
//! # Overview
//!
//! A server listens on a well-known channel name. Each arriving client is
//! handed the name of a freshly allocated private channel through a short
//! handshake, then both sides wrap the private channel in a [`Connection`]
//! that runs an independent reader and writer thread. Messages are
//! length-prefix framed ([`crate::frame`]) and serialized through a
//! pluggable codec ([`crate::codec`]).
//!
//! # Key components
//!
//! - [`Connection`]: one established link; outbound FIFO queue, message,
//!   disconnect and error callbacks.
//! - [`Server`]: accept loop, live-connection registry, broadcast and
//!   addressed delivery via [`Target`].
//! - [`Client`]: connect/handshake routine with optional automatic
//!   reconnection and blocking `wait_for_*` synchronization helpers.
//!
//! # Delivery semantics
//!
//! Messages pushed on one connection arrive in push order; nothing is
//! guaranteed across connections. A disconnect is reported exactly once per
//! connection no matter which loop notices it first. Pushing to a closed or
//! not-yet-open connection silently drops the message.

mod client;
mod connection;
mod handshake;
mod server;
mod signal;
mod worker;

pub use client::Client;
pub use connection::Connection;
pub use server::{Server, Target};

use std::io;

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
