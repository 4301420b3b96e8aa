#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
//! Secure client/server connection protocol for `tidewire`.
//!
//! # Connecting
//!
//! A client can only connect to a server with a *connect token*. Tokens are
//! created by a trusted backend which shares a [`SecretKey`] with the game
//! servers, using [`generate_connect_token`], and handed to the client over
//! some secure channel (e.g. HTTPS). The token lists which servers the client
//! may connect to, carries the keys the connection will be encrypted with,
//! and holds a signed and encrypted section which only servers can read.
//!
//! The handshake then goes:
//! 1. client sends the connect token packet to the server
//! 2. server validates it and replies with an encrypted challenge
//! 3. client sends the challenge back
//! 4. server allocates a slot and accepts the client
//!
//! See [`client::Client`] and [`server::Server`].
//!
//! # Packets
//!
//! Every packet apart from the connect token is encrypted and authenticated
//! with the keys from the token (see [`packet`]). Once connected, packets
//! carry [`tidewire_transport`] packets, so messages can be sent reliably and
//! in order.
//!
//! [`SecretKey`]: crypto::SecretKey
//! [`generate_connect_token`]: token::generate_connect_token

pub mod client;
pub mod crypto;
mod link;
pub mod packet;
pub mod replay;
pub mod server;
pub mod token;

use core::time::Duration;

/// Version string at the start of every connect token and in the associated
/// data of every encrypted packet.
pub const VERSION_INFO: &[u8; VERSION_INFO_SIZE] = b"TIDE 1.00\0";

/// Length of [`VERSION_INFO`].
pub const VERSION_INFO_SIZE: usize = 10;

/// Largest datagram the protocol sends or accepts.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Largest payload a single encrypted payload packet can carry.
///
/// This is exactly one [`tidewire_transport`] packet.
pub const MAX_PAYLOAD_SIZE: usize = tidewire_transport::MAX_PACKET_LEN;

/// Maximum number of clients a server can hold.
pub const MAX_CLIENTS: usize = 32;

/// Maximum number of server endpoints in a connect token.
pub const MAX_SERVERS_PER_CONNECT: usize = 32;

/// Length of the opaque user data in a connect token.
pub const USER_DATA_SIZE: usize = 256;

/// Number of redundant disconnect packets sent when a connection is closed
/// cleanly.
pub const DISCONNECT_REDUNDANCY: usize = 10;

/// How often a client resends its current handshake packet.
pub const HANDSHAKE_SEND_INTERVAL: Duration = Duration::from_millis(100);

/// How often an idle connection sends a keepalive packet.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(100);
