#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
//! Secure client/server connections with reliable-ordered messaging over
//! UDP.
//!
//! A backend which shares a signing key with the game servers issues each
//! player a connect token. The player's [`Client`] hands that token to one
//! of the servers listed inside it, answers the server's challenge, and is
//! then assigned a slot on the [`Server`]. From then on both sides exchange
//! messages, either reliably and in order or as fire-and-forget datagrams.
//!
//! This crate re-exports the layers that make this up:
//! - [`transport`]: sans-IO acks, fragmentation and reliable delivery
//! - [`io`]: the [`DatagramSocket`] abstraction and its implementations
//! - [`protocol`]: connect tokens, the encrypted handshake, and the client
//!   and server
//!
//! [`Client`]: protocol::client::Client
//! [`Server`]: protocol::server::Server
//! [`DatagramSocket`]: io::DatagramSocket

pub use {tidewire_io as io, tidewire_protocol as protocol, tidewire_transport as transport};

pub use tidewire_protocol::{
    client::{Client, ClientConfig, ClientState},
    server::{Server, ServerConfig, ServerEvent},
};
