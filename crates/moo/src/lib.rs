//! MOO server transport: per-user TCP connections with line reassembly,
//! multiplexed behind one client.

pub mod client;
pub mod connection;
pub mod error;
pub mod identity;

pub use {
    client::MooClient,
    connection::Connection,
    error::TransportError,
    identity::{PassthroughResolver, PlayerResolver, UnresolvedPlayers},
};
