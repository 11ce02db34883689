//! Relay rendezvous: the private-node client that keeps reservations alive
//! and the public server that accepts them.

pub mod client;
pub mod server;
