//! drift KV server.
//!
//! Line-delimited JSON protocol over TCP, a durable engine underneath, and
//! two replication modes over the same log substrate: primary/secondary
//! with bounded leader election, and leaderless last-writer-wins.

pub mod bootstrap;
pub mod cluster;
pub mod index;
pub mod protocol;
pub mod server;

pub use bootstrap::{NodeHandle, SingleConfig};
pub use server::{KvServer, WriteError, WritePath};
