//! Client for the drift KV store.
//!
//! Speaks the line-delimited JSON protocol: one request object per line,
//! one response line back. [`KvClient`] talks to a single node;
//! [`ClusterClient`] fronts a primary/secondary cluster, discovering the
//! primary by scanning a port list and following `not_primary` hints.

pub mod client;

pub use client::{ClientError, ClusterClient, KvClient};
