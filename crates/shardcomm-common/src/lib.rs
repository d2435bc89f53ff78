//! Shardcomm Common Types and Transport
//!
//! This crate provides the protocol definitions and the shared HTTP
//! transport driver for the shardcomm cluster dispatcher.
//!
//! # Overview
//!
//! Shardcomm is the inter-node RPC layer of a sharded database cluster.
//! A coordinator node issues HTTP requests to database-server peers and
//! correlates out-of-band answers that arrive back as independent inbound
//! HTTP requests. This crate contains everything both sides share:
//!
//! - **Protocol Layer**: destinations, tickets, status lifecycle, the
//!   request record, and the correlation header
//! - **Transport Layer**: a multi-connection HTTP engine with per-request
//!   callbacks and timeouts
//! - **Cluster Contracts**: topology and server-identity lookups, and the
//!   hybrid logical clock
//!
//! # Components
//!
//! - [`protocol`] - Core protocol types ([`Status`], [`Destination`],
//!   [`CommResult`], [`CoordinatorHeader`], [`CommError`])
//! - [`transport`] - The [`transport::HttpCommunicator`] driver
//! - [`cluster`] - [`cluster::ClusterTopology`] and
//!   [`cluster::ServerIdentity`] contracts
//! - [`hlc`] - Hybrid logical clock
//! - [`headers`] - Wire header names
//!
//! # Example
//!
//! ```
//! use shardcomm_common::{Destination, Status};
//!
//! let dest = Destination::parse("shard:s100042").unwrap();
//! assert_eq!(dest, Destination::Shard("s100042".to_string()));
//! assert!(!Status::Submitted.is_terminal());
//! ```

pub mod cluster;
pub mod headers;
pub mod hlc;
pub mod protocol;
pub mod transport;

pub use cluster::{ClusterTopology, ServerIdentity, StaticIdentity, StaticTopology};
pub use hlc::HybridLogicalClock;
pub use protocol::*;
pub use transport::{
    Callbacks, CommunicatorConfig, HttpCommunicator, HttpRequestSpec, SubmitOptions,
    TransportError,
};
