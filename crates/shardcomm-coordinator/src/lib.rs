//! Shardcomm Coordinator
//!
//! This crate provides the dispatcher of the shardcomm cluster RPC layer:
//! the component a coordinator node uses to talk to its database-server
//! peers, and the endpoint those peers answer back to.
//!
//! # Architecture
//!
//! Requests address a destination (`shard:`, `server:` or a raw
//! endpoint), are prepared with the cluster's standard headers and
//! submitted through a shared multi-connection HTTP engine. Every
//! operation gets a process-unique ticket and is tracked in a registry
//! until a waiter consumes it or the caller drops it.
//!
//! Two notification styles are available on the same primitive:
//!
//! - supply a callback and have it fired from the driver task, or
//! - hold on to the ticket and `wait` on it (or on a wildcard match).
//!
//! Requests submitted in store-and-answer mode are acknowledged first and
//! answered later by an independent inbound HTTP request; the
//! correlation header ties the answer back to the ticket.
//!
//! # Components
//!
//! - [`ShardComm`] - the dispatcher façade
//! - [`RequestOptions`] / [`FanoutRequest`] - request parameterization
//! - [`answer_router`] / [`serve`] - the inbound answer endpoint
//! - [`ShardCommConfig`] - startup configuration
//!
//! # Example
//!
//! ```no_run
//! use shardcomm_common::{StaticIdentity, StaticTopology};
//! use shardcomm_coordinator::{RequestOptions, ShardComm, ShardCommConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let topology = Arc::new(
//!     StaticTopology::new()
//!         .with_shard("s1", ["dbs-1"])
//!         .with_server("dbs-1", "tcp://db1.cluster.local:8529"),
//! );
//! let identity = Arc::new(StaticIdentity::new("crdn-1", "bearer token"));
//! let comm = ShardComm::new(ShardCommConfig::default(), topology, identity);
//!
//! let ticket = comm.async_request(
//!     "shard:s1",
//!     hyper::Method::GET,
//!     "/_api/document/s1/k",
//!     None,
//!     RequestOptions::new(Duration::from_secs(5)).single(),
//! );
//! let result = comm.wait("", 0, ticket, "", None).await;
//! println!("{}", result.status);
//! # }
//! ```

pub mod answer;
pub mod config;
pub mod dispatcher;
pub mod fanout;
pub mod http_server;
mod preparer;
mod registry;
mod resolver;

pub use answer::AnswerError;
pub use config::ShardCommConfig;
pub use dispatcher::{RequestOptions, ShardComm};
pub use fanout::{FanoutOutcome, FanoutRequest};
pub use http_server::{answer_router, serve};
