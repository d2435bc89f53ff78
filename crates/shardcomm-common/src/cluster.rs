//! Cluster service contracts.
//!
//! The dispatcher consumes two narrow interfaces from the surrounding
//! system: the topology service that maps shards to responsible servers
//! and servers to endpoints, and the identity service that names this
//! server and signs outgoing requests. Static, hash-map backed
//! implementations are provided for tests, tools and fixed deployments.

use std::collections::HashMap;

use crate::protocol::{ServerId, ShardId};

/// Shard-to-server and server-to-endpoint lookups.
pub trait ClusterTopology: Send + Sync {
    /// The servers responsible for a shard, primary first. Empty when the
    /// shard is unknown.
    fn responsible_servers(&self, shard_id: &str) -> Vec<ServerId>;

    /// The cluster endpoint (`tcp://...` or `ssl://...`) of a server, or
    /// `None` when the server is unknown.
    fn server_endpoint(&self, server_id: &str) -> Option<String>;
}

/// This server's identity and request authorization.
pub trait ServerIdentity: Send + Sync {
    /// This server's id, as peers know it.
    fn id(&self) -> ServerId;

    /// Value for the `Authorization` header on outgoing requests.
    fn authorization(&self) -> String;
}

/// Fixed topology backed by hash maps.
///
/// # Example
///
/// ```
/// use shardcomm_common::{ClusterTopology, StaticTopology};
///
/// let topology = StaticTopology::new()
///     .with_shard("s1", ["dbs-1"])
///     .with_server("dbs-1", "tcp://db1.cluster.local:8529");
///
/// assert_eq!(topology.responsible_servers("s1"), vec!["dbs-1".to_string()]);
/// assert_eq!(topology.server_endpoint("dbs-9"), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    shards: HashMap<ShardId, Vec<ServerId>>,
    endpoints: HashMap<ServerId, String>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shard<S, I>(mut self, shard_id: &str, servers: I) -> Self
    where
        S: Into<ServerId>,
        I: IntoIterator<Item = S>,
    {
        self.shards.insert(
            shard_id.to_string(),
            servers.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_server(mut self, server_id: &str, endpoint: &str) -> Self {
        self.endpoints
            .insert(server_id.to_string(), endpoint.to_string());
        self
    }
}

impl ClusterTopology for StaticTopology {
    fn responsible_servers(&self, shard_id: &str) -> Vec<ServerId> {
        self.shards.get(shard_id).cloned().unwrap_or_default()
    }

    fn server_endpoint(&self, server_id: &str) -> Option<String> {
        self.endpoints.get(server_id).cloned()
    }
}

/// Fixed identity with a pre-computed authorization value.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    id: ServerId,
    authorization: String,
}

impl StaticIdentity {
    pub fn new(id: &str, authorization: &str) -> Self {
        Self {
            id: id.to_string(),
            authorization: authorization.to_string(),
        }
    }
}

impl ServerIdentity for StaticIdentity {
    fn id(&self) -> ServerId {
        self.id.clone()
    }

    fn authorization(&self) -> String {
        self.authorization.clone()
    }
}
