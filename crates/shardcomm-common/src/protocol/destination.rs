use super::error::CommError;
use super::{ServerId, ShardId};

/// Parsed form of a destination string.
///
/// The grammar accepts exactly four forms:
///
/// - `shard:<ShardId>` - routed to the server responsible for the shard
/// - `server:<ServerId>` - routed to a specific database server
/// - `tcp://<host>:<port>` - a raw plaintext endpoint
/// - `ssl://<host>:<port>` - a raw TLS endpoint
///
/// Everything else is rejected.
///
/// # Example
///
/// ```
/// use shardcomm_common::Destination;
///
/// assert_eq!(
///     Destination::parse("server:db0007").unwrap(),
///     Destination::Server("db0007".to_string())
/// );
/// assert!(Destination::parse("udp://nope:1").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Shard(ShardId),
    Server(ServerId),
    Endpoint(String),
}

impl Destination {
    /// Parses a destination string, rejecting anything outside the grammar.
    pub fn parse(dest: &str) -> Result<Destination, CommError> {
        if let Some(shard) = dest.strip_prefix("shard:") {
            Ok(Destination::Shard(shard.to_string()))
        } else if let Some(server) = dest.strip_prefix("server:") {
            Ok(Destination::Server(server.to_string()))
        } else if dest.starts_with("tcp://") || dest.starts_with("ssl://") {
            Ok(Destination::Endpoint(dest.to_string()))
        } else {
            Err(CommError::InvalidDestination(dest.to_string()))
        }
    }
}

/// Translates a cluster endpoint into a URL for the HTTP engine and
/// appends the request path.
///
/// `tcp://` maps to `http://` and `ssl://` to `https://`; endpoints with
/// any other scheme yield `None`.
///
/// # Example
///
/// ```
/// use shardcomm_common::endpoint_to_url;
///
/// assert_eq!(
///     endpoint_to_url("ssl://h:8530", "/_api/version").as_deref(),
///     Some("https://h:8530/_api/version")
/// );
/// ```
pub fn endpoint_to_url(endpoint: &str, path: &str) -> Option<String> {
    let url = if let Some(rest) = endpoint.strip_prefix("tcp://") {
        format!("http://{rest}{path}")
    } else if let Some(rest) = endpoint.strip_prefix("ssl://") {
        format!("https://{rest}{path}")
    } else {
        return None;
    };
    Some(url)
}
