use super::error::CommError;
use super::{ClientTransactionId, CoordTransactionId, ServerId, Ticket};
use crate::headers;

/// Typed value of the `X-Arango-Coordinator` correlation header.
///
/// The header is the single source of truth for tying an inbound answer
/// back to the ticket that ordered it. Its wire format is
/// `<serverId>:<ticket>:<clientTxId>:<coordTxId>`; parsing is strict about
/// the first two fields and tolerant about the trailing tags.
///
/// # Example
///
/// ```
/// use shardcomm_common::CoordinatorHeader;
///
/// let header = CoordinatorHeader {
///     server_id: "crdn-1".to_string(),
///     ticket: 17,
///     client_transaction_id: "ctx".to_string(),
///     coord_transaction_id: 42,
/// };
/// let parsed = CoordinatorHeader::parse(&header.to_value()).unwrap();
/// assert_eq!(parsed, header);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorHeader {
    pub server_id: ServerId,
    pub ticket: Ticket,
    pub client_transaction_id: ClientTransactionId,
    pub coord_transaction_id: CoordTransactionId,
}

impl CoordinatorHeader {
    /// Formats the header value.
    pub fn to_value(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.server_id, self.ticket, self.client_transaction_id, self.coord_transaction_id
        )
    }

    /// Parses a header value.
    ///
    /// At least two `:`-separated fields are required and the ticket must
    /// be an unsigned 64-bit decimal. Missing trailing tags default to the
    /// empty string and zero.
    pub fn parse(value: &str) -> Result<CoordinatorHeader, CommError> {
        let mut parts = value.splitn(4, ':');
        let server_id = match parts.next() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(CommError::Header(format!(
                    "could not find coordinator ID in '{}'",
                    headers::COORDINATOR
                )))
            }
        };
        let ticket = parts
            .next()
            .and_then(|raw| raw.parse::<Ticket>().ok())
            .ok_or_else(|| {
                CommError::Header(format!(
                    "could not find operation ID in '{}'",
                    headers::COORDINATOR
                ))
            })?;
        let client_transaction_id = parts.next().unwrap_or("").to_string();
        let coord_transaction_id = parts
            .next()
            .and_then(|raw| raw.parse::<CoordTransactionId>().ok())
            .unwrap_or(0);

        Ok(CoordinatorHeader {
            server_id,
            ticket,
            client_transaction_id,
            coord_transaction_id,
        })
    }
}
