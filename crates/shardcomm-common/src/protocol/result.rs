use hyper::body::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use super::status::Status;
use super::{ClientTransactionId, CoordTransactionId, ServerId, ShardId, Ticket};
use crate::transport::TransportError;

/// Caller-supplied completion callback.
///
/// Invoked from the transport driver (or from `process_answer`) with the
/// final record. A `true` return tells the dispatcher the result has been
/// fully consumed.
pub type CommCallback = Arc<dyn Fn(&CommResult) -> bool + Send + Sync>;

/// A completed HTTP exchange as seen by the transport.
#[derive(Debug, Clone, Default)]
pub struct HttpResult {
    /// HTTP status code of the response.
    pub code: u16,
    /// Response headers; names are lower-cased on the wire.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResult {
    /// Response body as text, lossily decoded.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// An inbound HTTP request carrying an asynchronous answer.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl InboundRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// In-flight and final state of one dispatcher operation.
///
/// One record exists per ticket. The transport callbacks, the answer
/// correlation path and the timeout sweep all update the same record that
/// waiters observe; `wait` and `drop` remove it from tracking.
///
/// The empty string in `client_transaction_id`, `shard_id` or `server_id`
/// and zero in `coord_transaction_id` mean "not set"; matching treats them
/// as wildcards.
#[derive(Debug, Clone, Default)]
pub struct CommResult {
    pub client_transaction_id: ClientTransactionId,
    pub coord_transaction_id: CoordTransactionId,
    /// The ticket naming this operation.
    pub operation_id: Ticket,
    pub shard_id: ShardId,
    pub server_id: ServerId,
    /// Resolved endpoint in HTTP-engine form (`http://...` or
    /// `https://...`); empty when resolution failed.
    pub endpoint: String,
    pub status: Status,
    /// True for sync requests and one-off fan-outs; false for the
    /// store-and-answer pattern.
    pub single: bool,
    /// Set when the caller dropped the operation while it was being sent.
    pub dropped: bool,
    /// Whether the request was fully transmitted before the operation
    /// ended. Only meaningful for Timeout outcomes.
    pub send_was_complete: bool,
    pub error_message: String,
    /// The completed HTTP exchange, when one took place.
    pub result: Option<HttpResult>,
    /// The inbound answer request, for the store-and-answer pattern.
    pub answer: Option<InboundRequest>,
    /// HTTP status carried by the answer.
    pub answer_code: Option<u16>,
}

impl CommResult {
    /// Records a completed exchange.
    ///
    /// Single requests become Received. Store-and-answer requests become
    /// Sent, since the exchange only acknowledged storage and the real
    /// answer arrives out of band. A response with an HTTP-level failure
    /// status becomes Error either way.
    pub fn from_response(&mut self, response: HttpResult) {
        self.send_was_complete = true;
        if response.code >= 400 {
            self.status = Status::Error;
            self.error_message = format!("HTTP error, status {}", response.code);
        } else if self.single {
            self.status = Status::Received;
            self.answer_code = Some(response.code);
        } else {
            self.status = Status::Sent;
        }
        self.result = Some(response);
    }

    /// Records a failed exchange.
    pub fn from_error(&mut self, error: &TransportError, response: Option<HttpResult>) {
        match error {
            TransportError::Connect(message) => {
                self.status = Status::BackendUnavailable;
                self.error_message = message.clone();
                self.send_was_complete = false;
            }
            TransportError::Timeout { send_was_complete } => {
                self.status = Status::Timeout;
                self.error_message = "timeout".to_string();
                self.send_was_complete = *send_was_complete;
            }
            TransportError::Invalid(message) => {
                self.status = Status::Error;
                self.error_message = message.clone();
            }
        }
        self.result = response;
    }

    /// Human-readable description of the error state.
    pub fn stringify_error_message(&self) -> String {
        let mut message = self.status.as_str().to_string();
        if !self.server_id.is_empty() {
            message.push_str(&format!(", cluster node: '{}'", self.server_id));
        }
        if !self.shard_id.is_empty() {
            message.push_str(&format!(", shard: '{}'", self.shard_id));
        }
        if !self.endpoint.is_empty() {
            message.push_str(&format!(", endpoint: '{}'", self.endpoint));
        }
        if !self.error_message.is_empty() {
            message.push_str(&format!(", error: '{}'", self.error_message));
        }
        message
    }
}
