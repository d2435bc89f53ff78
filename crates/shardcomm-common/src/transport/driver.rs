use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::protocol::{next_ticket, CommError, HttpResult, Result, Ticket};

/// Failure classification reported to [`Callbacks::on_error`].
///
/// The distinction matters to callers: connect failures and incomplete
/// sends are eligible for retry by the fan-out layer, while a completed
/// exchange is final whatever its status code.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection could not be established, or broke mid-exchange
    /// before a response was read.
    #[error("{0}")]
    Connect(String),

    /// The request deadline passed. `send_was_complete` records whether
    /// response headers had been received by then.
    #[error("timeout")]
    Timeout { send_was_complete: bool },

    /// The request itself was malformed.
    #[error("{0}")]
    Invalid(String),
}

/// Outbound request shape handed to [`HttpCommunicator::submit`].
#[derive(Debug, Clone, Default)]
pub struct HttpRequestSpec {
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

/// Per-request timeouts.
#[derive(Debug, Clone, Copy)]
pub struct SubmitOptions {
    /// Bound on establishing the connection (TCP plus TLS).
    pub connect_timeout: Duration,
    /// Bound on the whole exchange.
    pub request_timeout: Duration,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Completion callbacks for one submitted request.
///
/// Exactly one of `on_success` / `on_error` fires, from the request's
/// driver task. `on_sending` fires first, when transmission begins.
pub struct Callbacks {
    pub on_sending: Option<Box<dyn FnOnce() + Send>>,
    pub on_success: Box<dyn FnOnce(HttpResult) + Send>,
    pub on_error: Box<dyn FnOnce(TransportError, Option<HttpResult>) + Send>,
}

impl Callbacks {
    pub fn new(
        on_success: impl FnOnce(HttpResult) + Send + 'static,
        on_error: impl FnOnce(TransportError, Option<HttpResult>) + Send + 'static,
    ) -> Self {
        Self {
            on_sending: None,
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        }
    }

    pub fn with_on_sending(mut self, on_sending: impl FnOnce() + Send + 'static) -> Self {
        self.on_sending = Some(Box::new(on_sending));
        self
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Maximum number of concurrently in-flight requests.
    pub max_in_flight: usize,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self { max_in_flight: 64 }
    }
}

struct NewRequest {
    ticket: Ticket,
    url: String,
    spec: HttpRequestSpec,
    callbacks: Callbacks,
    options: SubmitOptions,
}

/// The shared multi-connection HTTP engine.
///
/// `submit` is callable from any task and only enqueues; the driver task
/// spawned at construction owns all I/O. Must be created within a Tokio
/// runtime.
pub struct HttpCommunicator {
    queue: Mutex<Option<mpsc::UnboundedSender<NewRequest>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl HttpCommunicator {
    pub fn new(config: CommunicatorConfig) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        let limiter = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let driver = tokio::spawn(drive(inbox, limiter));
        Self {
            queue: Mutex::new(Some(queue)),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Queues one request and returns its ticket.
    ///
    /// The ticket is allocated from the process-wide monotonic source and
    /// is the key under which the dispatcher tracks the operation.
    ///
    /// # Errors
    ///
    /// [`CommError::ShuttingDown`] once [`Self::shutdown`] has been called.
    pub fn submit(
        &self,
        url: String,
        spec: HttpRequestSpec,
        callbacks: Callbacks,
        options: SubmitOptions,
    ) -> Result<Ticket> {
        let ticket = next_ticket();
        self.submit_with_ticket(ticket, url, spec, callbacks, options)?;
        Ok(ticket)
    }

    /// Queues one request under a ticket the caller already allocated
    /// with [`next_ticket`].
    ///
    /// Used when the request itself must carry its ticket, as the
    /// correlation header of the store-and-answer pattern does.
    pub fn submit_with_ticket(
        &self,
        ticket: Ticket,
        url: String,
        spec: HttpRequestSpec,
        callbacks: Callbacks,
        options: SubmitOptions,
    ) -> Result<()> {
        let request = NewRequest {
            ticket,
            url,
            spec,
            callbacks,
            options,
        };
        let queue = self.queue.lock();
        match queue.as_ref() {
            Some(sender) => sender.send(request).map_err(|_| CommError::ShuttingDown),
            None => Err(CommError::ShuttingDown),
        }
    }

    /// Closes the queue and waits for the driver task to finish.
    ///
    /// Requests already on the wire run to completion and still fire
    /// their callbacks.
    pub async fn shutdown(&self) {
        let sender = self.queue.lock().take();
        drop(sender);
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }
}

impl Drop for HttpCommunicator {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

/// Driver loop: drains the queue, one task per exchange, bounded by the
/// semaphore.
async fn drive(mut inbox: mpsc::UnboundedReceiver<NewRequest>, limiter: Arc<Semaphore>) {
    while let Some(request) = inbox.recv().await {
        let permit = match limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        tokio::spawn(async move {
            let _permit = permit;
            execute(request).await;
        });
    }
    debug!("transport driver stopped");
}

async fn execute(request: NewRequest) {
    let NewRequest {
        ticket,
        url,
        spec,
        callbacks,
        options,
    } = request;

    trace!(ticket, %url, "transport: starting exchange");
    if let Some(on_sending) = callbacks.on_sending {
        on_sending();
    }

    let target = match parse_url(&url) {
        Ok(target) => target,
        Err(error) => {
            (callbacks.on_error)(TransportError::Invalid(error.to_string()), None);
            return;
        }
    };

    match perform(&target, spec, options).await {
        Ok(result) => {
            trace!(ticket, code = result.code, "transport: exchange complete");
            (callbacks.on_success)(result);
        }
        Err(error) => {
            debug!(ticket, %url, %error, "transport: exchange failed");
            (callbacks.on_error)(error, None);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ParsedUrl {
    tls: bool,
    host: String,
    port: u16,
    path: String,
}

impl ParsedUrl {
    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_url(url: &str) -> Result<ParsedUrl> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else {
        return Err(CommError::InvalidEndpoint(url.to_string()));
    };

    let (authority, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(CommError::InvalidEndpoint(url.to_string()));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| CommError::InvalidEndpoint(url.to_string()))?,
        ),
        None => (authority.to_string(), if tls { 443 } else { 80 }),
    };

    Ok(ParsedUrl {
        tls,
        host,
        port,
        path: path.to_string(),
    })
}

trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

async fn connect(
    target: &ParsedUrl,
    connect_timeout: Duration,
) -> std::result::Result<Box<dyn RawStream>, TransportError> {
    let authority = target.authority();
    let tcp = timeout(
        connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| TransportError::Connect(format!("connect to '{authority}' timed out")))?
    .map_err(|error| TransportError::Connect(format!("cannot connect to '{authority}': {error}")))?;

    if !target.tls {
        return Ok(Box::new(tcp));
    }

    let domain = rustls::pki_types::ServerName::try_from(target.host.clone())
        .map_err(|_| TransportError::Connect(format!("invalid TLS host '{}'", target.host)))?;
    let tls = timeout(connect_timeout, tls_connector().connect(domain, tcp))
        .await
        .map_err(|_| TransportError::Connect(format!("TLS handshake with '{authority}' timed out")))?
        .map_err(|error| {
            TransportError::Connect(format!("TLS handshake with '{authority}' failed: {error}"))
        })?;
    Ok(Box::new(tls))
}

fn tls_connector() -> &'static TlsConnector {
    static CONNECTOR: std::sync::OnceLock<TlsConnector> = std::sync::OnceLock::new();
    CONNECTOR.get_or_init(|| {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    })
}

/// Runs one exchange under the configured deadlines.
///
/// The deadline is split in two observations: elapsing while awaiting
/// response headers means the send may not have completed; elapsing while
/// reading the body means it did.
async fn perform(
    target: &ParsedUrl,
    spec: HttpRequestSpec,
    options: SubmitOptions,
) -> std::result::Result<HttpResult, TransportError> {
    let deadline = Instant::now() + options.request_timeout;
    let stream = connect(target, options.connect_timeout).await?;

    let (mut sender, connection) = http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
        .await
        .map_err(|error| {
            TransportError::Connect(format!(
                "handshake with '{}' failed: {error}",
                target.authority()
            ))
        })?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            trace!(%error, "transport: connection closed");
        }
    });

    let mut builder = Request::builder()
        .method(spec.method.clone())
        .uri(target.path.clone())
        .header(HOST, target.authority());
    for (name, value) in &spec.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let request = builder
        .body(Full::new(spec.body.unwrap_or_default()))
        .map_err(|error| TransportError::Invalid(format!("cannot build request: {error}")))?;

    let response = timeout_at(deadline, sender.send_request(request))
        .await
        .map_err(|_| TransportError::Timeout {
            send_was_complete: false,
        })?
        .map_err(|error| {
            TransportError::Connect(format!(
                "exchange with '{}' failed: {error}",
                target.authority()
            ))
        })?;

    let (parts, body) = response.into_parts();
    let body = timeout_at(deadline, body.collect())
        .await
        .map_err(|_| TransportError::Timeout {
            send_was_complete: true,
        })?
        .map_err(|error| TransportError::Connect(format!("error reading response: {error}")))?
        .to_bytes();

    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    Ok(HttpResult {
        code: parts.status.as_u16(),
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_plain() {
        let parsed = parse_url("http://10.0.0.7:8529/_api/version").unwrap();
        assert_eq!(
            parsed,
            ParsedUrl {
                tls: false,
                host: "10.0.0.7".to_string(),
                port: 8529,
                path: "/_api/version".to_string(),
            }
        );
    }

    #[test]
    fn parse_url_tls_default_port() {
        let parsed = parse_url("https://db.cluster.local").unwrap();
        assert!(parsed.tls);
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.path, "/");
    }

    #[test]
    fn parse_url_rejects_cluster_schemes() {
        assert!(parse_url("tcp://h:1").is_err());
        assert!(parse_url("ssl://h:1").is_err());
        assert!(parse_url("h:1").is_err());
        assert!(parse_url("http://").is_err());
        assert!(parse_url("http://h:notaport/").is_err());
    }

    #[tokio::test]
    async fn submit_round_trip() {
        use hyper::body::Incoming;
        use hyper::server::conn::http1 as server_http1;
        use hyper::service::service_fn;
        use hyper::Response;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|_request: Request<Incoming>| async {
                Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(b"pong"))))
            });
            let _ = server_http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let communicator = HttpCommunicator::new(CommunicatorConfig::default());
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let callbacks = Callbacks::new(
            move |result| {
                let _ = done_tx.send(result);
            },
            |error: TransportError, _: Option<HttpResult>| panic!("unexpected error: {error}"),
        );
        let ticket = communicator
            .submit(
                format!("http://{addr}/ping"),
                HttpRequestSpec {
                    method: Method::GET,
                    ..Default::default()
                },
                callbacks,
                SubmitOptions::default(),
            )
            .unwrap();
        assert_ne!(ticket, 0);

        let result: HttpResult = done_rx.await.unwrap();
        assert_eq!(result.code, 200);
        assert_eq!(result.body_text(), "pong");
        communicator.shutdown().await;
    }

    #[tokio::test]
    async fn connect_failure_is_classified() {
        let communicator = HttpCommunicator::new(CommunicatorConfig::default());
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let callbacks = Callbacks::new(
            |_result| panic!("unexpected success"),
            move |error, _| {
                let _ = done_tx.send(matches!(error, TransportError::Connect(_)));
            },
        );
        // Port 1 on loopback refuses immediately on any sane test host.
        communicator
            .submit(
                "http://127.0.0.1:1/".to_string(),
                HttpRequestSpec::default(),
                callbacks,
                SubmitOptions {
                    connect_timeout: Duration::from_secs(2),
                    request_timeout: Duration::from_secs(2),
                },
            )
            .unwrap();
        assert!(done_rx.await.unwrap());
        communicator.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let communicator = HttpCommunicator::new(CommunicatorConfig::default());
        communicator.shutdown().await;
        let callbacks = Callbacks::new(|_| {}, |_, _| {});
        let result = communicator.submit(
            "http://127.0.0.1:1/".to_string(),
            HttpRequestSpec::default(),
            callbacks,
            SubmitOptions::default(),
        );
        assert!(matches!(result, Err(CommError::ShuttingDown)));
    }
}
