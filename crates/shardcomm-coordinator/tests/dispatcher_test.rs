//! Dispatcher integration tests.
//!
//! These run the full request lifecycle against in-process HTTP backends:
//! shard routing, destination failures, the store-and-answer correlation
//! flow, fan-out with retry, server-side timeouts, and the inbound answer
//! endpoint.
//!
//! Backends bind ephemeral loopback ports; nothing leaves the process.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use shardcomm_common::{
    headers as wire, InboundRequest, StaticIdentity, StaticTopology, Status,
};
use shardcomm_coordinator::{
    answer_router, AnswerError, FanoutRequest, RequestOptions, ShardComm, ShardCommConfig,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

/// One request as seen by a mock backend.
#[derive(Debug)]
struct Captured {
    method: Method,
    path: String,
    headers: HashMap<String, String>,
    body: Bytes,
}

impl Captured {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Minimal database-server stand-in: answers every request with a fixed
/// status and body, and hands the captured request to the test.
struct MockDbServer {
    addr: SocketAddr,
    captured: mpsc::UnboundedReceiver<Captured>,
    _shutdown: oneshot::Sender<()>,
}

impl MockDbServer {
    async fn start(code: u16, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, code, body)
    }

    async fn start_on(addr: SocketAddr, code: u16, body: &'static str) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        Self::serve(listener, code, body)
    }

    fn serve(listener: TcpListener, code: u16, body: &'static str) -> Self {
        let addr = listener.local_addr().unwrap();
        let (captured_tx, captured) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let captured_tx = captured_tx.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |request: Request<Incoming>| {
                                let captured_tx = captured_tx.clone();
                                async move {
                                    let (parts, inbound) = request.into_parts();
                                    let body_bytes =
                                        inbound.collect().await.unwrap().to_bytes();
                                    let headers = parts
                                        .headers
                                        .iter()
                                        .map(|(name, value)| {
                                            (
                                                name.as_str().to_string(),
                                                String::from_utf8_lossy(value.as_bytes())
                                                    .into_owned(),
                                            )
                                        })
                                        .collect();
                                    let _ = captured_tx.send(Captured {
                                        method: parts.method,
                                        path: parts.uri.path().to_string(),
                                        headers,
                                        body: body_bytes,
                                    });
                                    Ok::<_, hyper::Error>(
                                        Response::builder()
                                            .status(code)
                                            .body(Full::new(Bytes::from_static(
                                                body.as_bytes(),
                                            )))
                                            .unwrap(),
                                    )
                                }
                            });
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            captured,
            _shutdown: shutdown_tx,
        }
    }

    fn cluster_endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

fn make_comm(topology: StaticTopology) -> Arc<ShardComm> {
    ShardComm::new(
        ShardCommConfig::default(),
        Arc::new(topology),
        Arc::new(StaticIdentity::new("crdn-1", "bearer test-token")),
    )
}

/// The answer body a test delivers for a captured store-and-answer
/// request.
fn answer_for(captured: &Captured, code: u16, body: &str) -> (String, InboundRequest) {
    let correlation = captured
        .header(wire::COORDINATOR)
        .expect("store-and-answer request must carry the correlation header")
        .to_string();
    let mut headers = HashMap::new();
    headers.insert(
        wire::RESPONSE_CODE.to_ascii_lowercase(),
        code.to_string(),
    );
    headers.insert(
        wire::COORDINATOR.to_ascii_lowercase(),
        correlation.clone(),
    );
    (
        correlation,
        InboundRequest {
            headers,
            body: Bytes::from(body.to_string()),
        },
    )
}

#[tokio::test]
async fn shard_routing_happy_path() {
    let mut backend = MockDbServer::start(200, "ok").await;
    let comm = make_comm(
        StaticTopology::new()
            .with_shard("S1", ["srvA"])
            .with_server("srvA", &backend.cluster_endpoint()),
    );

    let ticket = comm.async_request(
        "shard:S1",
        Method::GET,
        "/x",
        None,
        RequestOptions::new(Duration::from_secs(5)).single(),
    );
    let result = comm.wait("", 0, ticket, "", None).await;

    assert_eq!(result.status, Status::Received);
    assert_eq!(result.endpoint, format!("http://{}", backend.addr));
    assert_eq!(result.server_id, "srvA");
    assert_eq!(result.result.as_ref().unwrap().body_text(), "ok");

    let captured = backend.captured.recv().await.unwrap();
    assert_eq!(captured.method, Method::GET);
    assert_eq!(captured.path, "/x");
    assert_eq!(captured.header(wire::AUTHORIZATION), Some("bearer test-token"));
    assert!(captured.header(wire::HLC).is_some());
    assert_eq!(
        captured.header(wire::ASYNC_MODE),
        None,
        "single requests do not order an answer"
    );

    comm.shutdown().await;
}

#[tokio::test]
async fn unknown_shard_fails_immediately() {
    let comm = make_comm(StaticTopology::new());

    let ticket = comm.async_request(
        "shard:S2",
        Method::GET,
        "/x",
        None,
        RequestOptions::new(Duration::from_secs(5)),
    );
    let result = comm.wait("", 0, ticket, "", None).await;

    assert_eq!(result.status, Status::BackendUnavailable);
    assert!(result
        .error_message
        .contains("cannot find responsible server for shard 'S2'"));
    assert!(result.endpoint.is_empty());

    comm.shutdown().await;
}

#[tokio::test]
async fn direct_endpoint_sync_request() {
    let mut backend = MockDbServer::start(201, "created").await;
    let comm = make_comm(StaticTopology::new());

    let destination = backend.cluster_endpoint();
    let result = comm
        .sync_request(
            "",
            0,
            &destination,
            Method::POST,
            "/docs",
            Some(Bytes::from_static(b"{\"k\":1}")),
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await;

    assert_eq!(result.status, Status::Received);
    assert_eq!(result.answer_code, Some(201));
    assert_eq!(result.endpoint, format!("http://{}", backend.addr));
    assert!(result.single);

    let captured = backend.captured.recv().await.unwrap();
    assert_eq!(captured.method, Method::POST);
    assert_eq!(captured.body, Bytes::from_static(b"{\"k\":1}"));

    comm.shutdown().await;
}

#[tokio::test]
async fn async_answer_ships_the_answer_back() {
    // Database-server side: the answer travels to the coordinator named
    // in the correlation header, as a PUT to its answer endpoint.
    let mut coordinator = MockDbServer::start(200, "").await;
    let comm = make_comm(
        StaticTopology::new().with_server("crdn-9", &coordinator.cluster_endpoint()),
    );

    let mut response_headers = HashMap::new();
    response_headers.insert("Content-Type".to_string(), "application/json".to_string());
    comm.async_answer(
        "crdn-9:17:ctx:42",
        200,
        response_headers,
        Bytes::from_static(b"{\"answer\":true}"),
    );

    let delivered = coordinator.captured.recv().await.unwrap();
    assert_eq!(delivered.method, Method::PUT);
    assert_eq!(delivered.path, wire::SHARD_COMM_PATH);
    assert_eq!(delivered.header(wire::COORDINATOR), Some("crdn-9:17:ctx:42"));
    assert_eq!(delivered.header(wire::RESPONSE_CODE), Some("200"));
    assert_eq!(delivered.header(wire::AUTHORIZATION), Some("bearer test-token"));
    assert!(delivered.header(wire::HLC).is_some());
    assert_eq!(delivered.body, Bytes::from_static(b"{\"answer\":true}"));

    comm.shutdown().await;
}

#[tokio::test]
async fn async_answer_correlation_wakes_the_waiter() {
    let mut backend = MockDbServer::start(202, "stored").await;
    let comm = make_comm(
        StaticTopology::new()
            .with_shard("S1", ["srvA"])
            .with_server("srvA", &backend.cluster_endpoint()),
    );

    let ticket = comm.async_request(
        "shard:S1",
        Method::GET,
        "/x",
        None,
        RequestOptions::new(Duration::from_secs(30)).with_transaction("ctx", 42),
    );

    // The backend acknowledged storage; deliver the real answer through
    // the correlation path, exactly as the inbound endpoint would.
    let captured = backend.captured.recv().await.unwrap();
    assert_eq!(captured.header(wire::ASYNC_MODE), Some(wire::ASYNC_STORE));
    let correlation = captured.header(wire::COORDINATOR).unwrap();
    assert!(correlation.starts_with(&format!("crdn-1:{ticket}:ctx:42")));

    let comm_for_answer = comm.clone();
    let (correlation, answer) = answer_for(&captured, 200, "the answer");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        comm_for_answer
            .process_answer(&correlation, answer)
            .unwrap();
    });

    let result = comm.wait("ctx", 42, ticket, "S1", Some(Duration::from_secs(10))).await;
    assert_eq!(result.status, Status::Received);
    assert_eq!(result.answer_code, Some(200));
    assert_eq!(
        result.answer.as_ref().unwrap().body,
        Bytes::from_static(b"the answer")
    );

    comm.shutdown().await;
}

#[tokio::test]
async fn fan_out_retries_connect_failures_with_backoff() {
    let mut backend_a = MockDbServer::start(202, "stored").await;
    let mut backend_b = MockDbServer::start(202, "stored").await;

    // The third backend starts down: grab a port, close it again, and
    // only come up after the batch has already failed against it.
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let late_addr = parked.local_addr().unwrap();
    drop(parked);

    let comm = make_comm(
        StaticTopology::new()
            .with_shard("SA", ["srvA"])
            .with_shard("SB", ["srvB"])
            .with_shard("SC", ["srvC"])
            .with_server("srvA", &backend_a.cluster_endpoint())
            .with_server("srvB", &backend_b.cluster_endpoint())
            .with_server("srvC", &format!("tcp://{late_addr}")),
    );

    // Answer pump: every stored request gets a 200 answer. The late
    // backend only comes up once the batch has had time to fail against
    // it and schedule a retry.
    let pump = comm.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let mut backend_c = MockDbServer::start_on(late_addr, 202, "stored").await;
        loop {
            let captured = tokio::select! {
                captured = backend_a.captured.recv() => captured,
                captured = backend_b.captured.recv() => captured,
                captured = backend_c.captured.recv() => captured,
            };
            let Some(captured) = captured else { break };
            let (correlation, answer) = answer_for(&captured, 200, "done");
            let _ = pump.process_answer(&correlation, answer);
        }
    });

    let mut requests = vec![
        FanoutRequest::new("shard:SA", Method::GET, "/a"),
        FanoutRequest::new("shard:SB", Method::GET, "/b"),
        FanoutRequest::new("shard:SC", Method::GET, "/c"),
    ];
    let started = Instant::now();
    let outcome = comm
        .perform_requests(&mut requests, Duration::from_secs(15))
        .await;

    assert_eq!(outcome.n_done, 3);
    assert_eq!(outcome.n_good, 3);
    assert!(requests.iter().all(|request| request.done));
    assert_eq!(
        requests[2].result.as_ref().unwrap().status,
        Status::Received
    );
    // The late backend required at least one backoff round trip.
    assert!(started.elapsed() >= Duration::from_millis(200));

    comm.shutdown().await;
}

#[tokio::test]
async fn fan_out_with_zero_timeout_returns_immediately() {
    let comm = make_comm(StaticTopology::new());
    let mut requests = vec![
        FanoutRequest::new("shard:SA", Method::GET, "/a"),
        FanoutRequest::new("shard:SB", Method::GET, "/b"),
    ];
    let outcome = comm.perform_requests(&mut requests, Duration::ZERO).await;
    assert_eq!(outcome.n_done, 0);
    assert_eq!(outcome.n_good, 0);
    assert!(requests.iter().all(|request| !request.done));
    comm.shutdown().await;
}

#[tokio::test]
async fn fan_out_single_request_fast_path() {
    let backend = MockDbServer::start(200, "solo").await;
    let comm = make_comm(StaticTopology::new());

    let mut requests = vec![FanoutRequest::new(
        &backend.cluster_endpoint(),
        Method::GET,
        "/solo",
    )];
    let outcome = comm
        .perform_requests(&mut requests, Duration::from_secs(5))
        .await;

    assert_eq!(outcome.n_good, 1);
    assert_eq!(outcome.n_done, 1);
    let result = requests[0].result.as_ref().unwrap();
    assert_eq!(result.status, Status::Received);
    assert_eq!(result.answer_code, Some(200));
    assert_eq!(
        result.answer.as_ref().unwrap().body,
        Bytes::from_static(b"solo")
    );

    comm.shutdown().await;
}

#[tokio::test]
async fn unanswered_request_times_out_via_the_sweep() {
    let mut backend = MockDbServer::start(202, "stored").await;
    let comm = make_comm(
        StaticTopology::new()
            .with_shard("S1", ["srvA"])
            .with_server("srvA", &backend.cluster_endpoint()),
    );

    let ticket = comm.async_request(
        "shard:S1",
        Method::GET,
        "/never-answered",
        None,
        RequestOptions::new(Duration::from_secs(1)),
    );
    // The ack arrives, but no answer ever will.
    backend.captured.recv().await.unwrap();

    let result = comm
        .wait("", 0, ticket, "", Some(Duration::from_secs(10)))
        .await;
    assert_eq!(result.status, Status::Timeout);
    assert!(result.send_was_complete);

    // Dropping the already-gone ticket is a clean no-op.
    comm.drop_matching("", 0, ticket, "");
    assert_eq!(comm.enquire(ticket).status, Status::Dropped);

    comm.shutdown().await;
}

#[tokio::test]
async fn dropped_operation_refuses_its_late_answer() {
    let mut backend = MockDbServer::start(202, "stored").await;
    let comm = make_comm(
        StaticTopology::new()
            .with_shard("S1", ["srvA"])
            .with_server("srvA", &backend.cluster_endpoint()),
    );

    let ticket = comm.async_request(
        "shard:S1",
        Method::GET,
        "/x",
        None,
        RequestOptions::new(Duration::from_secs(30)),
    );
    let captured = backend.captured.recv().await.unwrap();

    // Wait for the ack to land so the record is out of Sending before the
    // drop; then the entry must be gone for good.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = comm.enquire(ticket).status;
        if status == Status::Sent || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    comm.drop_matching("", 0, ticket, "");
    assert_eq!(comm.enquire(ticket).status, Status::Dropped);

    let (correlation, answer) = answer_for(&captured, 200, "too late");
    let refused = comm.process_answer(&correlation, answer);
    assert!(matches!(refused, Err(AnswerError::AlreadyDropped)));

    comm.shutdown().await;
}

#[tokio::test]
async fn callback_is_fired_from_the_driver() {
    let backend = MockDbServer::start(200, "ok").await;
    let comm = make_comm(StaticTopology::new());

    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = parkable(done_tx);
    let callback = Arc::new(move |result: &shardcomm_common::CommResult| {
        if let Some(sender) = done_tx.lock().unwrap().take() {
            let _ = sender.send(result.status);
        }
        true
    });

    comm.async_request(
        &backend.cluster_endpoint(),
        Method::GET,
        "/cb",
        None,
        RequestOptions::new(Duration::from_secs(5))
            .single()
            .with_callback(callback),
    );

    let status = done_rx.await.unwrap();
    assert_eq!(status, Status::Received);
    comm.shutdown().await;
}

/// Oneshot senders are consumed on use; park one behind a mutex so a
/// `Fn` callback can take it.
fn parkable<T>(value: T) -> Arc<std::sync::Mutex<Option<T>>> {
    Arc::new(std::sync::Mutex::new(Some(value)))
}

#[tokio::test]
async fn answer_endpoint_round_trip() {
    let mut backend = MockDbServer::start(202, "stored").await;
    let comm = make_comm(
        StaticTopology::new()
            .with_shard("S1", ["srvA"])
            .with_server("srvA", &backend.cluster_endpoint()),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint_addr = listener.local_addr().unwrap();
    let router = answer_router(comm.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let ticket = comm.async_request(
        "shard:S1",
        Method::GET,
        "/x",
        None,
        RequestOptions::new(Duration::from_secs(30)),
    );
    let captured = backend.captured.recv().await.unwrap();
    let correlation = captured.header(wire::COORDINATOR).unwrap().to_string();

    let client = reqwest::Client::new();
    let response = client
        .put(format!("http://{endpoint_addr}{}", wire::SHARD_COMM_PATH))
        .header(wire::COORDINATOR, &correlation)
        .header(wire::RESPONSE_CODE, "200")
        .body("delivered over the wire")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let result = comm
        .wait("", 0, ticket, "", Some(Duration::from_secs(10)))
        .await;
    assert_eq!(result.status, Status::Received);
    assert_eq!(result.answer_code, Some(200));
    assert_eq!(
        result.answer.as_ref().unwrap().body,
        Bytes::from_static(b"delivered over the wire")
    );

    // Unknown tickets and malformed headers are reported, not propagated.
    let gone = client
        .put(format!("http://{endpoint_addr}{}", wire::SHARD_COMM_PATH))
        .header(wire::COORDINATOR, "crdn-1:999999999:x:0")
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);

    let malformed = client
        .put(format!("http://{endpoint_addr}{}", wire::SHARD_COMM_PATH))
        .header(wire::COORDINATOR, "lonely-field")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);

    comm.shutdown().await;
}

#[tokio::test]
async fn wildcard_wait_returns_completions_in_arrival_order() {
    let fast = MockDbServer::start(200, "fast").await;
    let comm = make_comm(StaticTopology::new());

    comm.async_request(
        &fast.cluster_endpoint(),
        Method::GET,
        "/1",
        None,
        RequestOptions::new(Duration::from_secs(5))
            .single()
            .with_transaction("", 7),
    );

    let result = comm.wait("", 7, 0, "", Some(Duration::from_secs(5))).await;
    assert_eq!(result.status, Status::Received);
    assert_eq!(result.coord_transaction_id, 7);

    // Nothing matching is left; the wildcard now reports Dropped.
    let empty = comm.wait("", 7, 0, "", Some(Duration::from_secs(1))).await;
    assert_eq!(empty.status, Status::Dropped);

    comm.shutdown().await;
}

#[tokio::test]
async fn requests_after_shutdown_are_backend_unavailable() {
    let comm = make_comm(StaticTopology::new());
    comm.shutdown().await;

    let ticket = comm.async_request(
        "server:dbs-1",
        Method::GET,
        "/x",
        None,
        RequestOptions::new(Duration::from_secs(1)),
    );
    let result = comm.enquire(ticket);
    assert_eq!(result.status, Status::BackendUnavailable);
    assert!(result.error_message.contains("shutting down"));
}
