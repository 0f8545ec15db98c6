//! Mock event collector
//!
//! Accepts the analyser's event POSTs for local testing.
//!
//! Behavior:
//! 1. Listens on a configurable port (default 5000)
//! 2. POST /api/data - logs and stores the JSON payload, answers 201
//! 3. GET /api/data - returns every payload received so far
//! 4. With --fail-every N, every Nth POST answers 503 to exercise retries
//!
//! Usage:
//!   cargo run --bin mock-collector -- --port 5000 --fail-every 3

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock-collector")]
#[command(about = "Mock event collector for local simulation")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "5000")]
    port: u16,

    /// Answer 503 to every Nth POST (0 disables)
    #[arg(long, default_value = "0")]
    fail_every: u64,
}

#[derive(Default)]
struct CollectorState {
    posts: AtomicU64,
    received: Mutex<Vec<serde_json::Value>>,
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<CollectorState>,
    fail_every: u64,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    match (req.method().clone(), path.as_str()) {
        (Method::POST, "/api/data") => {
            let n = state.posts.fetch_add(1, Ordering::Relaxed) + 1;
            let idempotency_key = req
                .headers()
                .get("Idempotency-Key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            if fail_every > 0 && n % fail_every == 0 {
                warn!(request = %n, eid = %idempotency_key, "injected_failure");
                return Ok(json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    r#"{"ok":false,"error":"injected"}"#.to_string(),
                ));
            }

            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "body_read_failed");
                    return Ok(json_response(
                        StatusCode::BAD_REQUEST,
                        r#"{"ok":false,"error":"body"}"#.to_string(),
                    ));
                }
            };

            match serde_json::from_slice::<serde_json::Value>(&body) {
                Ok(payload) => {
                    info!(request = %n, eid = %idempotency_key, payload = %payload, "event_received");
                    state.received.lock().push(payload);
                    Ok(json_response(StatusCode::CREATED, r#"{"ok":true}"#.to_string()))
                }
                Err(e) => {
                    warn!(request = %n, error = %e, "invalid_json");
                    Ok(json_response(
                        StatusCode::BAD_REQUEST,
                        r#"{"ok":false,"error":"invalid_json"}"#.to_string(),
                    ))
                }
            }
        }
        (Method::GET, "/api/data") => {
            let body = serde_json::to_string(&*state.received.lock())
                .unwrap_or_else(|_| "[]".to_string());
            Ok(json_response(StatusCode::OK, body))
        }
        _ => Ok(json_response(StatusCode::NOT_FOUND, r#"{"ok":false}"#.to_string())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    let state = Arc::new(CollectorState::default());

    info!(port = %args.port, fail_every = %args.fail_every, "mock_collector_listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();
        let fail_every = args.fail_every;

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone(), fail_every));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(peer = %peer, error = %e, "mock_collector_http_error");
            }
        });
    }
}
