//! Mock remote API
//!
//! Serves the endpoints the relay talks to, for local end-to-end runs:
//! - POST /api/auth-plugin/auth/login-by-key - issues a token pair
//! - POST /auth/refresh - rotates the access token
//! - POST /api/golf/check-location/telemetry - accepts aggregate payloads
//! - POST /notification/update-buggy-location - accepts position lists
//!
//! Failures are injected deterministically: with `--failure-rate 0.25`
//! exactly one aggregate post in four gets a 500.
//!
//! Usage:
//!   cargo run --bin mock_api -- --port 8080 --token-ttl-secs 120 --failure-rate 0.1

use bytes::Bytes;
use clap::Parser;
use geotrack::domain::types::{Envelope, LoginRequest, RefreshRequest, TokenData};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mock_api")]
#[command(about = "Mock remote API for local GeoTrack runs")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Access token lifetime (seconds)
    #[arg(long, default_value = "300")]
    token_ttl_secs: u64,

    /// Fraction of aggregate posts answered with 500 (0.0 - 1.0)
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Accept only this client id (any when unset)
    #[arg(long)]
    client_id: Option<String>,

    /// Accept only this secret (any when unset)
    #[arg(long)]
    secret: Option<String>,
}

struct MockState {
    args: Args,
    /// access token -> expiry
    access_tokens: Mutex<FxHashMap<String, Instant>>,
    /// refresh token -> issued access token
    refresh_tokens: Mutex<FxHashMap<String, String>>,
    aggregates: AtomicU64,
}

impl MockState {
    fn issue_tokens(&self) -> TokenData {
        let access = Uuid::now_v7().to_string();
        let refresh = Uuid::now_v7().to_string();
        let ttl = Duration::from_secs(self.args.token_ttl_secs);
        self.access_tokens.lock().insert(access.clone(), Instant::now() + ttl);
        self.refresh_tokens.lock().insert(refresh.clone(), access.clone());
        TokenData {
            access_token: access,
            expire_in_seconds: self.args.token_ttl_secs as i64,
            refresh_token: Some(refresh),
        }
    }

    fn authorized(&self, req: &Request<hyper::body::Incoming>) -> bool {
        let Some(token) = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        matches!(self.access_tokens.lock().get(token), Some(expiry) if Instant::now() < *expiry)
    }

    /// Deterministic failure injection: fails `failure_rate` of all posts
    fn should_fail(&self, n: u64) -> bool {
        let rate = self.args.failure_rate.clamp(0.0, 1.0);
        ((n + 1) as f64 * rate).floor() > (n as f64 * rate).floor()
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn failure(message: &str) -> Envelope<TokenData> {
    Envelope { is_successful: false, data: None, message: Some(message.to_string()) }
}

async fn read_body(req: Request<hyper::body::Incoming>) -> Option<Bytes> {
    req.into_body().collect().await.ok().map(|body| body.to_bytes())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<MockState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/api/auth-plugin/auth/login-by-key") => {
            let body = read_body(req).await.unwrap_or_default();
            match serde_json::from_slice::<LoginRequest>(&body) {
                Ok(login)
                    if state.args.client_id.as_ref().map_or(true, |id| *id == login.client_id)
                        && state.args.secret.as_ref().map_or(true, |s| *s == login.secret) =>
                {
                    println!("[MOCK] Login ok for client {}", login.client_id);
                    let data = state.issue_tokens();
                    json_response(StatusCode::OK, &Envelope { is_successful: true, data: Some(data), message: None })
                }
                Ok(login) => {
                    println!("[MOCK] Login rejected for client {}", login.client_id);
                    json_response(StatusCode::OK, &failure("invalid client credentials"))
                }
                Err(e) => {
                    println!("[MOCK] Login body invalid: {}", e);
                    json_response(StatusCode::BAD_REQUEST, &failure("invalid request body"))
                }
            }
        }
        (&Method::POST, "/auth/refresh") => {
            let body = read_body(req).await.unwrap_or_default();
            let refresh = serde_json::from_slice::<RefreshRequest>(&body).ok();
            let known = refresh.and_then(|r| state.refresh_tokens.lock().remove(&r.refresh_token));
            match known {
                Some(old_access) => {
                    state.access_tokens.lock().remove(&old_access);
                    println!("[MOCK] Token refreshed");
                    let data = state.issue_tokens();
                    json_response(StatusCode::OK, &Envelope { is_successful: true, data: Some(data), message: None })
                }
                None => {
                    println!("[MOCK] Refresh rejected");
                    json_response(StatusCode::UNAUTHORIZED, &failure("unknown refresh token"))
                }
            }
        }
        (&Method::POST, "/api/golf/check-location/telemetry") => {
            if !state.authorized(&req) {
                println!("[MOCK] Telemetry rejected: bad or expired token");
                text_response(StatusCode::UNAUTHORIZED, "Unauthorized")
            } else {
                let n = state.aggregates.fetch_add(1, Ordering::Relaxed);
                let body = read_body(req).await.unwrap_or_default();
                if state.should_fail(n) {
                    println!("[MOCK] Telemetry #{} -> injected 500", n + 1);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Injected failure")
                } else {
                    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
                    println!(
                        "[MOCK] Telemetry #{}: {} devices, {} active",
                        n + 1,
                        payload["metrics"]["totalDevices"],
                        payload["metrics"]["activeDevices"]
                    );
                    text_response(StatusCode::OK, "OK")
                }
            }
        }
        (&Method::POST, "/notification/update-buggy-location") => {
            if !state.authorized(&req) {
                text_response(StatusCode::UNAUTHORIZED, "Unauthorized")
            } else {
                let body = read_body(req).await.unwrap_or_default();
                let items: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap_or_default();
                println!("[MOCK] Notification: {} positions", items.len());
                text_response(StatusCode::OK, "OK")
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    println!("[MOCK] {} {} -> {}", method, path, response.status().as_u16());
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;

    println!("[MOCK] Remote API listening on {}", addr);
    println!(
        "[MOCK] token ttl {}s, failure rate {:.2}",
        args.token_ttl_secs, args.failure_rate
    );

    let state = Arc::new(MockState {
        args,
        access_tokens: Mutex::new(FxHashMap::default()),
        refresh_tokens: Mutex::new(FxHashMap::default()),
        aggregates: AtomicU64::new(0),
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        eprintln!("[MOCK] Accept failed: {}", e);
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle_request(req, state.clone()));
                    if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                        eprintln!("[MOCK] Connection error: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[MOCK] Shutting down");
                return Ok(());
            }
        }
    }
}
