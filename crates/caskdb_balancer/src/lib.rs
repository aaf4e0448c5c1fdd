//! # CaskDB Balancer
//!
//! A least-connections HTTP load balancer for a pool of CaskDB servers.
//!
//! Every request is forwarded to the healthy backend with the fewest
//! requests currently in flight. A background task probes each backend's
//! `/health` route on a fixed interval and takes failing backends out of
//! rotation until they recover. When no backend is healthy the balancer
//! answers 503.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Balancer settings.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Backend addresses, `host:port` without a scheme.
    pub backends: Vec<String>,
    /// URL scheme used to reach backends.
    pub scheme: String,
    /// Interval between health probes.
    pub health_interval: Duration,
    /// Per-request timeout for probes and forwarded requests.
    pub request_timeout: Duration,
    /// Whether to add an `lb-from` header naming the chosen backend.
    pub trace: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            scheme: "http".to_owned(),
            health_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(3),
            trace: false,
        }
    }
}

/// One backend server and its live counters.
#[derive(Debug)]
pub struct Backend {
    /// Address in `host:port` form.
    pub address: String,
    healthy: AtomicBool,
    in_flight: AtomicUsize,
}

impl Backend {
    /// Creates a backend that starts out unhealthy until the first probe.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            healthy: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Whether the last health probe succeeded.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Marks the backend healthy or unhealthy.
    pub fn set_healthy(&self, value: bool) {
        self.healthy.store(value, Ordering::SeqCst);
    }

    /// Number of requests currently being forwarded to this backend.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Holds a backend's in-flight slot until the forwarded request finishes.
struct InFlightGuard(Arc<Backend>);

impl InFlightGuard {
    fn acquire(backend: Arc<Backend>) -> Self {
        backend.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(backend)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The set of backends a balancer instance distributes over.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
}

impl BackendPool {
    /// Builds a pool from backend addresses.
    pub fn new(addresses: &[String]) -> Self {
        Self {
            backends: addresses
                .iter()
                .map(|a| Arc::new(Backend::new(a.clone())))
                .collect(),
        }
    }

    /// All backends, healthy or not.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Picks the healthy backend with the fewest in-flight requests.
    pub fn select(&self) -> Option<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy())
            .min_by_key(|b| b.in_flight())
            .cloned()
    }
}

/// Shared state behind the forwarding handler.
#[derive(Debug)]
pub struct Balancer {
    /// The backend pool requests are distributed over.
    pub pool: BackendPool,
    config: BalancerConfig,
    client: reqwest::Client,
}

impl Balancer {
    /// Builds a balancer and its HTTP client from configuration.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(config: BalancerConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            pool: BackendPool::new(&config.backends),
            config,
            client,
        })
    }

    /// Probes one backend's `/health` route and updates its status.
    pub async fn probe(&self, backend: &Backend) -> bool {
        let url = format!("{}://{}/health", self.config.scheme, backend.address);
        let healthy = match self.client.get(&url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(_) => false,
        };
        backend.set_healthy(healthy);
        healthy
    }

    /// Probes every backend once.
    pub async fn probe_all(&self) {
        for backend in self.pool.backends() {
            let healthy = self.probe(backend).await;
            tracing::info!(
                backend = %backend.address,
                healthy,
                in_flight = backend.in_flight(),
                "health probe"
            );
        }
    }
}

/// Runs health probes on the configured interval, forever.
pub async fn run_health_probes(balancer: Arc<Balancer>) {
    let mut ticker = tokio::time::interval(balancer.config.health_interval);
    loop {
        ticker.tick().await;
        balancer.probe_all().await;
    }
}

/// Forwards one request to the least-loaded healthy backend.
async fn forward(State(balancer): State<Arc<Balancer>>, request: Request) -> Response {
    let Some(backend) = balancer.pool.select() else {
        tracing::warn!("no healthy backends available");
        return (StatusCode::SERVICE_UNAVAILABLE, "all servers are busy").into_response();
    };
    let _guard = InFlightGuard::acquire(Arc::clone(&backend));

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_owned(), |pq| pq.as_str().to_owned());
    let url = format!(
        "{}://{}{}",
        balancer.config.scheme, backend.address, path_and_query
    );

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "could not read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let mut headers = parts.headers;
    headers.remove(axum::http::header::HOST);
    headers.remove(axum::http::header::CONTENT_LENGTH);

    let result = balancer
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match result {
        Ok(response) => {
            tracing::debug!(
                backend = %backend.address,
                status = %response.status(),
                "fwd"
            );
            let status = response.status();
            let mut headers = relay_headers(response.headers());
            if balancer.config.trace {
                if let Ok(value) = backend.address.parse() {
                    headers.insert("lb-from", value);
                }
            }
            match response.bytes().await {
                Ok(bytes) => (status, headers, bytes).into_response(),
                Err(e) => {
                    tracing::warn!(backend = %backend.address, error = %e, "could not read backend response");
                    StatusCode::SERVICE_UNAVAILABLE.into_response()
                }
            }
        }
        Err(e) => {
            tracing::warn!(backend = %backend.address, error = %e, "could not reach backend");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Response headers minus the framing ones the local server recomputes.
fn relay_headers(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::new();
    for (name, value) in headers {
        let skip = name == &axum::http::header::TRANSFER_ENCODING
            || name == &axum::http::header::CONNECTION
            || name == &axum::http::header::CONTENT_LENGTH;
        if !skip {
            relayed.append(name.clone(), value.clone());
        }
    }
    relayed
}

/// Creates the forwarding router; every method and path goes to the pool.
pub fn create_router(balancer: Arc<Balancer>) -> Router {
    Router::new().fallback(forward).with_state(balancer)
}

/// Serves the balancer on `bind_addr` with background health probing.
///
/// # Errors
///
/// Returns an I/O error if the listener cannot bind or the server fails.
pub async fn start_balancer(bind_addr: SocketAddr, balancer: Arc<Balancer>) -> std::io::Result<()> {
    tokio::spawn(run_health_probes(Arc::clone(&balancer)));

    let app = create_router(balancer);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("balancer listening on {}", bind_addr);
    axum::serve(listener, app.into_make_service()).await
}
