//! End-to-end balancer tests against stub backends on ephemeral ports.

use axum::{routing::get, Router};
use caskdb_balancer::{create_router, Balancer, BalancerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Starts a stub backend that reports healthy and names itself on `/whoami`.
async fn start_backend(name: &'static str) -> SocketAddr {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/whoami", get(move || async move { name }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_balancer_over(backends: Vec<String>) -> (Arc<Balancer>, SocketAddr) {
    let config = BalancerConfig {
        backends,
        request_timeout: Duration::from_secs(1),
        ..BalancerConfig::default()
    };
    let balancer = Arc::new(Balancer::new(config).unwrap());
    balancer.probe_all().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(Arc::clone(&balancer));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (balancer, addr)
}

#[tokio::test]
async fn forwards_to_a_healthy_backend() {
    let backend = start_backend("alpha").await;
    let (_balancer, addr) = start_balancer_over(vec![backend.to_string()]).await;

    let response = reqwest::get(format!("http://{addr}/whoami")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "alpha");
}

#[tokio::test]
async fn dead_backends_are_marked_unhealthy_and_skipped() {
    let alive = start_backend("alive").await;
    // A bound-then-dropped listener gives an address nothing answers on.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (balancer, addr) =
        start_balancer_over(vec![dead.to_string(), alive.to_string()]).await;
    assert!(!balancer.pool.backends()[0].is_healthy());
    assert!(balancer.pool.backends()[1].is_healthy());

    for _ in 0..5 {
        let response = reqwest::get(format!("http://{addr}/whoami")).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "alive");
    }
}

#[tokio::test]
async fn no_healthy_backends_means_503() {
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (_balancer, addr) = start_balancer_over(vec![dead.to_string()]).await;

    let response = reqwest::get(format!("http://{addr}/whoami")).await.unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn backend_errors_relay_their_status() {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(
            "/boom",
            get(|| async { (axum::http::StatusCode::IM_A_TEAPOT, "teapot") }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (_balancer, addr) = start_balancer_over(vec![backend.to_string()]).await;

    let response = reqwest::get(format!("http://{addr}/boom")).await.unwrap();
    assert_eq!(response.status(), 418);
    assert_eq!(response.text().await.unwrap(), "teapot");
}
