//! Health and metrics HTTP endpoints.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::future::ready;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;

pub async fn index() -> &'static str {
    "event pipeline service"
}

/// Install the global Prometheus recorder. Must be called once, before any metric is
/// recorded, or those metrics are lost.
/// Histogram buckets are in milliseconds, durations are recorded as `*_ms`.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

pub fn router(recorder_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(recorder_handle.render())))
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(bind).await?;
    serve_listener(router, listener).await
}

pub async fn serve_listener(router: Router, listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, router).await
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency_ms = start.elapsed().as_millis() as f64;
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_ms", &labels).record(latency_ms);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get_path(path: &str) -> String {
        // a local recorder handle, the global one may only be installed once per process
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_listener(router(handle), listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        server.abort();
        response
    }

    #[tokio::test]
    async fn test_liveness() {
        let response = get_path("/_liveness").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));
    }

    #[tokio::test]
    async fn test_readiness() {
        let response = get_path("/_readiness").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("event pipeline service"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = get_path("/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }
}
