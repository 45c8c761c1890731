use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use cdp_adapter::metrics as cdp_metrics;
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Encoder, Registry, TextEncoder};
use soulbrowser_wait_task::metrics as wait_metrics;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info};

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = global_registry();
        wait_metrics::register_metrics(registry);
        cdp_metrics::register_metrics(registry);
    });
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

/// Serves `/metrics` for the lifetime of the process. Port zero disables it.
pub fn spawn_metrics_server(port: u16) -> Option<JoinHandle<()>> {
    if port == 0 {
        return None;
    }

    register_metrics();
    let registry = Arc::new(global_registry().clone());
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    info!(%addr, "metrics server listening");
    Some(tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app.into_make_service()).await {
                    error!(?err, "metrics server exited with error");
                }
            }
            Err(err) => {
                error!(?err, "failed to bind metrics listener");
            }
        }
    }))
}

/// Prometheus text exposition of everything in `registry`.
pub fn render(registry: &Registry) -> Result<String, String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|err| err.to_string())?;
    String::from_utf8(buffer).map_err(|err| err.to_string())
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    let encoder = TextEncoder::new();
    let body = match render(&registry) {
        Ok(body) => body,
        Err(err) => {
            error!(%err, "failed to encode prometheus metrics");
            return (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response();
        }
    };

    match HeaderValue::from_str(encoder.format_type()) {
        Ok(value) => ([(axum::http::header::CONTENT_TYPE, value)], body).into_response(),
        Err(err) => {
            error!(?err, "failed to build content-type header");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_includes_wait_and_cdp_families() {
        register_metrics();
        wait_metrics::record_started("raf");
        cdp_metrics::record_event();

        let text = render(global_registry()).expect("encodes");
        assert!(text.contains("soul_wait_"));
        assert!(text.contains("soul_cdp_"));
    }
}
