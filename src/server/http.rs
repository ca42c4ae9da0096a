//! HTTP listener subsystem.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::ServerError;
use crate::bus::HeaderCarrier;
use crate::telemetry::Telemetry;

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Grace period for draining subsystems on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_secs: 5,
        }
    }
}

impl HttpConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// A bound listener plus the router it will serve.
///
/// Binding happens at construction so port conflicts surface before any
/// subsystem starts.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
}

impl HttpServer {
    pub async fn bind(config: &HttpConfig, router: Router) -> Result<Self, ServerError> {
        let addr = config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        Ok(Self {
            listener,
            router,
            local_addr,
        })
    }

    /// Address actually bound, with the kernel-assigned port when 0 was asked.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `stop` flips to `true`, then drain in-flight requests.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<(), ServerError> {
        info!(addr = %self.local_addr, "HTTP server listening");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                // A dropped sender also means stop.
                let _ = stop.wait_for(|stopped| *stopped).await;
            })
            .await
            .map_err(ServerError::Serve)?;

        info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the service router: health check at `/`, `routes` merged in, every
/// request traced with its parent taken from the incoming W3C headers.
///
/// `route_table` lists the method and path of each merged route for the
/// startup log.
pub fn router(
    app_name: &str,
    telemetry: Arc<Telemetry>,
    routes: Router,
    route_table: &[(&str, &str)],
) -> Router {
    let health_message = format!("Services {} run properly", app_name);
    let health = Router::new().route(
        "/",
        get(move || {
            let message = health_message.clone();
            async move { Json(health_body(&message)) }
        }),
    );

    let router = health.merge(routes);
    log_routes(app_name, &[("GET", "/")]);
    log_routes(app_name, route_table);

    router.layer(TraceLayer::new_for_http().make_span_with(move |request: &Request<Body>| {
        let span = info_span!(
            "http.request",
            otel.kind = "server",
            http.method = %request.method(),
            http.route = %request.uri().path(),
        );
        let carrier: HeaderCarrier = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        span.set_parent(telemetry.extract(&carrier));
        span
    }))
}

fn health_body(message: &str) -> Value {
    json!({
        "success": true,
        "code": 200,
        "message": message,
    })
}

fn log_routes(app_name: &str, route_table: &[(&str, &str)]) {
    for (method, path) in route_table {
        info!(app = %app_name, method = %method, path = %path, "Registered route");
    }
}
