//! courier: todo HTTP service with traced event dispatch
//!
//! ## Architecture
//! ```text
//! HTTP POST /todo --> TodoService --> store
//!                          |
//!                          v
//!                  [todo.create queue] --> EventConsumer --> TodoNotifier
//! ```
//!
//! ## Configuration
//! - First argument or COURIER_CONFIG: YAML config file (default courier.yaml)
//! - COURIER__*: overrides, `__` separated (e.g. COURIER__BROKER__URL)
//! - COURIER_LOG: log filter (default: info)
//!
//! Shutdown is driven by Ctrl+C or SIGTERM. Resources are released after the
//! coordinator reports done, in reverse order of acquisition.

use std::sync::Arc;

use tracing::{error, info};

use courier::bus::{self, EventConsumer, EventPublisher};
use courier::config::{parse_config_path, Config};
use courier::server::{self, HttpServer, Server};
use courier::storage::{MemoryTodoStore, TodoStore};
use courier::telemetry::{init_tracing, Telemetry};
use courier::todo::{self, TodoNotifier, TodoService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(parse_config_path().as_deref())?;

    // Acquisition order: tracer, store, broker.
    let telemetry = Arc::new(Telemetry::new(&config.telemetry, &config.app)?);
    init_tracing(config.telemetry.enabled.then_some(&*telemetry))?;
    if let Some(endpoint) = telemetry.exporter_endpoint() {
        info!(endpoint = %endpoint, "OTLP span exporter installed");
    }

    let store: Arc<dyn TodoStore> = Arc::new(MemoryTodoStore::new());
    let channel = bus::connect_with_retry(&config.broker).await?;

    let publisher = Arc::new(EventPublisher::new(
        channel.clone(),
        telemetry.clone(),
        config.events.queue.clone(),
    ));
    let service = Arc::new(TodoService::new(store.clone(), publisher));

    let router = server::http::router(
        &config.app.name,
        telemetry.clone(),
        todo::routes(service),
        todo::ROUTE_TABLE,
    );
    let http = HttpServer::bind(&config.http, router).await?;

    let consumer = EventConsumer::new(
        channel.clone(),
        telemetry.clone(),
        config.events.queue.clone(),
        Arc::new(TodoNotifier),
    )
    .with_ack_policy(config.events.ack_policy)
    .with_consumer_tag(config.broker.consumer_tag.clone());

    let server = Arc::new(Server::new(http, vec![Arc::new(consumer)]));
    let done = server
        .take_done_signal()
        .await
        .ok_or("done signal already taken")?;

    server.run().await?;
    info!(app = %config.app.name, "courier started");

    let deadline = config.http.shutdown_timeout();
    let stopper = server.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        stopper.graceful_stop(deadline).await;
    });

    // A dropped sender also means the coordinator is gone.
    let _ = done.await;

    if let Err(e) = channel.close().await {
        error!(error = %e, "Failed to close broker channel");
    }
    if let Err(e) = store.disconnect().await {
        error!(error = %e, "Failed to disconnect store");
    }
    if let Err(e) = telemetry.shutdown() {
        error!(error = %e, "Failed to shut down tracer provider");
    }

    info!("Shutdown complete");
    Ok(())
}
