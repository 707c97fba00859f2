#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use receipts_adapter::{
    AdapterHealthResponse, AdapterRuntime, WebhookError, WebhookResponse, WEBHOOK_SECRET_HEADER,
};
use receipts_kernel_contracts::MonotonicTimeNs;
use receipts_os::config::RuntimeConfig;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = RuntimeConfig::from_env();
    let addr: SocketAddr = config.http_bind.parse()?;
    let sweep_interval_ms = parse_sweep_interval_ms_from_env();

    let runtime = Arc::new(AdapterRuntime::from_config(&config)?);
    let runtime_for_sweeper = runtime.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(sweep_interval_ms));
        loop {
            ticker.tick().await;
            let removed = runtime_for_sweeper.sweep_pending(MonotonicTimeNs::now());
            if removed > 0 {
                debug!(removed, "expired pending images swept");
            }
        }
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/whatsapp_webhook", post(whatsapp_webhook))
        .with_state(runtime.clone());

    info!(%addr, sweep_interval_ms, "receipts_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining forward queue");
    tokio::task::spawn_blocking(move || runtime.shutdown()).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_sweep_interval_ms_from_env() -> u64 {
    env::var("RECEIPTS_PENDING_SWEEP_INTERVAL_MS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| (1_000..=600_000).contains(v))
        .unwrap_or(30_000)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler failed");
    }
}

async fn healthz(
    State(runtime): State<Arc<AdapterRuntime>>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    let report = tokio::task::spawn_blocking(move || runtime.health_report()).await;
    match report {
        Ok(report) => (StatusCode::OK, Json(report)),
        Err(err) => {
            warn!(error = %err, "health report task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AdapterHealthResponse {
                    status: "error".to_string(),
                    seal_mode: "unknown".to_string(),
                    confidential: false,
                    pending_images: 0,
                    unforwarded_receipts: 0,
                    in_flight: 0,
                    forward_queue_depth: 0,
                }),
            )
        }
    }
}

async fn whatsapp_webhook(
    State(runtime): State<Arc<AdapterRuntime>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookError> {
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(err) = runtime.verify_secret(presented) {
        warn!(error = %err, "webhook rejected");
        return Err(err);
    }
    let now = MonotonicTimeNs::now();
    let response = tokio::task::spawn_blocking(move || runtime.process_body(&body, now))
        .await
        .map_err(|err| WebhookError::Internal(err.to_string()))??;
    Ok(Json(response))
}
