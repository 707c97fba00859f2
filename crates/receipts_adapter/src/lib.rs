#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use receipts_engines::sealer::{SealError, SealMode, Sealer};
use receipts_kernel_contracts::MonotonicTimeNs;
use receipts_os::config::RuntimeConfig;
use receipts_os::correlation::{
    BatchReport, CorrelationController, CorrelationDeps, MessageOutcome,
};
use receipts_os::error::CorrelationError;
use receipts_os::forward::{
    ForwardQueue, InFlightReceipts, OperatorChannel, OperatorForwarder, ReceiptSettlement,
};
use receipts_os::image_dir::SealedImageDir;
use receipts_os::media_fetch::HttpMediaFetcher;
use receipts_os::telegram::{LogOnlyChannel, TelegramBotChannel};
use receipts_storage::store::{ReceiptStore, StorageError};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

pub const WEBHOOK_SECRET_HEADER: &str = "X-Webhook-Secret";

#[derive(Debug, Error)]
pub enum AdapterInitError {
    #[error("invalid encryption key: {0}")]
    Seal(#[from] SealError),

    #[error("store startup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("image directory unavailable: {0}")]
    Images(#[from] CorrelationError),

    #[error("forward worker failed to start: {0}")]
    Worker(#[from] std::io::Error),
}

/// Errors the webhook endpoint can answer with. Bodies never echo the presented secret.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing webhook secret header")]
    MissingSecret,

    #[error("invalid webhook secret")]
    InvalidSecret,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSecret | Self::InvalidSecret => StatusCode::UNAUTHORIZED,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn public_status(&self) -> &'static str {
        match self {
            Self::MissingSecret | Self::InvalidSecret => "unauthorized",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Internal(_) => "error",
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "status": self.public_status() });
        (self.status_code(), Json(body)).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookOutcomeRow {
    pub outcome: String,
    pub receipt_id: Option<String>,
    pub score: Option<u8>,
    pub reason: Option<String>,
}

impl From<&MessageOutcome> for WebhookOutcomeRow {
    fn from(outcome: &MessageOutcome) -> Self {
        let (score, reason) = match outcome {
            MessageOutcome::MatchEnqueued { score, .. } | MessageOutcome::NoMatch { score, .. } => {
                (Some(*score), None)
            }
            MessageOutcome::Dropped { reason } => (None, Some((*reason).to_string())),
            MessageOutcome::Failed { stage, .. } => (None, Some((*stage).to_string())),
            _ => (None, None),
        };
        Self {
            outcome: outcome.label().to_string(),
            receipt_id: outcome.receipt_id().map(|id| id.as_str().to_string()),
            score,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    pub shape: String,
    pub processed: usize,
    pub dropped_by_normalizer: usize,
    pub outcomes: Vec<WebhookOutcomeRow>,
}

impl From<&BatchReport> for WebhookResponse {
    fn from(report: &BatchReport) -> Self {
        Self {
            status: "ok".to_string(),
            shape: report.shape.as_str().to_string(),
            processed: report.outcomes.len(),
            dropped_by_normalizer: report.dropped_by_normalizer,
            outcomes: report.outcomes.iter().map(WebhookOutcomeRow::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub seal_mode: String,
    pub confidential: bool,
    pub pending_images: usize,
    pub unforwarded_receipts: usize,
    pub in_flight: usize,
    pub forward_queue_depth: usize,
}

/// Everything the HTTP surface needs. Webhook bodies run on blocking threads through
/// [`AdapterRuntime::process_body`].
#[derive(Debug)]
pub struct AdapterRuntime {
    controller: CorrelationController,
    queue: Option<Arc<ForwardQueue>>,
    webhook_secret: Option<String>,
}

impl AdapterRuntime {
    pub fn new(controller: CorrelationController, webhook_secret: Option<String>) -> Self {
        Self {
            controller,
            queue: None,
            webhook_secret,
        }
    }

    pub fn default_from_env() -> Result<Self, AdapterInitError> {
        Self::from_config(&RuntimeConfig::from_env())
    }

    /// Replays the store journal, opens the image directory and starts the forward worker.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, AdapterInitError> {
        let sealer = Sealer::from_optional_key(config.encryption_key.as_deref())?;
        if !sealer.is_confidential() {
            warn!("no encryption key configured: receipt images are written unencrypted");
        }
        let images = SealedImageDir::new(config.image_dir.clone(), sealer)?;
        let store = ReceiptStore::open_journaled(config.store_path.clone())?;
        info!(
            store_path = %config.store_path.display(),
            receipts = store.receipts().len(),
            unforwarded = store.unforwarded_count(),
            "receipt store replayed"
        );
        let store = Arc::new(Mutex::new(store));
        let in_flight = InFlightReceipts::new();

        let channel: Box<dyn OperatorChannel> = match TelegramBotChannel::from_config(&config.bot) {
            Some(channel) => Box::new(channel),
            None => {
                warn!("operator bot token or chat id missing: using log-only channel");
                Box::new(LogOnlyChannel)
            }
        };
        let settlement = Arc::new(ReceiptSettlement::new(Arc::clone(&store), in_flight.clone()));
        let queue = Arc::new(ForwardQueue::spawn(
            channel,
            settlement,
            config.forward_queue_capacity,
        )?);
        let forwarder: Arc<dyn OperatorForwarder> = queue.clone();

        let controller = CorrelationController::new(
            config.correlation.clone(),
            CorrelationDeps {
                store,
                in_flight,
                images,
                fetcher: Arc::new(HttpMediaFetcher::new(config.media.clone())),
                forwarder,
            },
        );
        if config.webhook_secret.is_none() {
            warn!("no webhook secret configured: webhook requests are not authenticated");
        }
        Ok(Self {
            controller,
            queue: Some(queue),
            webhook_secret: config.webhook_secret.clone(),
        })
    }

    pub fn controller(&self) -> &CorrelationController {
        &self.controller
    }

    /// Without a configured secret every request passes.
    pub fn verify_secret(&self, presented: Option<&str>) -> Result<(), WebhookError> {
        let Some(expected) = self.webhook_secret.as_ref() else {
            return Ok(());
        };
        let presented = presented.ok_or(WebhookError::MissingSecret)?;
        if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSecret)
        }
    }

    /// Blocking: media downloads happen inline.
    pub fn process_body(&self, body: &[u8], now: MonotonicTimeNs) -> Result<WebhookResponse, WebhookError> {
        let report = self.controller.process_body(body, now).map_err(|err| match err {
            CorrelationError::Parse(detail) => WebhookError::InvalidPayload(detail),
            other => WebhookError::Internal(other.to_string()),
        })?;
        info!(
            shape = report.shape.as_str(),
            messages = report.outcomes.len(),
            stored = report.count("receipt_stored"),
            enqueued = report.count("match_enqueued"),
            failed = report.count("failed"),
            "webhook batch processed"
        );
        Ok(WebhookResponse::from(&report))
    }

    pub fn handle_webhook(
        &self,
        presented_secret: Option<&str>,
        body: &[u8],
        now: MonotonicTimeNs,
    ) -> Result<WebhookResponse, WebhookError> {
        self.verify_secret(presented_secret)?;
        self.process_body(body, now)
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        let seal_mode = self.controller.seal_mode();
        AdapterHealthResponse {
            status: "ok".to_string(),
            seal_mode: seal_mode.as_str().to_string(),
            confidential: seal_mode == SealMode::Aes256Gcm,
            pending_images: self.controller.pending_len(),
            unforwarded_receipts: self.controller.unforwarded_count(),
            in_flight: self.controller.in_flight_count(),
            forward_queue_depth: self.controller.queue_depth(),
        }
    }

    pub fn sweep_pending(&self, now: MonotonicTimeNs) -> usize {
        self.controller.sweep_pending(now)
    }

    /// Stops intake on the forward queue and waits for queued deliveries.
    pub fn shutdown(&self) {
        if let Some(queue) = self.queue.as_ref() {
            queue.shutdown();
        }
    }
}
