#![forbid(unsafe_code)]

//! Per-message state machine tying the normalizer, the pending-image cache, the receipt store
//! and the matcher together.
//!
//! Lock order is always store then in-flight set. Nothing here holds the store lock across a
//! network call.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use receipts_engines::claim::{ClaimDetection, ClaimParser, ClaimParserConfig};
use receipts_engines::matcher::{FuzzyMatcher, FuzzyMatcherConfig};
use receipts_engines::normalizer::{normalize_with_stats, PayloadShape};
use receipts_engines::pending_image::{ClaimedMediaGuard, PendingImageCache, PendingImageConfig};
use receipts_engines::sealer::SealMode;
use receipts_kernel_contracts::audit::{AuditAction, AuditSeverity};
use receipts_kernel_contracts::message::{ChatKey, GroupId, MediaRef, NormalizedMessage};
use receipts_kernel_contracts::query::{QueryRecordInput, QueryStatus, MAX_QUERY_TEXT_LEN};
use receipts_kernel_contracts::receipt::{CustomerName, Receipt, ReceiptId};
use receipts_kernel_contracts::MonotonicTimeNs;
use receipts_storage::audit::AuditWriter;
use receipts_storage::store::{ReceiptStore, StorageError};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{CorrelationError, DeliveryError};
use crate::forward::{ForwardTask, InFlightReceipts, OperatorForwarder};
use crate::image_dir::{guess_extension, SealedImageDir};
use crate::media_fetch::MediaFetcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationConfig {
    /// Empty means every group chat is monitored.
    pub monitored_groups: BTreeSet<GroupId>,
    pub claim: ClaimParserConfig,
    pub pending: PendingImageConfig,
    pub matcher: FuzzyMatcherConfig,
    pub forward_on_store: bool,
    pub admin_chat_id: Option<String>,
}

impl CorrelationConfig {
    pub fn mvp_v1() -> Self {
        Self {
            monitored_groups: BTreeSet::new(),
            claim: ClaimParserConfig::mvp_v1(),
            pending: PendingImageConfig::mvp_v1(),
            matcher: FuzzyMatcherConfig::mvp_v1(),
            forward_on_store: false,
            admin_chat_id: None,
        }
    }

    pub fn is_monitored(&self, group_id: &GroupId) -> bool {
        self.monitored_groups.is_empty() || self.monitored_groups.contains(group_id)
    }
}

/// Shared collaborators the controller drives.
pub struct CorrelationDeps {
    pub store: Arc<Mutex<ReceiptStore>>,
    pub in_flight: InFlightReceipts,
    pub images: SealedImageDir,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub forwarder: Arc<dyn OperatorForwarder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Attached,
    Pending,
}

impl ImageSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attached => "attached",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    ReceiptStored {
        receipt_id: ReceiptId,
        customer_name: CustomerName,
        image_source: ImageSource,
        forward_enqueued: bool,
    },
    ImageCached {
        replaced: bool,
    },
    ClaimUnresolved {
        customer_name: CustomerName,
    },
    MatchEnqueued {
        receipt_id: ReceiptId,
        score: u8,
    },
    NoMatch {
        score: u8,
        best: Option<ReceiptId>,
    },
    Dropped {
        reason: &'static str,
    },
    Failed {
        stage: &'static str,
        error: String,
    },
}

impl MessageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ReceiptStored { .. } => "receipt_stored",
            Self::ImageCached { .. } => "image_cached",
            Self::ClaimUnresolved { .. } => "claim_unresolved",
            Self::MatchEnqueued { .. } => "match_enqueued",
            Self::NoMatch { .. } => "no_match",
            Self::Dropped { .. } => "dropped",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn receipt_id(&self) -> Option<&ReceiptId> {
        match self {
            Self::ReceiptStored { receipt_id, .. } | Self::MatchEnqueued { receipt_id, .. } => {
                Some(receipt_id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub shape: PayloadShape,
    pub outcomes: Vec<MessageOutcome>,
    pub dropped_by_normalizer: usize,
}

impl BatchReport {
    pub fn count(&self, label: &str) -> usize {
        self.outcomes.iter().filter(|o| o.label() == label).count()
    }
}

pub struct CorrelationController {
    config: CorrelationConfig,
    claims: ClaimParser,
    pending: PendingImageCache,
    claimed_media: ClaimedMediaGuard,
    matcher: FuzzyMatcher,
    store: Arc<Mutex<ReceiptStore>>,
    in_flight: InFlightReceipts,
    images: SealedImageDir,
    fetcher: Arc<dyn MediaFetcher>,
    forwarder: Arc<dyn OperatorForwarder>,
}

impl std::fmt::Debug for CorrelationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationController")
            .field("config", &self.config)
            .field("pending_images", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl CorrelationController {
    pub fn new(config: CorrelationConfig, deps: CorrelationDeps) -> Self {
        Self {
            claims: ClaimParser::new(config.claim.clone()),
            pending: PendingImageCache::new(config.pending),
            claimed_media: ClaimedMediaGuard::new(config.pending.ttl_ms),
            matcher: FuzzyMatcher::new(config.matcher),
            store: deps.store,
            in_flight: deps.in_flight,
            images: deps.images,
            fetcher: deps.fetcher,
            forwarder: deps.forwarder,
            config,
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<Mutex<ReceiptStore>> {
        Arc::clone(&self.store)
    }

    /// Parses a raw webhook body and processes it as one batch.
    pub fn process_body(&self, body: &[u8], now: MonotonicTimeNs) -> Result<BatchReport, CorrelationError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|err| CorrelationError::Parse(err.to_string()))?;
        Ok(self.process_batch(&raw, now))
    }

    /// Messages are processed in payload order; a failure in one never stops the rest.
    pub fn process_batch(&self, raw: &Value, now: MonotonicTimeNs) -> BatchReport {
        let normalized = normalize_with_stats(raw, now);
        for reason in &normalized.dropped {
            debug!(reason = reason.as_str(), "message dropped by normalizer");
        }
        if normalized.shape == PayloadShape::Unrecognized {
            debug!("payload carried no recognizable message");
        }
        let outcomes = normalized
            .messages
            .iter()
            .map(|msg| self.process_message(msg, now))
            .collect();
        BatchReport {
            shape: normalized.shape,
            outcomes,
            dropped_by_normalizer: normalized.dropped.len(),
        }
    }

    pub fn process_message(&self, msg: &NormalizedMessage, now: MonotonicTimeNs) -> MessageOutcome {
        if !self.config.is_monitored(&msg.group_id) {
            debug!(group = %msg.group_id, "group not monitored");
            return MessageOutcome::Dropped {
                reason: "unmonitored_group",
            };
        }
        match self.claims.detect(&msg.text) {
            ClaimDetection::Claimed(customer_name) => return self.handle_claim(msg, customer_name, now),
            ClaimDetection::InvalidName(violation) => {
                warn!(group = %msg.group_id, error = %violation, "claim with invalid customer name");
                let detail = violation.to_string();
                self.record_audit(
                    now,
                    AuditAction::MessageDropped,
                    AuditSeverity::Warn,
                    &[
                        ("reason", "invalid_customer_name"),
                        ("group", msg.group_id.as_str()),
                        ("error", detail.as_str()),
                    ],
                );
                return MessageOutcome::Dropped {
                    reason: "invalid_customer_name",
                };
            }
            ClaimDetection::NotAClaim => {}
        }
        if let Some(media_ref) = msg.media_ref.as_ref() {
            return match msg.chat_key() {
                Some(key) => self.handle_bare_media(key, media_ref, now),
                None => MessageOutcome::Dropped {
                    reason: "missing_sender",
                },
            };
        }
        if msg.has_text() {
            return self.handle_query(msg, now);
        }
        MessageOutcome::Dropped {
            reason: "empty_message",
        }
    }

    pub fn sweep_pending(&self, now: MonotonicTimeNs) -> usize {
        self.pending.sweep(now)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn unforwarded_count(&self) -> usize {
        self.lock_store().unforwarded_count()
    }

    pub fn seal_mode(&self) -> SealMode {
        self.images.seal_mode()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.forwarder.depth()
    }

    fn handle_bare_media(&self, key: ChatKey, media_ref: &MediaRef, now: MonotonicTimeNs) -> MessageOutcome {
        let group = key.group_id.as_str().to_string();
        let sender = key.sender_id.as_str().to_string();
        let replaced = self.pending.put(key, media_ref.clone(), now).is_some();
        debug!(group = %group, sender = %sender, replaced, "image cached awaiting claim");
        self.record_audit(
            now,
            AuditAction::ImageCached,
            AuditSeverity::Info,
            &[
                ("group", group.as_str()),
                ("sender", sender.as_str()),
                ("replaced", if replaced { "true" } else { "false" }),
            ],
        );
        MessageOutcome::ImageCached { replaced }
    }

    fn handle_claim(
        &self,
        msg: &NormalizedMessage,
        customer_name: CustomerName,
        now: MonotonicTimeNs,
    ) -> MessageOutcome {
        let group = &msg.group_id;
        let (media_ref, image_source) = match msg.media_ref.as_ref() {
            Some(attached) => {
                if !self.claimed_media.try_claim(group, attached, now) {
                    warn!(group = %group, "duplicate claim for the same media");
                    self.record_audit(
                        now,
                        AuditAction::MessageDropped,
                        AuditSeverity::Warn,
                        &[
                            ("reason", "duplicate_media_claim"),
                            ("group", group.as_str()),
                            ("customer_name", customer_name.as_str()),
                        ],
                    );
                    return MessageOutcome::Dropped {
                        reason: "duplicate_media_claim",
                    };
                }
                (attached.clone(), ImageSource::Attached)
            }
            None => match msg.chat_key().and_then(|key| self.pending.take(&key, now)) {
                Some(cached) => (cached, ImageSource::Pending),
                None => {
                    warn!(group = %group, customer_name = %customer_name, "claim without image");
                    let sender = msg.sender_id.as_ref().map(|s| s.as_str()).unwrap_or("");
                    self.record_audit(
                        now,
                        AuditAction::ReceiptClaimUnresolved,
                        AuditSeverity::Warn,
                        &[
                            ("group", group.as_str()),
                            ("sender", sender),
                            ("customer_name", customer_name.as_str()),
                        ],
                    );
                    return MessageOutcome::ClaimUnresolved { customer_name };
                }
            },
        };

        match self.store_claimed_receipt(&customer_name, group, &media_ref, image_source, now) {
            Ok((receipt_id, forward_enqueued)) => MessageOutcome::ReceiptStored {
                receipt_id,
                customer_name,
                image_source,
                forward_enqueued,
            },
            Err(err) => {
                if image_source == ImageSource::Attached {
                    self.claimed_media.release(group, &media_ref);
                }
                self.report_failure("store_receipt", group, &err, now);
                MessageOutcome::Failed {
                    stage: "store_receipt",
                    error: err.to_string(),
                }
            }
        }
    }

    /// download -> seal -> write -> store row -> audit, then the optional immediate forward.
    fn store_claimed_receipt(
        &self,
        customer_name: &CustomerName,
        group: &GroupId,
        media_ref: &MediaRef,
        image_source: ImageSource,
        now: MonotonicTimeNs,
    ) -> Result<(ReceiptId, bool), CorrelationError> {
        let plaintext = self.fetcher.fetch(media_ref)?;
        let sealed_path = self.images.store_image(&plaintext)?;
        let path = sealed_path.to_string_lossy().into_owned();

        let receipt = {
            let mut store = self.lock_store();
            let receipt_id =
                match store.store_receipt(customer_name.clone(), path, group.clone(), now) {
                    Ok(receipt_id) => receipt_id,
                    Err(err) => {
                        drop(store);
                        if let Err(remove_err) = self.images.remove_image(&sealed_path) {
                            warn!(
                                path = %sealed_path.display(),
                                error = %remove_err,
                                "failed to remove unreferenced sealed image"
                            );
                        }
                        return Err(err.into());
                    }
                };
            audit_locked(
                &mut store,
                now,
                AuditAction::ReceiptStored,
                AuditSeverity::Info,
                &[
                    ("receipt_id", receipt_id.as_str()),
                    ("customer_name", customer_name.as_str()),
                    ("group", group.as_str()),
                    ("image_source", image_source.as_str()),
                ],
            );
            store
                .receipt(&receipt_id)
                .cloned()
                .ok_or_else(|| CorrelationError::NotFound(receipt_id.as_str().to_string()))?
        };
        info!(
            receipt_id = %receipt.receipt_id,
            group = %group,
            image_source = image_source.as_str(),
            "receipt stored"
        );

        let forward_enqueued = self.config.forward_on_store
            && self.forward_stored_receipt(&receipt, plaintext, now);
        Ok((receipt.receipt_id, forward_enqueued))
    }

    fn forward_stored_receipt(&self, receipt: &Receipt, plaintext: Vec<u8>, now: MonotonicTimeNs) -> bool {
        let mut store = self.lock_store();
        if !self.in_flight.reserve(&receipt.receipt_id) {
            return false;
        }
        let caption = receipt.operator_caption();
        match self.enqueue_document(receipt, plaintext, caption) {
            Ok(()) => {
                audit_locked(
                    &mut store,
                    now,
                    AuditAction::MatchEnqueued,
                    AuditSeverity::Info,
                    &[("receipt_id", receipt.receipt_id.as_str()), ("trigger", "store")],
                );
                true
            }
            Err(err) => {
                self.in_flight.release(&receipt.receipt_id);
                audit_forward_failed(&mut store, now, &receipt.receipt_id, &err);
                false
            }
        }
    }

    fn handle_query(&self, msg: &NormalizedMessage, now: MonotonicTimeNs) -> MessageOutcome {
        let query_text = clip_to_byte_len(msg.text.trim(), MAX_QUERY_TEXT_LEN);
        let group = &msg.group_id;
        let threshold = self.config.matcher.threshold;

        let (outcome, reserved) = {
            let store = self.lock_store();
            let in_flight = self.in_flight.snapshot();
            let pool = store.list_unforwarded(usize::MAX);
            let outcome = self.matcher.best_match(
                &query_text,
                pool.iter()
                    .filter(|r| !in_flight.contains(&r.receipt_id))
                    .map(|r| (&r.receipt_id, &r.customer_name)),
            );
            let reserved = match outcome.accepted(threshold) {
                Some(id) if self.in_flight.reserve(id) => store.receipt(id).cloned(),
                _ => None,
            };
            (outcome, reserved)
        };

        let Some(receipt) = reserved else {
            let best = outcome.best.as_ref().map(|id| id.as_str()).unwrap_or("");
            let score = outcome.score.to_string();
            debug!(group = %group, score = outcome.score, "query below threshold");
            let mut store = self.lock_store();
            audit_locked(
                &mut store,
                now,
                AuditAction::QueryNoMatch,
                AuditSeverity::Info,
                &[
                    ("group", group.as_str()),
                    ("query", query_text.as_str()),
                    ("score", score.as_str()),
                    ("best_receipt_id", best),
                ],
            );
            log_query(&mut store, now, &query_text, group, None, outcome.score, QueryStatus::NoMatch);
            return MessageOutcome::NoMatch {
                score: outcome.score,
                best: outcome.best,
            };
        };

        let receipt_id = receipt.receipt_id.clone();
        let score = outcome.score;
        let plaintext = match self.images.open_image(Path::new(&receipt.encrypted_image_path)) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.in_flight.release(&receipt_id);
                warn!(receipt_id = %receipt_id, error = %err, "matched receipt unreadable");
                let detail = err.to_string();
                let mut store = self.lock_store();
                audit_locked(
                    &mut store,
                    now,
                    AuditAction::ReceiptUnreadable,
                    AuditSeverity::Error,
                    &[("receipt_id", receipt_id.as_str()), ("error", detail.as_str())],
                );
                log_query(
                    &mut store,
                    now,
                    &query_text,
                    group,
                    Some(receipt_id),
                    score,
                    QueryStatus::Failed,
                );
                return MessageOutcome::Failed {
                    stage: "open_image",
                    error: detail,
                };
            }
        };

        let caption = format!(
            "{}\nquery: {}\nscore: {}",
            receipt.operator_caption(),
            query_text,
            score
        );
        // Held across the non-blocking enqueue so the worker's settlement lands after these rows.
        let mut store = self.lock_store();
        match self.enqueue_document(&receipt, plaintext, caption) {
            Ok(()) => {
                let score_text = score.to_string();
                audit_locked(
                    &mut store,
                    now,
                    AuditAction::MatchEnqueued,
                    AuditSeverity::Info,
                    &[
                        ("receipt_id", receipt_id.as_str()),
                        ("group", group.as_str()),
                        ("score", score_text.as_str()),
                    ],
                );
                log_query(
                    &mut store,
                    now,
                    &query_text,
                    group,
                    Some(receipt_id.clone()),
                    score,
                    QueryStatus::Enqueued,
                );
                info!(receipt_id = %receipt_id, group = %group, score, "match enqueued for operator");
                MessageOutcome::MatchEnqueued { receipt_id, score }
            }
            Err(err) => {
                self.in_flight.release(&receipt_id);
                audit_forward_failed(&mut store, now, &receipt_id, &err);
                log_query(
                    &mut store,
                    now,
                    &query_text,
                    group,
                    Some(receipt_id),
                    score,
                    QueryStatus::Failed,
                );
                MessageOutcome::Failed {
                    stage: "enqueue_forward",
                    error: err.to_string(),
                }
            }
        }
    }

    fn enqueue_document(
        &self,
        receipt: &Receipt,
        plaintext: Vec<u8>,
        caption: String,
    ) -> Result<(), DeliveryError> {
        let file_name = format!(
            "receipt_{}.{}",
            receipt.receipt_id.as_str(),
            guess_extension(&plaintext)
        );
        self.forwarder.enqueue(ForwardTask::Document {
            receipt_id: Some(receipt.receipt_id.clone()),
            file_name,
            bytes: plaintext,
            caption,
            chat_id: None,
        })
    }

    fn report_failure(&self, stage: &'static str, group: &GroupId, err: &CorrelationError, now: MonotonicTimeNs) {
        warn!(stage, group = %group, error = %err, "receipt processing failed");
        let detail = err.to_string();
        self.record_audit(
            now,
            AuditAction::ReceiptProcessError,
            AuditSeverity::Error,
            &[
                ("stage", stage),
                ("group", group.as_str()),
                ("error", detail.as_str()),
            ],
        );
        if let Some(admin) = self.config.admin_chat_id.as_ref() {
            let notice = ForwardTask::Message {
                text: format!("receipt processing failed at {stage} in {group}: {detail}"),
                chat_id: Some(admin.clone()),
            };
            if let Err(err) = self.forwarder.enqueue(notice) {
                warn!(error = %err, "admin notification not enqueued");
            }
        }
    }

    fn record_audit(
        &self,
        now: MonotonicTimeNs,
        action: AuditAction,
        severity: AuditSeverity,
        fields: &[(&str, &str)],
    ) {
        let mut store = self.lock_store();
        audit_locked(&mut store, now, action, severity, fields);
    }

    fn lock_store(&self) -> MutexGuard<'_, ReceiptStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Audit failures are logged and never fail the message.
fn audit_locked(
    store: &mut ReceiptStore,
    now: MonotonicTimeNs,
    action: AuditAction,
    severity: AuditSeverity,
    fields: &[(&str, &str)],
) {
    if let Err(err) = AuditWriter::emit_fields(store, now, action, severity, fields) {
        warn!(action = action.as_str(), error = %err, "audit append failed");
    }
}

fn audit_forward_failed(
    store: &mut ReceiptStore,
    now: MonotonicTimeNs,
    receipt_id: &ReceiptId,
    err: &DeliveryError,
) {
    warn!(receipt_id = %receipt_id, error = %err, "forward not enqueued");
    let detail = err.to_string();
    audit_locked(
        store,
        now,
        AuditAction::ForwardFailed,
        AuditSeverity::Warn,
        &[("receipt_id", receipt_id.as_str()), ("error", detail.as_str())],
    );
}

fn log_query(
    store: &mut ReceiptStore,
    now: MonotonicTimeNs,
    query_text: &str,
    group: &GroupId,
    matched: Option<ReceiptId>,
    score: u8,
    status: QueryStatus,
) {
    let appended = QueryRecordInput::v1(
        now,
        query_text.to_string(),
        group.clone(),
        matched,
        score,
        status,
    )
    .map_err(StorageError::from)
    .and_then(|input| store.append_query(input));
    if let Err(err) = appended {
        warn!(error = %err, "query log append failed");
    }
}

fn clip_to_byte_len(raw: &str, max_len: usize) -> String {
    if raw.len() <= max_len {
        return raw.to_string();
    }
    let mut end = max_len;
    while end > 0 && !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}
