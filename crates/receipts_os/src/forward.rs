#![forbid(unsafe_code)]

//! Operator forwarding: a bounded queue drained in order by one worker thread that owns the
//! delivery channel.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use receipts_kernel_contracts::audit::{AuditAction, AuditSeverity};
use receipts_kernel_contracts::receipt::ReceiptId;
use receipts_kernel_contracts::MonotonicTimeNs;
use receipts_storage::audit::AuditWriter;
use receipts_storage::store::{ReceiptStore, StorageError};
use tracing::{debug, info, warn};

use crate::error::DeliveryError;

pub const FORWARD_QUEUE_CAPACITY_DEFAULT: usize = 256;

#[derive(Clone, PartialEq, Eq)]
pub enum ForwardTask {
    Document {
        /// Set when delivery must settle a reserved receipt.
        receipt_id: Option<ReceiptId>,
        file_name: String,
        bytes: Vec<u8>,
        caption: String,
        chat_id: Option<String>,
    },
    Message {
        text: String,
        chat_id: Option<String>,
    },
}

impl std::fmt::Debug for ForwardTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document {
                receipt_id,
                file_name,
                bytes,
                chat_id,
                ..
            } => f
                .debug_struct("Document")
                .field("receipt_id", receipt_id)
                .field("file_name", file_name)
                .field("bytes_len", &bytes.len())
                .field("chat_id", chat_id)
                .finish(),
            Self::Message { text, chat_id } => f
                .debug_struct("Message")
                .field("text_len", &text.len())
                .field("chat_id", chat_id)
                .finish(),
        }
    }
}

impl ForwardTask {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Document { .. } => "send_document",
            Self::Message { .. } => "send_message",
        }
    }
}

/// A connection to the operator-facing chat. `chat_id = None` means the channel default.
pub trait OperatorChannel: Send {
    fn send_document(
        &mut self,
        chat_id: Option<&str>,
        file_name: &str,
        bytes: &[u8],
        caption: &str,
    ) -> Result<(), DeliveryError>;

    fn send_message(&mut self, chat_id: Option<&str>, text: &str) -> Result<(), DeliveryError>;

    fn name(&self) -> &'static str;
}

/// Non-blocking hand-off to whatever performs delivery.
pub trait OperatorForwarder: Send + Sync {
    fn enqueue(&self, task: ForwardTask) -> Result<(), DeliveryError>;

    fn depth(&self) -> usize {
        0
    }
}

/// Called by the worker once a receipt-bearing document has been attempted.
pub trait ForwardSettlement: Send + Sync {
    fn settle(&self, receipt_id: &ReceiptId, outcome: Result<(), DeliveryError>);
}

/// Receipts reserved for delivery. Reserved receipts are invisible to matching.
#[derive(Debug, Clone, Default)]
pub struct InFlightReceipts {
    inner: Arc<Mutex<BTreeSet<ReceiptId>>>,
}

impl InFlightReceipts {
    pub fn new() -> Self {
        Self::default()
    }

    /// False when the receipt is already reserved.
    pub fn reserve(&self, receipt_id: &ReceiptId) -> bool {
        self.lock().insert(receipt_id.clone())
    }

    pub fn release(&self, receipt_id: &ReceiptId) -> bool {
        self.lock().remove(receipt_id)
    }

    pub fn contains(&self, receipt_id: &ReceiptId) -> bool {
        self.lock().contains(receipt_id)
    }

    pub fn snapshot(&self) -> BTreeSet<ReceiptId> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<ReceiptId>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Advances store state from delivery results. Success marks the receipt forwarded; failure
/// leaves it unforwarded and eligible for a later query.
#[derive(Debug, Clone)]
pub struct ReceiptSettlement {
    store: Arc<Mutex<ReceiptStore>>,
    in_flight: InFlightReceipts,
}

impl ReceiptSettlement {
    pub fn new(store: Arc<Mutex<ReceiptStore>>, in_flight: InFlightReceipts) -> Self {
        Self { store, in_flight }
    }

    fn record(&self, receipt_id: &ReceiptId, outcome: &Result<(), DeliveryError>) -> Result<(), StorageError> {
        let now = MonotonicTimeNs::now();
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match outcome {
            Ok(()) => {
                if store.mark_forwarded(receipt_id)? {
                    AuditWriter::emit_fields(
                        &mut store,
                        now,
                        AuditAction::MatchForwarded,
                        AuditSeverity::Info,
                        &[("receipt_id", receipt_id.as_str())],
                    )?;
                }
            }
            Err(err) => {
                let detail = err.to_string();
                AuditWriter::emit_fields(
                    &mut store,
                    now,
                    AuditAction::ForwardFailed,
                    AuditSeverity::Warn,
                    &[("receipt_id", receipt_id.as_str()), ("error", detail.as_str())],
                )?;
            }
        }
        Ok(())
    }
}

impl ForwardSettlement for ReceiptSettlement {
    fn settle(&self, receipt_id: &ReceiptId, outcome: Result<(), DeliveryError>) {
        match &outcome {
            Ok(()) => info!(receipt_id = %receipt_id, "receipt forwarded to operator"),
            Err(err) => warn!(receipt_id = %receipt_id, error = %err, "receipt forward failed"),
        }
        if let Err(err) = self.record(receipt_id, &outcome) {
            warn!(receipt_id = %receipt_id, error = %err, "forward settlement not recorded");
        }
        self.in_flight.release(receipt_id);
    }
}

/// Bounded in-order queue with a single dedicated sender thread.
pub struct ForwardQueue {
    sender: Mutex<Option<SyncSender<ForwardTask>>>,
    depth: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ForwardQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardQueue")
            .field("depth", &self.depth.load(Ordering::SeqCst))
            .finish()
    }
}

impl ForwardQueue {
    pub fn spawn(
        channel: Box<dyn OperatorChannel>,
        settlement: Arc<dyn ForwardSettlement>,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = Arc::clone(&depth);
        let worker = thread::Builder::new()
            .name("receipts-forward".to_string())
            .spawn(move || run_forward_worker(channel, settlement, receiver, worker_depth))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            depth,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops intake and waits for every queued task to finish.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                warn!("forward worker panicked");
            }
        }
    }
}

impl OperatorForwarder for ForwardQueue {
    fn enqueue(&self, task: ForwardTask) -> Result<(), DeliveryError> {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = guard.as_ref().ok_or(DeliveryError::WorkerStopped)?;
        let kind = task.kind();
        self.depth.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(task) {
            Ok(()) => {
                debug!(kind, "forward task enqueued");
                Ok(())
            }
            Err(err) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                match err {
                    TrySendError::Full(_) => Err(DeliveryError::QueueFull),
                    TrySendError::Disconnected(_) => Err(DeliveryError::WorkerStopped),
                }
            }
        }
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl Drop for ForwardQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_forward_worker(
    mut channel: Box<dyn OperatorChannel>,
    settlement: Arc<dyn ForwardSettlement>,
    receiver: Receiver<ForwardTask>,
    depth: Arc<AtomicUsize>,
) {
    info!(channel = channel.name(), "forward worker started");
    for task in receiver {
        match task {
            ForwardTask::Document {
                receipt_id,
                file_name,
                bytes,
                caption,
                chat_id,
            } => {
                let result = channel.send_document(chat_id.as_deref(), &file_name, &bytes, &caption);
                match receipt_id {
                    Some(id) => settlement.settle(&id, result),
                    None => {
                        if let Err(err) = result {
                            warn!(file_name = %file_name, error = %err, "document delivery failed");
                        }
                    }
                }
            }
            ForwardTask::Message { text, chat_id } => {
                if let Err(err) = channel.send_message(chat_id.as_deref(), &text) {
                    warn!(error = %err, "message delivery failed");
                }
            }
        }
        depth.fetch_sub(1, Ordering::SeqCst);
    }
    info!(channel = channel.name(), "forward worker stopped");
}
