//! Retry scheduling and the background delivery worker
//!
//! The worker wakes on a fixed interval (or when kicked) and:
//!
//! 1. Times out `awaiting_mdn` messages past their deadline
//! 2. Logs business acknowledgments past their SLA
//! 3. Dispatches every message whose `next_attempt_at` has passed
//! 4. Delivers pending async MDNs for inbound messages
//! 5. Replays audit records parked during a database outage
//!
//! # Configuration
//!
//! - `AS2_WORKER_INTERVAL_SECS` - How often to look for due work (default: 5)
//! - `AS2_WORKER_BATCH_SIZE` - Maximum messages dispatched per tick (default: 50)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::state_machine::TransmissionEngine;
use crate::as2::AsyncMdnDispatcher;
use crate::domain::{OutboundMessage, RetryPolicy};
use crate::infra::{As2Error, RetryingAuditSink};

/// What happens after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// An operator asked for the message to stop
    Cancel,
    /// Try again at `next_attempt_at`
    Retry {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Out of retries
    Exhausted { reason: String },
}

/// Decide the follow-up for a message that just failed an attempt.
///
/// `retry_count` counts retries already scheduled, so a policy with
/// `max_retries = 3` allows four attempts in total.
pub fn retry_decision(
    msg: &OutboundMessage,
    policy: &RetryPolicy,
    failed_at: DateTime<Utc>,
    last_error: &str,
) -> RetryDecision {
    if msg.cancel_requested {
        return RetryDecision::Cancel;
    }
    if msg.retry_count < policy.max_retries {
        return RetryDecision::Retry {
            retry_count: msg.retry_count + 1,
            next_attempt_at: failed_at + policy.retry_interval(),
        };
    }
    RetryDecision::Exhausted {
        reason: format!(
            "retries exhausted after {} attempts: {}",
            msg.retry_count + 1,
            last_error
        ),
    }
}

/// Configuration for the retry worker
#[derive(Debug, Clone)]
pub struct RetryWorkerConfig {
    /// How often to look for due work
    pub interval: Duration,
    /// Maximum messages dispatched per tick
    pub batch_size: u32,
}

impl Default for RetryWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 50,
        }
    }
}

impl RetryWorkerConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let interval = std::env::var("AS2_WORKER_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let batch_size = std::env::var("AS2_WORKER_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);

        Self {
            interval,
            batch_size,
        }
    }
}

/// Control messages for the worker
#[derive(Debug)]
pub enum WorkerMessage {
    /// Run a tick now instead of waiting for the interval
    Kick,
    Shutdown,
}

/// Counts from one worker tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub expired: usize,
    pub overdue_acks: usize,
    pub dispatched: usize,
    pub dispatch_errors: usize,
    pub mdns_delivered: usize,
    pub audit_replayed: usize,
}

/// Background worker driving retries, deadlines and async MDN delivery
pub struct RetryWorker {
    config: RetryWorkerConfig,
    engine: Arc<TransmissionEngine>,
    async_mdns: Option<Arc<AsyncMdnDispatcher>>,
    audit: Option<Arc<RetryingAuditSink>>,
    control_tx: mpsc::Sender<WorkerMessage>,
    control_rx: mpsc::Receiver<WorkerMessage>,
}

impl RetryWorker {
    pub fn new(config: RetryWorkerConfig, engine: Arc<TransmissionEngine>) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            config,
            engine,
            async_mdns: None,
            audit: None,
            control_tx,
            control_rx,
        }
    }

    /// Also deliver pending async MDNs on every tick
    pub fn with_async_mdns(mut self, dispatcher: Arc<AsyncMdnDispatcher>) -> Self {
        self.async_mdns = Some(dispatcher);
        self
    }

    pub fn with_audit_backlog(mut self, audit: Arc<RetryingAuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Get a sender handle for controlling the worker
    pub fn control_handle(&self) -> mpsc::Sender<WorkerMessage> {
        self.control_tx.clone()
    }

    /// Run until `WorkerMessage::Shutdown`
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting retry worker"
        );

        match self.engine.recover_interrupted().await {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "Recovered messages left in sending"),
            Err(e) => error!(error = ?e, "Failed to recover interrupted messages"),
        }

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                Some(msg) = self.control_rx.recv() => {
                    match msg {
                        WorkerMessage::Kick => {
                            debug!("Retry worker kicked");
                            self.tick().await;
                        }
                        WorkerMessage::Shutdown => {
                            info!("Retry worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// One pass over all due work. Errors are logged and counted, never returned.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.engine.expire_mdn_deadlines().await {
            Ok(n) => report.expired = n,
            Err(e) => error!(error = ?e, "Error expiring MDN deadlines"),
        }
        match self.engine.warn_overdue_business_acks().await {
            Ok(n) => report.overdue_acks = n,
            Err(e) => error!(error = ?e, "Error checking business acknowledgments"),
        }

        let due = match self
            .engine
            .store()
            .due_messages(self.engine.now(), self.config.batch_size)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = ?e, "Error loading due messages");
                Vec::new()
            }
        };

        let mut attempts = JoinSet::new();
        for msg in due {
            let engine = Arc::clone(&self.engine);
            attempts.spawn(async move {
                let result = engine.dispatch(msg.id).await;
                (msg, result)
            });
        }
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((_, Ok(_))) => report.dispatched += 1,
                // Another task already has it.
                Ok((msg, Err(As2Error::MessageBusy(_)))) => {
                    debug!(message_id = %msg.message_id, "Message busy, skipping");
                }
                Ok((msg, Err(e))) => {
                    report.dispatch_errors += 1;
                    warn!(message_id = %msg.message_id, error = ?e, "Dispatch failed");
                }
                Err(e) => {
                    report.dispatch_errors += 1;
                    error!(error = ?e, "Dispatch task panicked");
                }
            }
        }

        if let Some(dispatcher) = &self.async_mdns {
            match dispatcher.deliver_pending().await {
                Ok(n) => report.mdns_delivered = n,
                Err(e) => error!(error = ?e, "Error delivering async MDNs"),
            }
        }

        if let Some(audit) = &self.audit {
            match audit.flush_pending().await {
                Ok(n) => report.audit_replayed = n,
                Err(e) => warn!(error = ?e, "Audit log still unavailable"),
            }
        }

        if report != TickReport::default() {
            debug!(?report, "Retry worker tick");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageId, PartnerId, Priority, TransmissionState};

    fn message(retry_count: u32, cancel_requested: bool) -> OutboundMessage {
        let now = Utc::now();
        OutboundMessage {
            id: MessageId::new(),
            message_id: "<m@gw>".to_string(),
            partner_id: PartnerId::new(),
            payload: b"x".to_vec(),
            content_type: "text/plain".to_string(),
            subject: "s".to_string(),
            priority: Priority::Normal,
            created_at: now,
            state: TransmissionState::SendFailed,
            state_reason: None,
            sent_mic: None,
            received_mic: None,
            mic_algorithm: None,
            compressed: None,
            envelope: None,
            envelope_cert_serial: None,
            mdn: None,
            business_ack: None,
            retry_count,
            next_attempt_at: None,
            mdn_deadline: None,
            cancel_requested,
            review_required: false,
            business_ack_overdue_warned: false,
            updated_at: now,
        }
    }

    fn policy(max_retries: u32, minutes: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_interval_minutes: minutes,
        }
    }

    #[test]
    fn retries_until_budget_is_spent() {
        let at = Utc::now();
        assert_eq!(
            retry_decision(&message(0, false), &policy(3, 10), at, "boom"),
            RetryDecision::Retry {
                retry_count: 1,
                next_attempt_at: at + chrono::Duration::minutes(10),
            }
        );
        assert!(matches!(
            retry_decision(&message(2, false), &policy(3, 10), at, "boom"),
            RetryDecision::Retry { retry_count: 3, .. }
        ));

        match retry_decision(&message(3, false), &policy(3, 10), at, "HTTP 503") {
            RetryDecision::Exhausted { reason } => {
                assert_eq!(reason, "retries exhausted after 4 attempts: HTTP 503");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_retries_fails_on_first_error() {
        assert!(matches!(
            retry_decision(&message(0, false), &policy(0, 10), Utc::now(), "x"),
            RetryDecision::Exhausted { .. }
        ));
    }

    #[test]
    fn cancel_request_wins() {
        assert_eq!(
            retry_decision(&message(0, true), &policy(3, 10), Utc::now(), "x"),
            RetryDecision::Cancel
        );
    }
}
