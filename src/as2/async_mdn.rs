//! Delivery of queued asynchronous MDNs
//!
//! The receiver stores async MDNs on the inbound row; this dispatcher POSTs
//! them to the sender's `Receipt-Delivery-Option` URL. Each round retries
//! with exponential backoff; rounds stop once `max_attempts` is spent.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use super::headers::{AS2_FROM, AS2_TO, AS2_VERSION_HEADER, CONTENT_TYPE, CONTENT_TYPE_MDN, MESSAGE_ID};
use super::transport::{As2Transport, TransportError};
use crate::domain::{generate_as2_message_id, InboundMessage, AS2_VERSION};
use crate::engine::{Clock, SystemClock};
use crate::infra::{AuditAction, AuditLogBuilder, AuditSink, Result, Retry, RetryConfig, SqliteStore};

#[derive(Debug, Clone)]
pub struct AsyncMdnConfig {
    pub own_as2_id: String,
    pub message_id_host: String,
    /// Total POST attempts allowed per MDN, across rounds
    pub max_attempts: u32,
    pub batch_size: u32,
    /// Per-POST deadline
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl AsyncMdnConfig {
    pub fn new(own_as2_id: impl Into<String>) -> Self {
        let own_as2_id = own_as2_id.into();
        Self {
            message_id_host: own_as2_id.to_ascii_lowercase(),
            own_as2_id,
            max_attempts: 12,
            batch_size: 50,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::partner_delivery(),
        }
    }
}

/// Sends pending async MDNs
pub struct AsyncMdnDispatcher {
    store: SqliteStore,
    transport: Arc<dyn As2Transport>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: AsyncMdnConfig,
}

impl AsyncMdnDispatcher {
    pub fn new(
        store: SqliteStore,
        transport: Arc<dyn As2Transport>,
        audit: Arc<dyn AuditSink>,
        config: AsyncMdnConfig,
    ) -> Self {
        Self {
            store,
            transport,
            audit,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deliver every pending MDN; returns how many were accepted
    pub async fn deliver_pending(&self) -> Result<usize> {
        let pending = self
            .store
            .pending_async_mdns(self.config.max_attempts, self.config.batch_size)
            .await?;

        let mut delivered = 0;
        for inbound in pending {
            if self.deliver(&inbound).await? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, inbound: &InboundMessage) -> Result<bool> {
        let (Some(url), Some(body)) = (inbound.mdn_url.clone(), inbound.mdn_body.clone()) else {
            return Ok(false);
        };
        let headers = vec![
            (AS2_VERSION_HEADER.to_string(), AS2_VERSION.to_string()),
            (AS2_FROM.to_string(), self.config.own_as2_id.clone()),
            (AS2_TO.to_string(), inbound.as2_from.clone()),
            (
                MESSAGE_ID.to_string(),
                generate_as2_message_id(&self.config.message_id_host),
            ),
            (CONTENT_TYPE.to_string(), CONTENT_TYPE_MDN.to_string()),
        ];

        // Never exceed the overall attempt budget within one round.
        let remaining = self.config.max_attempts.saturating_sub(inbound.mdn_attempts);
        let retry = Retry::new(
            self.config
                .retry
                .clone()
                .with_max_retries(remaining.saturating_sub(1).min(self.config.retry.max_retries)),
        );
        let outcome = retry
            .run(
                "async_mdn_delivery",
                || {
                    self.transport.deliver_mdn(
                        url.clone(),
                        headers.clone(),
                        body.clone(),
                        self.config.request_timeout,
                    )
                },
                is_transient,
            )
            .await;

        let now = self.clock.now();
        let attempts = outcome.attempts;
        let mut audit = AuditLogBuilder::system(AuditAction::InboundMdnDelivered)
            .resource("inbound_message", inbound.id.to_string())
            .details(json!({
                "message_id": inbound.message_id,
                "url": url,
                "attempts": attempts,
            }))
            .at(now);

        let sent = match outcome.result {
            Ok(status) => {
                info!(
                    message_id = %inbound.message_id,
                    as2_from = %inbound.as2_from,
                    status,
                    attempts,
                    "Async MDN delivered"
                );
                self.store
                    .record_mdn_delivery(inbound.id, attempts, Some(now))
                    .await?;
                true
            }
            Err(e) => {
                warn!(
                    message_id = %inbound.message_id,
                    as2_from = %inbound.as2_from,
                    attempts,
                    error = %e,
                    "Async MDN delivery failed"
                );
                audit = audit.failed(e.to_string());
                self.store
                    .record_mdn_delivery(inbound.id, attempts, None)
                    .await?;
                false
            }
        };

        if let Err(e) = self.audit.record(audit.build()).await {
            warn!(error = %e, "Failed to write audit record");
        }
        Ok(sent)
    }
}

/// Client errors will not improve with retrying
fn is_transient(err: &TransportError) -> bool {
    match err {
        TransportError::Http { status, .. } => *status >= 500 || *status == 429,
        TransportError::Timeout(_) | TransportError::Connection(_) => true,
    }
}
