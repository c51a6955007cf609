//! Audit logging for gateway operations
//!
//! Every mutating operation leaves an append-only record:
//! - message submission, cancellation and terminal failures
//! - MDN and business acknowledgement receipt
//! - partner and certificate lifecycle changes
//! - inbound message receipt

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::retry::{Retry, RetryConfig};
use super::sqlite::{format_ts, parse_ts};
use super::{As2Error, AuditSink, Result};
use crate::domain::{Page, PageRequest};

/// Audit log action types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Outbound messages
    MessageSubmitted,
    MessageCancelled,
    CancelRequested,
    MessageFailed,
    MdnReceived,
    BusinessAckRecorded,

    // Partners
    PartnerCreated,
    PartnerUpdated,
    PartnerArchived,

    // Certificates
    CertificateAdded,
    CertificateRotated,
    CertificateRevoked,
    CertificateArchived,

    // Inbound
    InboundReceived,
    InboundMdnDelivered,

    // Other
    Custom(String),
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::MessageSubmitted => write!(f, "message_submitted"),
            AuditAction::MessageCancelled => write!(f, "message_cancelled"),
            AuditAction::CancelRequested => write!(f, "cancel_requested"),
            AuditAction::MessageFailed => write!(f, "message_failed"),
            AuditAction::MdnReceived => write!(f, "mdn_received"),
            AuditAction::BusinessAckRecorded => write!(f, "business_ack_recorded"),
            AuditAction::PartnerCreated => write!(f, "partner_created"),
            AuditAction::PartnerUpdated => write!(f, "partner_updated"),
            AuditAction::PartnerArchived => write!(f, "partner_archived"),
            AuditAction::CertificateAdded => write!(f, "certificate_added"),
            AuditAction::CertificateRotated => write!(f, "certificate_rotated"),
            AuditAction::CertificateRevoked => write!(f, "certificate_revoked"),
            AuditAction::CertificateArchived => write!(f, "certificate_archived"),
            AuditAction::InboundReceived => write!(f, "inbound_received"),
            AuditAction::InboundMdnDelivered => write!(f, "inbound_mdn_delivered"),
            AuditAction::Custom(s) => write!(f, "custom:{}", s),
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Operator name, or `system` for engine-driven changes
    pub actor: String,
    /// `operator`, `system` or `partner`
    pub actor_type: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl AuditLogEntry {
    pub fn outcome(&self) -> &'static str {
        if self.success {
            "success"
        } else {
            "failure"
        }
    }
}

/// Builder for creating audit log entries
pub struct AuditLogBuilder {
    action: AuditAction,
    actor: String,
    actor_type: String,
    resource_type: String,
    resource_id: Option<String>,
    details: Option<serde_json::Value>,
    timestamp: Option<DateTime<Utc>>,
    success: bool,
    error_message: Option<String>,
}

impl AuditLogBuilder {
    pub fn new(action: AuditAction, actor: impl Into<String>, actor_type: impl Into<String>) -> Self {
        Self {
            action,
            actor: actor.into(),
            actor_type: actor_type.into(),
            resource_type: String::new(),
            resource_id: None,
            details: None,
            timestamp: None,
            success: true,
            error_message: None,
        }
    }

    /// Engine-driven entry
    pub fn system(action: AuditAction) -> Self {
        Self::new(action, "system", "system")
    }

    /// Set the resource type and ID
    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Timestamp from the engine clock; defaults to wall time
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Mark as failed with error message
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }

    pub fn build(self) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            action: self.action,
            actor: self.actor,
            actor_type: self.actor_type,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            details: self.details,
            success: self.success,
            error_message: self.error_message,
        }
    }
}

/// SQLite-backed audit log
#[derive(Clone)]
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Query audit logs with filters, newest first
    pub async fn query(
        &self,
        filters: &AuditQueryFilters,
        page: PageRequest,
    ) -> Result<Page<AuditLogEntry>> {
        let action = filters.action.as_ref().map(|a| a.to_string());
        let outcome = filters.success.map(|s| if s { "success" } else { "failure" });
        let from = filters.from.map(format_ts);
        let to = filters.to.map(format_ts);

        let rows = sqlx::query_as::<_, AuditLogRow>(
            r#"
            SELECT id, timestamp, action, actor, actor_type,
                   resource_type, resource_id, outcome, error_message, details
            FROM audit_log
            WHERE (?1 IS NULL OR actor = ?1)
              AND (?2 IS NULL OR action = ?2)
              AND (?3 IS NULL OR resource_type = ?3)
              AND (?4 IS NULL OR resource_id = ?4)
              AND (?5 IS NULL OR timestamp >= ?5)
              AND (?6 IS NULL OR timestamp <= ?6)
              AND (?7 IS NULL OR outcome = ?7)
            ORDER BY timestamp DESC, rowid DESC
            LIMIT ?8 OFFSET ?9
            "#,
        )
        .bind(&filters.actor)
        .bind(&action)
        .bind(&filters.resource_type)
        .bind(&filters.resource_id)
        .bind(&from)
        .bind(&to)
        .bind(outcome)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM audit_log
            WHERE (?1 IS NULL OR actor = ?1)
              AND (?2 IS NULL OR action = ?2)
              AND (?3 IS NULL OR resource_type = ?3)
              AND (?4 IS NULL OR resource_id = ?4)
              AND (?5 IS NULL OR timestamp >= ?5)
              AND (?6 IS NULL OR timestamp <= ?6)
              AND (?7 IS NULL OR outcome = ?7)
            "#,
        )
        .bind(&filters.actor)
        .bind(&action)
        .bind(&filters.resource_type)
        .bind(&filters.resource_id)
        .bind(&from)
        .bind(&to)
        .bind(outcome)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(AuditLogEntry::try_from)
                .collect::<Result<Vec<_>>>()?,
            total: total.0 as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn record(&self, entry: AuditLogEntry) -> Result<()> {
        let details = entry
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, actor, actor_type, action, resource_type, resource_id,
                timestamp, outcome, error_message, details
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.actor)
        .bind(&entry.actor_type)
        .bind(entry.action.to_string())
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(format_ts(entry.timestamp))
        .bind(entry.outcome())
        .bind(&entry.error_message)
        .bind(&details)
        .execute(&self.pool)
        .await?;

        if entry.success {
            tracing::info!(
                action = %entry.action,
                actor = %entry.actor,
                resource_type = %entry.resource_type,
                resource_id = ?entry.resource_id,
                "Audit log entry"
            );
        } else {
            tracing::warn!(
                action = %entry.action,
                actor = %entry.actor,
                resource_id = ?entry.resource_id,
                error = ?entry.error_message,
                "Audit log entry (failed)"
            );
        }

        Ok(())
    }
}

/// Sink decorator that retries transient write failures.
///
/// Entries still failing after the retry budget are parked in memory and
/// written, in order, before the next entry or by [`flush_pending`].
///
/// [`flush_pending`]: RetryingAuditSink::flush_pending
pub struct RetryingAuditSink {
    inner: Arc<dyn AuditSink>,
    retry: Retry,
    backlog: Mutex<VecDeque<AuditLogEntry>>,
}

impl RetryingAuditSink {
    pub fn new(inner: Arc<dyn AuditSink>) -> Self {
        Self::with_config(inner, RetryConfig::database())
    }

    pub fn with_config(inner: Arc<dyn AuditSink>, config: RetryConfig) -> Self {
        Self {
            inner,
            retry: Retry::new(config),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Entries waiting to be written
    pub async fn pending(&self) -> usize {
        self.backlog.lock().await.len()
    }

    /// Write parked entries oldest first, stopping at the first failure.
    ///
    /// Returns how many were written.
    pub async fn flush_pending(&self) -> Result<usize> {
        let mut backlog = self.backlog.lock().await;
        let mut written = 0;
        while let Some(entry) = backlog.front() {
            self.inner.record(entry.clone()).await?;
            backlog.pop_front();
            written += 1;
        }
        if written > 0 {
            tracing::info!(written, "Replayed parked audit records");
        }
        Ok(written)
    }

    async fn park(&self, entry: AuditLogEntry, error: &As2Error) {
        let mut backlog = self.backlog.lock().await;
        backlog.push_back(entry);
        tracing::warn!(
            error = %error,
            pending = backlog.len(),
            "Audit write failed, parking record for replay"
        );
    }
}

fn is_transient(error: &As2Error) -> bool {
    matches!(error, As2Error::Database(_))
}

#[async_trait]
impl AuditSink for RetryingAuditSink {
    async fn record(&self, entry: AuditLogEntry) -> Result<()> {
        if let Err(e) = self.flush_pending().await {
            // Stay behind the older records.
            self.park(entry, &e).await;
            return Ok(());
        }

        let written = self
            .retry
            .run(
                "audit_log",
                || {
                    let entry = entry.clone();
                    async move { self.inner.record(entry).await }
                },
                is_transient,
            )
            .await
            .into_result();

        match written {
            Err(e) if is_transient(&e) => {
                self.park(entry, &e).await;
                Ok(())
            }
            other => other,
        }
    }
}

/// Query filters for audit logs
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AuditQueryFilters {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub success: Option<bool>,
}

/// Database row for audit log
#[derive(Debug, sqlx::FromRow)]
struct AuditLogRow {
    id: String,
    timestamp: String,
    action: String,
    actor: String,
    actor_type: String,
    resource_type: String,
    resource_id: Option<String>,
    outcome: String,
    error_message: Option<String>,
    details: Option<String>,
}

impl TryFrom<AuditLogRow> for AuditLogEntry {
    type Error = As2Error;

    fn try_from(row: AuditLogRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| As2Error::Internal(format!("invalid audit id: {}", e)))?;
        let details = row
            .details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Self {
            id,
            timestamp: parse_ts(&row.timestamp)?,
            action: parse_audit_action(&row.action),
            actor: row.actor,
            actor_type: row.actor_type,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            details,
            success: row.outcome == "success",
            error_message: row.error_message,
        })
    }
}

pub fn parse_audit_action(s: &str) -> AuditAction {
    match s {
        "message_submitted" => AuditAction::MessageSubmitted,
        "message_cancelled" => AuditAction::MessageCancelled,
        "cancel_requested" => AuditAction::CancelRequested,
        "message_failed" => AuditAction::MessageFailed,
        "mdn_received" => AuditAction::MdnReceived,
        "business_ack_recorded" => AuditAction::BusinessAckRecorded,
        "partner_created" => AuditAction::PartnerCreated,
        "partner_updated" => AuditAction::PartnerUpdated,
        "partner_archived" => AuditAction::PartnerArchived,
        "certificate_added" => AuditAction::CertificateAdded,
        "certificate_rotated" => AuditAction::CertificateRotated,
        "certificate_revoked" => AuditAction::CertificateRevoked,
        "certificate_archived" => AuditAction::CertificateArchived,
        "inbound_received" => AuditAction::InboundReceived,
        "inbound_mdn_delivered" => AuditAction::InboundMdnDelivered,
        s if s.starts_with("custom:") => AuditAction::Custom(s[7..].to_string()),
        _ => AuditAction::Custom(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite::SqliteStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_audit_action_display() {
        assert_eq!(AuditAction::MessageSubmitted.to_string(), "message_submitted");
        assert_eq!(AuditAction::CertificateRotated.to_string(), "certificate_rotated");
        assert_eq!(
            AuditAction::Custom("test".to_string()).to_string(),
            "custom:test"
        );
    }

    #[test]
    fn test_audit_log_builder_failed() {
        let entry = AuditLogBuilder::system(AuditAction::MessageFailed)
            .resource("message", "m-1")
            .failed("retries exhausted")
            .build();

        assert!(!entry.success);
        assert_eq!(entry.outcome(), "failure");
        assert_eq!(entry.actor, "system");
        assert_eq!(entry.error_message, Some("retries exhausted".to_string()));
    }

    #[test]
    fn test_parse_audit_action() {
        assert_eq!(parse_audit_action("partner_archived"), AuditAction::PartnerArchived);
        assert_eq!(
            parse_audit_action("custom:special"),
            AuditAction::Custom("special".to_string())
        );
    }

    #[tokio::test]
    async fn test_record_and_query() {
        let store = SqliteStore::in_memory().await.unwrap();
        let log = SqliteAuditLog::new(store.pool().clone());

        log.record(
            AuditLogBuilder::new(AuditAction::PartnerCreated, "alice", "operator")
                .resource("partner", "p-1")
                .details(serde_json::json!({"as2_id": "ACME"}))
                .build(),
        )
        .await
        .unwrap();
        log.record(
            AuditLogBuilder::system(AuditAction::MessageFailed)
                .resource("message", "m-1")
                .failed("boom")
                .build(),
        )
        .await
        .unwrap();

        let all = log
            .query(&AuditQueryFilters::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(all.total, 2);

        let failures = log
            .query(
                &AuditQueryFilters {
                    success: Some(false),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(failures.total, 1);
        assert_eq!(failures.items[0].action, AuditAction::MessageFailed);

        let partner = log
            .query(
                &AuditQueryFilters {
                    resource_id: Some("p-1".to_string()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(partner.items[0].details.as_ref().unwrap()["as2_id"], "ACME");
    }

    struct FlakySink {
        failures_left: AtomicU32,
        recorded: std::sync::Mutex<Vec<AuditAction>>,
    }

    impl FlakySink {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(times),
                recorded: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn recorded(&self) -> Vec<AuditAction> {
            self.recorded.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditSink for FlakySink {
        async fn record(&self, entry: AuditLogEntry) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(As2Error::Database(sqlx::Error::PoolTimedOut));
            }
            self.recorded.lock().unwrap().push(entry.action);
            Ok(())
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig::fast()
            .with_max_retries(1)
            .with_initial_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retrying_sink_recovers() {
        let flaky = FlakySink::failing(1);
        let sink = RetryingAuditSink::with_config(flaky.clone(), fast());

        sink.record(AuditLogBuilder::system(AuditAction::MdnReceived).build())
            .await
            .unwrap();
        assert_eq!(flaky.recorded(), vec![AuditAction::MdnReceived]);
        assert_eq!(sink.pending().await, 0);
    }

    #[tokio::test]
    async fn test_outage_parks_records_in_order() {
        let flaky = FlakySink::failing(u32::MAX);
        let sink = RetryingAuditSink::with_config(flaky.clone(), fast());

        sink.record(AuditLogBuilder::system(AuditAction::MessageSubmitted).build())
            .await
            .unwrap();
        sink.record(AuditLogBuilder::system(AuditAction::MessageFailed).build())
            .await
            .unwrap();
        assert_eq!(sink.pending().await, 2);
        assert!(sink.flush_pending().await.is_err());
        assert!(flaky.recorded().is_empty());

        flaky.failures_left.store(0, Ordering::SeqCst);
        sink.record(AuditLogBuilder::system(AuditAction::MdnReceived).build())
            .await
            .unwrap();

        assert_eq!(sink.pending().await, 0);
        assert_eq!(
            flaky.recorded(),
            vec![
                AuditAction::MessageSubmitted,
                AuditAction::MessageFailed,
                AuditAction::MdnReceived,
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_pending_replays_backlog() {
        let flaky = FlakySink::failing(2);
        let sink = RetryingAuditSink::with_config(flaky.clone(), fast());

        sink.record(AuditLogBuilder::system(AuditAction::PartnerArchived).build())
            .await
            .unwrap();
        assert_eq!(sink.pending().await, 1);

        assert_eq!(sink.flush_pending().await.unwrap(), 1);
        assert_eq!(sink.flush_pending().await.unwrap(), 0);
        assert_eq!(flaky.recorded(), vec![AuditAction::PartnerArchived]);
    }
}
