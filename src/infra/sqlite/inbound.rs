//! Inbound message rows

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{format_ts, parse_column, parse_opt_ts, parse_ts, parse_uuid, SqliteStore};
use crate::domain::{InboundId, InboundMessage, InboundStatus, Page, PageRequest, PartnerId};
use crate::infra::{As2Error, Result};

const INBOUND_COLUMNS: &str = r#"
    id, message_id, partner_id, as2_from, as2_to, subject, content_type, payload,
    received_at, mic, status, status_reason, validation_json, routing_json,
    mdn_mode, mdn_disposition, mdn_body, mdn_url, mdn_sent_at, mdn_attempts
"#;

#[derive(Debug, Clone, Default)]
pub struct InboundFilter {
    pub status: Option<InboundStatus>,
    pub partner_id: Option<PartnerId>,
}

impl SqliteStore {
    /// Insert unless `(as2_from, message_id)` was already received.
    ///
    /// Returns false for a duplicate.
    pub async fn insert_inbound(&self, msg: &InboundMessage) -> Result<bool> {
        let validation = msg.validation.as_ref().map(serde_json::to_string).transpose()?;
        let routing = msg.routing.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO inbound_messages (
                id, message_id, partner_id, as2_from, as2_to, subject, content_type, payload,
                received_at, mic, status, status_reason, validation_json, routing_json,
                mdn_mode, mdn_disposition, mdn_body, mdn_url, mdn_sent_at, mdn_attempts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(as2_from, message_id) DO NOTHING
            "#,
        )
        .bind(msg.id.0.to_string())
        .bind(&msg.message_id)
        .bind(msg.partner_id.map(|p| p.0.to_string()))
        .bind(&msg.as2_from)
        .bind(&msg.as2_to)
        .bind(&msg.subject)
        .bind(&msg.content_type)
        .bind(&msg.payload)
        .bind(format_ts(msg.received_at))
        .bind(&msg.mic)
        .bind(msg.status.as_str())
        .bind(&msg.status_reason)
        .bind(&validation)
        .bind(&routing)
        .bind(msg.mdn_mode.as_str())
        .bind(&msg.mdn_disposition)
        .bind(&msg.mdn_body)
        .bind(&msg.mdn_url)
        .bind(msg.mdn_sent_at.map(format_ts))
        .bind(msg.mdn_attempts as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find_inbound(
        &self,
        as2_from: &str,
        message_id: &str,
    ) -> Result<Option<InboundMessage>> {
        let row = sqlx::query_as::<_, InboundRow>(&format!(
            "SELECT {} FROM inbound_messages WHERE as2_from = ? AND message_id = ?",
            INBOUND_COLUMNS
        ))
        .bind(as2_from)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InboundMessage::try_from).transpose()
    }

    pub async fn get_inbound(&self, id: InboundId) -> Result<Option<InboundMessage>> {
        let row = sqlx::query_as::<_, InboundRow>(&format!(
            "SELECT {} FROM inbound_messages WHERE id = ?",
            INBOUND_COLUMNS
        ))
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(InboundMessage::try_from).transpose()
    }

    pub async fn list_inbound(
        &self,
        filter: &InboundFilter,
        page: PageRequest,
    ) -> Result<Page<InboundMessage>> {
        let status = filter.status.map(|s| s.as_str());
        let partner = filter.partner_id.map(|p| p.0.to_string());

        let rows = sqlx::query_as::<_, InboundRow>(&format!(
            r#"
            SELECT {} FROM inbound_messages
            WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR partner_id = ?2)
            ORDER BY received_at DESC, id
            LIMIT ?3 OFFSET ?4
            "#,
            INBOUND_COLUMNS
        ))
        .bind(status)
        .bind(&partner)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM inbound_messages WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR partner_id = ?2)",
        )
        .bind(status)
        .bind(&partner)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(InboundMessage::try_from)
                .collect::<Result<Vec<_>>>()?,
            total: total.0 as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Async MDNs built but not yet delivered, oldest first
    pub async fn pending_async_mdns(&self, max_attempts: u32, limit: u32) -> Result<Vec<InboundMessage>> {
        let rows = sqlx::query_as::<_, InboundRow>(&format!(
            r#"
            SELECT {} FROM inbound_messages
            WHERE mdn_mode = 'async' AND mdn_url IS NOT NULL AND mdn_body IS NOT NULL
              AND mdn_sent_at IS NULL AND mdn_attempts < ?
            ORDER BY received_at
            LIMIT ?
            "#,
            INBOUND_COLUMNS
        ))
        .bind(max_attempts as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InboundMessage::try_from).collect()
    }

    /// Record one async MDN delivery round; `sent_at` is set on success
    pub async fn record_mdn_delivery(
        &self,
        id: InboundId,
        attempts: u32,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE inbound_messages SET mdn_attempts = mdn_attempts + ?, mdn_sent_at = COALESCE(mdn_sent_at, ?) WHERE id = ?",
        )
        .bind(attempts as i64)
        .bind(sent_at.map(format_ts))
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct InboundRow {
    id: String,
    message_id: String,
    partner_id: Option<String>,
    as2_from: String,
    as2_to: String,
    subject: Option<String>,
    content_type: Option<String>,
    payload: Option<Vec<u8>>,
    received_at: String,
    mic: Option<String>,
    status: String,
    status_reason: Option<String>,
    validation_json: Option<String>,
    routing_json: Option<String>,
    mdn_mode: String,
    mdn_disposition: Option<String>,
    mdn_body: Option<Vec<u8>>,
    mdn_url: Option<String>,
    mdn_sent_at: Option<String>,
    mdn_attempts: i64,
}

impl TryFrom<InboundRow> for InboundMessage {
    type Error = As2Error;

    fn try_from(row: InboundRow) -> Result<Self> {
        Ok(Self {
            id: InboundId::from_uuid(parse_uuid(&row.id)?),
            message_id: row.message_id,
            partner_id: row
                .partner_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(PartnerId::from_uuid),
            as2_from: row.as2_from,
            as2_to: row.as2_to,
            subject: row.subject,
            content_type: row.content_type,
            payload: row.payload,
            received_at: parse_ts(&row.received_at)?,
            mic: row.mic,
            status: parse_column(&row.status)?,
            status_reason: row.status_reason,
            validation: row
                .validation_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            routing: row
                .routing_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            mdn_mode: parse_column(&row.mdn_mode)?,
            mdn_disposition: row.mdn_disposition,
            mdn_body: row.mdn_body,
            mdn_url: row.mdn_url,
            mdn_sent_at: parse_opt_ts(row.mdn_sent_at)?,
            mdn_attempts: row.mdn_attempts as u32,
        })
    }
}
