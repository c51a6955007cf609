//! Outbound messages, their transition timeline and raw artifacts

use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite};

use super::{format_ts, parse_column, parse_opt_ts, parse_ts, parse_uuid, SqliteStore};
use crate::domain::{
    ArtifactKind, BusinessAck, MdnMetadata, MessageId, MicAlgorithm, OutboundMessage, Page,
    PageRequest, PartnerId, RawArtifact, StateTransition, TransmissionState,
};
use crate::infra::{As2Error, Result};

const MESSAGE_COLUMNS: &str = r#"
    id, message_id, partner_id, payload, content_type, subject, priority, created_at,
    state, state_reason, sent_mic, received_mic, mic_algorithm, compressed,
    envelope, envelope_cert_serial,
    mdn_disposition, mdn_signature_verified, mdn_message_id, mdn_received_at,
    business_ack_status, business_ack_received_at, business_ack_detail,
    retry_count, next_attempt_at, mdn_deadline,
    cancel_requested, review_required, business_ack_overdue_warned, updated_at
"#;

/// Column changes applied together with (or without) a state change.
///
/// `sent_mic`, `mic_algorithm` and `compressed` are write-once: the store
/// keeps an existing value.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub sent_mic: Option<String>,
    pub mic_algorithm: Option<MicAlgorithm>,
    pub compressed: Option<bool>,
    pub received_mic: Option<String>,
    /// Envelope bytes and the encryption certificate serial they target
    pub envelope: Option<(Vec<u8>, String)>,
    pub mdn: Option<MdnMetadata>,
    pub business_ack: Option<BusinessAck>,
    pub retry_count: Option<u32>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub mdn_deadline: Option<Option<DateTime<Utc>>>,
    pub cancel_requested: Option<bool>,
    pub review_required: Option<bool>,
    pub business_ack_overdue_warned: Option<bool>,
}

impl MessageUpdate {
    fn push_assignments(self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(mic) = self.sent_mic {
            qb.push(", sent_mic = COALESCE(sent_mic, ").push_bind(mic).push(")");
        }
        if let Some(alg) = self.mic_algorithm {
            qb.push(", mic_algorithm = COALESCE(mic_algorithm, ")
                .push_bind(alg.as_str())
                .push(")");
        }
        if let Some(compressed) = self.compressed {
            qb.push(", compressed = COALESCE(compressed, ")
                .push_bind(compressed)
                .push(")");
        }
        if let Some(mic) = self.received_mic {
            qb.push(", received_mic = ").push_bind(mic);
        }
        if let Some((bytes, serial)) = self.envelope {
            qb.push(", envelope = ").push_bind(bytes);
            qb.push(", envelope_cert_serial = ").push_bind(serial);
        }
        if let Some(mdn) = self.mdn {
            qb.push(", mdn_disposition = ").push_bind(mdn.disposition);
            qb.push(", mdn_signature_verified = ")
                .push_bind(mdn.signature_verified);
            qb.push(", mdn_message_id = ").push_bind(mdn.mdn_message_id);
            qb.push(", mdn_received_at = ")
                .push_bind(format_ts(mdn.received_at));
        }
        if let Some(ack) = self.business_ack {
            qb.push(", business_ack_status = ")
                .push_bind(ack.status.as_str());
            qb.push(", business_ack_received_at = ")
                .push_bind(format_ts(ack.received_at));
            qb.push(", business_ack_detail = ").push_bind(ack.detail);
        }
        if let Some(count) = self.retry_count {
            qb.push(", retry_count = ").push_bind(count as i64);
        }
        if let Some(at) = self.next_attempt_at {
            qb.push(", next_attempt_at = ").push_bind(at.map(format_ts));
        }
        if let Some(at) = self.mdn_deadline {
            qb.push(", mdn_deadline = ").push_bind(at.map(format_ts));
        }
        if let Some(flag) = self.cancel_requested {
            qb.push(", cancel_requested = ").push_bind(flag);
        }
        if let Some(flag) = self.review_required {
            qb.push(", review_required = ").push_bind(flag);
        }
        if let Some(flag) = self.business_ack_overdue_warned {
            qb.push(", business_ack_overdue_warned = ").push_bind(flag);
        }
    }
}

/// Filters for listing outbound messages
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub state: Option<TransmissionState>,
    pub partner_id: Option<PartnerId>,
}

impl SqliteStore {
    /// Persist a new message together with its initial timeline entry
    pub async fn insert_outbound(&self, msg: &OutboundMessage) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO outbound_messages (
                id, message_id, partner_id, payload, content_type, subject, priority,
                created_at, state, state_reason, retry_count, next_attempt_at,
                cancel_requested, review_required, business_ack_overdue_warned, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(msg.id.0.to_string())
        .bind(&msg.message_id)
        .bind(msg.partner_id.0.to_string())
        .bind(&msg.payload)
        .bind(&msg.content_type)
        .bind(&msg.subject)
        .bind(msg.priority.as_str())
        .bind(format_ts(msg.created_at))
        .bind(msg.state.as_str())
        .bind(&msg.state_reason)
        .bind(msg.retry_count as i64)
        .bind(msg.next_attempt_at.map(format_ts))
        .bind(msg.cancel_requested)
        .bind(msg.review_required)
        .bind(msg.business_ack_overdue_warned)
        .bind(format_ts(msg.updated_at))
        .execute(&mut *tx)
        .await?;

        insert_transition(&mut *tx, msg.id, None, msg.state, &msg.state_reason, msg.created_at)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_outbound(&self, id: MessageId) -> Result<Option<OutboundMessage>> {
        let row = sqlx::query_as::<_, OutboundRow>(&format!(
            "SELECT {} FROM outbound_messages WHERE id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboundMessage::try_from).transpose()
    }

    /// Look up by AS2 `Message-ID`
    pub async fn get_outbound_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<OutboundMessage>> {
        let row = sqlx::query_as::<_, OutboundRow>(&format!(
            "SELECT {} FROM outbound_messages WHERE message_id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboundMessage::try_from).transpose()
    }

    /// Newest first
    pub async fn list_outbound(
        &self,
        filter: &MessageFilter,
        page: PageRequest,
    ) -> Result<Page<OutboundMessage>> {
        let state = filter.state.map(|s| s.as_str());
        let partner = filter.partner_id.map(|p| p.0.to_string());

        let rows = sqlx::query_as::<_, OutboundRow>(&format!(
            r#"
            SELECT {} FROM outbound_messages
            WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR partner_id = ?2)
            ORDER BY created_at DESC, id
            LIMIT ?3 OFFSET ?4
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(state)
        .bind(&partner)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM outbound_messages WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR partner_id = ?2)",
        )
        .bind(state)
        .bind(&partner)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(OutboundMessage::try_from)
                .collect::<Result<Vec<_>>>()?,
            total: total.0 as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Compare-and-set state change plus its timeline row, in one transaction.
    ///
    /// `reason` replaces `state_reason`. Fails with `InvalidStateTransition`
    /// for edges outside the graph and `ConcurrentModification` when the
    /// persisted state is no longer `from`.
    pub async fn transition(
        &self,
        id: MessageId,
        from: TransmissionState,
        to: TransmissionState,
        reason: Option<String>,
        update: MessageUpdate,
        at: DateTime<Utc>,
    ) -> Result<OutboundMessage> {
        if !from.can_transition_to(to) {
            return Err(As2Error::InvalidStateTransition {
                message_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE outbound_messages SET updated_at = ");
        qb.push_bind(format_ts(at));
        qb.push(", state = ").push_bind(to.as_str());
        qb.push(", state_reason = ").push_bind(reason.clone());
        update.push_assignments(&mut qb);
        qb.push(" WHERE id = ").push_bind(id.0.to_string());
        qb.push(" AND state = ").push_bind(from.as_str());

        let result = qb.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(lost_race(&mut *tx, id, from).await);
        }

        insert_transition(&mut *tx, id, Some(from), to, &reason, at).await?;
        tx.commit().await?;

        self.get_outbound(id)
            .await?
            .ok_or_else(|| As2Error::MessageNotFound(id.to_string()))
    }

    /// Apply `update` without changing state, provided the state is still `expected`
    pub async fn update_outbound(
        &self,
        id: MessageId,
        expected: TransmissionState,
        update: MessageUpdate,
        at: DateTime<Utc>,
    ) -> Result<OutboundMessage> {
        let mut tx = self.pool.begin().await?;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE outbound_messages SET updated_at = ");
        qb.push_bind(format_ts(at));
        update.push_assignments(&mut qb);
        qb.push(" WHERE id = ").push_bind(id.0.to_string());
        qb.push(" AND state = ").push_bind(expected.as_str());

        let result = qb.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(lost_race(&mut *tx, id, expected).await);
        }
        tx.commit().await?;

        self.get_outbound(id)
            .await?
            .ok_or_else(|| As2Error::MessageNotFound(id.to_string()))
    }

    /// Set `cancel_requested` on a non-terminal message; false if it is terminal
    pub async fn request_cancel(&self, id: MessageId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbound_messages SET cancel_requested = 1, updated_at = ?
            WHERE id = ? AND state IN ('queued', 'sending', 'awaiting_mdn', 'send_failed', 'mdn_timeout')
            "#,
        )
        .bind(format_ts(at))
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Dispatchable messages whose `next_attempt_at` has passed, high priority first
    pub async fn due_messages(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboundMessage>> {
        let rows = sqlx::query_as::<_, OutboundRow>(&format!(
            r#"
            SELECT {} FROM outbound_messages
            WHERE state IN ('queued', 'send_failed', 'mdn_timeout')
              AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?
            ORDER BY CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                     next_attempt_at
            LIMIT ?
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(format_ts(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboundMessage::try_from).collect()
    }

    /// Messages still awaiting an MDN past their deadline
    pub async fn expired_mdn_deadlines(&self, now: DateTime<Utc>) -> Result<Vec<OutboundMessage>> {
        let rows = sqlx::query_as::<_, OutboundRow>(&format!(
            r#"
            SELECT {} FROM outbound_messages
            WHERE state = 'awaiting_mdn' AND mdn_deadline IS NOT NULL AND mdn_deadline <= ?
            ORDER BY mdn_deadline
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(format_ts(now))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboundMessage::try_from).collect()
    }

    /// Messages awaiting a business ack that have not been warned about yet
    pub async fn unwarned_business_acks(&self) -> Result<Vec<OutboundMessage>> {
        let rows = sqlx::query_as::<_, OutboundRow>(&format!(
            r#"
            SELECT {} FROM outbound_messages
            WHERE state = 'awaiting_business_ack' AND business_ack_overdue_warned = 0
            "#,
            MESSAGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboundMessage::try_from).collect()
    }

    /// Timeline in commit order
    pub async fn timeline(&self, id: MessageId) -> Result<Vec<StateTransition>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT message_id, from_state, to_state, reason, at
            FROM message_transitions WHERE message_id = ? ORDER BY id
            "#,
        )
        .bind(id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StateTransition::try_from).collect()
    }

    pub async fn record_artifact(&self, artifact: &RawArtifact) -> Result<()> {
        sqlx::query(
            "INSERT INTO raw_artifacts (owner_id, kind, bytes, recorded_at) VALUES (?, ?, ?, ?)",
        )
        .bind(artifact.owner_id.to_string())
        .bind(artifact.kind.as_str())
        .bind(&artifact.bytes)
        .bind(format_ts(artifact.recorded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn artifacts(&self, owner_id: uuid::Uuid) -> Result<Vec<RawArtifact>> {
        let rows: Vec<(String, String, Vec<u8>, String)> = sqlx::query_as(
            "SELECT owner_id, kind, bytes, recorded_at FROM raw_artifacts WHERE owner_id = ? ORDER BY id",
        )
        .bind(owner_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(owner, kind, bytes, recorded_at)| {
                Ok(RawArtifact {
                    owner_id: parse_uuid(&owner)?,
                    kind: parse_column::<ArtifactKind>(&kind)?,
                    bytes,
                    recorded_at: parse_ts(&recorded_at)?,
                })
            })
            .collect()
    }
}

async fn insert_transition(
    conn: &mut sqlx::SqliteConnection,
    id: MessageId,
    from: Option<TransmissionState>,
    to: TransmissionState,
    reason: &Option<String>,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO message_transitions (message_id, from_state, to_state, reason, at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.0.to_string())
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(reason)
    .bind(format_ts(at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Explain a compare-and-set that matched no row
async fn lost_race(
    conn: &mut sqlx::SqliteConnection,
    id: MessageId,
    expected: TransmissionState,
) -> As2Error {
    let current: std::result::Result<Option<(String,)>, sqlx::Error> =
        sqlx::query_as("SELECT state FROM outbound_messages WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&mut *conn)
            .await;

    match current {
        Ok(None) => As2Error::MessageNotFound(id.to_string()),
        Ok(Some(_)) => As2Error::ConcurrentModification {
            message_id: id.to_string(),
            expected: expected.to_string(),
        },
        Err(e) => e.into(),
    }
}

#[derive(Debug, FromRow)]
struct OutboundRow {
    id: String,
    message_id: String,
    partner_id: String,
    payload: Vec<u8>,
    content_type: String,
    subject: String,
    priority: String,
    created_at: String,
    state: String,
    state_reason: Option<String>,
    sent_mic: Option<String>,
    received_mic: Option<String>,
    mic_algorithm: Option<String>,
    compressed: Option<bool>,
    envelope: Option<Vec<u8>>,
    envelope_cert_serial: Option<String>,
    mdn_disposition: Option<String>,
    mdn_signature_verified: Option<bool>,
    mdn_message_id: Option<String>,
    mdn_received_at: Option<String>,
    business_ack_status: Option<String>,
    business_ack_received_at: Option<String>,
    business_ack_detail: Option<String>,
    retry_count: i64,
    next_attempt_at: Option<String>,
    mdn_deadline: Option<String>,
    cancel_requested: bool,
    review_required: bool,
    business_ack_overdue_warned: bool,
    updated_at: String,
}

impl TryFrom<OutboundRow> for OutboundMessage {
    type Error = As2Error;

    fn try_from(row: OutboundRow) -> Result<Self> {
        let mdn = match (row.mdn_disposition, parse_opt_ts(row.mdn_received_at)?) {
            (Some(disposition), Some(received_at)) => Some(MdnMetadata {
                disposition,
                signature_verified: row.mdn_signature_verified.unwrap_or(false),
                mdn_message_id: row.mdn_message_id,
                received_at,
            }),
            _ => None,
        };

        let business_ack = match (
            row.business_ack_status,
            parse_opt_ts(row.business_ack_received_at)?,
        ) {
            (Some(status), Some(received_at)) => Some(BusinessAck {
                status: parse_column(&status)?,
                received_at,
                detail: row.business_ack_detail,
            }),
            _ => None,
        };

        Ok(Self {
            id: MessageId::from_uuid(parse_uuid(&row.id)?),
            message_id: row.message_id,
            partner_id: PartnerId::from_uuid(parse_uuid(&row.partner_id)?),
            payload: row.payload,
            content_type: row.content_type,
            subject: row.subject,
            priority: parse_column(&row.priority)?,
            created_at: parse_ts(&row.created_at)?,
            state: parse_column(&row.state)?,
            state_reason: row.state_reason,
            sent_mic: row.sent_mic,
            received_mic: row.received_mic,
            mic_algorithm: row.mic_algorithm.as_deref().map(parse_column).transpose()?,
            compressed: row.compressed,
            envelope: row.envelope,
            envelope_cert_serial: row.envelope_cert_serial,
            mdn,
            business_ack,
            retry_count: row.retry_count as u32,
            next_attempt_at: parse_opt_ts(row.next_attempt_at)?,
            mdn_deadline: parse_opt_ts(row.mdn_deadline)?,
            cancel_requested: row.cancel_requested,
            review_required: row.review_required,
            business_ack_overdue_warned: row.business_ack_overdue_warned,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransitionRow {
    message_id: String,
    from_state: Option<String>,
    to_state: String,
    reason: Option<String>,
    at: String,
}

impl TryFrom<TransitionRow> for StateTransition {
    type Error = As2Error;

    fn try_from(row: TransitionRow) -> Result<Self> {
        Ok(Self {
            message_id: MessageId::from_uuid(parse_uuid(&row.message_id)?),
            from_state: row.from_state.as_deref().map(parse_column).transpose()?,
            to_state: parse_column(&row.to_state)?,
            reason: row.reason,
            at: parse_ts(&row.at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use crate::domain::Priority;
    use chrono::Duration;

    async fn setup() -> (SqliteStore, OutboundMessage) {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let partner = fixtures::partner("ACME", now);
        store.insert_partner(&partner).await.unwrap();

        let msg = OutboundMessage {
            id: MessageId::new(),
            message_id: "<m1@gw>".to_string(),
            partner_id: partner.id,
            payload: b"ISA*00*".to_vec(),
            content_type: "application/edi-x12".to_string(),
            subject: "PO 1".to_string(),
            priority: Priority::Normal,
            created_at: now,
            state: TransmissionState::Queued,
            state_reason: None,
            sent_mic: None,
            received_mic: None,
            mic_algorithm: None,
            compressed: None,
            envelope: None,
            envelope_cert_serial: None,
            mdn: None,
            business_ack: None,
            retry_count: 0,
            next_attempt_at: Some(now),
            mdn_deadline: None,
            cancel_requested: false,
            review_required: false,
            business_ack_overdue_warned: false,
            updated_at: now,
        };
        store.insert_outbound(&msg).await.unwrap();
        (store, msg)
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let (store, msg) = setup().await;
        let now = Utc::now();

        let sending = store
            .transition(
                msg.id,
                TransmissionState::Queued,
                TransmissionState::Sending,
                None,
                MessageUpdate {
                    sent_mic: Some("mic-1".to_string()),
                    mic_algorithm: Some(MicAlgorithm::Sha256),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(sending.state, TransmissionState::Sending);
        assert_eq!(sending.sent_mic.as_deref(), Some("mic-1"));

        // A second writer still believing the message is queued loses.
        let err = store
            .transition(
                msg.id,
                TransmissionState::Queued,
                TransmissionState::Cancelled,
                None,
                MessageUpdate::default(),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, As2Error::ConcurrentModification { .. }));

        let timeline = store.timeline(msg.id).await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].from_state, None);
        assert_eq!(timeline[1].from_state, Some(TransmissionState::Queued));
        assert_eq!(timeline[1].to_state, TransmissionState::Sending);
    }

    #[tokio::test]
    async fn invalid_edges_are_rejected_before_touching_the_row() {
        let (store, msg) = setup().await;
        let err = store
            .transition(
                msg.id,
                TransmissionState::Queued,
                TransmissionState::Complete,
                None,
                MessageUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, As2Error::InvalidStateTransition { .. }));
        assert_eq!(store.timeline(msg.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sent_mic_is_write_once() {
        let (store, msg) = setup().await;
        let now = Utc::now();
        store
            .update_outbound(
                msg.id,
                TransmissionState::Queued,
                MessageUpdate {
                    sent_mic: Some("first".to_string()),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        let updated = store
            .update_outbound(
                msg.id,
                TransmissionState::Queued,
                MessageUpdate {
                    sent_mic: Some("second".to_string()),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(updated.sent_mic.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn due_and_deadline_queries() {
        let (store, msg) = setup().await;
        let now = Utc::now();

        assert_eq!(store.due_messages(now, 10).await.unwrap().len(), 1);
        assert!(store
            .due_messages(now - Duration::minutes(1), 10)
            .await
            .unwrap()
            .is_empty());

        store
            .transition(
                msg.id,
                TransmissionState::Queued,
                TransmissionState::Sending,
                None,
                MessageUpdate::default(),
                now,
            )
            .await
            .unwrap();
        store
            .transition(
                msg.id,
                TransmissionState::Sending,
                TransmissionState::AwaitingMdn,
                None,
                MessageUpdate {
                    mdn_deadline: Some(Some(now + Duration::minutes(5))),
                    next_attempt_at: Some(None),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();

        assert!(store.due_messages(now, 10).await.unwrap().is_empty());
        assert!(store.expired_mdn_deadlines(now).await.unwrap().is_empty());
        let expired = store
            .expired_mdn_deadlines(now + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, msg.id);
    }

    #[tokio::test]
    async fn cancel_request_only_for_live_messages() {
        let (store, msg) = setup().await;
        assert!(store.request_cancel(msg.id, Utc::now()).await.unwrap());
        assert!(store.get_outbound(msg.id).await.unwrap().unwrap().cancel_requested);

        assert!(!store.request_cancel(MessageId::new(), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn artifacts_are_kept_in_order() {
        let (store, msg) = setup().await;
        for (kind, bytes) in [
            (ArtifactKind::OutboundEnvelope, b"env".to_vec()),
            (ArtifactKind::SyncMdn, b"mdn".to_vec()),
        ] {
            store
                .record_artifact(&RawArtifact {
                    owner_id: msg.id.0,
                    kind,
                    bytes,
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let artifacts = store.artifacts(msg.id.0).await.unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].kind, ArtifactKind::OutboundEnvelope);
        assert_eq!(artifacts[1].bytes, b"mdn");
    }
}
