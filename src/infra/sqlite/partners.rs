//! Partner rows

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{format_ts, is_unique_violation, parse_column, parse_opt_ts, parse_ts, parse_uuid, SqliteStore};
use crate::domain::{Page, PageRequest, Partner, PartnerCryptoConfig, PartnerId, RetryPolicy};
use crate::infra::{As2Error, Result};

const PARTNER_COLUMNS: &str = r#"
    id, as2_id, name, endpoint_url, encryption_cert_serial, signing_cert_serial,
    encryption_algorithm, mic_algorithm, compress, request_signed_mdn, mdn_mode,
    mdn_timeout_secs, max_retries, retry_interval_minutes, business_ack_expected,
    business_ack_sla_minutes, archived_at, created_at, updated_at
"#;

impl SqliteStore {
    pub async fn insert_partner(&self, partner: &Partner) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO partners (
                id, as2_id, name, endpoint_url, encryption_cert_serial, signing_cert_serial,
                encryption_algorithm, mic_algorithm, compress, request_signed_mdn, mdn_mode,
                mdn_timeout_secs, max_retries, retry_interval_minutes, business_ack_expected,
                business_ack_sla_minutes, archived_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(partner.id.0.to_string())
        .bind(&partner.as2_id)
        .bind(&partner.name)
        .bind(&partner.endpoint_url)
        .bind(&partner.encryption_cert_serial)
        .bind(&partner.signing_cert_serial)
        .bind(partner.crypto.encryption.as_str())
        .bind(partner.crypto.mic_algorithm.as_str())
        .bind(partner.crypto.compress)
        .bind(partner.crypto.request_signed_mdn)
        .bind(partner.mdn_mode.as_str())
        .bind(partner.mdn_timeout_secs as i64)
        .bind(partner.retry_policy.max_retries as i64)
        .bind(partner.retry_policy.retry_interval_minutes as i64)
        .bind(partner.business_ack_expected)
        .bind(partner.business_ack_sla_minutes as i64)
        .bind(partner.archived_at.map(format_ts))
        .bind(format_ts(partner.created_at))
        .bind(format_ts(partner.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(As2Error::AlreadyExists(format!(
                "AS2 id {} is already registered",
                partner.as2_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite every mutable column of an existing partner
    pub async fn update_partner(&self, partner: &Partner) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE partners SET
                as2_id = ?, name = ?, endpoint_url = ?,
                encryption_cert_serial = ?, signing_cert_serial = ?,
                encryption_algorithm = ?, mic_algorithm = ?, compress = ?, request_signed_mdn = ?,
                mdn_mode = ?, mdn_timeout_secs = ?, max_retries = ?, retry_interval_minutes = ?,
                business_ack_expected = ?, business_ack_sla_minutes = ?,
                archived_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&partner.as2_id)
        .bind(&partner.name)
        .bind(&partner.endpoint_url)
        .bind(&partner.encryption_cert_serial)
        .bind(&partner.signing_cert_serial)
        .bind(partner.crypto.encryption.as_str())
        .bind(partner.crypto.mic_algorithm.as_str())
        .bind(partner.crypto.compress)
        .bind(partner.crypto.request_signed_mdn)
        .bind(partner.mdn_mode.as_str())
        .bind(partner.mdn_timeout_secs as i64)
        .bind(partner.retry_policy.max_retries as i64)
        .bind(partner.retry_policy.retry_interval_minutes as i64)
        .bind(partner.business_ack_expected)
        .bind(partner.business_ack_sla_minutes as i64)
        .bind(partner.archived_at.map(format_ts))
        .bind(format_ts(partner.updated_at))
        .bind(partner.id.0.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(As2Error::PartnerNotFound(partner.id.to_string()))
            }
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(As2Error::AlreadyExists(format!(
                "AS2 id {} is already registered",
                partner.as2_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_partner(&self, id: PartnerId) -> Result<Option<Partner>> {
        let row = sqlx::query_as::<_, PartnerRow>(&format!(
            "SELECT {} FROM partners WHERE id = ?",
            PARTNER_COLUMNS
        ))
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Partner::try_from).transpose()
    }

    pub async fn get_partner_by_as2_id(&self, as2_id: &str) -> Result<Option<Partner>> {
        let row = sqlx::query_as::<_, PartnerRow>(&format!(
            "SELECT {} FROM partners WHERE as2_id = ?",
            PARTNER_COLUMNS
        ))
        .bind(as2_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Partner::try_from).transpose()
    }

    pub async fn list_partners(
        &self,
        include_archived: bool,
        page: PageRequest,
    ) -> Result<Page<Partner>> {
        let rows = sqlx::query_as::<_, PartnerRow>(&format!(
            "SELECT {} FROM partners WHERE (?1 OR archived_at IS NULL) ORDER BY as2_id LIMIT ?2 OFFSET ?3",
            PARTNER_COLUMNS
        ))
        .bind(include_archived)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM partners WHERE (?1 OR archived_at IS NULL)")
                .bind(include_archived)
                .fetch_one(&self.pool)
                .await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(Partner::try_from)
                .collect::<Result<Vec<_>>>()?,
            total: total.0 as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Soft delete; archiving twice keeps the first timestamp
    pub async fn archive_partner(&self, id: PartnerId, at: DateTime<Utc>) -> Result<Partner> {
        let ts = format_ts(at);
        sqlx::query(
            "UPDATE partners SET archived_at = COALESCE(archived_at, ?), updated_at = ? WHERE id = ?",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        self.get_partner(id)
            .await?
            .ok_or_else(|| As2Error::PartnerNotFound(id.to_string()))
    }
}

#[derive(Debug, FromRow)]
pub(super) struct PartnerRow {
    id: String,
    as2_id: String,
    name: String,
    endpoint_url: String,
    encryption_cert_serial: String,
    signing_cert_serial: String,
    encryption_algorithm: String,
    mic_algorithm: String,
    compress: bool,
    request_signed_mdn: bool,
    mdn_mode: String,
    mdn_timeout_secs: i64,
    max_retries: i64,
    retry_interval_minutes: i64,
    business_ack_expected: bool,
    business_ack_sla_minutes: i64,
    archived_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<PartnerRow> for Partner {
    type Error = As2Error;

    fn try_from(row: PartnerRow) -> Result<Self> {
        Ok(Self {
            id: PartnerId::from_uuid(parse_uuid(&row.id)?),
            as2_id: row.as2_id,
            name: row.name,
            endpoint_url: row.endpoint_url,
            encryption_cert_serial: row.encryption_cert_serial,
            signing_cert_serial: row.signing_cert_serial,
            crypto: PartnerCryptoConfig {
                encryption: parse_column(&row.encryption_algorithm)?,
                mic_algorithm: parse_column(&row.mic_algorithm)?,
                compress: row.compress,
                request_signed_mdn: row.request_signed_mdn,
            },
            mdn_mode: parse_column(&row.mdn_mode)?,
            mdn_timeout_secs: row.mdn_timeout_secs as u32,
            retry_policy: RetryPolicy {
                max_retries: row.max_retries as u32,
                retry_interval_minutes: row.retry_interval_minutes as u32,
            },
            business_ack_expected: row.business_ack_expected,
            business_ack_sla_minutes: row.business_ack_sla_minutes as u32,
            archived_at: parse_opt_ts(row.archived_at)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}
