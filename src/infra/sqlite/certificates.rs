//! Certificate rows and the `CertificateStore` implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{format_ts, is_unique_violation, parse_column, parse_ts, SqliteStore};
use crate::domain::{
    Certificate, CertificateOverride, CertificateOwner, CertificateUsage, Page, PageRequest,
    Partner, PartnerId,
};
use crate::infra::{As2Error, CertificateStore, Result};

const CERTIFICATE_COLUMNS: &str = r#"
    serial, subject_dn, issuer_dn, valid_from, valid_to, fingerprint, key_size_bits,
    owner, usage, encryption_public_key, signing_public_key, status_override, created_at
"#;

impl SqliteStore {
    pub async fn insert_certificate(&self, cert: &Certificate) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_certificate_row(&mut *conn, cert).await
    }

    pub async fn get_certificate(&self, serial: &str) -> Result<Option<Certificate>> {
        let row = sqlx::query_as::<_, CertificateRow>(&format!(
            "SELECT {} FROM certificates WHERE serial = ?",
            CERTIFICATE_COLUMNS
        ))
        .bind(serial)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Certificate::try_from).transpose()
    }

    /// Certificates ordered by expiry, optionally for one owner
    pub async fn list_certificates(
        &self,
        owner: Option<CertificateOwner>,
        page: PageRequest,
    ) -> Result<Page<Certificate>> {
        let owner = owner.map(|o| o.to_string());

        let rows = sqlx::query_as::<_, CertificateRow>(&format!(
            "SELECT {} FROM certificates WHERE (?1 IS NULL OR owner = ?1) ORDER BY valid_to, serial LIMIT ?2 OFFSET ?3",
            CERTIFICATE_COLUMNS
        ))
        .bind(&owner)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM certificates WHERE (?1 IS NULL OR owner = ?1)")
                .bind(&owner)
                .fetch_one(&self.pool)
                .await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(Certificate::try_from)
                .collect::<Result<Vec<_>>>()?,
            total: total.0 as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Mark a certificate archived or revoked
    pub async fn set_certificate_override(
        &self,
        serial: &str,
        status: CertificateOverride,
    ) -> Result<Certificate> {
        let result = sqlx::query("UPDATE certificates SET status_override = ? WHERE serial = ?")
            .bind(status.as_str())
            .bind(serial)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(As2Error::CertificateNotFound(serial.to_string()));
        }

        self.get_certificate(serial)
            .await?
            .ok_or_else(|| As2Error::CertificateNotFound(serial.to_string()))
    }

    /// Add `cert` and point the partner's reference(s) at it, atomically.
    ///
    /// Encoders read the partner reference at encode time, so they observe
    /// either the previous certificate or the new one.
    pub async fn rotate_partner_certificate(
        &self,
        partner_id: PartnerId,
        cert: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<Partner> {
        if cert.owner != CertificateOwner::Partner(partner_id) {
            return Err(As2Error::Validation(format!(
                "certificate {} is owned by {}, not partner {}",
                cert.serial, cert.owner, partner_id
            )));
        }

        let mut tx = self.pool.begin().await?;
        insert_certificate_row(&mut *tx, cert).await?;

        let covers_encryption = cert.usage.covers(CertificateUsage::Encryption);
        let covers_signing = cert.usage.covers(CertificateUsage::Signing);
        let updated = sqlx::query(
            r#"
            UPDATE partners SET
                encryption_cert_serial = CASE WHEN ?1 THEN ?3 ELSE encryption_cert_serial END,
                signing_cert_serial = CASE WHEN ?2 THEN ?3 ELSE signing_cert_serial END,
                updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(covers_encryption)
        .bind(covers_signing)
        .bind(&cert.serial)
        .bind(format_ts(at))
        .bind(partner_id.0.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(As2Error::PartnerNotFound(partner_id.to_string()));
        }
        tx.commit().await?;

        self.get_partner(partner_id)
            .await?
            .ok_or_else(|| As2Error::PartnerNotFound(partner_id.to_string()))
    }
}

async fn insert_certificate_row(
    conn: &mut sqlx::SqliteConnection,
    cert: &Certificate,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO certificates (
            serial, subject_dn, issuer_dn, valid_from, valid_to, fingerprint, key_size_bits,
            owner, usage, encryption_public_key, signing_public_key, status_override, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&cert.serial)
    .bind(&cert.subject_dn)
    .bind(&cert.issuer_dn)
    .bind(format_ts(cert.valid_from))
    .bind(format_ts(cert.valid_to))
    .bind(&cert.fingerprint)
    .bind(cert.key_size_bits as i64)
    .bind(cert.owner.to_string())
    .bind(cert.usage.as_str())
    .bind(&cert.encryption_public_key)
    .bind(&cert.signing_public_key)
    .bind(cert.status_override.map(|s| s.as_str()))
    .bind(format_ts(cert.created_at))
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(As2Error::AlreadyExists(format!(
            "certificate {} (or its key material) is already registered",
            cert.serial
        ))),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CertificateStore for SqliteStore {
    async fn get_active_certificate(
        &self,
        owner: CertificateOwner,
        usage: CertificateUsage,
    ) -> Result<Option<Certificate>> {
        match owner {
            CertificateOwner::Partner(partner_id) => {
                let Some(partner) = self.get_partner(partner_id).await? else {
                    return Ok(None);
                };
                let serial = match usage {
                    CertificateUsage::Signing => &partner.signing_cert_serial,
                    CertificateUsage::Encryption | CertificateUsage::Both => {
                        &partner.encryption_cert_serial
                    }
                };
                Ok(self
                    .get_certificate(serial)
                    .await?
                    .filter(|cert| cert.usage.covers(usage)))
            }
            CertificateOwner::Own => {
                let rows = sqlx::query_as::<_, CertificateRow>(&format!(
                    "SELECT {} FROM certificates WHERE owner = 'self' AND status_override IS NULL ORDER BY valid_from DESC",
                    CERTIFICATE_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?;

                for row in rows {
                    let cert = Certificate::try_from(row)?;
                    if cert.usage.covers(usage) {
                        return Ok(Some(cert));
                    }
                }
                Ok(None)
            }
        }
    }

    async fn get_certificate_by_serial(&self, serial: &str) -> Result<Option<Certificate>> {
        self.get_certificate(serial).await
    }
}

#[derive(Debug, FromRow)]
struct CertificateRow {
    serial: String,
    subject_dn: String,
    issuer_dn: String,
    valid_from: String,
    valid_to: String,
    fingerprint: String,
    key_size_bits: i64,
    owner: String,
    usage: String,
    encryption_public_key: Option<String>,
    signing_public_key: Option<String>,
    status_override: Option<String>,
    created_at: String,
}

impl TryFrom<CertificateRow> for Certificate {
    type Error = As2Error;

    fn try_from(row: CertificateRow) -> Result<Self> {
        Ok(Self {
            serial: row.serial,
            subject_dn: row.subject_dn,
            issuer_dn: row.issuer_dn,
            valid_from: parse_ts(&row.valid_from)?,
            valid_to: parse_ts(&row.valid_to)?,
            fingerprint: row.fingerprint,
            key_size_bits: row.key_size_bits as u32,
            owner: parse_column(&row.owner)?,
            usage: parse_column(&row.usage)?,
            encryption_public_key: row.encryption_public_key,
            signing_public_key: row.signing_public_key,
            status_override: row
                .status_override
                .as_deref()
                .map(parse_column)
                .transpose()?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use chrono::SubsecRound;

    #[tokio::test]
    async fn rotation_swaps_reference_atomically() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now().trunc_subsecs(6);
        let partner = fixtures::partner("ACME", now);
        store.insert_partner(&partner).await.unwrap();

        let owner = CertificateOwner::Partner(partner.id);
        let old = fixtures::certificate("ACME-ENC-1", owner, CertificateUsage::Encryption, now);
        store.insert_certificate(&old).await.unwrap();
        assert_eq!(
            store
                .get_active_certificate(owner, CertificateUsage::Encryption)
                .await
                .unwrap(),
            Some(old)
        );

        let new = fixtures::certificate("ACME-ENC-2", owner, CertificateUsage::Encryption, now);
        let rotated = store
            .rotate_partner_certificate(partner.id, &new, now)
            .await
            .unwrap();
        assert_eq!(rotated.encryption_cert_serial, "ACME-ENC-2");
        assert_eq!(rotated.signing_cert_serial, partner.signing_cert_serial);
        assert_eq!(
            store
                .get_active_certificate(owner, CertificateUsage::Encryption)
                .await
                .unwrap()
                .map(|c| c.serial),
            Some("ACME-ENC-2".to_string())
        );
    }

    #[tokio::test]
    async fn failed_rotation_leaves_nothing_behind() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let partner = fixtures::partner("ACME", now);
        store.insert_partner(&partner).await.unwrap();

        let owner = CertificateOwner::Partner(partner.id);
        let first = fixtures::certificate("ACME-ENC-1", owner, CertificateUsage::Both, now);
        store.insert_certificate(&first).await.unwrap();

        // Same fingerprint as the existing certificate
        let mut clash = fixtures::certificate("ACME-ENC-2", owner, CertificateUsage::Both, now);
        clash.fingerprint = first.fingerprint.clone();
        let err = store
            .rotate_partner_certificate(partner.id, &clash, now)
            .await
            .unwrap_err();
        assert!(matches!(err, As2Error::AlreadyExists(_)));

        let reloaded = store.get_partner(partner.id).await.unwrap().unwrap();
        assert_eq!(reloaded.encryption_cert_serial, "ACME-ENC-1");
        assert!(store.get_certificate("ACME-ENC-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotation_rejects_foreign_certificate() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let partner = fixtures::partner("ACME", now);
        store.insert_partner(&partner).await.unwrap();

        let cert = fixtures::certificate("OWN-1", CertificateOwner::Own, CertificateUsage::Both, now);
        assert!(matches!(
            store.rotate_partner_certificate(partner.id, &cert, now).await,
            Err(As2Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn override_and_own_lookup() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let own = fixtures::certificate("OWN-1", CertificateOwner::Own, CertificateUsage::Both, now);
        store.insert_certificate(&own).await.unwrap();

        let found = store
            .get_active_certificate(CertificateOwner::Own, CertificateUsage::Signing)
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.serial), Some("OWN-1".to_string()));

        let revoked = store
            .set_certificate_override("OWN-1", CertificateOverride::Revoked)
            .await
            .unwrap();
        assert_eq!(revoked.status_override, Some(CertificateOverride::Revoked));
        assert!(store
            .get_active_certificate(CertificateOwner::Own, CertificateUsage::Signing)
            .await
            .unwrap()
            .is_none());

        assert!(matches!(
            store
                .set_certificate_override("MISSING", CertificateOverride::Archived)
                .await,
            Err(As2Error::CertificateNotFound(_))
        ));
    }
}
