use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use as2_gateway::crypto::{
    issue_certificate, parse_32_byte_key, CertificateTemplate, EncryptionKeyPair, SigningKeyPair,
};
use as2_gateway::domain::{CertificateOwner, MessageId, PageRequest, PartnerId};
use as2_gateway::engine::PartnerRegistry;
use as2_gateway::infra::{parse_audit_action, AuditQueryFilters, SqliteAuditLog, SqliteStore};

fn print_help() {
    eprintln!(
        "\
as2-gateway-admin

USAGE:
  as2-gateway-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  generate-keys                   Print a fresh signing and encryption key pair
  register-own-cert               Register our certificate from the configured private keys
  list-partners                   List trading partners
  archive-partner                 Archive a trading partner
  list-certs                      List certificates with effective status
  expiring-certs                  List expiring or expired certificates
  revoke-cert                     Revoke a certificate
  timeline                        Print the state timeline of an outbound message
  audit                           Query the audit trail

COMMON OPTIONS:
  --database-url <sqlite_url>     (defaults to env DATABASE_URL)
  --actor <name>                  (defaults to env USER) recorded in the audit trail

register-own-cert OPTIONS:
  --serial <serial>               (required)
  --subject <dn>                  (default: CN=<AS2_OWN_ID>)
  --valid-days <n>                (default: 365)
  --signing-key <hex|base64>      (defaults to env AS2_SIGNING_KEY)
  --encryption-key <hex|base64>   (defaults to env AS2_ENCRYPTION_KEY)

list-partners OPTIONS:
  --include-archived

archive-partner OPTIONS:
  --partner-id <uuid>             (required)

list-certs OPTIONS:
  --owner <self|partner:uuid>     (optional)

revoke-cert OPTIONS:
  --serial <serial>               (required)

timeline OPTIONS:
  --message-id <uuid>             (required)

audit OPTIONS:
  --action <action>               (optional) e.g. message_submitted
  --resource-id <id>              (optional)
  --limit <n>                     (default: 50)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn take_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

/// Options shared by every command plus the command-specific flags
#[derive(Default)]
struct Options {
    database_url: Option<String>,
    actor: Option<String>,
    serial: Option<String>,
    subject: Option<String>,
    valid_days: Option<i64>,
    signing_key: Option<String>,
    encryption_key: Option<String>,
    include_archived: bool,
    partner_id: Option<Uuid>,
    message_id: Option<Uuid>,
    owner: Option<String>,
    action: Option<String>,
    resource_id: Option<String>,
    limit: Option<u32>,
}

enum Parsed {
    Run(Options),
    Help,
}

fn parse_options(mut args: VecDeque<String>) -> anyhow::Result<Parsed> {
    let mut opts = Options::default();
    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => opts.database_url = Some(take_value(&mut args, &arg)?),
            "--actor" => opts.actor = Some(take_value(&mut args, &arg)?),
            "--serial" => opts.serial = Some(take_value(&mut args, &arg)?),
            "--subject" => opts.subject = Some(take_value(&mut args, &arg)?),
            "--valid-days" => opts.valid_days = Some(take_value(&mut args, &arg)?.parse()?),
            "--signing-key" => opts.signing_key = Some(take_value(&mut args, &arg)?),
            "--encryption-key" => opts.encryption_key = Some(take_value(&mut args, &arg)?),
            "--include-archived" => opts.include_archived = true,
            "--partner-id" => opts.partner_id = Some(Uuid::parse_str(&take_value(&mut args, &arg)?)?),
            "--message-id" => opts.message_id = Some(Uuid::parse_str(&take_value(&mut args, &arg)?)?),
            "--owner" => opts.owner = Some(take_value(&mut args, &arg)?),
            "--action" => opts.action = Some(take_value(&mut args, &arg)?),
            "--resource-id" => opts.resource_id = Some(take_value(&mut args, &arg)?),
            "--limit" => opts.limit = Some(take_value(&mut args, &arg)?.parse()?),
            "-h" | "--help" => return Ok(Parsed::Help),
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }
    Ok(Parsed::Run(opts))
}

impl Options {
    fn actor(&self) -> String {
        self.actor
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "operator".to_string())
    }

    async fn store(&self) -> anyhow::Result<SqliteStore> {
        let database_url = require_database_url(self.database_url.clone())?;
        let store = SqliteStore::connect(&database_url, 2).await?;
        store.migrate().await?;
        Ok(store)
    }
}

fn registry(store: &SqliteStore) -> PartnerRegistry {
    let audit = Arc::new(SqliteAuditLog::new(store.pool().clone()));
    PartnerRegistry::new(store.clone(), audit)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let opts = match parse_options(args)? {
        Parsed::Run(opts) => opts,
        Parsed::Help => {
            print_help();
            return Ok(());
        }
    };

    match command.as_str() {
        "migrate" => {
            opts.store().await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "generate-keys" => {
            let signing = SigningKeyPair::generate();
            let encryption = EncryptionKeyPair::generate();
            print_json(&serde_json::json!({
                "signing_private_key": hex::encode(signing.to_bytes()),
                "signing_public_key": hex::encode(signing.public_key_bytes()),
                "encryption_private_key": hex::encode(encryption.private_key()),
                "encryption_public_key": hex::encode(encryption.public_key_bytes()),
            }))
        }
        "register-own-cert" => {
            let serial = opts
                .serial
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--serial is required"))?;
            let signing_key = opts
                .signing_key
                .clone()
                .or_else(|| std::env::var("AS2_SIGNING_KEY").ok());
            let encryption_key = opts
                .encryption_key
                .clone()
                .or_else(|| std::env::var("AS2_ENCRYPTION_KEY").ok());

            let signing = signing_key
                .map(|k| parse_32_byte_key(&k).map(|b| SigningKeyPair::from_bytes(&b)))
                .transpose()?;
            let encryption = encryption_key
                .map(|k| parse_32_byte_key(&k).and_then(|b| EncryptionKeyPair::from_bytes(&b)))
                .transpose()?;

            let subject = opts.subject.clone().unwrap_or_else(|| {
                format!(
                    "CN={}",
                    std::env::var("AS2_OWN_ID").unwrap_or_else(|_| "AS2GATEWAY".to_string())
                )
            });
            let now = Utc::now();
            let cert = issue_certificate(
                CertificateTemplate {
                    serial,
                    subject_dn: subject.clone(),
                    issuer_dn: subject,
                    valid_from: now,
                    valid_to: now + Duration::days(opts.valid_days.unwrap_or(365)),
                    owner: CertificateOwner::Own,
                },
                encryption.as_ref(),
                signing.as_ref(),
                now,
            )?;

            let store = opts.store().await?;
            let view = registry(&store)
                .add_certificate(
                    as2_gateway::engine::CertificateSpec {
                        serial: cert.serial,
                        subject_dn: cert.subject_dn,
                        issuer_dn: cert.issuer_dn,
                        valid_from: cert.valid_from,
                        valid_to: cert.valid_to,
                        owner: cert.owner,
                        encryption_public_key: cert.encryption_public_key,
                        signing_public_key: cert.signing_public_key,
                    },
                    &opts.actor(),
                )
                .await?;
            print_json(&view)
        }
        "list-partners" => {
            let store = opts.store().await?;
            let partners = registry(&store)
                .list_partners(
                    opts.include_archived,
                    PageRequest::new(opts.limit.unwrap_or(PageRequest::MAX_LIMIT), 0),
                )
                .await?;
            print_json(&partners)
        }
        "archive-partner" => {
            let partner_id = opts
                .partner_id
                .ok_or_else(|| anyhow::anyhow!("--partner-id is required"))?;
            let store = opts.store().await?;
            let partner = registry(&store)
                .archive_partner(PartnerId::from_uuid(partner_id), &opts.actor())
                .await?;
            println!("ok: partner {} archived at {:?}", partner.as2_id, partner.archived_at);
            Ok(())
        }
        "list-certs" => {
            let owner = opts
                .owner
                .as_deref()
                .map(str::parse::<CertificateOwner>)
                .transpose()?;
            let store = opts.store().await?;
            let certs = registry(&store)
                .list_certificates(
                    owner,
                    PageRequest::new(opts.limit.unwrap_or(PageRequest::MAX_LIMIT), 0),
                )
                .await?;
            print_json(&certs)
        }
        "expiring-certs" => {
            let store = opts.store().await?;
            let flagged = registry(&store).attention_required().await?;
            if flagged.is_empty() {
                println!("ok: no certificates need attention");
                return Ok(());
            }
            for view in &flagged {
                println!(
                    "{}\t{}\t{}\t{} days\t{}",
                    view.certificate.serial,
                    view.certificate.owner,
                    view.status,
                    view.days_until_expiry,
                    view.certificate.subject_dn
                );
            }
            Ok(())
        }
        "revoke-cert" => {
            let serial = opts
                .serial
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--serial is required"))?;
            let store = opts.store().await?;
            let view = registry(&store)
                .revoke_certificate(&serial, &opts.actor())
                .await?;
            println!("ok: certificate {} is {}", view.certificate.serial, view.status);
            Ok(())
        }
        "timeline" => {
            let message_id = opts
                .message_id
                .ok_or_else(|| anyhow::anyhow!("--message-id is required"))?;
            let store = opts.store().await?;
            let timeline = store.timeline(MessageId::from_uuid(message_id)).await?;
            if timeline.is_empty() {
                anyhow::bail!("no timeline for message {message_id}");
            }
            for entry in timeline {
                println!(
                    "{}\t{} -> {}\t{}",
                    entry.at.to_rfc3339(),
                    entry
                        .from_state
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    entry.to_state,
                    entry.reason.unwrap_or_default()
                );
            }
            Ok(())
        }
        "audit" => {
            let store = opts.store().await?;
            let audit = SqliteAuditLog::new(store.pool().clone());
            let filters = AuditQueryFilters {
                action: opts.action.as_deref().map(parse_audit_action),
                resource_id: opts.resource_id.clone(),
                ..Default::default()
            };
            let entries = audit
                .query(&filters, PageRequest::new(opts.limit.unwrap_or(50), 0))
                .await?;
            print_json(&entries)
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
