//! End-to-end transmission tests.
//!
//! Two gateways run in-process and exchange real envelopes and MDNs over a
//! loopback transport, so every test covers encoding, receipt, MDN
//! generation and reconciliation together.

mod common;

use std::sync::Arc;

use chrono::Duration;

use as2_gateway::crypto::{
    issue_certificate, CertificateTemplate, EncryptionKeyPair, SigningKeyPair,
};
use as2_gateway::domain::{
    CertificateOwner, InboundMessage, InboundStatus, MdnMode, PageRequest, StateTransition,
    TransmissionState,
};
use as2_gateway::engine::{
    CancelOutcome, CertificateSpec, Clock, RetryWorker, RetryWorkerConfig,
};
use as2_gateway::infra::{
    AuditAction, AuditLogBuilder, AuditQueryFilters, AuditSink, InboundFilter, RetryConfig,
    RetryingAuditSink,
};

use common::{LinkMode, Pair};
use TransmissionState::*;

fn states(timeline: &[StateTransition]) -> Vec<TransmissionState> {
    timeline.iter().map(|t| t.to_state).collect()
}

async fn inbound_on(gateway: &common::Gateway) -> Vec<InboundMessage> {
    gateway
        .store
        .list_inbound(&InboundFilter::default(), PageRequest::default())
        .await
        .unwrap()
        .items
}

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test]
async fn sync_exchange_completes_and_routes_payload() {
    let pair = Pair::new(MdnMode::Sync).await;
    let request = pair.invoice();
    let payload = request.payload.clone();

    let msg = pair.sender.engine.submit(request, "alice").await.unwrap();
    assert_eq!(msg.state, Queued);

    let sent = pair.sender.engine.dispatch(msg.id).await.unwrap();
    assert_eq!(sent.state, Complete);
    let mdn = sent.mdn.as_ref().expect("mdn metadata recorded");
    assert!(mdn.signature_verified);
    assert!(mdn.disposition.ends_with("processed"));
    assert!(sent.received_mic.is_some());
    assert_eq!(sent.received_mic, sent.sent_mic);

    let timeline = pair.sender.engine.timeline(msg.id).await.unwrap();
    assert_eq!(
        states(&timeline),
        vec![Queued, Sending, AwaitingMdn, MdnVerified, Complete]
    );

    let inbound = inbound_on(&pair.receiver).await;
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].message_id, msg.message_id);
    assert_eq!(inbound[0].as2_from, "ACME");
    assert_eq!(inbound[0].status, InboundStatus::Routed);
    assert_eq!(inbound[0].payload.as_deref(), Some(payload.as_slice()));
    assert_eq!(
        inbound[0].routing.as_ref().map(|r| r.destination.as_str()),
        Some("edi-inbox")
    );
}

#[tokio::test]
async fn async_mdn_is_delivered_by_the_receiver() {
    let pair = Pair::new(MdnMode::Async).await;

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    let sent = pair.sender.engine.dispatch(msg.id).await.unwrap();
    assert_eq!(sent.state, AwaitingMdn);
    assert!(sent.mdn_deadline.is_some());

    let inbound = inbound_on(&pair.receiver).await;
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].mdn_mode, MdnMode::Async);
    assert_eq!(inbound[0].mdn_url.as_deref(), Some(pair.sender.mdn_url().as_str()));
    assert!(inbound[0].mdn_sent_at.is_none());

    let delivered = pair.receiver.dispatcher.deliver_pending().await.unwrap();
    assert_eq!(delivered, 1);

    let done = pair.sender.store.get_outbound(msg.id).await.unwrap().unwrap();
    assert_eq!(done.state, Complete);
    assert!(done.mdn_deadline.is_none());

    let inbound = inbound_on(&pair.receiver).await;
    assert!(inbound[0].mdn_sent_at.is_some());
    assert_eq!(pair.receiver.dispatcher.deliver_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn business_ack_closes_the_message() {
    let pair = Pair::new(MdnMode::Sync).await;
    let mut partner = pair.partner.clone();
    partner.business_ack_expected = true;
    pair.sender.store.update_partner(&partner).await.unwrap();

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    let sent = pair.sender.engine.dispatch(msg.id).await.unwrap();
    assert_eq!(sent.state, AwaitingBusinessAck);

    let acked = pair
        .sender
        .engine
        .record_business_ack(msg.id, true, Some("997 accepted".to_string()), "alice")
        .await
        .unwrap();
    assert_eq!(acked.state, Complete);
    assert_eq!(
        acked.business_ack.as_ref().and_then(|a| a.detail.as_deref()),
        Some("997 accepted")
    );
}

// ============================================================================
// Failures and retries
// ============================================================================

#[tokio::test]
async fn worker_gives_up_after_retry_budget() {
    let pair = Pair::new(MdnMode::Sync).await;
    pair.network.set_mode(LinkMode::Down);

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    let worker = RetryWorker::new(RetryWorkerConfig::default(), pair.sender.engine.clone());

    for _ in 0..4 {
        worker.tick().await;
        pair.advance(Duration::minutes(5));
    }
    // Nothing left to do once the message has failed.
    let report = worker.tick().await;
    assert_eq!(report.dispatched, 0);

    let failed = pair.sender.store.get_outbound(msg.id).await.unwrap().unwrap();
    assert_eq!(failed.state, Failed);
    assert_eq!(failed.retry_count, 3);
    assert!(failed
        .state_reason
        .as_deref()
        .unwrap_or_default()
        .contains("retries exhausted after 4 attempts"));
    assert_eq!(pair.network.sends(), 4);

    let timeline = pair.sender.engine.timeline(msg.id).await.unwrap();
    let sending = states(&timeline).iter().filter(|s| **s == Sending).count();
    assert_eq!(sending, 4);
    assert_eq!(states(&timeline).last(), Some(&Failed));
    assert!(inbound_on(&pair.receiver).await.is_empty());
}

#[tokio::test]
async fn missed_async_deadline_is_retried_and_deduplicated() {
    let pair = Pair::new(MdnMode::Async).await;

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    pair.sender.engine.dispatch(msg.id).await.unwrap();

    // The receiver never delivers its MDN in time.
    pair.advance(Duration::seconds(61));
    assert_eq!(pair.sender.engine.expire_mdn_deadlines().await.unwrap(), 1);
    let timed_out = pair.sender.store.get_outbound(msg.id).await.unwrap().unwrap();
    assert_eq!(timed_out.state, MdnTimeout);
    assert_eq!(timed_out.retry_count, 1);

    pair.advance(Duration::minutes(5));
    let resent = pair.sender.engine.dispatch(msg.id).await.unwrap();
    assert_eq!(resent.state, AwaitingMdn);
    assert_eq!(resent.message_id, msg.message_id);

    // The resend is recognised as a duplicate and not routed twice.
    let inbound = inbound_on(&pair.receiver).await;
    assert_eq!(inbound.len(), 1);

    assert_eq!(pair.receiver.dispatcher.deliver_pending().await.unwrap(), 1);
    let done = pair.sender.store.get_outbound(msg.id).await.unwrap().unwrap();
    assert_eq!(done.state, Complete);
}

#[tokio::test]
async fn replayed_request_returns_the_original_mdn() {
    let pair = Pair::new(MdnMode::Sync).await;

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    pair.sender.engine.dispatch(msg.id).await.unwrap();
    let first = inbound_on(&pair.receiver).await.remove(0);

    let request = pair.network.last_request().unwrap();
    let pairs = request.headers.to_pairs();
    let replay = pair
        .receiver
        .receiver
        .receive(pairs.iter().map(|(k, v)| (*k, v.as_str())), &request.body)
        .await
        .unwrap();

    assert!(replay.duplicate);
    assert_eq!(replay.http_status, 200);
    assert_eq!(replay.mdn_body, first.mdn_body);
    assert_eq!(inbound_on(&pair.receiver).await.len(), 1);
}

#[tokio::test]
async fn archived_sender_gets_authentication_failed() {
    let pair = Pair::new(MdnMode::Sync).await;
    let acme = pair.receiver.partner("ACME").await;
    pair.receiver
        .registry
        .archive_partner(acme.id, "bob")
        .await
        .unwrap();

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    let sent = pair.sender.engine.dispatch(msg.id).await.unwrap();
    assert_eq!(sent.state, MdnRejected);
    assert!(sent
        .mdn
        .as_ref()
        .map(|m| m.disposition.contains("authentication-failed"))
        .unwrap_or(false));

    let inbound = inbound_on(&pair.receiver).await;
    assert_eq!(inbound[0].status, InboundStatus::Rejected);
    assert!(inbound[0].payload.is_none());
}

// ============================================================================
// Certificate rotation
// ============================================================================

#[tokio::test]
async fn rotation_between_attempts_rebuilds_envelope_with_same_mic() {
    let pair = Pair::new(MdnMode::Sync).await;
    pair.network.set_mode(LinkMode::Timeout);

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    let first = pair.sender.engine.dispatch(msg.id).await.unwrap();
    assert_eq!(first.state, MdnTimeout);
    assert_eq!(first.envelope_cert_serial.as_deref(), Some("GLOBEX-1"));
    let sent_mic = first.sent_mic.clone().unwrap();

    // GLOBEX rolls its keys and tells ACME about the new certificate.
    let now = pair.receiver.clock.now();
    let encryption = EncryptionKeyPair::generate();
    let signing = SigningKeyPair::generate();
    let renewed = issue_certificate(
        CertificateTemplate {
            serial: "GLOBEX-2".to_string(),
            subject_dn: "CN=GLOBEX".to_string(),
            issuer_dn: "CN=GLOBEX".to_string(),
            valid_from: now - Duration::hours(1),
            valid_to: now + Duration::days(730),
            owner: CertificateOwner::Own,
        },
        Some(&encryption),
        Some(&signing),
        now,
    )
    .unwrap();
    pair.receiver.store.insert_certificate(&renewed).await.unwrap();
    pair.receiver.keys.insert_encryption("GLOBEX-2", encryption).await;
    pair.receiver.keys.insert_signing("GLOBEX-2", signing).await;

    let rotated = pair
        .sender
        .registry
        .rotate_partner_certificate(
            pair.partner.id,
            CertificateSpec {
                serial: renewed.serial.clone(),
                subject_dn: renewed.subject_dn.clone(),
                issuer_dn: renewed.issuer_dn.clone(),
                valid_from: renewed.valid_from,
                valid_to: renewed.valid_to,
                owner: CertificateOwner::Partner(pair.partner.id),
                encryption_public_key: renewed.encryption_public_key.clone(),
                signing_public_key: renewed.signing_public_key.clone(),
            },
            "alice",
        )
        .await
        .unwrap();
    assert_eq!(rotated.encryption_cert_serial, "GLOBEX-2");
    assert_eq!(rotated.signing_cert_serial, "GLOBEX-2");

    pair.network.set_mode(LinkMode::Up);
    pair.advance(Duration::minutes(5));
    let done = pair.sender.engine.dispatch(msg.id).await.unwrap();

    assert_eq!(done.state, Complete);
    assert_eq!(done.envelope_cert_serial.as_deref(), Some("GLOBEX-2"));
    assert_eq!(done.sent_mic.as_deref(), Some(sent_mic.as_str()));
    assert!(done.mdn.as_ref().unwrap().signature_verified);
}

// ============================================================================
// Operator actions
// ============================================================================

#[tokio::test]
async fn cancelled_message_is_never_sent() {
    let pair = Pair::new(MdnMode::Sync).await;

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    match pair.sender.engine.cancel(msg.id, "alice").await.unwrap() {
        CancelOutcome::Cancelled(cancelled) => assert_eq!(cancelled.state, Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }

    let worker = RetryWorker::new(RetryWorkerConfig::default(), pair.sender.engine.clone());
    worker.tick().await;
    assert_eq!(pair.network.sends(), 0);

    // Cancelling again changes nothing.
    match pair.sender.engine.cancel(msg.id, "alice").await.unwrap() {
        CancelOutcome::NoOp { state } => assert_eq!(state, Cancelled),
        other => panic!("expected no-op, got {other:?}"),
    }
}

#[tokio::test]
async fn audit_trail_records_actor_and_engine_steps() {
    let pair = Pair::new(MdnMode::Sync).await;

    let msg = pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    pair.sender.engine.dispatch(msg.id).await.unwrap();

    let entries = pair
        .sender
        .audit_log
        .query(
            &AuditQueryFilters {
                resource_id: Some(msg.id.to_string()),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap()
        .items;

    let submitted = entries
        .iter()
        .find(|e| e.action == AuditAction::MessageSubmitted)
        .expect("submission audited");
    assert_eq!(submitted.actor, "alice");
    assert_eq!(submitted.actor_type, "operator");

    let mdn = entries
        .iter()
        .find(|e| e.action == AuditAction::MdnReceived)
        .expect("MDN audited");
    assert_eq!(mdn.actor_type, "system");
    assert!(mdn.success);
}

#[tokio::test]
async fn concurrent_workers_send_each_message_once() {
    let pair = Pair::new(MdnMode::Sync).await;
    for _ in 0..5 {
        pair.sender.engine.submit(pair.invoice(), "alice").await.unwrap();
    }

    let engine = pair.sender.engine.clone();
    let a = RetryWorker::new(RetryWorkerConfig::default(), Arc::clone(&engine));
    let b = RetryWorker::new(RetryWorkerConfig::default(), engine);
    tokio::join!(a.tick(), b.tick());

    assert_eq!(pair.network.sends(), 5);
    assert_eq!(inbound_on(&pair.receiver).await.len(), 5);
}

#[tokio::test]
async fn worker_replays_audit_records_parked_during_outage() {
    let pair = Pair::new(MdnMode::Sync).await;
    let pool = pair.sender.store.pool().clone();
    let sink = Arc::new(RetryingAuditSink::with_config(
        pair.sender.audit_log.clone(),
        RetryConfig::fast().with_max_retries(0),
    ));

    sqlx::query("ALTER TABLE audit_log RENAME TO audit_log_offline")
        .execute(&pool)
        .await
        .unwrap();
    sink.record(
        AuditLogBuilder::new(AuditAction::PartnerArchived, "alice", "operator")
            .resource("partner", "outage-1")
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(sink.pending().await, 1);

    let worker = RetryWorker::new(RetryWorkerConfig::default(), pair.sender.engine.clone())
        .with_audit_backlog(sink.clone());
    assert_eq!(worker.tick().await.audit_replayed, 0);
    assert_eq!(sink.pending().await, 1);

    sqlx::query("ALTER TABLE audit_log_offline RENAME TO audit_log")
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(worker.tick().await.audit_replayed, 1);
    assert_eq!(sink.pending().await, 0);

    let entries = pair
        .sender
        .audit_log
        .query(
            &AuditQueryFilters {
                resource_id: Some("outage-1".to_string()),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap()
        .items;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].actor, "alice");
}
