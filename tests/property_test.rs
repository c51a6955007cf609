//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for any valid input.

use std::collections::{HashSet, VecDeque};

use chrono::{Duration, Utc};
use proptest::prelude::*;

use as2_gateway::as2::{Disposition, DispositionModifier, DispositionType, ModifierKind};
use as2_gateway::crypto::{
    compute_mic, decode, encode, issue_certificate, AlgorithmPolicy, CertificateTemplate,
    EncodeOptions, EncryptionKeyPair, RecipientIdentity, SenderIdentity, SigningKeyPair,
};
use as2_gateway::domain::{
    Certificate, CertificateOwner, EncryptionAlgorithm, MessageId, MicAlgorithm, OutboundMessage,
    PartnerId, Priority, RetryPolicy, TransmissionState,
};
use as2_gateway::engine::{retry_decision, RetryDecision};

// ============================================================================
// Custom Strategies
// ============================================================================

fn arb_state() -> impl Strategy<Value = TransmissionState> {
    proptest::sample::select(TransmissionState::ALL.to_vec())
}

fn arb_options() -> impl Strategy<Value = EncodeOptions> {
    (
        proptest::sample::select(EncryptionAlgorithm::ALL.to_vec()),
        proptest::sample::select(MicAlgorithm::ALL.to_vec()),
        any::<bool>(),
    )
        .prop_map(|(cipher, mic_algorithm, compress)| EncodeOptions {
            cipher,
            mic_algorithm,
            compress,
        })
}

fn arb_disposition() -> impl Strategy<Value = Disposition> {
    let modifier = prop_oneof![
        Just(None),
        (
            prop_oneof![
                Just(ModifierKind::Error),
                Just(ModifierKind::Warning),
                Just(ModifierKind::Failure),
            ],
            "[a-z][a-z0-9-]{0,30}",
        )
            .prop_map(|(kind, description)| Some(DispositionModifier { kind, description })),
    ];
    (
        prop_oneof![Just(DispositionType::Processed), Just(DispositionType::Failed)],
        modifier,
    )
        .prop_map(|(kind, modifier)| Disposition { kind, modifier })
}

fn queued_message(retry_count: u32) -> OutboundMessage {
    let now = Utc::now();
    OutboundMessage {
        id: MessageId::new(),
        message_id: "<prop@gw>".to_string(),
        partner_id: PartnerId::new(),
        payload: b"x".to_vec(),
        content_type: "text/plain".to_string(),
        subject: "prop".to_string(),
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
        cancel_requested: false,
        review_required: false,
        business_ack_overdue_warned: false,
        updated_at: now,
    }
}

fn certificate(
    serial: &str,
    encryption: &EncryptionKeyPair,
    signing: &SigningKeyPair,
) -> Certificate {
    let now = Utc::now();
    issue_certificate(
        CertificateTemplate {
            serial: serial.to_string(),
            subject_dn: format!("CN={serial}"),
            issuer_dn: format!("CN={serial}"),
            valid_from: now - Duration::days(1),
            valid_to: now + Duration::days(30),
            owner: CertificateOwner::Own,
        },
        Some(encryption),
        Some(signing),
        now,
    )
    .unwrap()
}

// ============================================================================
// Transmission state graph
// ============================================================================

#[test]
fn every_state_is_reachable_from_queued() {
    let mut seen = HashSet::from([TransmissionState::Queued]);
    let mut frontier = VecDeque::from([TransmissionState::Queued]);
    while let Some(state) = frontier.pop_front() {
        for next in state.successors() {
            if seen.insert(*next) {
                frontier.push_back(*next);
            }
        }
    }
    for state in TransmissionState::ALL {
        assert!(seen.contains(&state), "{state} is unreachable");
    }
}

#[test]
fn every_non_terminal_state_can_reach_a_terminal_state() {
    for start in TransmissionState::ALL {
        let mut seen = HashSet::from([start]);
        let mut frontier = VecDeque::from([start]);
        let mut reached = start.is_terminal();
        while let Some(state) = frontier.pop_front() {
            if state.is_terminal() {
                reached = true;
                break;
            }
            for next in state.successors() {
                if seen.insert(*next) {
                    frontier.push_back(*next);
                }
            }
        }
        assert!(reached, "{start} never terminates");
    }
}

proptest! {
    #[test]
    fn terminal_states_have_no_successors(state in arb_state()) {
        prop_assert_eq!(state.is_terminal(), state.successors().is_empty());
    }

    #[test]
    fn queued_is_never_a_successor(state in arb_state()) {
        prop_assert!(!state.successors().contains(&TransmissionState::Queued));
    }

    #[test]
    fn random_walks_follow_the_graph(choices in prop::collection::vec(any::<prop::sample::Index>(), 0..20)) {
        let mut state = TransmissionState::Queued;
        let mut timeline = vec![state];
        for choice in choices {
            let successors = state.successors();
            if successors.is_empty() {
                break;
            }
            state = successors[choice.index(successors.len())];
            timeline.push(state);
        }

        for pair in timeline.windows(2) {
            prop_assert!(pair[0].successors().contains(&pair[1]));
            prop_assert!(!pair[0].is_terminal());
        }
    }

    #[test]
    fn state_names_parse_back(state in arb_state()) {
        let parsed: TransmissionState = state.to_string().parse().unwrap();
        prop_assert_eq!(parsed, state);
    }
}

// ============================================================================
// Retry scheduling
// ============================================================================

proptest! {
    #[test]
    fn attempts_never_exceed_retry_budget(max_retries in 0u32..10, minutes in 1u32..120) {
        let policy = RetryPolicy { max_retries, retry_interval_minutes: minutes };
        let mut msg = queued_message(0);
        let mut attempts = 1;
        let failed_at = Utc::now();

        loop {
            match retry_decision(&msg, &policy, failed_at, "connection refused") {
                RetryDecision::Retry { retry_count, next_attempt_at } => {
                    prop_assert_eq!(retry_count, msg.retry_count + 1);
                    prop_assert_eq!(next_attempt_at, failed_at + Duration::minutes(minutes as i64));
                    msg.retry_count = retry_count;
                    attempts += 1;
                }
                RetryDecision::Exhausted { reason } => {
                    let expected = format!("after {attempts} attempts");
                    prop_assert!(reason.contains(&expected));
                    break;
                }
                RetryDecision::Cancel => {
                    return Err(TestCaseError::fail("cancel was never requested"));
                }
            }
        }

        prop_assert_eq!(attempts, max_retries + 1);
    }

    #[test]
    fn cancel_request_wins_over_retry(retry_count in 0u32..10) {
        let mut msg = queued_message(retry_count);
        msg.cancel_requested = true;
        let decision = retry_decision(&msg, &RetryPolicy::default(), Utc::now(), "timeout");
        prop_assert!(matches!(decision, RetryDecision::Cancel));
    }
}

// ============================================================================
// Envelope codec
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn envelope_opens_to_the_original_payload(
        payload in prop::collection::vec(any::<u8>(), 1..4096),
        options in arb_options(),
    ) {
        let sender_signing = SigningKeyPair::generate();
        let sender_encryption = EncryptionKeyPair::generate();
        let recipient_signing = SigningKeyPair::generate();
        let recipient_encryption = EncryptionKeyPair::generate();
        let sender_cert = certificate("SENDER-1", &sender_encryption, &sender_signing);
        let recipient_cert = certificate("RECIPIENT-1", &recipient_encryption, &recipient_signing);
        let policy = AlgorithmPolicy::default();

        let encoded = encode(
            &payload,
            "application/octet-stream",
            options,
            &SenderIdentity {
                signing_key: sender_signing,
                certificate_fingerprint: sender_cert.fingerprint.clone(),
            },
            &recipient_cert,
            &policy,
        )
        .unwrap();

        let decoded = decode(
            &encoded.bytes,
            &RecipientIdentity {
                encryption_key: recipient_encryption,
                certificate_fingerprint: recipient_cert.fingerprint.clone(),
            },
            &sender_cert,
            &policy,
        )
        .unwrap();

        prop_assert_eq!(&decoded.payload, &payload);
        prop_assert_eq!(decoded.compressed, options.compress);
        prop_assert_eq!(&decoded.mic, &encoded.mic);
        prop_assert_eq!(
            compute_mic(options.mic_algorithm, &decoded.signed_body),
            encoded.mic
        );
    }

    #[test]
    fn mic_is_deterministic(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        for alg in MicAlgorithm::ALL {
            prop_assert_eq!(compute_mic(alg, &data), compute_mic(alg, &data));
        }
    }
}

// ============================================================================
// MDN dispositions
// ============================================================================

proptest! {
    #[test]
    fn disposition_text_parses_back(disposition in arb_disposition()) {
        let rendered = disposition.to_string();
        let parsed: Disposition = rendered.parse().unwrap();
        prop_assert_eq!(parsed, disposition);
    }

    #[test]
    fn only_plain_or_warning_processed_is_positive(disposition in arb_disposition()) {
        let expected = disposition.kind == DispositionType::Processed
            && disposition
                .modifier
                .as_ref()
                .map_or(true, |m| m.kind == ModifierKind::Warning);
        prop_assert_eq!(disposition.is_positive(), expected);
    }
}
