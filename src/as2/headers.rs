//! AS2 HTTP header names, parsing and rendering

use crate::crypto::AlgorithmPolicy;
use crate::domain::{MdnMode, MicAlgorithm, AS2_VERSION};

pub const AS2_VERSION_HEADER: &str = "AS2-Version";
pub const AS2_FROM: &str = "AS2-From";
pub const AS2_TO: &str = "AS2-To";
pub const MESSAGE_ID: &str = "Message-ID";
pub const SUBJECT: &str = "Subject";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const MIME_VERSION: &str = "MIME-Version";
pub const DISPOSITION_NOTIFICATION_TO: &str = "Disposition-Notification-To";
pub const DISPOSITION_NOTIFICATION_OPTIONS: &str = "Disposition-Notification-Options";
pub const RECEIPT_DELIVERY_OPTION: &str = "Receipt-Delivery-Option";

/// Content type of an encrypted AS2 body
pub const CONTENT_TYPE_ENVELOPE: &str =
    "application/pkcs7-mime; smime-type=enveloped-data; name=smime.p7m";

/// Content type of an MDN body
pub const CONTENT_TYPE_MDN: &str = "message/disposition-notification";

/// Signature protocol advertised when a signed receipt is requested
pub const SIGNED_RECEIPT_PROTOCOL: &str = "pkcs7-signature";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("missing required header {0}")]
    Missing(&'static str),

    #[error("invalid header {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Parsed `Disposition-Notification-Options`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DispositionOptions {
    /// A `signed-receipt-protocol` parameter was present
    pub signed_receipt: bool,
    /// Requested MIC algorithms we recognise, in the sender's order
    pub mic_algorithms: Vec<MicAlgorithm>,
}

impl DispositionOptions {
    /// Render the header value for an outbound request
    pub fn render(signed_receipt: bool, mic_algorithm: MicAlgorithm) -> String {
        if signed_receipt {
            format!(
                "signed-receipt-protocol=optional, {}; signed-receipt-micalg=optional, {}",
                SIGNED_RECEIPT_PROTOCOL,
                mic_algorithm.as2_name()
            )
        } else {
            format!("signed-receipt-micalg=optional, {}", mic_algorithm.as2_name())
        }
    }

    /// Parse the header value; unknown parameters and algorithms are skipped
    pub fn parse(value: &str) -> Self {
        let mut options = DispositionOptions::default();

        for param in value.split(';') {
            let Some((name, rest)) = param.split_once('=') else {
                continue;
            };
            let mut values = rest.split(',').map(str::trim);
            // First element is the importance (`required` / `optional`).
            let _importance = values.next();

            match name.trim().to_ascii_lowercase().as_str() {
                "signed-receipt-protocol" => options.signed_receipt = true,
                "signed-receipt-micalg" => {
                    options.mic_algorithms = values.filter_map(|v| v.parse().ok()).collect();
                }
                _ => {}
            }
        }

        options
    }

    /// First requested MIC algorithm permitted by `policy`
    pub fn preferred_mic(&self, policy: &AlgorithmPolicy) -> Option<MicAlgorithm> {
        self.mic_algorithms
            .iter()
            .copied()
            .find(|alg| policy.allows_mic(*alg))
    }
}

/// The AS2 headers of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct As2Headers {
    pub as2_version: String,
    pub as2_from: String,
    pub as2_to: String,
    pub message_id: String,
    pub subject: Option<String>,
    pub content_type: Option<String>,
    pub disposition_notification_to: Option<String>,
    pub disposition_options: Option<DispositionOptions>,
    pub receipt_delivery_option: Option<String>,
}

impl As2Headers {
    /// Parse from case-insensitive header pairs
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, HeaderError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let pairs: Vec<(String, &str)> = pairs
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
            .collect();
        let get = |name: &str| {
            let lower = name.to_ascii_lowercase();
            pairs
                .iter()
                .find(|(k, _)| *k == lower)
                .map(|(_, v)| *v)
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| get(name).ok_or(HeaderError::Missing(name));

        let message_id = required(MESSAGE_ID)?.to_string();
        if message_id.len() > 998 {
            return Err(HeaderError::Invalid {
                name: MESSAGE_ID,
                reason: "longer than 998 characters".to_string(),
            });
        }

        Ok(Self {
            as2_version: get(AS2_VERSION_HEADER).unwrap_or(AS2_VERSION).to_string(),
            as2_from: unquote(required(AS2_FROM)?),
            as2_to: unquote(required(AS2_TO)?),
            message_id,
            subject: get(SUBJECT).map(str::to_string),
            content_type: get(CONTENT_TYPE).map(str::to_string),
            disposition_notification_to: get(DISPOSITION_NOTIFICATION_TO).map(str::to_string),
            disposition_options: get(DISPOSITION_NOTIFICATION_OPTIONS)
                .map(DispositionOptions::parse),
            receipt_delivery_option: get(RECEIPT_DELIVERY_OPTION).map(str::to_string),
        })
    }

    /// How the sender wants its MDN; `None` when no MDN was requested
    pub fn mdn_mode(&self) -> Option<MdnMode> {
        self.disposition_notification_to.as_ref()?;
        Some(if self.receipt_delivery_option.is_some() {
            MdnMode::Async
        } else {
            MdnMode::Sync
        })
    }

    /// Whether the sender asked for a signed receipt
    pub fn wants_signed_mdn(&self) -> bool {
        self.disposition_options
            .as_ref()
            .map(|o| o.signed_receipt)
            .unwrap_or(false)
    }

    /// Header pairs to put on the wire
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (AS2_VERSION_HEADER, self.as2_version.clone()),
            (MIME_VERSION, "1.0".to_string()),
            (AS2_FROM, quote_if_needed(&self.as2_from)),
            (AS2_TO, quote_if_needed(&self.as2_to)),
            (MESSAGE_ID, self.message_id.clone()),
        ];
        if let Some(subject) = &self.subject {
            pairs.push((SUBJECT, subject.clone()));
        }
        if let Some(content_type) = &self.content_type {
            pairs.push((CONTENT_TYPE, content_type.clone()));
        }
        if let Some(to) = &self.disposition_notification_to {
            pairs.push((DISPOSITION_NOTIFICATION_TO, to.clone()));
        }
        if let Some(options) = &self.disposition_options {
            if let Some(alg) = options.mic_algorithms.first() {
                pairs.push((
                    DISPOSITION_NOTIFICATION_OPTIONS,
                    DispositionOptions::render(options.signed_receipt, *alg),
                ));
            }
        }
        if let Some(url) = &self.receipt_delivery_option {
            pairs.push((RECEIPT_DELIVERY_OPTION, url.clone()));
        }
        pairs
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

fn quote_if_needed(value: &str) -> String {
    if value.chars().any(|c| c == ' ' || c == '"' || c == ',') {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("as2-from", "\"PARTNER\""),
            ("AS2-To", "GATEWAY"),
            ("message-id", "<abc@partner>"),
            ("Disposition-Notification-To", "mailto:as2@partner"),
            (
                "Disposition-Notification-Options",
                "signed-receipt-protocol=optional, pkcs7-signature; signed-receipt-micalg=optional, md5, sha-256, sha1",
            ),
        ]
    }

    #[test]
    fn parses_case_insensitive_and_unquotes() {
        let headers = As2Headers::from_pairs(base()).unwrap();
        assert_eq!(headers.as2_from, "PARTNER");
        assert_eq!(headers.as2_to, "GATEWAY");
        assert_eq!(headers.as2_version, AS2_VERSION);
        assert_eq!(headers.mdn_mode(), Some(MdnMode::Sync));
        assert!(headers.wants_signed_mdn());
    }

    #[test]
    fn missing_required_header() {
        let pairs: Vec<_> = base().into_iter().filter(|(k, _)| *k != "AS2-To").collect();
        assert_eq!(
            As2Headers::from_pairs(pairs).unwrap_err(),
            HeaderError::Missing(AS2_TO)
        );
    }

    #[test]
    fn async_mode_from_receipt_delivery_option() {
        let mut pairs = base();
        pairs.push(("Receipt-Delivery-Option", "https://partner/mdn"));
        let headers = As2Headers::from_pairs(pairs).unwrap();
        assert_eq!(headers.mdn_mode(), Some(MdnMode::Async));
    }

    #[test]
    fn no_mdn_requested() {
        let pairs: Vec<_> = base()
            .into_iter()
            .filter(|(k, _)| *k != "Disposition-Notification-To")
            .collect();
        assert_eq!(As2Headers::from_pairs(pairs).unwrap().mdn_mode(), None);
    }

    #[test]
    fn preferred_mic_skips_unknown_and_disallowed() {
        let options = DispositionOptions::parse(
            "signed-receipt-protocol=optional, pkcs7-signature; signed-receipt-micalg=optional, md5, sha1, sha-256",
        );
        assert!(options.signed_receipt);
        assert_eq!(
            options.mic_algorithms,
            vec![MicAlgorithm::Sha1, MicAlgorithm::Sha256]
        );

        let strict = AlgorithmPolicy::new(
            crate::domain::EncryptionAlgorithm::ALL.to_vec(),
            vec![MicAlgorithm::Sha256],
        );
        assert_eq!(options.preferred_mic(&strict), Some(MicAlgorithm::Sha256));
    }

    #[test]
    fn render_round_trips_through_parse() {
        let rendered = DispositionOptions::render(true, MicAlgorithm::Sha384);
        let parsed = DispositionOptions::parse(&rendered);
        assert!(parsed.signed_receipt);
        assert_eq!(parsed.mic_algorithms, vec![MicAlgorithm::Sha384]);

        let unsigned = DispositionOptions::parse(&DispositionOptions::render(false, MicAlgorithm::Sha1));
        assert!(!unsigned.signed_receipt);
    }

    #[test]
    fn to_pairs_quotes_ids_with_spaces() {
        let headers = As2Headers {
            as2_version: AS2_VERSION.to_string(),
            as2_from: "MY GATEWAY".to_string(),
            as2_to: "PARTNER".to_string(),
            message_id: "<1@gw>".to_string(),
            subject: None,
            content_type: Some(CONTENT_TYPE_ENVELOPE.to_string()),
            disposition_notification_to: None,
            disposition_options: None,
            receipt_delivery_option: None,
        };
        let pairs = headers.to_pairs();
        assert!(pairs.contains(&(AS2_FROM, "\"MY GATEWAY\"".to_string())));
        assert!(pairs.contains(&(AS2_VERSION_HEADER, "1.2".to_string())));
    }
}
