//! Message Integrity Check computation and rendering
//!
//! The MIC is a base64 (standard alphabet) digest over the signed body. In an
//! MDN it is rendered as `"<base64>, <alg>"`, e.g. `"3q2+7w==, sha-256"`.

use base64::Engine;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::CryptoError;
use crate::domain::MicAlgorithm;

/// Compute the base64 MIC of `data` with `alg`
pub fn compute_mic(alg: MicAlgorithm, data: &[u8]) -> String {
    let digest = match alg {
        MicAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        MicAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        MicAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        MicAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    };
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Render a MIC for `Received-Content-MIC`
pub fn format_mic(mic: &str, alg: MicAlgorithm) -> String {
    format!("{}, {}", mic, alg.as2_name())
}

/// Parse a `Received-Content-MIC` value into its digest and algorithm
pub fn parse_mic(value: &str) -> Result<(String, MicAlgorithm), CryptoError> {
    let (digest, alg) = value
        .split_once(',')
        .ok_or_else(|| CryptoError::Malformed(format!("MIC without algorithm: {value}")))?;

    let digest = digest.trim();
    if digest.is_empty() {
        return Err(CryptoError::Malformed("empty MIC digest".to_string()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(digest)
        .map_err(|e| CryptoError::Malformed(format!("MIC is not base64: {e}")))?;

    let alg = alg
        .trim()
        .parse::<MicAlgorithm>()
        .map_err(|e| CryptoError::UnsupportedAlgorithm(e.to_string()))?;

    Ok((digest.to_string(), alg))
}

/// The digest of a rendered MIC, if it was computed with `alg`
pub fn digest_for(rendered: &str, alg: MicAlgorithm) -> Option<String> {
    match parse_mic(rendered) {
        Ok((digest, parsed_alg)) if parsed_alg == alg => Some(digest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sha256_mic() {
        // sha256("abc")
        assert_eq!(
            compute_mic(MicAlgorithm::Sha256, b"abc"),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }

    #[test]
    fn digest_lengths_differ_by_algorithm() {
        let lens: Vec<usize> = MicAlgorithm::ALL
            .iter()
            .map(|alg| compute_mic(*alg, b"payload").len())
            .collect();
        assert_eq!(lens, vec![28, 44, 64, 88]);
    }

    #[test]
    fn format_and_parse() {
        let mic = compute_mic(MicAlgorithm::Sha512, b"payload");
        let rendered = format_mic(&mic, MicAlgorithm::Sha512);
        assert!(rendered.ends_with(", sha-512"));

        let (digest, alg) = parse_mic(&rendered).unwrap();
        assert_eq!(digest, mic);
        assert_eq!(alg, MicAlgorithm::Sha512);
    }

    #[test]
    fn parse_accepts_unhyphenated_names() {
        let mic = compute_mic(MicAlgorithm::Sha256, b"x");
        let (_, alg) = parse_mic(&format!("{mic}, sha256")).unwrap();
        assert_eq!(alg, MicAlgorithm::Sha256);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_mic("no-comma").is_err());
        assert!(parse_mic(", sha-256").is_err());
        assert!(matches!(
            parse_mic("AAAA, md5"),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn digest_requires_same_algorithm() {
        let mic = compute_mic(MicAlgorithm::Sha256, b"x");
        let rendered = format_mic(&mic, MicAlgorithm::Sha256);
        assert_eq!(digest_for(&rendered, MicAlgorithm::Sha256), Some(mic));
        assert_eq!(digest_for(&rendered, MicAlgorithm::Sha384), None);
        assert_eq!(digest_for("garbage", MicAlgorithm::Sha256), None);
    }
}
