//! HMAC-SHA256 verification for approval callbacks. Signatures are hex
//! encoded; comparison is constant time via the mac verifier.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("signature is not valid hex")]
    MalformedHex,
    #[error("signature does not match payload")]
    Mismatch,
}

/// Verify `signature_hex` against `payload` using the shared webhook secret.
pub fn verify(
    secret: &SecretString,
    payload: &[u8],
    signature_hex: Option<&str>,
) -> Result<(), SignatureError> {
    let signature_hex = signature_hex.map(str::trim).filter(|value| !value.is_empty());
    let Some(signature_hex) = signature_hex else {
        return Err(SignatureError::Missing);
    };

    let signature = decode_hex(signature_hex).ok_or(SignatureError::MalformedHex)?;

    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(payload);
    mac.verify_slice(&signature).map_err(|_| SignatureError::Mismatch)
}

/// Sign a payload; used by tests and the outbound notifier.
pub fn sign(secret: &SecretString, payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);

    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }

    (0..value.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(value.get(index..index + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{sign, verify, SignatureError};

    fn secret() -> SecretString {
        "wh-secret".to_string().into()
    }

    #[test]
    fn signed_payload_verifies() {
        let payload = br#"{"action":"approve","ap_item_id":"item-1"}"#;
        let signature = sign(&secret(), payload);

        assert!(verify(&secret(), payload, Some(&signature)).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signature = sign(&secret(), b"original");

        assert_eq!(
            verify(&secret(), b"tampered", Some(&signature)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn missing_and_malformed_signatures_are_distinct_errors() {
        assert_eq!(verify(&secret(), b"payload", None), Err(SignatureError::Missing));
        assert_eq!(verify(&secret(), b"payload", Some("  ")), Err(SignatureError::Missing));
        assert_eq!(
            verify(&secret(), b"payload", Some("not-hex")),
            Err(SignatureError::MalformedHex)
        );
    }
}
