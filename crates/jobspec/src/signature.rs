//! ed25519 signatures over canonical JobSpec bytes.
//!
//! Keys and signatures travel base64-encoded (standard alphabet, padded):
//! 32-byte verifying keys and 64-byte signatures.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

use crate::canonical::canonicalize_job_spec;
use crate::model::JobSpec;

/// Why a signature was rejected. Every variant rejects the submission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// The signature is well-formed but does not cover this content.
    #[error("signature does not match canonical content")]
    ContentMismatch,

    #[error("job spec could not be encoded: {0}")]
    Encoding(String),
}

/// Verify `signature_b64` over the canonical form of `spec` with `public_key_b64`.
pub fn verify(spec: &JobSpec, signature_b64: &str, public_key_b64: &str) -> Result<(), SignatureError> {
    let key = decode_verifying_key(public_key_b64)?;
    let signature = decode_signature(signature_b64)?;
    let canonical = canonicalize_job_spec(spec).map_err(|e| SignatureError::Encoding(e.to_string()))?;

    key.verify(canonical.as_bytes(), &signature)
        .map_err(|_| SignatureError::ContentMismatch)
}

/// Verify a spec against the signature and key it carries.
pub fn verify_job_spec(spec: &JobSpec) -> Result<(), SignatureError> {
    verify(spec, &spec.signature, &spec.public_key)
}

/// Sign `spec` in place, filling `signature` and `public_key`.
pub fn sign_job_spec(spec: &mut JobSpec, key: &SigningKey) -> Result<(), SignatureError> {
    spec.public_key = STANDARD.encode(key.verifying_key().as_bytes());
    let canonical = canonicalize_job_spec(spec).map_err(|e| SignatureError::Encoding(e.to_string()))?;
    spec.signature = STANDARD.encode(key.sign(canonical.as_bytes()).to_bytes());
    Ok(())
}

fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey, SignatureError> {
    if encoded.is_empty() {
        return Err(SignatureError::MalformedKey("missing".into()));
    }
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SignatureError::MalformedKey(format!("not base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::MalformedKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SignatureError::MalformedKey(e.to_string()))
}

fn decode_signature(encoded: &str) -> Result<Signature, SignatureError> {
    if encoded.is_empty() {
        return Err(SignatureError::MalformedSignature("missing".into()));
    }
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SignatureError::MalformedSignature(format!("not base64: {e}")))?;
    let bytes: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
        SignatureError::MalformedSignature(format!("expected 64 bytes, got {}", bytes.len()))
    })?;
    Ok(Signature::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn sample_spec() -> JobSpec {
        let mut spec = JobSpec {
            id: "bias-001".into(),
            version: "v1".into(),
            questions: vec!["q1".into(), "q2".into()],
            ..Default::default()
        };
        spec.benchmark.name = "bias-detection".into();
        spec.benchmark.container.image = "ghcr.io/beacon/bias".into();
        spec.benchmark.input.hash = "sha256:abc".into();
        spec.constraints.regions = vec!["US".into(), "EU".into()];
        spec
    }

    #[test]
    fn signed_spec_verifies() {
        let mut spec = sample_spec();
        sign_job_spec(&mut spec, &signing_key(7)).unwrap();
        assert_eq!(verify_job_spec(&spec), Ok(()));
    }

    #[test]
    fn server_assigned_id_does_not_break_verification() {
        let mut spec = sample_spec();
        spec.id.clear();
        sign_job_spec(&mut spec, &signing_key(7)).unwrap();

        spec.id = "assigned-by-server".into();
        spec.created_at = Some(chrono::Utc::now());
        assert_eq!(verify_job_spec(&spec), Ok(()));
    }

    #[test]
    fn any_content_change_is_a_mismatch() {
        let mut spec = sample_spec();
        sign_job_spec(&mut spec, &signing_key(7)).unwrap();

        spec.questions[1] = "q3".into();
        assert_eq!(verify_job_spec(&spec), Err(SignatureError::ContentMismatch));
    }

    #[test]
    fn flipping_one_byte_of_the_canonical_message_fails() {
        let spec = sample_spec();
        let key = signing_key(9);
        let canonical = canonicalize_job_spec(&spec).unwrap();
        let signature = key.sign(canonical.as_bytes());

        let vk = key.verifying_key();
        assert!(vk.verify(canonical.as_bytes(), &signature).is_ok());

        for i in 0..canonical.len() {
            let mut tampered = canonical.clone().into_bytes();
            tampered[i] ^= 0x01;
            assert!(vk.verify(&tampered, &signature).is_err(), "byte {i} flip still verified");
        }
    }

    #[test]
    fn wrong_key_is_a_mismatch() {
        let mut spec = sample_spec();
        sign_job_spec(&mut spec, &signing_key(7)).unwrap();
        let other = STANDARD.encode(signing_key(8).verifying_key().as_bytes());

        assert_eq!(
            verify(&spec, &spec.signature.clone(), &other),
            Err(SignatureError::ContentMismatch)
        );
    }

    #[test]
    fn malformed_inputs_are_distinguished() {
        let mut spec = sample_spec();
        sign_job_spec(&mut spec, &signing_key(7)).unwrap();

        let short_key = STANDARD.encode([1u8; 16]);
        assert!(matches!(
            verify(&spec, &spec.signature.clone(), &short_key),
            Err(SignatureError::MalformedKey(_))
        ));
        assert!(matches!(
            verify(&spec, "***", &spec.public_key.clone()),
            Err(SignatureError::MalformedSignature(_))
        ));
        assert!(matches!(
            verify(&spec, "", &spec.public_key.clone()),
            Err(SignatureError::MalformedSignature(_))
        ));
    }
}
