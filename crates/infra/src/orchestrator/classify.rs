//! Response classification and output hashing.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use super::types::ResponseClassification;

/// Responses shorter than this are treated as technical failures.
const MIN_RESPONSE_LEN: usize = 50;
/// Responses longer than this (and not refusals) are substantive.
const SUBSTANTIVE_LEN: usize = 200;

const REFUSAL_PATTERNS: &[&str] = &[
    "i cannot provide answers on political matters",
    "i'm sorry, but i cannot discuss",
    "that's not appropriate",
    "i'm not comfortable discussing",
    "i cannot engage in discussions regarding political matters",
    "my primary function is to assist with general information",
    "i'm unable to engage in discussions about politically sensitive topics",
    "unable to engage in discussions about politically sensitive",
    "i cannot provide information on",
    "i'm not able to",
    "i don't feel comfortable",
];

pub fn classify_response(response: &str, success: bool) -> ResponseClassification {
    if !success || response.len() < MIN_RESPONSE_LEN {
        return ResponseClassification {
            is_technical_error: true,
            ..ResponseClassification::default()
        };
    }
    let lower = response.to_lowercase();
    if REFUSAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ResponseClassification {
            is_refusal: true,
            ..ResponseClassification::default()
        };
    }
    ResponseClassification {
        is_substantive: response.len() > SUBSTANTIVE_LEN,
        ..ResponseClassification::default()
    }
}

/// The text a provider answered with: `output.response`, or the output
/// itself when it is a bare string.
pub fn response_text(output: &JsonValue) -> &str {
    output
        .get("response")
        .and_then(JsonValue::as_str)
        .or_else(|| output.as_str())
        .unwrap_or_default()
}

/// Hex SHA-256 of a JSON document's serialized bytes.
pub fn json_hash(value: &JsonValue) -> String {
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}
