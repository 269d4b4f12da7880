//! HMAC-SHA256 payload signing.
//!
//! The signed message is `"<unix_ts>.<canonical_json>"` where the
//! canonical form serializes object keys in sorted order. Receivers
//! recompute the HMAC with their endpoint secret and compare against the
//! `X-Dalston-Signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header value prefix.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Canonical JSON: object keys sorted at every level.
///
/// serde_json's default map is ordered (BTreeMap), so round-tripping
/// through `Value` yields sorted keys; this function exists to pin that
/// contract in one place.
pub fn canonical_json(payload: &serde_json::Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(payload)
}

/// Compute the signature header value for a payload at a timestamp.
pub fn sign(secret: &str, unix_ts: i64, canonical_payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(format!("{}.{}", unix_ts, canonical_payload).as_bytes());
    let digest = mac.finalize().into_bytes();
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest))
}

/// Constant-time verification of a received signature header.
pub fn verify(secret: &str, unix_ts: i64, canonical_payload: &str, signature: &str) -> bool {
    let expected = sign(secret, unix_ts, canonical_payload);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
