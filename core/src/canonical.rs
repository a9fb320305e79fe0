//! Canonical serialization and identity hashing.
//!
//! The identity of an envelope is the SHA-256 digest, rendered as 64 lowercase hex
//! characters, of this byte string:
//!
//! ```text
//! {"params":{...},"sqljClassName":"...","sqljMethodName":"...","version":"..."}
//! ```
//!
//! The canonical form is part of the wire contract:
//!
//! - object keys at every depth are sorted by their UTF-8 bytes
//! - no insignificant whitespace, UTF-8 output, standard JSON string escaping
//! - integers in plain decimal, floats in their shortest round-trip form
//!   (so `1` and `1.0` are different identities)
//!
//! `createdAt`, `scenarioId`, `stepIndex` and `correlationId` never take part in
//! the identity.

use crate::envelope::{MessageId, Params};
use crate::error::OutboxError;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Serializes a JSON value with object keys sorted at every depth.
pub(crate) struct Canonical<'a>(pub(crate) &'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(object) => {
                let mut entries: Vec<(&String, &Value)> = object.iter().collect();
                entries.sort_unstable_by(|left, right| left.0.cmp(right.0));
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, &Canonical(value))?;
                }
                map.end()
            }
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&Canonical(item))?;
                }
                seq.end()
            }
            scalar => scalar.serialize(serializer),
        }
    }
}

/// Canonical view over a parameter map.
pub(crate) struct CanonicalParams<'a>(pub(crate) &'a Params);

impl Serialize for CanonicalParams<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_params(self.0, serializer)
    }
}

/// `serialize_with` helper writing params in canonical form.
pub(crate) fn serialize_params<S: Serializer>(
    params: &Params,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(params.len()))?;
    for (key, value) in params {
        map.serialize_entry(key, &Canonical(value))?;
    }
    map.end()
}

// Field order is the sorted key order of the identity object.
#[derive(Serialize)]
struct IdentityPayload<'a> {
    params: CanonicalParams<'a>,
    #[serde(rename = "sqljClassName")]
    operation_class: &'a str,
    #[serde(rename = "sqljMethodName")]
    operation_name: &'a str,
    version: &'a str,
}

/// Canonical bytes of the stable envelope fields.
///
/// # Errors
///
/// Returns [`OutboxError::IdentitySerialization`] if the params cannot be written.
pub fn identity_bytes(
    operation_class: &str,
    operation_name: &str,
    params: &Params,
    version: &str,
) -> Result<Vec<u8>, OutboxError> {
    let payload = IdentityPayload {
        params: CanonicalParams(params),
        operation_class,
        operation_name,
        version,
    };
    serde_json::to_vec(&payload).map_err(|e| OutboxError::IdentitySerialization(e.to_string()))
}

/// Compute the idempotency key for the stable envelope fields.
///
/// Pure and deterministic: identical inputs always give the same id, and a
/// different `version` always gives a different one.
///
/// # Examples
///
/// ```
/// use replay_outbox_core::canonical::message_id_for;
/// use replay_outbox_core::params;
///
/// let params = params! { "orderId": 1001, "amount": "42.50" };
/// let a = message_id_for("OrderSqlj", "insertOrder", &params, "v1").unwrap();
/// let b = message_id_for("OrderSqlj", "insertOrder", &params, "v1").unwrap();
/// let c = message_id_for("OrderSqlj", "insertOrder", &params, "v2").unwrap();
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// assert_eq!(a.as_str().len(), 64);
/// ```
///
/// # Errors
///
/// Returns [`OutboxError::IdentitySerialization`] if the params cannot be written
/// canonically. No partial hash is computed in that case.
pub fn message_id_for(
    operation_class: &str,
    operation_name: &str,
    params: &Params,
    version: &str,
) -> Result<MessageId, OutboxError> {
    let bytes = identity_bytes(operation_class, operation_name, params, version)?;
    Ok(MessageId::new(sha256_hex(&bytes)))
}

/// SHA-256 of `bytes` as 64 lowercase hex characters.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing into a String cannot fail.
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
