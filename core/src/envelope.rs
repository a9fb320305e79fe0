//! The envelope: one immutable, hashable unit of replay work.
//!
//! An envelope is created once, at the moment a primary-side operation
//! succeeds, and is never mutated afterwards. Its [`MessageId`] is derived from
//! the stable fields (see [`crate::canonical`]), so two envelopes describing the
//! same operation with the same params and version share an identity.
//!
//! # JSON shape
//!
//! ```text
//! messageId, sqljClassName, sqljMethodName, params, scenarioId?, stepIndex?,
//! version, correlationId?, createdAt
//! ```
//!
//! Absent optional fields are omitted. Parsing also accepts `operationClass` and
//! `operationName` in place of the `sqlj*` names.

use crate::canonical::{self, message_id_for};
use crate::error::OutboxError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Version tag used when none is given.
pub const DEFAULT_VERSION: &str = "v1";

/// Operation parameters: string keys to JSON-representable values.
pub type Params = BTreeMap<String, Value>;

/// Content hash identifying an envelope; the idempotency key.
///
/// # Examples
///
/// ```
/// use replay_outbox_core::envelope::MessageId;
///
/// let id = MessageId::new("ab12");
/// assert_eq!(id.as_str(), "ab12");
/// assert_eq!(id.to_string(), "ab12");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an already computed identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One deterministic unit of replay work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    message_id: MessageId,
    #[serde(rename = "sqljClassName", alias = "operationClass")]
    operation_class: String,
    #[serde(rename = "sqljMethodName", alias = "operationName")]
    operation_name: String,
    #[serde(
        default,
        serialize_with = "canonical::serialize_params",
        deserialize_with = "nullable_params"
    )]
    params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scenario_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step_index: Option<u32>,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
}

fn nullable_params<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Params, D::Error> {
    Ok(Option::<Params>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    /// Start building an envelope for `operation_class#operation_name`.
    pub fn builder(
        operation_class: impl Into<String>,
        operation_name: impl Into<String>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder::new(operation_class, operation_name)
    }

    /// The idempotency key.
    #[must_use]
    pub const fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// First half of the dispatch key.
    #[must_use]
    pub fn operation_class(&self) -> &str {
        &self.operation_class
    }

    /// Second half of the dispatch key.
    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Operation parameters.
    #[must_use]
    pub const fn params(&self) -> &Params {
        &self.params
    }

    /// Scenario this envelope was produced in, if any.
    #[must_use]
    pub fn scenario_id(&self) -> Option<&str> {
        self.scenario_id.as_deref()
    }

    /// 1-based position of this envelope within its scenario, if any.
    #[must_use]
    pub const fn step_index(&self) -> Option<u32> {
        self.step_index
    }

    /// Shape/semantics tag of the params.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Correlation id of the primary-side call, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Recompute the identity from the stable fields.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::IdentitySerialization`] if the params cannot be written.
    pub fn recompute_message_id(&self) -> Result<MessageId, OutboxError> {
        message_id_for(
            &self.operation_class,
            &self.operation_name,
            &self.params,
            &self.version,
        )
    }

    /// Whether the carried id matches the stable fields.
    #[must_use]
    pub fn identity_matches(&self) -> bool {
        self.recompute_message_id()
            .is_ok_and(|id| id == self.message_id)
    }

    /// Full envelope JSON, as handed to the send call.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::IdentitySerialization`] if the envelope cannot be written.
    pub fn to_json(&self) -> Result<String, OutboxError> {
        serde_json::to_string(self).map_err(|e| OutboxError::IdentitySerialization(e.to_string()))
    }

    /// Parse one envelope from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::EnvelopeParse`] if the text is not an envelope.
    pub fn from_json(json: &str) -> Result<Self, OutboxError> {
        serde_json::from_str(json).map_err(|e| OutboxError::EnvelopeParse(e.to_string()))
    }

    /// Parse a JSON array of envelopes, keeping their order.
    ///
    /// An absent or blank payload is an empty batch.
    ///
    /// # Examples
    ///
    /// ```
    /// use replay_outbox_core::envelope::Envelope;
    ///
    /// assert!(Envelope::parse_batch(None).unwrap().is_empty());
    /// assert!(Envelope::parse_batch(Some("  ")).unwrap().is_empty());
    /// assert!(Envelope::parse_batch(Some("[]")).unwrap().is_empty());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::EnvelopeParse`] if the payload is not a JSON array of
    /// envelopes.
    pub fn parse_batch(payload: Option<&str>) -> Result<Vec<Self>, OutboxError> {
        Self::parse_batch_items(payload)?.into_iter().collect()
    }

    /// Parse a JSON array of envelopes one element at a time, keeping their
    /// order.
    ///
    /// Only the array itself has to parse; each element comes back as its own
    /// result so a malformed envelope does not hide the ones around it.
    ///
    /// # Examples
    ///
    /// ```
    /// use replay_outbox_core::envelope::Envelope;
    ///
    /// let items = Envelope::parse_batch_items(Some(r#"[{"operationClass": "C"}]"#)).unwrap();
    /// assert_eq!(items.len(), 1);
    /// assert!(items[0].is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::EnvelopeParse`] if the payload is not a JSON array.
    pub fn parse_batch_items(
        payload: Option<&str>,
    ) -> Result<Vec<Result<Self, OutboxError>>, OutboxError> {
        let items: Vec<serde_json::Value> = match payload.map(str::trim) {
            None | Some("") => return Ok(Vec::new()),
            Some(json) => {
                serde_json::from_str(json).map_err(|e| OutboxError::EnvelopeParse(e.to_string()))?
            }
        };

        Ok(items
            .into_iter()
            .enumerate()
            .map(|(position, item)| {
                serde_json::from_value(item)
                    .map_err(|e| OutboxError::EnvelopeParse(format!("item {position}: {e}")))
            })
            .collect())
    }
}

/// Builder for [`Envelope`]; computes the identity on [`build`](Self::build).
///
/// # Examples
///
/// ```
/// use replay_outbox_core::envelope::Envelope;
///
/// let envelope = Envelope::builder("OrderSqlj", "insertOrder")
///     .param("orderId", 1001)
///     .param("amount", "42.50")
///     .correlation_id("checkout-7")
///     .build()
///     .unwrap();
///
/// assert_eq!(envelope.version(), "v1");
/// assert_eq!(envelope.params()["orderId"], 1001);
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct EnvelopeBuilder {
    operation_class: String,
    operation_name: String,
    params: Params,
    version: String,
    scenario_id: Option<String>,
    step_index: Option<u32>,
    correlation_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    error: Option<OutboxError>,
}

impl EnvelopeBuilder {
    /// New builder with no params and the default version.
    pub fn new(operation_class: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self {
            operation_class: operation_class.into(),
            operation_name: operation_name.into(),
            params: Params::new(),
            version: DEFAULT_VERSION.to_string(),
            scenario_id: None,
            step_index: None,
            correlation_id: None,
            created_at: None,
            error: None,
        }
    }

    /// Replace all params.
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Set one param from any serializable value.
    ///
    /// A value with no JSON form makes [`build`](Self::build) fail.
    pub fn param(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.params.insert(key.into(), value);
            }
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(OutboxError::IdentitySerialization(e.to_string()));
                }
            }
        }
        self
    }

    /// Set the version tag.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Attach scenario tracing fields.
    pub fn scenario(mut self, scenario_id: impl Into<String>, step_index: u32) -> Self {
        self.scenario_id = Some(scenario_id.into());
        self.step_index = Some(step_index);
        self
    }

    /// Attach a correlation id.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the creation timestamp (defaults to now).
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Compute the identity and freeze the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::IdentitySerialization`] if a param had no JSON form
    /// or the params cannot be written canonically.
    pub fn build(self) -> Result<Envelope, OutboxError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let message_id = message_id_for(
            &self.operation_class,
            &self.operation_name,
            &self.params,
            &self.version,
        )?;
        Ok(Envelope {
            message_id,
            operation_class: self.operation_class,
            operation_name: self.operation_name,
            params: self.params,
            scenario_id: self.scenario_id,
            step_index: self.step_index,
            version: self.version,
            correlation_id: self.correlation_id,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Build a [`Params`] map from `"key": value` pairs.
///
/// Values go through `serde_json::json!`.
///
/// ```
/// use replay_outbox_core::params;
///
/// let params = params! { "productId": 77, "quantityDelta": -1 };
/// assert_eq!(params.len(), 2);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::envelope::Params::new()
    };
    ($($key:literal : $value:expr),+ $(,)?) => {{
        let mut params = $crate::envelope::Params::new();
        $(
            params.insert(::std::string::String::from($key), $crate::serde_json::json!($value));
        )+
        params
    }};
}
