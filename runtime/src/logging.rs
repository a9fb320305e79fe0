//! Parameter masking for log output.
//!
//! Params may carry personal or payment data. They are only ever logged through
//! [`ParamMasker`], which replaces the values of configured keys with `***` at any
//! nesting depth.

use crate::config::LoggingConfig;
use replay_outbox_core::Params;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

const MASK: &str = "***";

/// Replaces values of sensitive param keys before they reach a log line.
///
/// # Examples
///
/// ```
/// use replay_outbox_core::params;
/// use replay_outbox_runtime::logging::ParamMasker;
///
/// let masker = ParamMasker::new(["iban"]);
/// let params = params! { "accountId": 222, "iban": "DE89370400440532013000" };
///
/// assert_eq!(
///     masker.display(&params).to_string(),
///     r#"{"accountId":222,"iban":"***"}"#
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParamMasker {
    keys: Arc<HashSet<String>>,
}

impl ParamMasker {
    /// Mask the given keys.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: Arc::new(keys.into_iter().map(Into::into).collect()),
        }
    }

    /// Mask the keys listed in `logging.masked_params`.
    #[must_use]
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self::new(config.masked_params.iter().cloned())
    }

    /// Whether nothing is masked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// A masked copy of `params` as a JSON object.
    #[must_use]
    pub fn mask(&self, params: &Params) -> Value {
        Value::Object(
            params
                .iter()
                .map(|(key, value)| (key.clone(), self.mask_entry(key, value)))
                .collect::<Map<String, Value>>(),
        )
    }

    /// Lazily formatted masked params, for use as a tracing field.
    #[must_use]
    pub const fn display<'a>(&'a self, params: &'a Params) -> MaskedParams<'a> {
        MaskedParams {
            masker: self,
            params,
        }
    }

    fn mask_entry(&self, key: &str, value: &Value) -> Value {
        if self.keys.contains(key) {
            Value::String(MASK.to_string())
        } else {
            self.mask_value(value)
        }
    }

    fn mask_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(object) => Value::Object(
                object
                    .iter()
                    .map(|(key, nested)| (key.clone(), self.mask_entry(key, nested)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.mask_value(item)).collect())
            }
            scalar => scalar.clone(),
        }
    }
}

/// `Display` adapter produced by [`ParamMasker::display`].
pub struct MaskedParams<'a> {
    masker: &'a ParamMasker,
    params: &'a Params,
}

impl fmt::Display for MaskedParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.masker.mask(self.params)) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unprintable params>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replay_outbox_core::params;
    use serde_json::json;

    #[test]
    fn masks_nested_keys_and_arrays() {
        let masker = ParamMasker::new(["cardNumber", "cvv"]);
        let params = params! {
            "payment": json!({ "cardNumber": "4111", "amount": 300 }),
            "history": json!([{ "cvv": "123" }, 5]),
            "contractId": 5001,
        };

        assert_eq!(
            masker.mask(&params),
            json!({
                "contractId": 5001,
                "history": [{ "cvv": "***" }, 5],
                "payment": { "amount": 300, "cardNumber": "***" },
            })
        );
    }

    #[test]
    fn masked_key_hides_structured_values() {
        let masker = ParamMasker::new(["customer"]);
        let params = params! { "customer": json!({ "name": "Ada" }) };
        assert_eq!(masker.display(&params).to_string(), r#"{"customer":"***"}"#);
    }

    #[test]
    fn empty_masker_is_identity() {
        let masker = ParamMasker::from_config(&LoggingConfig::default());
        let params = params! { "currency": "EUR", "customerId": 7001 };

        assert!(masker.is_empty());
        assert_eq!(masker.mask(&params), json!({ "currency": "EUR", "customerId": 7001 }));
    }
}
