//! Wire-level data model shared by the HTTP endpoints and the push transport.
use derive_more::From;
use serde::{Deserialize, Serialize};

/// A feature flag value.
///
/// Untagged on the wire: booleans, numbers and strings are encoded as the corresponding JSON
/// primitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, From)]
#[serde(untagged)]
pub enum FeatureValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for FeatureValue {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl FeatureValue {
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FeatureValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A single value resolved by the service for a fixed audience set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveFeatureValue {
    pub feature_key: String,
    pub value: FeatureValue,
}

/// An audience-specific override of a feature's default value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudienceExceptionValue {
    pub audience_key: String,
    pub value: FeatureValue,
}

/// Raw per-feature rule set, resolved locally against caller-supplied audiences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureConfiguration {
    pub feature_key: String,
    pub default_value: FeatureValue,
    /// Evaluated in order; the first exception whose audience matches wins.
    #[serde(default, alias = "audienceValues")]
    pub audience_exceptions: Vec<AudienceExceptionValue>,
}

impl FeatureConfiguration {
    /// Resolve the value of this feature for `audience_keys`.
    pub fn resolve<S: AsRef<str>>(&self, audience_keys: &[S]) -> &FeatureValue {
        self.audience_exceptions
            .iter()
            .find(|exception| {
                audience_keys
                    .iter()
                    .any(|audience| audience.as_ref() == exception.audience_key)
            })
            .map(|exception| &exception.value)
            .unwrap_or(&self.default_value)
    }
}

/// Snapshot of all present values for a client, along with the audiences they were resolved for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveValues {
    pub audiences: Vec<String>,
    pub effective_values: Vec<EffectiveFeatureValue>,
}

/// Order-insensitive comparison of two audience lists.
pub(crate) fn same_audiences(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration() -> FeatureConfiguration {
        FeatureConfiguration {
            feature_key: "banner".into(),
            default_value: "default".into(),
            audience_exceptions: vec![
                AudienceExceptionValue {
                    audience_key: "beta".into(),
                    value: "beta-value".into(),
                },
                AudienceExceptionValue {
                    audience_key: "staff".into(),
                    value: "staff-value".into(),
                },
            ],
        }
    }

    #[test]
    fn resolves_first_matching_exception_in_stored_order() {
        let config = configuration();
        assert_eq!(
            config.resolve(&["staff", "beta"]),
            &FeatureValue::from("beta-value")
        );
        assert_eq!(config.resolve(&["staff"]), &FeatureValue::from("staff-value"));
    }

    #[test]
    fn falls_back_to_default_value() {
        let config = configuration();
        assert_eq!(config.resolve(&["other"]), &FeatureValue::from("default"));
        assert_eq!(config.resolve::<&str>(&[]), &FeatureValue::from("default"));
    }

    #[test]
    fn parses_untagged_values() {
        let values: Vec<EffectiveFeatureValue> = serde_json::from_str(
            r#"[
                {"featureKey": "a", "value": true},
                {"featureKey": "b", "value": 4.5},
                {"featureKey": "c", "value": "text"}
            ]"#,
        )
        .unwrap();

        assert_eq!(values[0].value, FeatureValue::Boolean(true));
        assert_eq!(values[1].value, FeatureValue::Number(4.5));
        assert_eq!(values[2].value.as_str(), Some("text"));
    }

    #[test]
    fn accepts_audience_values_alias() {
        let config: FeatureConfiguration = serde_json::from_str(
            r#"{"featureKey": "a", "defaultValue": 1, "audienceValues": [{"audienceKey": "x", "value": 2}]}"#,
        )
        .unwrap();

        assert_eq!(config.resolve(&["x"]), &FeatureValue::Number(2.0));
    }

    #[test]
    fn audience_comparison_ignores_order() {
        let a = vec!["x".to_owned(), "y".to_owned()];
        let b = vec!["y".to_owned(), "x".to_owned()];
        assert!(same_audiences(&a, &b));
        assert!(!same_audiences(&a, &["x".to_owned()]));
    }
}
