//! Label selectors.
//!
//! [`LabelSelector`] is the wire form stored in a fleet spec. It must be
//! converted into a validated [`Selector`] before it can match anything; a
//! selector that fails conversion is a spec defect, not a transient error.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SelectorError;

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// Set-based requirement operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for SelectorOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::In => "In",
            Self::NotIn => "NotIn",
            Self::Exists => "Exists",
            Self::DoesNotExist => "DoesNotExist",
        };
        f.write_str(s)
    }
}

/// A set-based requirement as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Wire form of a label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Selector matching exactly the given labels.
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// Validate and convert into a [`Selector`].
    ///
    /// An empty selector matches everything.
    pub fn to_selector(&self) -> Result<Selector, SelectorError> {
        let mut requirements = Vec::with_capacity(
            self.match_labels.len() + self.match_expressions.len(),
        );

        for (key, value) in &self.match_labels {
            validate_key(key)?;
            validate_value(key, value)?;
            requirements.push(Requirement {
                key: key.clone(),
                op: Op::Equals(value.clone()),
            });
        }

        for expr in &self.match_expressions {
            validate_key(&expr.key)?;
            let op = match expr.operator {
                SelectorOperator::In | SelectorOperator::NotIn => {
                    if expr.values.is_empty() {
                        return Err(SelectorError::MissingValues {
                            key: expr.key.clone(),
                            operator: expr.operator.to_string(),
                        });
                    }
                    for v in &expr.values {
                        validate_value(&expr.key, v)?;
                    }
                    let values: BTreeSet<String> = expr.values.iter().cloned().collect();
                    if expr.operator == SelectorOperator::In {
                        Op::In(values)
                    } else {
                        Op::NotIn(values)
                    }
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist => {
                    if !expr.values.is_empty() {
                        return Err(SelectorError::UnexpectedValues {
                            key: expr.key.clone(),
                            operator: expr.operator.to_string(),
                        });
                    }
                    if expr.operator == SelectorOperator::Exists {
                        Op::Exists
                    } else {
                        Op::DoesNotExist
                    }
                }
            };
            requirements.push(Requirement {
                key: expr.key.clone(),
                op,
            });
        }

        requirements.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Selector { requirements })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Equals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    op: Op,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match &self.op {
            Op::Equals(v) => value == Some(v),
            Op::In(set) => value.is_some_and(|v| set.contains(v)),
            Op::NotIn(set) => value.is_none_or(|v| !set.contains(v)),
            Op::Exists => value.is_some(),
            Op::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        match &self.op {
            Op::Equals(v) => write!(f, "{}={}", self.key, v),
            Op::In(set) => write!(f, "{} in ({})", self.key, join(set)),
            Op::NotIn(set) => write!(f, "{} notin ({})", self.key, join(set)),
            Op::Exists => write!(f, "{}", self.key),
            Op::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A validated label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Returns true if every requirement matches `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Returns true if this selector matches every label set.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |message: &str| SelectorError::InvalidKey {
        key: key.to_string(),
        message: message.to_string(),
    };

    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
                return Err(invalid("prefix must be a non-empty DNS subdomain"));
            }
            let prefix_ok = prefix.split('.').all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                    && !part.starts_with('-')
                    && !part.ends_with('-')
            });
            if !prefix_ok {
                return Err(invalid("prefix must be a lowercase DNS subdomain"));
            }
            name
        }
        None => key,
    };

    if name.is_empty() || name.len() > MAX_NAME_LEN || !is_qualified_segment(name) {
        return Err(invalid(
            "name must be 63 characters or less, alphanumeric at both ends, with '-', '_' or '.' inside",
        ));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LEN || !is_qualified_segment(value) {
        return Err(SelectorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

fn is_qualified_segment(s: &str) -> bool {
    let bytes = s.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector::from_labels([("app", "web")]).to_selector().unwrap();
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "a")])));
        assert!(!selector.matches(&labels(&[("app", "db")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_expressions_and_string_form() {
        let selector = LabelSelector {
            match_labels: labels(&[("app", "web")]),
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "env".into(),
                    operator: SelectorOperator::In,
                    values: vec!["prod".into(), "dev".into()],
                },
                LabelSelectorRequirement {
                    key: "gone".into(),
                    operator: SelectorOperator::DoesNotExist,
                    values: vec![],
                },
                LabelSelectorRequirement {
                    key: "tier".into(),
                    operator: SelectorOperator::NotIn,
                    values: vec!["db".into()],
                },
            ],
        }
        .to_selector()
        .unwrap();

        assert_eq!(
            selector.to_string(),
            "app=web,env in (dev,prod),!gone,tier notin (db)"
        );
        assert!(selector.matches(&labels(&[("app", "web"), ("env", "dev")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("env", "dev"), ("gone", "x")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("env", "dev"), ("tier", "db")])));
    }

    #[test]
    fn test_invalid_selectors() {
        let missing_values = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: SelectorOperator::In,
                values: vec![],
            }],
        };
        assert!(matches!(
            missing_values.to_selector(),
            Err(SelectorError::MissingValues { .. })
        ));

        let bad_key = LabelSelector::from_labels([("-bad", "x")]);
        assert!(bad_key.to_selector().unwrap_err().is_key_error());

        let bad_value = LabelSelector::from_labels([("app", "has space")]);
        assert!(matches!(
            bad_value.to_selector(),
            Err(SelectorError::InvalidValue { .. })
        ));

        let prefixed = LabelSelector::from_labels([("pool.vmfleet.io/name", "a")]);
        assert!(prefixed.to_selector().is_ok());
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default().to_selector().unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[("any", "thing")])));
        assert_eq!(selector.to_string(), "");
    }

    proptest! {
        #[test]
        fn prop_match_labels_selects_its_own_labels(
            pairs in proptest::collection::btree_map("[a-z][a-z0-9]{0,8}", "[a-z0-9]{1,8}", 0..5)
        ) {
            let selector = LabelSelector { match_labels: pairs.clone(), match_expressions: vec![] }
                .to_selector()
                .unwrap();
            prop_assert!(selector.matches(&pairs));
        }
    }
}
