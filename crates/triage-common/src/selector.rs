//! Label-selector matching for machine targeting.
//!
//! Works on the apimachinery `LabelSelector` wire type, where the
//! requirement operator arrives as a plain string, so matching can fail
//! on malformed input instead of silently selecting nothing.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::error::Error;

/// Whether the selector has no terms at all. Callers decide what an
/// empty selector means; budgets treat it as matching nothing while
/// health checks use the usual match-everything reading.
pub fn selector_is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().map_or(true, |m| m.is_empty())
        && selector.match_expressions.as_ref().map_or(true, |e| e.is_empty())
}

/// Whether `labels` satisfies every term of the selector.
///
/// All `matchLabels` pairs and all `matchExpressions` must hold. A
/// malformed requirement (unknown operator, or values that do not fit
/// the operator) is a validation error, not a non-match.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for requirement in expressions {
            if !requirement_matches(requirement, labels)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn requirement_matches(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    let value = labels.get(&requirement.key).map(String::as_str);
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => {
            if values.is_empty() {
                return Err(invalid(requirement, "In requires at least one value"));
            }
            Ok(value.is_some_and(|v| values.iter().any(|req| req == v)))
        }
        "NotIn" => {
            if values.is_empty() {
                return Err(invalid(requirement, "NotIn requires at least one value"));
            }
            Ok(value.map_or(true, |v| !values.iter().any(|req| req == v)))
        }
        "Exists" => {
            if !values.is_empty() {
                return Err(invalid(requirement, "Exists takes no values"));
            }
            Ok(value.is_some())
        }
        "DoesNotExist" => {
            if !values.is_empty() {
                return Err(invalid(requirement, "DoesNotExist takes no values"));
            }
            Ok(value.is_none())
        }
        other => Err(invalid(requirement, &format!("unknown operator {other:?}"))),
    }
}

fn invalid(requirement: &LabelSelectorRequirement, message: &str) -> Error {
    Error::validation(
        format!("selector requirement on {:?}", requirement.key),
        message,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector_with_labels(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels(pairs)),
            ..Default::default()
        }
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn all_match_labels_must_hold() {
        let selector = selector_with_labels(&[("role", "worker"), ("pool", "a")]);
        assert!(selector_matches(&selector, &labels(&[("role", "worker"), ("pool", "a")])).unwrap());
        assert!(!selector_matches(&selector, &labels(&[("role", "worker")])).unwrap());
        assert!(!selector_matches(&selector, &labels(&[("role", "control"), ("pool", "a")])).unwrap());
    }

    #[test]
    fn in_and_not_in_check_membership() {
        let sel = LabelSelector {
            match_expressions: Some(vec![requirement("pool", "In", &["a", "b"])]),
            ..Default::default()
        };
        assert!(selector_matches(&sel, &labels(&[("pool", "a")])).unwrap());
        assert!(!selector_matches(&sel, &labels(&[("pool", "c")])).unwrap());
        assert!(!selector_matches(&sel, &labels(&[])).unwrap());

        let sel = LabelSelector {
            match_expressions: Some(vec![requirement("pool", "NotIn", &["a"])]),
            ..Default::default()
        };
        assert!(!selector_matches(&sel, &labels(&[("pool", "a")])).unwrap());
        assert!(selector_matches(&sel, &labels(&[("pool", "b")])).unwrap());
        // absent label satisfies NotIn
        assert!(selector_matches(&sel, &labels(&[])).unwrap());
    }

    #[test]
    fn exists_operators_check_presence_only() {
        let sel = LabelSelector {
            match_expressions: Some(vec![requirement("pool", "Exists", &[])]),
            ..Default::default()
        };
        assert!(selector_matches(&sel, &labels(&[("pool", "anything")])).unwrap());
        assert!(!selector_matches(&sel, &labels(&[])).unwrap());

        let sel = LabelSelector {
            match_expressions: Some(vec![requirement("pool", "DoesNotExist", &[])]),
            ..Default::default()
        };
        assert!(!selector_matches(&sel, &labels(&[("pool", "x")])).unwrap());
        assert!(selector_matches(&sel, &labels(&[])).unwrap());
    }

    #[test]
    fn malformed_requirements_are_errors_not_non_matches() {
        let sel = LabelSelector {
            match_expressions: Some(vec![requirement("pool", "In", &[])]),
            ..Default::default()
        };
        assert!(selector_matches(&sel, &labels(&[("pool", "a")])).is_err());

        let sel = LabelSelector {
            match_expressions: Some(vec![requirement("pool", "Near", &["a"])]),
            ..Default::default()
        };
        assert!(selector_matches(&sel, &labels(&[])).is_err());

        let sel = LabelSelector {
            match_expressions: Some(vec![requirement("pool", "Exists", &["a"])]),
            ..Default::default()
        };
        assert!(selector_matches(&sel, &labels(&[])).is_err());
    }

    #[test]
    fn empty_selector_is_detected() {
        assert!(selector_is_empty(&LabelSelector::default()));
        assert!(selector_is_empty(&LabelSelector {
            match_labels: Some(BTreeMap::new()),
            match_expressions: Some(Vec::new()),
        }));
        assert!(!selector_is_empty(&selector_with_labels(&[("a", "b")])));
    }

    #[test]
    fn empty_selector_still_matches_everything() {
        assert!(selector_matches(&LabelSelector::default(), &labels(&[("a", "b")])).unwrap());
        assert!(selector_matches(&LabelSelector::default(), &labels(&[])).unwrap());
    }
}
