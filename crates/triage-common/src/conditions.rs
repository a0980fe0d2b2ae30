//! Condition evaluator: decides when a node counts as unhealthy.
//!
//! Rules are `(type, status, timeout)` triples loaded from the
//! `node-unhealthy-conditions` ConfigMap in the triage system namespace
//! (key `conditions`, YAML list). A node is unhealthy when any rule
//! matches a current node condition by type and status; it has been
//! unhealthy "too long" once the condition held past the rule's timeout.
//! On a missing or malformed ConfigMap the built-in defaults apply.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Node, NodeCondition};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;

/// Name of the ConfigMap holding the condition policy.
pub const CONFIGMAP_NODE_UNHEALTHY_CONDITIONS: &str = "node-unhealthy-conditions";

/// ConfigMap data key holding the YAML rule list.
pub const CONDITIONS_DATA_KEY: &str = "conditions";

/// Node condition type consulted for readiness.
pub const CONDITION_READY: &str = "Ready";

/// Condition status meaning the condition holds.
pub const STATUS_TRUE: &str = "True";

/// Condition status meaning the condition does not hold.
pub const STATUS_FALSE: &str = "False";

/// Condition status meaning the kubelet stopped reporting.
pub const STATUS_UNKNOWN: &str = "Unknown";

/// One unhealthy-condition rule.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UnhealthyCondition {
    /// Node condition type to match (e.g. `Ready`)
    pub name: String,
    /// Condition status that counts as unhealthy (e.g. `Unknown`)
    pub status: String,
    /// How long the condition may hold before remediation, e.g. `300s`, `5m`
    pub timeout: String,
}

impl UnhealthyCondition {
    /// Parsed timeout; `None` when the string is malformed.
    pub fn timeout(&self) -> Option<Duration> {
        parse_duration(&self.timeout)
    }
}

#[derive(Deserialize)]
struct UnhealthyConditionList {
    items: Vec<UnhealthyCondition>,
}

/// Built-in rules applied when no valid policy ConfigMap exists:
/// a node whose Ready condition is Unknown or False for 5 minutes.
pub fn default_conditions() -> Vec<UnhealthyCondition> {
    vec![
        UnhealthyCondition {
            name: CONDITION_READY.to_string(),
            status: STATUS_UNKNOWN.to_string(),
            timeout: "300s".to_string(),
        },
        UnhealthyCondition {
            name: CONDITION_READY.to_string(),
            status: STATUS_FALSE.to_string(),
            timeout: "300s".to_string(),
        },
    ]
}

/// Parse the YAML rule list from the ConfigMap's `conditions` key.
pub fn parse_conditions(data: &str) -> Result<Vec<UnhealthyCondition>, Error> {
    let list: UnhealthyConditionList = serde_yaml::from_str(data)?;
    for rule in &list.items {
        if rule.timeout().is_none() {
            return Err(Error::validation(
                format!("UnhealthyCondition/{}", rule.name),
                format!("unparseable timeout {:?}", rule.timeout),
            ));
        }
    }
    Ok(list.items)
}

/// Load the condition policy, falling back to [`default_conditions`] when
/// the ConfigMap is absent or malformed.
pub async fn load_conditions(client: Client, namespace: &str) -> Vec<UnhealthyCondition> {
    let configmaps: Api<ConfigMap> = Api::namespaced(client, namespace);
    let cm = match configmaps.get_opt(CONFIGMAP_NODE_UNHEALTHY_CONDITIONS).await {
        Ok(Some(cm)) => cm,
        Ok(None) => return default_conditions(),
        Err(err) => {
            warn!(error = %err, "failed to read condition policy, using defaults");
            return default_conditions();
        }
    };

    let Some(data) = cm.data.as_ref().and_then(|d| d.get(CONDITIONS_DATA_KEY)) else {
        warn!("condition policy ConfigMap has no conditions key, using defaults");
        return default_conditions();
    };
    match parse_conditions(data) {
        Ok(rules) => rules,
        Err(err) => {
            warn!(error = %err, "malformed condition policy, using defaults");
            default_conditions()
        }
    }
}

/// Parse a Go-style duration with a single unit suffix: `ms`, `s`, `m` or `h`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (value, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit())?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Whether the node currently has a condition of the given type and status.
pub fn node_has_condition(node: &Node, type_: &str, status: &str) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == status)
        })
}

/// Whether the node's Ready condition is True.
pub fn node_ready(node: &Node) -> bool {
    node_has_condition(node, CONDITION_READY, STATUS_TRUE)
}

/// Rules matching the node's current conditions, paired with the matched
/// condition so callers can reason about transition times.
pub fn matching_conditions<'a>(
    node: &'a Node,
    rules: &'a [UnhealthyCondition],
) -> Vec<(&'a UnhealthyCondition, &'a NodeCondition)> {
    let Some(conditions) = node.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
        return Vec::new();
    };
    rules
        .iter()
        .filter_map(|rule| {
            conditions
                .iter()
                .find(|c| c.type_ == rule.name && c.status == rule.status)
                .map(|c| (rule, c))
        })
        .collect()
}

/// Whether the condition has held past the timeout. A condition without a
/// transition time is treated as held forever.
pub fn unhealthy_too_long(condition: &NodeCondition, timeout: Duration, now: DateTime<Utc>) -> bool {
    match condition.last_transition_time.as_ref() {
        Some(transition) => {
            now.signed_duration_since(transition.0).to_std().unwrap_or_default() >= timeout
        }
        None => true,
    }
}

/// Time left before [`unhealthy_too_long`] turns true; `None` once elapsed.
pub fn remaining_wait(
    condition: &NodeCondition,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let transition = condition.last_transition_time.as_ref()?;
    let held = now.signed_duration_since(transition.0).to_std().unwrap_or_default();
    (held < timeout).then(|| timeout - held)
}

/// Grace window for a node: the tightest matching rule timeout, or the
/// default when no rule matches (or none parses).
pub fn effective_grace(
    node: &Node,
    rules: &[UnhealthyCondition],
    default: Duration,
) -> Duration {
    matching_conditions(node, rules)
        .iter()
        .filter_map(|(rule, _)| rule.timeout())
        .min()
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn node_with_condition(type_: &str, status: &str, transition: DateTime<Utc>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    last_transition_time: Some(Time(transition)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn parses_single_unit_durations() {
        assert_eq!(parse_duration("300s"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("300"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("5d"), None);
    }

    #[test]
    fn parses_the_configmap_rule_format() {
        let rules = parse_conditions(
            "items:\n- name: Ready\n  timeout: 60s\n  status: Unknown\n",
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "Ready");
        assert_eq!(rules[0].status, "Unknown");
        assert_eq!(rules[0].timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn rejects_rules_with_bad_timeouts() {
        let err = parse_conditions("items:\n- name: Ready\n  timeout: soon\n  status: Unknown\n")
            .unwrap_err();
        assert!(err.to_string().contains("soon"));
    }

    #[test]
    fn defaults_cover_unknown_and_false_ready() {
        let rules = default_conditions();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.name == CONDITION_READY));
        assert!(rules.iter().all(|r| r.timeout() == Some(Duration::from_secs(300))));
    }

    #[test]
    fn matches_rules_by_type_and_status() {
        let now = Utc::now();
        let node = node_with_condition(CONDITION_READY, STATUS_UNKNOWN, now);
        let rules = default_conditions();
        let matched = matching_conditions(&node, &rules);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0.status, STATUS_UNKNOWN);

        let healthy = node_with_condition(CONDITION_READY, STATUS_TRUE, now);
        assert!(matching_conditions(&healthy, &rules).is_empty());
        assert!(node_ready(&healthy));
    }

    #[test]
    fn too_long_after_the_timeout_elapses() {
        let now = Utc::now();
        let held = node_with_condition(CONDITION_READY, STATUS_UNKNOWN, now - chrono::Duration::minutes(10));
        let recent = node_with_condition(CONDITION_READY, STATUS_UNKNOWN, now);

        let timeout = Duration::from_secs(300);
        let held_cond = &held.status.as_ref().unwrap().conditions.as_ref().unwrap()[0];
        let recent_cond = &recent.status.as_ref().unwrap().conditions.as_ref().unwrap()[0];

        assert!(unhealthy_too_long(held_cond, timeout, now));
        assert!(!unhealthy_too_long(recent_cond, timeout, now));
        assert_eq!(remaining_wait(held_cond, timeout, now), None);
        assert_eq!(remaining_wait(recent_cond, timeout, now), Some(timeout));
    }

    #[test]
    fn grace_takes_the_tightest_matching_rule() {
        let now = Utc::now();
        let node = node_with_condition(CONDITION_READY, STATUS_UNKNOWN, now);
        let rules = vec![
            UnhealthyCondition {
                name: CONDITION_READY.to_string(),
                status: STATUS_UNKNOWN.to_string(),
                timeout: "30s".to_string(),
            },
            UnhealthyCondition {
                name: CONDITION_READY.to_string(),
                status: STATUS_UNKNOWN.to_string(),
                timeout: "5m".to_string(),
            },
        ];
        let default = Duration::from_secs(60);
        assert_eq!(effective_grace(&node, &rules, default), Duration::from_secs(30));

        let unmatched = node_with_condition(CONDITION_READY, STATUS_TRUE, now);
        assert_eq!(effective_grace(&unmatched, &rules, default), default);
    }
}
