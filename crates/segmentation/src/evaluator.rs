//! Segment evaluation against a single individual's snapshot.

use std::collections::{BTreeSet, HashMap};

use audience_core::config::ManualVersionPolicy;
use audience_core::types::UserSnapshot;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::definition::{SegmentNode, SegmentTree};
use crate::predicates::{apply_operator, compare_numbers};

/// Nesting limit for composite nodes.
pub const MAX_DEPTH: usize = 64;

/// Failure evaluating one definition for one individual. The engine logs
/// and skips these; they never fail a batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("node {0} is not part of the definition")]
    UnknownNode(String),
    #[error("definition nests deeper than {0} nodes")]
    DepthExceeded(usize),
    #[error("property {property} of event {event} is not numeric: {value}")]
    NonNumeric {
        event: String,
        property: String,
        value: String,
    },
    #[error("aggregate of property {property} of event {event} is not finite")]
    NonFinite { event: String, property: String },
}

/// Operator-supplied membership list for a manual segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualMembership {
    pub version: i64,
    pub user_ids: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl ManualMembership {
    pub fn admits(&self, user_id: &str, node_version: i64, policy: ManualVersionPolicy) -> bool {
        let current = match policy {
            ManualVersionPolicy::Strict => self.version >= node_version,
            ManualVersionPolicy::Advisory => true,
        };
        current && self.user_ids.contains(user_id)
    }
}

pub struct EvalContext<'a> {
    pub snapshot: &'a UserSnapshot,
    pub manual: Option<&'a ManualMembership>,
    pub policy: ManualVersionPolicy,
}

impl<'a> EvalContext<'a> {
    pub fn new(snapshot: &'a UserSnapshot) -> Self {
        Self {
            snapshot,
            manual: None,
            policy: ManualVersionPolicy::default(),
        }
    }

    pub fn with_manual(mut self, manual: Option<&'a ManualMembership>, policy: ManualVersionPolicy) -> Self {
        self.manual = manual;
        self.policy = policy;
        self
    }
}

/// Evaluates the tree from its entry node. Missing attributes evaluate to
/// `false`; composites short-circuit left to right. Nodes shared by several
/// parents are evaluated once.
pub fn evaluate_segment(tree: &SegmentTree, ctx: &EvalContext<'_>) -> Result<bool, EvaluationError> {
    let mut memo = HashMap::with_capacity(tree.len());
    eval_node(tree, tree.entry_id(), ctx, 0, &mut memo)
}

fn eval_node<'t>(
    tree: &'t SegmentTree,
    id: &'t str,
    ctx: &EvalContext<'_>,
    depth: usize,
    memo: &mut HashMap<&'t str, bool>,
) -> Result<bool, EvaluationError> {
    if depth > MAX_DEPTH {
        return Err(EvaluationError::DepthExceeded(MAX_DEPTH));
    }
    if let Some(&known) = memo.get(id) {
        return Ok(known);
    }
    let node = tree
        .node(id)
        .ok_or_else(|| EvaluationError::UnknownNode(id.to_string()))?;

    let value = match node {
        SegmentNode::Trait { path, operator, .. } => {
            apply_operator(ctx.snapshot.trait_value(path), operator, ctx.snapshot.as_of)
        }
        SegmentNode::Performed {
            event,
            times,
            times_operator,
            within_seconds,
            ..
        } => {
            let count = count_events(ctx.snapshot, event, *within_seconds);
            compare_numbers(count, *times_operator, *times)
        }
        SegmentNode::Manual { version, .. } => ctx
            .manual
            .is_some_and(|m| m.admits(&ctx.snapshot.user_id, *version, ctx.policy)),
        SegmentNode::And { children, .. } => {
            let mut all = true;
            for child in children {
                if !eval_node(tree, child, ctx, depth + 1, memo)? {
                    all = false;
                    break;
                }
            }
            all
        }
        SegmentNode::Or { children, .. } => {
            let mut any = false;
            for child in children {
                if eval_node(tree, child, ctx, depth + 1, memo)? {
                    any = true;
                    break;
                }
            }
            any
        }
        SegmentNode::Not { child, .. } => !eval_node(tree, child, ctx, depth + 1, memo)?,
    };
    memo.insert(id, value);
    Ok(value)
}

/// Number of track events named `event`, optionally within the trailing
/// window ending at the snapshot time.
pub fn count_events(snapshot: &UserSnapshot, event: &str, within_seconds: Option<u64>) -> u64 {
    let cutoff = window_start(snapshot.as_of, within_seconds);
    snapshot
        .events
        .iter()
        .filter(|e| e.event.as_deref() == Some(event))
        .filter(|e| cutoff.map_or(true, |c| e.event_time >= c && e.event_time <= snapshot.as_of))
        .count() as u64
}

pub(crate) fn window_start(as_of: DateTime<Utc>, within_seconds: Option<u64>) -> Option<DateTime<Utc>> {
    within_seconds.map(|secs| {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        as_of
            .checked_sub_signed(Duration::seconds(secs))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SegmentBuilder;
    use crate::definition::SegmentDefinition;
    use crate::predicates::SegmentOperator;
    use audience_core::types::UserEvent;
    use serde_json::json;
    use uuid::Uuid;

    fn snapshot_with_traits(traits: serde_json::Value) -> UserSnapshot {
        let event = UserEvent::identify(Uuid::new_v4(), "u1", traits, Utc::now());
        UserSnapshot::from_events("u1", [&event], Utc::now())
    }

    fn name_equals_test() -> SegmentTree {
        let definition = SegmentDefinition::single(SegmentNode::Trait {
            id: "n".into(),
            path: "name".into(),
            operator: SegmentOperator::Equals { value: json!("test") },
        });
        SegmentTree::from_definition(&definition).unwrap()
    }

    #[test]
    fn test_trait_equals() {
        let tree = name_equals_test();
        let matching = snapshot_with_traits(json!({"name": "test"}));
        let other = snapshot_with_traits(json!({"name": "other"}));
        let missing = snapshot_with_traits(json!({}));

        assert!(evaluate_segment(&tree, &EvalContext::new(&matching)).unwrap());
        assert!(!evaluate_segment(&tree, &EvalContext::new(&other)).unwrap());
        assert!(!evaluate_segment(&tree, &EvalContext::new(&missing)).unwrap());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let tree = name_equals_test();
        let snapshot = snapshot_with_traits(json!({"name": "test"}));
        let first = evaluate_segment(&tree, &EvalContext::new(&snapshot)).unwrap();
        for _ in 0..10 {
            assert_eq!(evaluate_segment(&tree, &EvalContext::new(&snapshot)).unwrap(), first);
        }
    }

    #[test]
    fn test_composites() {
        let definition = SegmentBuilder::new()
            .trait_equals("plan", json!("pro"))
            .group(
                SegmentBuilder::new()
                    .with_or()
                    .trait_equals("country", json!("NO"))
                    .trait_equals("country", json!("SE")),
            )
            .build()
            .unwrap();
        let tree = SegmentTree::from_definition(&definition).unwrap();

        let yes = snapshot_with_traits(json!({"plan": "pro", "country": "SE"}));
        let wrong_country = snapshot_with_traits(json!({"plan": "pro", "country": "DK"}));
        let wrong_plan = snapshot_with_traits(json!({"plan": "free", "country": "NO"}));

        assert!(evaluate_segment(&tree, &EvalContext::new(&yes)).unwrap());
        assert!(!evaluate_segment(&tree, &EvalContext::new(&wrong_country)).unwrap());
        assert!(!evaluate_segment(&tree, &EvalContext::new(&wrong_plan)).unwrap());

        let negated = SegmentBuilder::new()
            .trait_equals("plan", json!("pro"))
            .negate()
            .build()
            .unwrap();
        let negated = SegmentTree::from_definition(&negated).unwrap();
        assert!(!evaluate_segment(&negated, &EvalContext::new(&yes)).unwrap());
        assert!(evaluate_segment(&negated, &EvalContext::new(&wrong_plan)).unwrap());
    }

    #[test]
    fn test_performed_within_window() {
        let ws = Uuid::new_v4();
        let now = Utc::now();
        let recent = UserEvent::track(ws, "u1", "purchase", json!({}), now - Duration::hours(1));
        let old = UserEvent::track(ws, "u1", "purchase", json!({}), now - Duration::days(10));
        let snapshot = UserSnapshot::from_events("u1", [&recent, &old], now);

        assert_eq!(count_events(&snapshot, "purchase", None), 2);
        assert_eq!(count_events(&snapshot, "purchase", Some(86_400)), 1);

        let twice_this_week = SegmentBuilder::new()
            .performed("purchase", 2, Some(7 * 86_400))
            .build()
            .unwrap();
        let tree = SegmentTree::from_definition(&twice_this_week).unwrap();
        assert!(!evaluate_segment(&tree, &EvalContext::new(&snapshot)).unwrap());

        let never = SegmentBuilder::new()
            .did_not_perform("refund", None)
            .build()
            .unwrap();
        let tree = SegmentTree::from_definition(&never).unwrap();
        assert!(evaluate_segment(&tree, &EvalContext::new(&snapshot)).unwrap());
    }

    #[test]
    fn test_manual_version_policy() {
        let tree = SegmentTree::from_definition(&SegmentBuilder::manual(2)).unwrap();
        let snapshot = UserSnapshot::empty("u1", Utc::now());
        let stale_list = ManualMembership {
            version: 1,
            user_ids: ["u1".to_string()].into_iter().collect(),
            updated_at: Utc::now(),
        };
        let current_list = ManualMembership {
            version: 2,
            ..stale_list.clone()
        };

        let strict = |m: &ManualMembership| {
            let ctx = EvalContext::new(&snapshot).with_manual(Some(m), ManualVersionPolicy::Strict);
            evaluate_segment(&tree, &ctx).unwrap()
        };
        assert!(!strict(&stale_list));
        assert!(strict(&current_list));

        let advisory = EvalContext::new(&snapshot)
            .with_manual(Some(&stale_list), ManualVersionPolicy::Advisory);
        assert!(evaluate_segment(&tree, &advisory).unwrap());

        let no_list = EvalContext::new(&snapshot);
        assert!(!evaluate_segment(&tree, &no_list).unwrap());
    }

    #[test]
    fn test_depth_guard() {
        let mut nodes = Vec::new();
        for i in 0..(MAX_DEPTH + 2) {
            nodes.push(SegmentNode::Not {
                id: format!("n{}", i),
                child: format!("n{}", i + 1),
            });
        }
        nodes.push(SegmentNode::Trait {
            id: format!("n{}", MAX_DEPTH + 2),
            path: "name".into(),
            operator: SegmentOperator::Exists,
        });
        let entry = nodes.remove(0);
        let tree = SegmentTree::from_definition(&SegmentDefinition {
            entry_node: entry,
            nodes,
        })
        .unwrap();

        let snapshot = UserSnapshot::empty("u1", Utc::now());
        assert_eq!(
            evaluate_segment(&tree, &EvalContext::new(&snapshot)),
            Err(EvaluationError::DepthExceeded(MAX_DEPTH))
        );
    }

    #[test]
    fn test_shared_children_are_evaluated_once() {
        // Each level references the next one twice; without sharing results
        // this tree would take 2^48 node visits.
        let levels = 48;
        let mut nodes: Vec<SegmentNode> = (0..levels)
            .map(|i| SegmentNode::And {
                id: format!("n{}", i),
                children: vec![format!("n{}", i + 1), format!("n{}", i + 1)],
            })
            .collect();
        nodes.push(SegmentNode::Trait {
            id: format!("n{}", levels),
            path: "name".into(),
            operator: SegmentOperator::Exists,
        });
        let entry = nodes.remove(0);
        let tree = SegmentTree::from_definition(&SegmentDefinition {
            entry_node: entry,
            nodes,
        })
        .unwrap();

        let named = snapshot_with_traits(json!({"name": "test"}));
        let anonymous = snapshot_with_traits(json!({}));
        assert!(evaluate_segment(&tree, &EvalContext::new(&named)).unwrap());
        assert!(!evaluate_segment(&tree, &EvalContext::new(&anonymous)).unwrap());
    }
}
