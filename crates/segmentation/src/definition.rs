//! Segment definition trees.
//!
//! Definitions arrive in wire form (`SegmentDefinition`: an entry node plus
//! the other nodes it may reference by id) and are validated into a
//! `SegmentTree`, a flat arena keyed by node id. Every tree handed to the
//! evaluator has passed validation: no duplicate ids, no dangling
//! references, no cycles, no empty composites.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::predicates::{ComparisonOperator, SegmentOperator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("malformed definition: {0}")]
    Malformed(String),
    #[error("node id {0} is used more than once")]
    DuplicateNodeId(String),
    #[error("node {node} references unknown node {missing}")]
    DanglingReference { node: String, missing: String },
    #[error("node {0} is part of a reference cycle")]
    Cycle(String),
    #[error("composite node {0} has no children")]
    EmptyComposite(String),
    #[error("field {0} must not be empty")]
    EmptyField(&'static str),
}

fn default_times() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentNode {
    Trait {
        id: String,
        path: String,
        operator: SegmentOperator,
    },
    /// Count of track events named `event`, optionally restricted to the
    /// trailing `within_seconds` before the snapshot time.
    Performed {
        id: String,
        event: String,
        #[serde(default = "default_times")]
        times: u64,
        #[serde(default)]
        times_operator: ComparisonOperator,
        #[serde(default)]
        within_seconds: Option<u64>,
    },
    Manual {
        id: String,
        version: i64,
    },
    And {
        id: String,
        children: Vec<String>,
    },
    Or {
        id: String,
        children: Vec<String>,
    },
    Not {
        id: String,
        child: String,
    },
}

impl SegmentNode {
    pub fn id(&self) -> &str {
        match self {
            SegmentNode::Trait { id, .. }
            | SegmentNode::Performed { id, .. }
            | SegmentNode::Manual { id, .. }
            | SegmentNode::And { id, .. }
            | SegmentNode::Or { id, .. }
            | SegmentNode::Not { id, .. } => id,
        }
    }

    /// Ids of the nodes this node references.
    pub fn children(&self) -> &[String] {
        match self {
            SegmentNode::And { children, .. } | SegmentNode::Or { children, .. } => children,
            SegmentNode::Not { child, .. } => std::slice::from_ref(child),
            _ => &[],
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, SegmentNode::Manual { .. })
    }
}

/// Wire form of a segment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDefinition {
    pub entry_node: SegmentNode,
    #[serde(default)]
    pub nodes: Vec<SegmentNode>,
}

impl SegmentDefinition {
    /// A definition with a single leaf as its entry node.
    pub fn single(entry_node: SegmentNode) -> Self {
        Self {
            entry_node,
            nodes: Vec::new(),
        }
    }

    /// Version of the entry node when the segment is manually maintained.
    pub fn manual_version(&self) -> Option<i64> {
        match &self.entry_node {
            SegmentNode::Manual { version, .. } => Some(*version),
            _ => None,
        }
    }
}

/// Validated arena form of a segment definition.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTree {
    entry: String,
    nodes: HashMap<String, SegmentNode>,
}

impl SegmentTree {
    /// Deserializes and validates a raw JSON definition.
    pub fn parse(raw: &serde_json::Value) -> Result<Self, DefinitionError> {
        let definition: SegmentDefinition = serde_json::from_value(raw.clone())
            .map_err(|e| DefinitionError::Malformed(e.to_string()))?;
        Self::from_definition(&definition)
    }

    pub fn from_definition(definition: &SegmentDefinition) -> Result<Self, DefinitionError> {
        let mut nodes = HashMap::with_capacity(definition.nodes.len() + 1);
        for node in std::iter::once(&definition.entry_node).chain(definition.nodes.iter()) {
            if node.id().is_empty() {
                return Err(DefinitionError::EmptyField("id"));
            }
            validate_leaf(node)?;
            if nodes.insert(node.id().to_string(), node.clone()).is_some() {
                return Err(DefinitionError::DuplicateNodeId(node.id().to_string()));
            }
        }

        for node in nodes.values() {
            if matches!(node, SegmentNode::And { .. } | SegmentNode::Or { .. })
                && node.children().is_empty()
            {
                return Err(DefinitionError::EmptyComposite(node.id().to_string()));
            }
            if let Some(missing) = node.children().iter().find(|c| !nodes.contains_key(*c)) {
                return Err(DefinitionError::DanglingReference {
                    node: node.id().to_string(),
                    missing: missing.clone(),
                });
            }
        }

        let tree = Self {
            entry: definition.entry_node.id().to_string(),
            nodes,
        };
        tree.check_acyclic()?;
        Ok(tree)
    }

    pub fn entry_id(&self) -> &str {
        &self.entry
    }

    pub fn entry(&self) -> &SegmentNode {
        // The entry node is always inserted during validation.
        &self.nodes[&self.entry]
    }

    pub fn node(&self, id: &str) -> Option<&SegmentNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether evaluating the tree needs a manual membership list.
    pub fn references_manual(&self) -> bool {
        self.nodes.values().any(SegmentNode::is_manual)
    }

    /// Whether membership can change with the passage of time alone, without
    /// new events from the individual.
    pub fn depends_on_time(&self) -> bool {
        self.nodes.values().any(|node| {
            matches!(
                node,
                SegmentNode::Trait {
                    operator: SegmentOperator::Within { .. },
                    ..
                } | SegmentNode::Performed {
                    within_seconds: Some(_),
                    ..
                }
            )
        })
    }

    fn check_acyclic(&self) -> Result<(), DefinitionError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.nodes.len());
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();

        for root in ids {
            if marks.contains_key(root) {
                continue;
            }
            // Iterative DFS: (node, index of next child to visit).
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
            marks.insert(root, Mark::Visiting);
            while let Some((id, next)) = stack.pop() {
                let children = self.nodes[id].children();
                if next == children.len() {
                    marks.insert(id, Mark::Done);
                    continue;
                }
                stack.push((id, next + 1));
                let child = children[next].as_str();
                match marks.get(child) {
                    Some(Mark::Visiting) => return Err(DefinitionError::Cycle(child.to_string())),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_leaf(node: &SegmentNode) -> Result<(), DefinitionError> {
    match node {
        SegmentNode::Trait { path, .. } if path.is_empty() => Err(DefinitionError::EmptyField("path")),
        SegmentNode::Performed { event, .. } if event.is_empty() => {
            Err(DefinitionError::EmptyField("event"))
        }
        SegmentNode::Trait {
            operator: SegmentOperator::Between { min, max },
            ..
        } if min > max => Err(DefinitionError::Malformed(format!(
            "between range is inverted: {} > {}",
            min, max
        ))),
        _ => Ok(()),
    }
}
