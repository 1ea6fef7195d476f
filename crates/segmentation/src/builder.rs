//! Segment builder: fluent API for constructing segment definitions.

use uuid::Uuid;

use crate::definition::{DefinitionError, SegmentDefinition, SegmentNode, SegmentTree};
use crate::predicates::{ComparisonOperator, SegmentOperator};

#[derive(Clone, Copy)]
enum Combinator {
    And,
    Or,
}

/// Collects leaf predicates and nested groups, combined with `And` unless
/// `with_or` is called. Node ids are generated.
pub struct SegmentBuilder {
    combinator: Combinator,
    negated: bool,
    /// Ids of the direct operands, in insertion order.
    operands: Vec<String>,
    nodes: Vec<SegmentNode>,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self {
            combinator: Combinator::And,
            negated: false,
            operands: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// A manually maintained segment at the given list version.
    pub fn manual(version: i64) -> SegmentDefinition {
        SegmentDefinition::single(SegmentNode::Manual {
            id: new_id(),
            version,
        })
    }

    pub fn with_or(mut self) -> Self {
        self.combinator = Combinator::Or;
        self
    }

    /// Wraps the whole expression in `Not`.
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn trait_matches(self, path: impl Into<String>, operator: SegmentOperator) -> Self {
        self.leaf(SegmentNode::Trait {
            id: new_id(),
            path: path.into(),
            operator,
        })
    }

    pub fn trait_equals(self, path: impl Into<String>, value: serde_json::Value) -> Self {
        self.trait_matches(path, SegmentOperator::Equals { value })
    }

    pub fn trait_exists(self, path: impl Into<String>) -> Self {
        self.trait_matches(path, SegmentOperator::Exists)
    }

    pub fn performed(
        self,
        event: impl Into<String>,
        min_times: u64,
        within_seconds: Option<u64>,
    ) -> Self {
        self.leaf(SegmentNode::Performed {
            id: new_id(),
            event: event.into(),
            times: min_times,
            times_operator: ComparisonOperator::GreaterThanOrEqual,
            within_seconds,
        })
    }

    pub fn did_not_perform(self, event: impl Into<String>, within_seconds: Option<u64>) -> Self {
        self.leaf(SegmentNode::Performed {
            id: new_id(),
            event: event.into(),
            times: 0,
            times_operator: ComparisonOperator::Equals,
            within_seconds,
        })
    }

    pub fn in_manual_list(self, version: i64) -> Self {
        self.leaf(SegmentNode::Manual {
            id: new_id(),
            version,
        })
    }

    /// Adds a nested group as a single operand.
    pub fn group(mut self, group: SegmentBuilder) -> Self {
        if let Some((entry, nodes)) = group.assemble() {
            self.operands.push(entry.id().to_string());
            self.nodes.push(entry);
            self.nodes.extend(nodes);
        }
        self
    }

    /// Builds and validates the definition.
    pub fn build(self) -> Result<SegmentDefinition, DefinitionError> {
        let (entry_node, nodes) = self
            .assemble()
            .ok_or_else(|| DefinitionError::Malformed("segment has no predicates".into()))?;
        let definition = SegmentDefinition { entry_node, nodes };
        SegmentTree::from_definition(&definition)?;
        Ok(definition)
    }

    fn leaf(mut self, node: SegmentNode) -> Self {
        self.operands.push(node.id().to_string());
        self.nodes.push(node);
        self
    }

    /// Returns the entry node and the remaining nodes it references.
    fn assemble(mut self) -> Option<(SegmentNode, Vec<SegmentNode>)> {
        let mut entry = match self.operands.len() {
            0 => return None,
            1 => {
                let id = self.operands.remove(0);
                let index = self.nodes.iter().position(|n| n.id() == id)?;
                self.nodes.remove(index)
            }
            _ => match self.combinator {
                Combinator::And => SegmentNode::And {
                    id: new_id(),
                    children: self.operands,
                },
                Combinator::Or => SegmentNode::Or {
                    id: new_id(),
                    children: self.operands,
                },
            },
        };
        if self.negated {
            self.nodes.push(entry);
            let child = self.nodes.last().map(|n| n.id().to_string())?;
            entry = SegmentNode::Not {
                id: new_id(),
                child,
            };
        }
        Some((entry, self.nodes))
    }
}

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}
