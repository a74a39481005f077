//! Operations, edges and the query specification graph.
//!
//! The evaluator lowers a program into a [`QuerySpec`]: a DAG of
//! [`Operation`] nodes joined by [`Edge`]s. Operations serialize as
//! `{"id", "kind", "spec"}` documents, with the spec payload keyed by the
//! operation kind.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use common_error::{RivuletError, RivuletResult};

use crate::expr::Expression;
use crate::time::{Duration, TimeSpec};

/// Unique operation identifier within a query, typically `<kind><counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    /// Create an operation id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Spec payload for the `from` source operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromOpSpec {
    /// Database to read from.
    pub database: String,
}

/// Spec payload for `range`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeOpSpec {
    /// Inclusive start.
    pub start: TimeSpec,
    /// Exclusive stop; defaults to `now`.
    #[serde(default)]
    pub stop: TimeSpec,
}

/// Spec payload for `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOpSpec {
    /// The predicate arrow function.
    pub expression: Expression,
}

/// Spec payload for `group`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOpSpec {
    /// Tag keys to group by.
    pub by: Vec<String>,
}

/// Spec payload for `window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowOpSpec {
    /// Window stride.
    pub every: Duration,
    /// Window length; defaults to `every`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Duration>,
    /// Rounding applied to window boundaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<Duration>,
    /// Window alignment origin; defaults to the resolved query start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<TimeSpec>,
}

/// Spec payload for `limit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOpSpec {
    /// Maximum number of rows per block key.
    pub n: i64,
    /// Rows skipped before counting.
    #[serde(default)]
    pub offset: i64,
}

/// Spec payload shared by the row selectors `first`, `last`, `min`, `max`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorOpSpec {
    /// Emit the selected row's own time instead of the block stop.
    #[serde(default)]
    pub use_row_time: bool,
}

/// Spec payload for `join`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOpSpec {
    /// Tag keys rows must agree on, in addition to time.
    #[serde(default)]
    pub on: Vec<String>,
}

/// The spec of a single operation, keyed by operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "camelCase")]
pub enum OperationSpec {
    /// Storage source.
    From(FromOpSpec),
    /// Time range restriction.
    Range(RangeOpSpec),
    /// Predicate filter.
    Filter(FilterOpSpec),
    /// Regroup by tag keys.
    Group(GroupOpSpec),
    /// Windowing.
    Window(WindowOpSpec),
    /// Row count limit.
    Limit(LimitOpSpec),
    /// First-row selector.
    First(SelectorOpSpec),
    /// Last-row selector.
    Last(SelectorOpSpec),
    /// Minimum-row selector.
    Min(SelectorOpSpec),
    /// Maximum-row selector.
    Max(SelectorOpSpec),
    /// Sum aggregate.
    Sum {},
    /// Count aggregate.
    Count {},
    /// Mean aggregate.
    Mean {},
    /// Join on time and tag keys.
    Join(JoinOpSpec),
}

impl OperationSpec {
    /// The kind string of this operation.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::From(_) => "from",
            Self::Range(_) => "range",
            Self::Filter(_) => "filter",
            Self::Group(_) => "group",
            Self::Window(_) => "window",
            Self::Limit(_) => "limit",
            Self::First(_) => "first",
            Self::Last(_) => "last",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::Sum {} => "sum",
            Self::Count {} => "count",
            Self::Mean {} => "mean",
            Self::Join(_) => "join",
        }
    }

    /// Whether this operation kind is a source (has no parents).
    pub const fn is_source(&self) -> bool {
        matches!(self, Self::From(_))
    }
}

/// A single node of the operation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id within the query.
    pub id: OperationId,
    /// Kind-tagged spec.
    #[serde(flatten)]
    pub spec: OperationSpec,
}

impl Operation {
    /// Create an operation.
    pub fn new(id: impl Into<String>, spec: OperationSpec) -> Self {
        Self {
            id: OperationId::new(id),
            spec,
        }
    }
}

/// A parent → child dependency between operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// The producing operation.
    pub parent: OperationId,
    /// The consuming operation.
    pub child: OperationId,
}

impl Edge {
    /// Create an edge.
    pub fn new(parent: impl Into<String>, child: impl Into<String>) -> Self {
        Self {
            parent: OperationId::new(parent),
            child: OperationId::new(child),
        }
    }
}

/// A complete query: operations plus the edges joining them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// All operations, in evaluation order.
    pub operations: Vec<Operation>,
    /// All edges.
    pub edges: Vec<Edge>,
}

impl QuerySpec {
    /// Look up an operation by id.
    pub fn operation(&self, id: &OperationId) -> Option<&Operation> {
        self.operations.iter().find(|op| &op.id == id)
    }

    /// Parent ids per operation, in edge order.
    pub fn parents(&self) -> HashMap<&OperationId, Vec<&OperationId>> {
        let mut map: HashMap<&OperationId, Vec<&OperationId>> = self
            .operations
            .iter()
            .map(|op| (&op.id, Vec::new()))
            .collect();
        for edge in &self.edges {
            map.entry(&edge.child).or_default().push(&edge.parent);
        }
        map
    }

    /// Child ids per operation, in edge order.
    pub fn children(&self) -> HashMap<&OperationId, Vec<&OperationId>> {
        let mut map: HashMap<&OperationId, Vec<&OperationId>> = self
            .operations
            .iter()
            .map(|op| (&op.id, Vec::new()))
            .collect();
        for edge in &self.edges {
            map.entry(&edge.parent).or_default().push(&edge.child);
        }
        map
    }

    /// Validate graph well-formedness: unique ids, known edge endpoints,
    /// sources are exactly the zero-parent operations, acyclicity.
    pub fn validate(&self) -> RivuletResult<()> {
        if self.operations.is_empty() {
            return Err(RivuletError::evaluation("query has no operations"));
        }

        let mut ids = HashSet::new();
        for op in &self.operations {
            if !ids.insert(&op.id) {
                return Err(RivuletError::evaluation(format!(
                    "duplicate operation id {:?}",
                    op.id.as_str()
                )));
            }
        }
        for edge in &self.edges {
            for end in [&edge.parent, &edge.child] {
                if !ids.contains(end) {
                    return Err(RivuletError::evaluation(format!(
                        "edge references unknown operation {:?}",
                        end.as_str()
                    )));
                }
            }
        }

        let parents = self.parents();
        for op in &self.operations {
            let n_parents = parents.get(&op.id).map_or(0, Vec::len);
            if op.spec.is_source() && n_parents != 0 {
                return Err(RivuletError::evaluation(format!(
                    "source operation {:?} cannot have parents",
                    op.id.as_str()
                )));
            }
            if !op.spec.is_source() && n_parents == 0 {
                return Err(RivuletError::evaluation(format!(
                    "operation {:?} of kind {:?} has no parents",
                    op.id.as_str(),
                    op.spec.kind()
                )));
            }
        }

        // Acyclicity falls out of the topological sort.
        self.topo_order().map(|_| ())
    }

    /// Deterministic topological order: Kahn's algorithm seeded in
    /// operation declaration order.
    pub fn topo_order(&self) -> RivuletResult<Vec<OperationId>> {
        let mut in_degree: HashMap<&OperationId, usize> =
            self.operations.iter().map(|op| (&op.id, 0)).collect();
        for edge in &self.edges {
            if let Some(d) = in_degree.get_mut(&edge.child) {
                *d += 1;
            }
        }

        let children = self.children();
        let mut queue: VecDeque<&OperationId> = self
            .operations
            .iter()
            .filter(|op| in_degree.get(&op.id) == Some(&0))
            .map(|op| &op.id)
            .collect();

        let mut order = Vec::with_capacity(self.operations.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(kids) = children.get(id) {
                for child in kids {
                    if let Some(d) = in_degree.get_mut(*child) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(*child);
                        }
                    }
                }
            }
        }

        if order.len() != self.operations.len() {
            return Err(RivuletError::evaluation(
                "operation graph contains a cycle",
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Node, Operator};
    use crate::time::Time;

    fn from_op(id: &str) -> Operation {
        Operation::new(
            id,
            OperationSpec::From(FromOpSpec {
                database: "mydb".to_string(),
            }),
        )
    }

    #[test]
    fn test_selector_marshaling() {
        let op = Operation::new(
            "last",
            OperationSpec::Last(SelectorOpSpec { use_row_time: true }),
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "last", "kind": "last", "spec": {"useRowTime": true}})
        );
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_filter_marshaling() {
        let op = Operation::new(
            "filter",
            OperationSpec::Filter(FilterOpSpec {
                expression: Expression::new(Node::binary(
                    Operator::Neq,
                    Node::Reference {
                        name: "_measurement".to_string(),
                        kind: Some("tag".to_string()),
                    },
                    Node::string("mem"),
                )),
            }),
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "filter",
                "kind": "filter",
                "spec": {
                    "expression": {
                        "root": {
                            "type": "binary",
                            "operator": "!=",
                            "left": {"type": "reference", "name": "_measurement", "kind": "tag"},
                            "right": {"type": "stringLiteral", "value": "mem"}
                        }
                    }
                }
            })
        );
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let ops = vec![
            from_op("from0").spec,
            OperationSpec::Range(RangeOpSpec {
                start: TimeSpec::Relative(Duration::hours(-1)),
                stop: TimeSpec::now(),
            }),
            OperationSpec::Filter(FilterOpSpec {
                expression: Expression::new(Node::binary(
                    Operator::Gt,
                    Node::reference("$"),
                    Node::float(5.0),
                )),
            }),
            OperationSpec::Group(GroupOpSpec {
                by: vec!["host".to_string()],
            }),
            OperationSpec::Window(WindowOpSpec {
                every: Duration::minutes(5),
                period: None,
                round: None,
                start: Some(TimeSpec::Absolute(Time(0))),
            }),
            OperationSpec::Limit(LimitOpSpec { n: 10, offset: 2 }),
            OperationSpec::First(SelectorOpSpec::default()),
            OperationSpec::Last(SelectorOpSpec { use_row_time: true }),
            OperationSpec::Min(SelectorOpSpec::default()),
            OperationSpec::Max(SelectorOpSpec::default()),
            OperationSpec::Sum {},
            OperationSpec::Count {},
            OperationSpec::Mean {},
            OperationSpec::Join(JoinOpSpec {
                on: vec!["host".to_string()],
            }),
        ];
        for spec in ops {
            let op = Operation {
                id: OperationId::new(format!("{}0", spec.kind())),
                spec,
            };
            let json = serde_json::to_string(&op).unwrap();
            let back: Operation = serde_json::from_str(&json).unwrap();
            assert_eq!(back, op, "round trip failed for {json}");
        }
    }

    #[test]
    fn test_validate_ok() {
        let spec = QuerySpec {
            operations: vec![
                from_op("from0"),
                Operation::new("last1", OperationSpec::Last(SelectorOpSpec::default())),
            ],
            edges: vec![Edge::new("from0", "last1")],
        };
        spec.validate().unwrap();
        assert_eq!(
            spec.topo_order().unwrap(),
            vec![OperationId::new("from0"), OperationId::new("last1")]
        );
    }

    #[test]
    fn test_validate_duplicate_id() {
        let spec = QuerySpec {
            operations: vec![from_op("from0"), from_op("from0")],
            edges: vec![],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_unknown_edge_endpoint() {
        let spec = QuerySpec {
            operations: vec![from_op("from0")],
            edges: vec![Edge::new("from0", "ghost")],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_cycle() {
        let spec = QuerySpec {
            operations: vec![
                from_op("from0"),
                Operation::new("limit1", OperationSpec::Limit(LimitOpSpec { n: 1, offset: 0 })),
                Operation::new("limit2", OperationSpec::Limit(LimitOpSpec { n: 1, offset: 0 })),
            ],
            edges: vec![
                Edge::new("from0", "limit1"),
                Edge::new("limit1", "limit2"),
                Edge::new("limit2", "limit1"),
            ],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_orphan_non_source() {
        let spec = QuerySpec {
            operations: vec![
                from_op("from0"),
                Operation::new("count1", OperationSpec::Count {}),
            ],
            edges: vec![],
        };
        assert!(spec.validate().is_err());
    }
}
