//! Predicate expression trees.
//!
//! Arrow-function bodies and `filter` predicates are carried through the
//! system as typed trees. Nodes serialize internally tagged by `"type"` and
//! operators by their surface symbol, so specs survive a JSON round trip in
//! the shape the wire format expects.

use serde::{Deserialize, Serialize};

use crate::time::{Duration, Time};

/// Binary operator in a predicate expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// Equality (==).
    #[serde(rename = "==")]
    Eq,
    /// Inequality (!=).
    #[serde(rename = "!=")]
    Neq,
    /// Less than (<).
    #[serde(rename = "<")]
    Lt,
    /// Less than or equal (<=).
    #[serde(rename = "<=")]
    Lte,
    /// Greater than (>).
    #[serde(rename = ">")]
    Gt,
    /// Greater than or equal (>=).
    #[serde(rename = ">=")]
    Gte,
    /// Addition.
    #[serde(rename = "+")]
    Add,
    /// Subtraction.
    #[serde(rename = "-")]
    Sub,
    /// Multiplication.
    #[serde(rename = "*")]
    Mul,
    /// Division.
    #[serde(rename = "/")]
    Div,
    /// Logical AND.
    #[serde(rename = "and")]
    And,
    /// Logical OR.
    #[serde(rename = "or")]
    Or,
    /// Prefix match on strings.
    #[serde(rename = "startsWith")]
    StartsWith,
    /// Regular expression match (=~).
    #[serde(rename = "=~")]
    RegexpMatch,
    /// Regular expression non-match (!~).
    #[serde(rename = "!~")]
    RegexpNotMatch,
}

impl Operator {
    /// The surface symbol for display.
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::And => "and",
            Self::Or => "or",
            Self::StartsWith => "startsWith",
            Self::RegexpMatch => "=~",
            Self::RegexpNotMatch => "!~",
        }
    }

    /// Check if this is a comparison operator.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Neq | Self::Lt | Self::Lte | Self::Gt | Self::Gte
        )
    }

    /// Check if this is a logical operator.
    pub const fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    /// Check if this is an arithmetic operator.
    pub const fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div)
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A node in a predicate expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Node {
    /// Binary or logical operation.
    Binary {
        /// The operator.
        operator: Operator,
        /// Left operand.
        left: Box<Node>,
        /// Right operand.
        right: Box<Node>,
    },

    /// Reference to a name in the row scope (`$`, `_measurement`, ...).
    Reference {
        /// Referenced name.
        name: String,
        /// Optional reference kind hint (e.g. `"tag"`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },

    /// Property access on an object (`r._value`).
    MemberReference {
        /// The object node, typically a [`Node::Reference`] to an arrow
        /// function parameter.
        object: Box<Node>,
        /// Property name.
        property: String,
    },

    /// String literal.
    StringLiteral {
        /// Literal value.
        value: String,
    },

    /// Boolean literal.
    BooleanLiteral {
        /// Literal value.
        value: bool,
    },

    /// Integer literal.
    IntegerLiteral {
        /// Literal value.
        value: i64,
    },

    /// Floating point literal.
    FloatLiteral {
        /// Literal value.
        value: f64,
    },

    /// Time literal.
    TimeLiteral {
        /// Literal value.
        value: Time,
    },

    /// Duration literal.
    DurationLiteral {
        /// Literal value.
        value: Duration,
    },

    /// Regular expression literal, stored as its source pattern.
    RegexpLiteral {
        /// Pattern source.
        value: String,
    },
}

impl Node {
    /// Create a binary node.
    pub fn binary(operator: Operator, left: Node, right: Node) -> Node {
        Node::Binary {
            operator,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Create a reference node.
    pub fn reference(name: impl Into<String>) -> Node {
        Node::Reference {
            name: name.into(),
            kind: None,
        }
    }

    /// Create a member reference node.
    pub fn member(object: Node, property: impl Into<String>) -> Node {
        Node::MemberReference {
            object: Box::new(object),
            property: property.into(),
        }
    }

    /// Create a string literal node.
    pub fn string(value: impl Into<String>) -> Node {
        Node::StringLiteral {
            value: value.into(),
        }
    }

    /// Create a float literal node.
    pub fn float(value: f64) -> Node {
        Node::FloatLiteral { value }
    }

    /// Create an integer literal node.
    pub fn integer(value: i64) -> Node {
        Node::IntegerLiteral { value }
    }

    /// Whether this node is a regexp literal.
    pub const fn is_regexp(&self) -> bool {
        matches!(self, Node::RegexpLiteral { .. })
    }

    /// Visit this node and all descendants, depth first.
    pub fn visit(&self, f: &mut impl FnMut(&Node)) {
        f(self);
        if let Node::Binary { left, right, .. } = self {
            left.visit(f);
            right.visit(f);
        }
        if let Node::MemberReference { object, .. } = self {
            object.visit(f);
        }
    }
}

/// A complete predicate expression: a tree plus the arrow-function
/// parameter names captured at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    /// Root of the expression tree.
    pub root: Node,
    /// Arrow-function parameter names, empty for bare expressions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}

impl Expression {
    /// Create an expression with no parameters.
    pub fn new(root: Node) -> Self {
        Self {
            root,
            params: Vec::new(),
        }
    }

    /// Create an expression with parameters.
    pub fn with_params(root: Node, params: Vec<String>) -> Self {
        Self { root, params }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_symbols() {
        assert_eq!(Operator::Neq.symbol(), "!=");
        assert_eq!(Operator::RegexpMatch.symbol(), "=~");
        assert!(Operator::Gt.is_comparison());
        assert!(Operator::And.is_logical());
        assert!(Operator::Div.is_arithmetic());
    }

    #[test]
    fn test_node_json_shape() {
        let node = Node::binary(
            Operator::Neq,
            Node::Reference {
                name: "_measurement".to_string(),
                kind: Some("tag".to_string()),
            },
            Node::string("mem"),
        );
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "binary",
                "operator": "!=",
                "left": {"type": "reference", "name": "_measurement", "kind": "tag"},
                "right": {"type": "stringLiteral", "value": "mem"}
            })
        );
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_visit_collects_references() {
        let node = Node::binary(
            Operator::And,
            Node::binary(Operator::Gt, Node::reference("$"), Node::float(5.0)),
            Node::binary(Operator::Eq, Node::reference("t1"), Node::string("a")),
        );
        let mut names = Vec::new();
        node.visit(&mut |n| {
            if let Node::Reference { name, .. } = n {
                names.push(name.clone());
            }
        });
        assert_eq!(names, vec!["$", "t1"]);
    }
}
