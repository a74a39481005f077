//! Filter expression compilation.
//!
//! An arrow-function body is compiled once per value-column kind into a
//! closure-free tree with every reference resolved to a concrete type.
//! `_value` (or the bare `$` reference) binds to the block's value column;
//! every other reference defaults to string, matching tag columns. This
//! keeps per-row evaluation cheap: no type dispatch happens after a block's
//! value kind selects its compiled expression.

use std::collections::HashMap;

use regex::Regex;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::{DataType, Expression, Node, Operator, Value};

/// A `(object, property)` pair referenced by an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectProperty {
    /// The arrow-function parameter the property is read from.
    pub object: String,
    /// Property name.
    pub property: String,
}

impl ObjectProperty {
    /// Create an object property.
    pub fn new(object: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            property: property.into(),
        }
    }

    /// Whether this property refers to the block's value column.
    pub fn is_value(&self) -> bool {
        self.property == "_value" || self.property == "$"
    }
}

/// Runtime scope: concrete values per referenced property.
pub type Scope = HashMap<ObjectProperty, Value>;

/// Collect every property an expression references, in first-seen order.
/// Bare references are attributed to the expression's parameter.
pub fn object_properties(expr: &Expression) -> Vec<ObjectProperty> {
    let param = expr.params.first().cloned().unwrap_or_default();
    let mut out = Vec::new();
    collect_properties(&expr.root, &param, &mut out);
    out
}

fn collect_properties(node: &Node, param: &str, out: &mut Vec<ObjectProperty>) {
    match node {
        Node::Binary { left, right, .. } => {
            collect_properties(left, param, out);
            collect_properties(right, param, out);
        }
        Node::MemberReference { object, property } => {
            if let Node::Reference { name, .. } = object.as_ref() {
                let prop = ObjectProperty::new(name.clone(), property.clone());
                if !out.contains(&prop) {
                    out.push(prop);
                }
            }
        }
        Node::Reference { name, .. } => {
            let prop = ObjectProperty::new(param, name.clone());
            if !out.contains(&prop) {
                out.push(prop);
            }
        }
        _ => {}
    }
}

/// Internal type of a compiled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompiledType {
    Data(DataType),
    Regex,
}

impl CompiledType {
    fn name(self) -> &'static str {
        match self {
            Self::Data(dt) => dt.name(),
            Self::Regex => "regexp",
        }
    }
}

#[derive(Debug, Clone)]
enum CompiledNode {
    Lit(Value),
    Regexp(Regex),
    Ref {
        prop: ObjectProperty,
        dt: DataType,
    },
    Binary {
        op: Operator,
        left: Box<CompiledNode>,
        right: Box<CompiledNode>,
    },
}

/// A predicate compiled against one assignment of reference types.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    root: CompiledNode,
    dt: DataType,
}

impl CompiledExpression {
    /// The expression's result type.
    pub fn data_type(&self) -> DataType {
        self.dt
    }

    /// Evaluate against a scope.
    pub fn eval(&self, scope: &Scope) -> RivuletResult<Value> {
        eval_node(&self.root, scope)
    }

    /// Evaluate and require a boolean result.
    pub fn eval_bool(&self, scope: &Scope) -> RivuletResult<bool> {
        match self.eval(scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(RivuletError::execution(format!(
                "expression evaluated to {}, not bool",
                other.type_name()
            ))),
        }
    }
}

/// Compile an expression given concrete types for its references.
/// References absent from `types` default to string.
pub fn compile(
    expr: &Expression,
    types: &HashMap<ObjectProperty, DataType>,
) -> RivuletResult<CompiledExpression> {
    let param = expr.params.first().cloned().unwrap_or_default();
    let (root, typ) = compile_node(&expr.root, types, &param)?;
    match typ {
        CompiledType::Data(dt) => Ok(CompiledExpression { root, dt }),
        CompiledType::Regex => Err(RivuletError::compilation(
            "a bare regular expression is not a predicate",
        )),
    }
}

fn compile_node(
    node: &Node,
    types: &HashMap<ObjectProperty, DataType>,
    param: &str,
) -> RivuletResult<(CompiledNode, CompiledType)> {
    match node {
        Node::BooleanLiteral { value } => Ok((
            CompiledNode::Lit(Value::Bool(*value)),
            CompiledType::Data(DataType::Bool),
        )),
        Node::IntegerLiteral { value } => Ok((
            CompiledNode::Lit(Value::Int(*value)),
            CompiledType::Data(DataType::Int),
        )),
        Node::FloatLiteral { value } => Ok((
            CompiledNode::Lit(Value::Float(*value)),
            CompiledType::Data(DataType::Float),
        )),
        Node::StringLiteral { value } => Ok((
            CompiledNode::Lit(Value::String(value.clone())),
            CompiledType::Data(DataType::String),
        )),
        Node::TimeLiteral { value } => Ok((
            CompiledNode::Lit(Value::Time(*value)),
            CompiledType::Data(DataType::Time),
        )),
        Node::DurationLiteral { value } => Ok((
            CompiledNode::Lit(Value::Int(value.nanos())),
            CompiledType::Data(DataType::Int),
        )),
        Node::RegexpLiteral { value } => {
            let re = Regex::new(value).map_err(|e| {
                RivuletError::compilation(format!("invalid regular expression {value:?}: {e}"))
            })?;
            Ok((CompiledNode::Regexp(re), CompiledType::Regex))
        }
        Node::Reference { name, .. } => {
            let prop = ObjectProperty::new(param, name.clone());
            let dt = types.get(&prop).copied().unwrap_or(DataType::String);
            Ok((CompiledNode::Ref { prop, dt }, CompiledType::Data(dt)))
        }
        Node::MemberReference { object, property } => {
            let Node::Reference { name, .. } = object.as_ref() else {
                return Err(RivuletError::compilation(
                    "member access must read a parameter property",
                ));
            };
            let prop = ObjectProperty::new(name.clone(), property.clone());
            let dt = types.get(&prop).copied().unwrap_or(DataType::String);
            Ok((CompiledNode::Ref { prop, dt }, CompiledType::Data(dt)))
        }
        Node::Binary {
            operator,
            left,
            right,
        } => {
            let (l, lt) = compile_node(left, types, param)?;
            let (r, rt) = compile_node(right, types, param)?;
            let typ = binary_type(*operator, lt, rt)?;
            Ok((
                CompiledNode::Binary {
                    op: *operator,
                    left: Box::new(l),
                    right: Box::new(r),
                },
                typ,
            ))
        }
    }
}

fn is_numeric(dt: DataType) -> bool {
    matches!(dt, DataType::Int | DataType::UInt | DataType::Float)
}

fn binary_type(
    op: Operator,
    lt: CompiledType,
    rt: CompiledType,
) -> RivuletResult<CompiledType> {
    use CompiledType::{Data, Regex as RegexType};

    let mismatch = || {
        Err(RivuletError::compilation(format!(
            "operator {op} is not defined for {} and {}",
            lt.name(),
            rt.name()
        )))
    };

    match op {
        Operator::And | Operator::Or => match (lt, rt) {
            (Data(DataType::Bool), Data(DataType::Bool)) => Ok(Data(DataType::Bool)),
            _ => mismatch(),
        },
        Operator::RegexpMatch | Operator::RegexpNotMatch => match (lt, rt) {
            (Data(DataType::String), RegexType) | (RegexType, Data(DataType::String)) => {
                Ok(Data(DataType::Bool))
            }
            _ => mismatch(),
        },
        Operator::StartsWith => match (lt, rt) {
            (Data(DataType::String), Data(DataType::String)) => Ok(Data(DataType::Bool)),
            _ => mismatch(),
        },
        Operator::Eq | Operator::Neq | Operator::Lt | Operator::Lte | Operator::Gt
        | Operator::Gte => match (lt, rt) {
            (Data(l), Data(r)) if is_numeric(l) && is_numeric(r) => Ok(Data(DataType::Bool)),
            (Data(DataType::String), Data(DataType::String))
            | (Data(DataType::Time), Data(DataType::Time)) => Ok(Data(DataType::Bool)),
            (Data(DataType::Bool), Data(DataType::Bool))
                if matches!(op, Operator::Eq | Operator::Neq) =>
            {
                Ok(Data(DataType::Bool))
            }
            _ => mismatch(),
        },
        Operator::Add | Operator::Sub | Operator::Mul | Operator::Div => match (lt, rt) {
            (Data(l), Data(r)) if l == r && is_numeric(l) => Ok(Data(l)),
            (Data(l), Data(r)) if is_numeric(l) && is_numeric(r) => Ok(Data(DataType::Float)),
            _ => mismatch(),
        },
    }
}

fn eval_node(node: &CompiledNode, scope: &Scope) -> RivuletResult<Value> {
    match node {
        CompiledNode::Lit(v) => Ok(v.clone()),
        CompiledNode::Regexp(_) => Err(RivuletError::execution(
            "regular expressions are not values",
        )),
        CompiledNode::Ref { prop, .. } => scope.get(prop).cloned().ok_or_else(|| {
            RivuletError::execution(format!(
                "no value for {}.{} in scope",
                prop.object, prop.property
            ))
        }),
        CompiledNode::Binary { op, left, right } => eval_binary(*op, left, right, scope),
    }
}

fn eval_binary(
    op: Operator,
    left: &CompiledNode,
    right: &CompiledNode,
    scope: &Scope,
) -> RivuletResult<Value> {
    // Regex matches read the pattern from the literal side.
    if matches!(op, Operator::RegexpMatch | Operator::RegexpNotMatch) {
        let (re, operand) = match (left, right) {
            (CompiledNode::Regexp(re), other) | (other, CompiledNode::Regexp(re)) => (re, other),
            _ => {
                return Err(RivuletError::execution(
                    "regexp match without a regexp literal",
                ))
            }
        };
        let value = eval_node(operand, scope)?;
        let Value::String(s) = value else {
            return Err(RivuletError::execution(format!(
                "regexp match against {}",
                value.type_name()
            )));
        };
        let matched = re.is_match(&s);
        return Ok(Value::Bool(if op == Operator::RegexpMatch {
            matched
        } else {
            !matched
        }));
    }

    let l = eval_node(left, scope)?;
    let r = eval_node(right, scope)?;

    match op {
        Operator::And | Operator::Or => {
            let (Value::Bool(a), Value::Bool(b)) = (&l, &r) else {
                return Err(type_error(op, &l, &r));
            };
            Ok(Value::Bool(if op == Operator::And {
                *a && *b
            } else {
                *a || *b
            }))
        }
        Operator::StartsWith => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::Bool(a.starts_with(b.as_str()))),
            _ => Err(type_error(op, &l, &r)),
        },
        Operator::Eq | Operator::Neq | Operator::Lt | Operator::Lte | Operator::Gt
        | Operator::Gte => compare(op, &l, &r),
        Operator::Add | Operator::Sub | Operator::Mul | Operator::Div => arithmetic(op, &l, &r),
        Operator::RegexpMatch | Operator::RegexpNotMatch => unreachable!("handled above"),
    }
}

fn type_error(op: Operator, l: &Value, r: &Value) -> RivuletError {
    RivuletError::execution(format!(
        "operator {op} is not defined for {} and {}",
        l.type_name(),
        r.type_name()
    ))
}

fn compare(op: Operator, l: &Value, r: &Value) -> RivuletResult<Value> {
    use std::cmp::Ordering;

    let ord = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::UInt(a), Value::UInt(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => a.partial_cmp(b),
        (Value::Time(a), Value::Time(b)) => a.partial_cmp(b),
        (Value::Bool(a), Value::Bool(b)) if matches!(op, Operator::Eq | Operator::Neq) => {
            Some(if a == b {
                Ordering::Equal
            } else {
                Ordering::Less
            })
        }
        _ => {
            // Mixed numeric comparison promotes to float.
            match (l.as_float(), r.as_float()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => return Err(type_error(op, l, r)),
            }
        }
    };
    let Some(ord) = ord else {
        // NaN comparisons select no rows.
        return Ok(Value::Bool(matches!(op, Operator::Neq)));
    };
    let result = match op {
        Operator::Eq => ord == Ordering::Equal,
        Operator::Neq => ord != Ordering::Equal,
        Operator::Lt => ord == Ordering::Less,
        Operator::Lte => ord != Ordering::Greater,
        Operator::Gt => ord == Ordering::Greater,
        Operator::Gte => ord != Ordering::Less,
        _ => unreachable!("compare called with non-comparison operator"),
    };
    Ok(Value::Bool(result))
}

fn arithmetic(op: Operator, l: &Value, r: &Value) -> RivuletResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 && op == Operator::Div {
                return Err(RivuletError::execution("integer division by zero"));
            }
            Ok(Value::Int(match op {
                Operator::Add => a.wrapping_add(*b),
                Operator::Sub => a.wrapping_sub(*b),
                Operator::Mul => a.wrapping_mul(*b),
                Operator::Div => a.wrapping_div(*b),
                _ => unreachable!("arithmetic called with non-arithmetic operator"),
            }))
        }
        (Value::UInt(a), Value::UInt(b)) => {
            if *b == 0 && op == Operator::Div {
                return Err(RivuletError::execution("integer division by zero"));
            }
            Ok(Value::UInt(match op {
                Operator::Add => a.wrapping_add(*b),
                Operator::Sub => a.wrapping_sub(*b),
                Operator::Mul => a.wrapping_mul(*b),
                Operator::Div => a.wrapping_div(*b),
                _ => unreachable!("arithmetic called with non-arithmetic operator"),
            }))
        }
        _ => match (l.as_float(), r.as_float()) {
            (Some(a), Some(b)) => Ok(Value::Float(match op {
                Operator::Add => a + b,
                Operator::Sub => a - b,
                Operator::Mul => a * b,
                Operator::Div => a / b,
                _ => unreachable!("arithmetic called with non-arithmetic operator"),
            })),
            _ => Err(type_error(op, l, r)),
        },
    }
}

/// Compile an expression once per value-column kind, assigning `dt` to the
/// value property and string to every other reference. The result maps each
/// kind to its compiled predicate or the error to report when a block of
/// that kind arrives.
pub fn compile_per_kind(
    expr: &Expression,
) -> HashMap<DataType, Result<CompiledExpression, RivuletError>> {
    let properties = object_properties(expr);
    let mut out = HashMap::new();
    for dt in rivulet_core::VALUE_DATA_TYPES {
        let mut types = HashMap::new();
        for prop in &properties {
            let t = if prop.is_value() { dt } else { DataType::String };
            types.insert(prop.clone(), t);
        }
        let compiled = compile(expr, &types).and_then(|ce| {
            if ce.data_type() == DataType::Bool {
                Ok(ce)
            } else {
                Err(RivuletError::compilation(
                    "expression does not evaluate to boolean",
                ))
            }
        });
        out.insert(dt, compiled);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_ref() -> Node {
        Node::reference("$")
    }

    #[test]
    fn test_simple_comparison() {
        let expr = Expression::new(Node::binary(Operator::Gt, value_ref(), Node::float(5.0)));
        let mut types = HashMap::new();
        types.insert(ObjectProperty::new("", "$"), DataType::Float);
        let ce = compile(&expr, &types).unwrap();
        assert_eq!(ce.data_type(), DataType::Bool);

        let mut scope = Scope::new();
        scope.insert(ObjectProperty::new("", "$"), Value::Float(6.0));
        assert!(ce.eval_bool(&scope).unwrap());
        scope.insert(ObjectProperty::new("", "$"), Value::Float(4.0));
        assert!(!ce.eval_bool(&scope).unwrap());
    }

    #[test]
    fn test_string_column_rejects_numeric_comparison() {
        let expr = Expression::new(Node::binary(Operator::Gt, value_ref(), Node::float(5.0)));
        let mut types = HashMap::new();
        types.insert(ObjectProperty::new("", "$"), DataType::String);
        let err = compile(&expr, &types).unwrap_err();
        assert!(matches!(err, RivuletError::CompilationError(_)));
    }

    #[test]
    fn test_compile_per_kind_reports_type_errors() {
        let expr = Expression::new(Node::binary(Operator::Gt, value_ref(), Node::float(5.0)));
        let compiled = compile_per_kind(&expr);
        assert!(compiled[&DataType::Float].is_ok());
        assert!(compiled[&DataType::Int].is_ok());
        assert!(compiled[&DataType::String].is_err());
        assert!(compiled[&DataType::Bool].is_err());
    }

    #[test]
    fn test_compound_predicate() {
        // $>5 and t1 == "a"
        let expr = Expression::new(Node::binary(
            Operator::And,
            Node::binary(Operator::Gt, value_ref(), Node::float(5.0)),
            Node::binary(Operator::Eq, Node::reference("t1"), Node::string("a")),
        ));
        let compiled = compile_per_kind(&expr);
        let ce = compiled[&DataType::Float].as_ref().unwrap();

        let mut scope = Scope::new();
        scope.insert(ObjectProperty::new("", "$"), Value::Float(8.0));
        scope.insert(
            ObjectProperty::new("", "t1"),
            Value::String("a".to_string()),
        );
        assert!(ce.eval_bool(&scope).unwrap());

        scope.insert(
            ObjectProperty::new("", "t1"),
            Value::String("b".to_string()),
        );
        assert!(!ce.eval_bool(&scope).unwrap());
    }

    #[test]
    fn test_member_reference_properties() {
        let expr = Expression::with_params(
            Node::binary(
                Operator::Neq,
                Node::member(Node::reference("r"), "_measurement"),
                Node::string("mem"),
            ),
            vec!["r".to_string()],
        );
        assert_eq!(
            object_properties(&expr),
            vec![ObjectProperty::new("r", "_measurement")]
        );

        let ce = compile(&expr, &HashMap::new()).unwrap();
        let mut scope = Scope::new();
        scope.insert(
            ObjectProperty::new("r", "_measurement"),
            Value::String("cpu".to_string()),
        );
        assert!(ce.eval_bool(&scope).unwrap());
    }

    #[test]
    fn test_regexp_match() {
        let expr = Expression::new(Node::binary(
            Operator::RegexpMatch,
            Node::reference("host"),
            Node::RegexpLiteral {
                value: "^web-".to_string(),
            },
        ));
        let ce = compile(&expr, &HashMap::new()).unwrap();

        let mut scope = Scope::new();
        scope.insert(
            ObjectProperty::new("", "host"),
            Value::String("web-01".to_string()),
        );
        assert!(ce.eval_bool(&scope).unwrap());
        scope.insert(
            ObjectProperty::new("", "host"),
            Value::String("db-01".to_string()),
        );
        assert!(!ce.eval_bool(&scope).unwrap());
    }

    #[test]
    fn test_mixed_numeric_promotion() {
        let expr = Expression::new(Node::binary(Operator::Gt, value_ref(), Node::integer(5)));
        let mut types = HashMap::new();
        types.insert(ObjectProperty::new("", "$"), DataType::Float);
        let ce = compile(&expr, &types).unwrap();
        let mut scope = Scope::new();
        scope.insert(ObjectProperty::new("", "$"), Value::Float(5.5));
        assert!(ce.eval_bool(&scope).unwrap());
    }

    #[test]
    fn test_division_by_zero_is_runtime_error() {
        let expr = Expression::new(Node::binary(
            Operator::Eq,
            Node::binary(Operator::Div, Node::integer(4), Node::integer(0)),
            Node::integer(1),
        ));
        let ce = compile(&expr, &HashMap::new()).unwrap();
        assert!(ce.eval_bool(&Scope::new()).is_err());
    }
}
