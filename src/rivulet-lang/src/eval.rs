//! Program evaluation: AST → operation graph.
//!
//! Evaluation walks the program statement by statement. Calling a registered
//! function starts a call chain anchored on the new operation; member calls
//! on a chain extend it, adding an edge from the chain's tail. When a chain
//! value is consumed (as a statement result or a declaration) its buffered
//! operations and edges are drained into the query spec exactly once.

use std::collections::HashMap;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::{
    Edge, Expression as CoreExpression, Node, Operation, OperationId, Operator, QuerySpec,
};

use crate::arguments::Arguments;
use crate::ast::{self, BinaryOperator, Declaration, Expression, LogicalOperator, Statement};
use crate::registry;
use crate::value::{Array, CallChain, Value, ValueKind};

/// Evaluate a program into a query spec.
pub fn evaluate(program: &ast::Program) -> RivuletResult<QuerySpec> {
    registry::ensure_builtins();
    let mut ev = Evaluator::default();
    ev.eval(program)?;
    let spec = ev.into_spec();
    spec.validate()?;
    Ok(spec)
}

/// Context handed to operation constructors.
///
/// Lets a constructor resolve named chains from the surrounding scope and
/// declare additional parent operations (e.g. `join` pulling in its tables).
pub struct EvalContext<'a> {
    scope: &'a HashMap<String, Value>,
    parents: Vec<OperationId>,
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(scope: &'a HashMap<String, Value>) -> Self {
        Self {
            scope,
            parents: Vec::new(),
        }
    }

    /// Resolve an identifier bound to a chain and return its tail operation.
    pub fn lookup_id_from_identifier(&self, ident: &str) -> RivuletResult<OperationId> {
        match self.scope.get(ident) {
            None => Err(RivuletError::evaluation(format!(
                "unknown identifier {ident:?}"
            ))),
            Some(Value::Chain(chain)) => Ok(chain.parent.clone()),
            Some(v) => Err(RivuletError::evaluation(format!(
                "identifier not a function chain {ident:?}, got {}",
                v.kind()
            ))),
        }
    }

    /// Declare an additional parent for the operation under construction.
    pub fn additional_parent(&mut self, id: OperationId) {
        if !self.parents.contains(&id) {
            self.parents.push(id);
        }
    }
}

#[derive(Default)]
struct Evaluator {
    id: usize,
    scope: HashMap<String, Value>,
    operations: Vec<Operation>,
    edges: Vec<Edge>,
}

impl Evaluator {
    fn eval(&mut self, program: &ast::Program) -> RivuletResult<()> {
        for stmt in &program.body {
            match stmt {
                Statement::VariableDeclaration(decls) => {
                    for decl in decls {
                        self.do_variable_declaration(decl)?;
                    }
                }
                Statement::Expression(expr) => {
                    let mut value = self.do_expression(expr)?;
                    if let Value::Chain(chain) = &mut value {
                        self.add_chain(chain);
                    }
                }
            }
        }
        Ok(())
    }

    fn into_spec(self) -> QuerySpec {
        QuerySpec {
            operations: self.operations,
            edges: self.edges,
        }
    }

    fn next_id(&mut self) -> usize {
        let id = self.id;
        self.id += 1;
        id
    }

    /// Drain a chain's buffered operations and edges into the query spec.
    /// The chain keeps its tail so later extensions still branch from it.
    fn add_chain(&mut self, chain: &mut CallChain) {
        self.operations.append(&mut chain.operations);
        self.edges.append(&mut chain.edges);
    }

    fn do_variable_declaration(&mut self, decl: &Declaration) -> RivuletResult<()> {
        let mut value = self.do_expression(&decl.init)?;
        if let Value::Chain(chain) = &mut value {
            self.add_chain(chain);
        }
        self.scope.insert(decl.id.clone(), value);
        Ok(())
    }

    fn do_expression(&mut self, expr: &Expression) -> RivuletResult<Value> {
        match expr {
            Expression::Identifier(name) => self.scope.get(name).cloned().ok_or_else(|| {
                RivuletError::evaluation(format!("undefined identifier {name:?}"))
            }),
            Expression::Call { .. } => {
                let chain = self.call_function(expr, None)?;
                Ok(Value::Chain(chain))
            }
            Expression::Binary { .. } => {
                let root = self.binary_operation(expr)?;
                Ok(Value::Expression(CoreExpression::new(root)))
            }
            Expression::Logical { .. } => {
                let root = self.binary_operation(expr)?;
                Ok(Value::Expression(CoreExpression::new(root)))
            }
            Expression::ArrowFunction { params, body } => {
                let value = self.do_expression(body)?;
                match value {
                    Value::Expression(mut e) => {
                        e.params = params.clone();
                        Ok(Value::Expression(e))
                    }
                    other => Err(RivuletError::evaluation(format!(
                        "arrow function body must be an expression, got {}",
                        other.kind()
                    ))),
                }
            }
            Expression::Array(elements) => self.do_array(elements),
            Expression::DateTime(t) => Ok(Value::Time(*t)),
            Expression::Duration(d) => Ok(Value::Duration(*d)),
            Expression::Number(f) => Ok(Value::Float(*f)),
            Expression::Integer(i) => Ok(Value::Int(*i)),
            Expression::String(s) => Ok(Value::String(s.clone())),
            Expression::Boolean(b) => Ok(Value::Bool(*b)),
            other => Err(RivuletError::evaluation(format!(
                "unsupported expression {other:?}"
            ))),
        }
    }

    fn do_array(&mut self, elements: &[Expression]) -> RivuletResult<Value> {
        let mut kind: Option<ValueKind> = None;
        let mut out = Vec::with_capacity(elements.len());
        for el in elements {
            let v = self.do_expression(el)?;
            match kind {
                None => kind = Some(v.kind()),
                Some(k) if k != v.kind() => {
                    return Err(RivuletError::evaluation(format!(
                        "cannot mix types in an array, found both {k} and {}",
                        v.kind()
                    )));
                }
                Some(_) => {}
            }
            out.push(v);
        }
        Ok(Value::Array(Array {
            kind: kind.unwrap_or(ValueKind::String),
            elements: out,
        }))
    }

    fn call_function(
        &mut self,
        call: &Expression,
        chain: Option<CallChain>,
    ) -> RivuletResult<CallChain> {
        let Expression::Call { callee, arguments } = call else {
            return Err(RivuletError::internal("call_function on non-call node"));
        };
        match callee.as_ref() {
            Expression::Identifier(name) => {
                let ctor = registry::lookup_function(name).ok_or_else(|| {
                    RivuletError::evaluation(format!("unknown function {name:?}"))
                })?;
                let (op, parents) = self.create_op(name, ctor, arguments)?;
                let parent = op.id.clone();
                let edges = parents
                    .into_iter()
                    .map(|p| Edge {
                        parent: p,
                        child: op.id.clone(),
                    })
                    .collect();
                Ok(CallChain {
                    parent,
                    operations: vec![op],
                    edges,
                })
            }
            Expression::Member { object, property } => {
                let mut chain = self.member_object(object, chain)?;
                let ctor = registry::lookup_method(property).ok_or_else(|| {
                    RivuletError::evaluation(format!("unknown method {property:?}"))
                })?;
                let (op, parents) = self.create_op(property, ctor, arguments)?;

                chain.edges.push(Edge {
                    parent: chain.parent.clone(),
                    child: op.id.clone(),
                });
                for p in parents {
                    if p != chain.parent {
                        chain.edges.push(Edge {
                            parent: p,
                            child: op.id.clone(),
                        });
                    }
                }
                chain.parent = op.id.clone();
                chain.operations.push(op);
                Ok(chain)
            }
            other => Err(RivuletError::evaluation(format!(
                "unsupported callee expression {other:?}"
            ))),
        }
    }

    fn member_object(
        &mut self,
        object: &Expression,
        chain: Option<CallChain>,
    ) -> RivuletResult<CallChain> {
        match object {
            Expression::Call { .. } => self.call_function(object, chain),
            Expression::Identifier(name) => match self.scope.get(name) {
                None => Err(RivuletError::evaluation(format!(
                    "undefined identifier {name:?}"
                ))),
                // Copy the chain: extending a stored chain must branch, not
                // alias the version in scope.
                Some(Value::Chain(stored)) => Ok(stored.clone()),
                Some(v) => Err(RivuletError::evaluation(format!(
                    "variable {name:?} is not a function chain, got {}",
                    v.kind()
                ))),
            },
            other => Err(RivuletError::evaluation(format!(
                "unsupported member expression object {other:?}"
            ))),
        }
    }

    fn create_op(
        &mut self,
        name: &str,
        ctor: registry::CreateOperationSpec,
        arguments: &[Expression],
    ) -> RivuletResult<(Operation, Vec<OperationId>)> {
        let id = OperationId::new(format!("{name}{}", self.next_id()));

        let params = match arguments {
            [] => HashMap::new(),
            [Expression::Object(props)] => self.resolve_parameters(props)?,
            _ => {
                return Err(RivuletError::evaluation(format!(
                    "arguments to {name:?} are not a valid object expression"
                )));
            }
        };

        let mut args = Arguments::new(params);
        let mut ctx = EvalContext::new(&self.scope);
        let spec = ctor(&mut args, &mut ctx).map_err(|e| {
            RivuletError::evaluation(format!("error calling {name:?}: {e}"))
        })?;

        let unused = args.list_unused();
        if !unused.is_empty() {
            return Err(RivuletError::evaluation(format!(
                "extra arguments provided: [{}]",
                unused.join(",")
            )));
        }

        Ok((Operation { id, spec }, ctx.parents))
    }

    fn resolve_parameters(
        &mut self,
        props: &[ast::Property],
    ) -> RivuletResult<HashMap<String, Value>> {
        let mut params = HashMap::with_capacity(props.len());
        for p in props {
            let value = self.do_expression(&p.value)?;
            if params.insert(p.key.clone(), value).is_some() {
                return Err(RivuletError::evaluation(format!(
                    "duplicate keyword parameter specified: {:?}",
                    p.key
                )));
            }
        }
        Ok(params)
    }

    fn binary_operation(&mut self, expr: &Expression) -> RivuletResult<Node> {
        match expr {
            Expression::Binary { .. } => self.binary_expression(expr),
            Expression::Logical { .. } => self.logical_expression(expr),
            other => Err(RivuletError::evaluation(format!(
                "expression expected to be relational or logical, got {other:?}"
            ))),
        }
    }

    fn binary_expression(&mut self, expr: &Expression) -> RivuletResult<Node> {
        let Expression::Binary {
            operator,
            left,
            right,
        } = expr
        else {
            return Err(RivuletError::internal("binary_expression on non-binary node"));
        };
        let lhs = self.primary_node(left)?;
        let rhs = self.primary_node(right)?;
        let is_regexp = lhs.is_regexp() || rhs.is_regexp();
        let op = expression_operator(*operator, is_regexp)?;
        Ok(Node::binary(op, lhs, rhs))
    }

    fn logical_expression(&mut self, expr: &Expression) -> RivuletResult<Node> {
        let Expression::Logical {
            operator,
            left,
            right,
        } = expr
        else {
            return Err(RivuletError::internal(
                "logical_expression on non-logical node",
            ));
        };
        let lhs = self.binary_operation(left)?;
        let rhs = self.binary_operation(right)?;
        let op = match operator {
            LogicalOperator::And => Operator::And,
            LogicalOperator::Or => Operator::Or,
        };
        Ok(Node::binary(op, lhs, rhs))
    }

    fn primary_node(&mut self, expr: &Expression) -> RivuletResult<Node> {
        match expr {
            Expression::Binary { .. } => self.binary_expression(expr),
            Expression::String(v) => Ok(Node::StringLiteral { value: v.clone() }),
            Expression::Boolean(v) => Ok(Node::BooleanLiteral { value: *v }),
            Expression::Number(v) => Ok(Node::FloatLiteral { value: *v }),
            Expression::Integer(v) => Ok(Node::IntegerLiteral { value: *v }),
            Expression::Duration(v) => Ok(Node::DurationLiteral { value: *v }),
            Expression::DateTime(v) => Ok(Node::TimeLiteral { value: *v }),
            Expression::Regexp(v) => Ok(Node::RegexpLiteral { value: v.clone() }),
            Expression::Identifier(name) => Ok(Node::Reference {
                name: name.clone(),
                kind: None,
            }),
            Expression::Member { object, property } => {
                let o = self.primary_node(object)?;
                Ok(Node::MemberReference {
                    object: Box::new(o),
                    property: property.clone(),
                })
            }
            other => Err(RivuletError::evaluation(format!(
                "unknown primary expression {other:?}"
            ))),
        }
    }
}

fn expression_operator(op: BinaryOperator, is_regexp: bool) -> RivuletResult<Operator> {
    Ok(match op {
        BinaryOperator::Equal => {
            if is_regexp {
                Operator::RegexpMatch
            } else {
                Operator::Eq
            }
        }
        BinaryOperator::NotEqual => {
            if is_regexp {
                Operator::RegexpNotMatch
            } else {
                Operator::Neq
            }
        }
        BinaryOperator::LessThan => Operator::Lt,
        BinaryOperator::LessThanEqual => Operator::Lte,
        BinaryOperator::GreaterThan => Operator::Gt,
        BinaryOperator::GreaterThanEqual => Operator::Gte,
        BinaryOperator::Addition => Operator::Add,
        BinaryOperator::Subtraction => Operator::Sub,
        BinaryOperator::Multiplication => Operator::Mul,
        BinaryOperator::Division => Operator::Div,
        BinaryOperator::StartsWith => Operator::StartsWith,
    })
}
