//! Builtin operation constructors.
//!
//! Each constructor reads its keyword arguments through [`Arguments`] and
//! produces the matching [`OperationSpec`] variant. Registration happens
//! once at startup via [`crate::registry::ensure_builtins`].

use common_error::{RivuletError, RivuletResult};
use rivulet_core::query::{
    FilterOpSpec, FromOpSpec, GroupOpSpec, JoinOpSpec, LimitOpSpec, RangeOpSpec, SelectorOpSpec,
    WindowOpSpec,
};
use rivulet_core::{OperationSpec, TimeSpec};

use crate::arguments::Arguments;
use crate::eval::EvalContext;
use crate::registry::{register_function, register_method};
use crate::value::{Value, ValueKind};

pub(crate) fn register_all() {
    register_function("from", create_from);
    register_function("join", create_join);

    register_method("range", create_range);
    register_method("filter", create_filter);
    register_method("group", create_group);
    register_method("window", create_window);
    register_method("limit", create_limit);
    register_method("first", create_first);
    register_method("last", create_last);
    register_method("min", create_min);
    register_method("max", create_max);
    register_method("sum", create_sum);
    register_method("count", create_count);
    register_method("mean", create_mean);
}

fn create_from(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    let database = args.get_required_string("db")?;
    Ok(OperationSpec::From(FromOpSpec { database }))
}

fn create_range(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    let start = args.get_required_time("start")?;
    let stop = args.get_time("stop")?.unwrap_or(TimeSpec::now());
    Ok(OperationSpec::Range(RangeOpSpec { start, stop }))
}

fn create_filter(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    let expression = args.get_required_expression("f")?;
    if expression.params.len() != 1 {
        return Err(RivuletError::evaluation(format!(
            "filter functions should have a single parameter, got {:?}",
            expression.params
        )));
    }
    Ok(OperationSpec::Filter(FilterOpSpec { expression }))
}

fn create_group(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    let by = args.get_required_array("by", ValueKind::String)?;
    let by = by
        .elements
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            _ => unreachable!("array kind checked"),
        })
        .collect();
    Ok(OperationSpec::Group(GroupOpSpec { by }))
}

fn create_window(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    let every = args.get_required_duration("every")?;
    let period = args.get_duration("period")?;
    let round = args.get_duration("round")?;
    let start = args.get_time("start")?;
    Ok(OperationSpec::Window(WindowOpSpec {
        every,
        period,
        round,
        start,
    }))
}

fn create_limit(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    let n = args.get_required_int("n")?;
    let offset = args.get_int("offset")?.unwrap_or(0);
    Ok(OperationSpec::Limit(LimitOpSpec { n, offset }))
}

fn selector_spec(args: &mut Arguments) -> RivuletResult<SelectorOpSpec> {
    let use_row_time = args.get_bool("useRowTime")?.unwrap_or(false);
    Ok(SelectorOpSpec { use_row_time })
}

fn create_first(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    Ok(OperationSpec::First(selector_spec(args)?))
}

fn create_last(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    Ok(OperationSpec::Last(selector_spec(args)?))
}

fn create_min(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    Ok(OperationSpec::Min(selector_spec(args)?))
}

fn create_max(args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    Ok(OperationSpec::Max(selector_spec(args)?))
}

fn create_sum(_args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    Ok(OperationSpec::Sum {})
}

fn create_count(_args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    Ok(OperationSpec::Count {})
}

fn create_mean(_args: &mut Arguments, _ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    Ok(OperationSpec::Mean {})
}

fn create_join(args: &mut Arguments, ctx: &mut EvalContext<'_>) -> RivuletResult<OperationSpec> {
    let tables = args.get_required_array("tables", ValueKind::Chain)?;
    if tables.elements.len() < 2 {
        return Err(RivuletError::evaluation(
            "join requires at least two tables",
        ));
    }
    for table in tables.elements {
        match table {
            Value::Chain(chain) => ctx.additional_parent(chain.parent),
            _ => unreachable!("array kind checked"),
        }
    }

    let on = match args.get_array("on", ValueKind::String)? {
        None => Vec::new(),
        Some(arr) => arr
            .elements
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                _ => unreachable!("array kind checked"),
            })
            .collect(),
    };
    Ok(OperationSpec::Join(JoinOpSpec { on }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{prop, Declaration, Expression, Program, Statement};
    use crate::eval::evaluate;
    use rivulet_core::{Duration, Edge};

    #[test]
    fn test_from_requires_db() {
        let program = Program::new(vec![Statement::Expression(Expression::call(
            Expression::ident("from"),
            vec![],
        ))]);
        let err = evaluate(&program).unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keyword argument \"db\""));
    }

    #[test]
    fn test_range_stop_defaults_to_now() {
        let program = Program::new(vec![Statement::Expression(Expression::method(
            Expression::call(
                Expression::ident("from"),
                vec![prop("db", Expression::String("mydb".to_string()))],
            ),
            "range",
            vec![prop("start", Expression::Duration(Duration::hours(-1)))],
        ))]);
        let spec = evaluate(&program).unwrap();
        match &spec.operations[1].spec {
            OperationSpec::Range(r) => {
                assert_eq!(r.start, TimeSpec::Relative(Duration::hours(-1)));
                assert_eq!(r.stop, TimeSpec::now());
            }
            other => panic!("expected range, got {other:?}"),
        }
    }

    #[test]
    fn test_join_adds_parents() {
        // a = from(db:"a"); b = from(db:"b"); join(tables:[a,b], on:["host"])
        let program = Program::new(vec![
            Statement::VariableDeclaration(vec![Declaration {
                id: "a".to_string(),
                init: Expression::call(
                    Expression::ident("from"),
                    vec![prop("db", Expression::String("a".to_string()))],
                ),
            }]),
            Statement::VariableDeclaration(vec![Declaration {
                id: "b".to_string(),
                init: Expression::call(
                    Expression::ident("from"),
                    vec![prop("db", Expression::String("b".to_string()))],
                ),
            }]),
            Statement::Expression(Expression::call(
                Expression::ident("join"),
                vec![
                    prop(
                        "tables",
                        Expression::Array(vec![Expression::ident("a"), Expression::ident("b")]),
                    ),
                    prop(
                        "on",
                        Expression::Array(vec![Expression::String("host".to_string())]),
                    ),
                ],
            )),
        ]);
        let spec = evaluate(&program).unwrap();
        let ids: Vec<&str> = spec.operations.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["from0", "from1", "join2"]);
        assert_eq!(
            spec.edges,
            vec![Edge::new("from0", "join2"), Edge::new("from1", "join2")]
        );
    }

    #[test]
    fn test_filter_requires_single_param() {
        use crate::ast::BinaryOperator;
        let body = Expression::binary(
            BinaryOperator::GreaterThan,
            Expression::ident("x"),
            Expression::Number(5.0),
        );
        let program = Program::new(vec![Statement::Expression(Expression::method(
            Expression::call(
                Expression::ident("from"),
                vec![prop("db", Expression::String("mydb".to_string()))],
            ),
            "filter",
            vec![prop("f", Expression::arrow(vec!["r", "s"], body))],
        ))]);
        let err = evaluate(&program).unwrap_err();
        assert!(err.to_string().contains("single parameter"));
    }
}
