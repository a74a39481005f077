//! Logical planning: operation graph → procedure graph.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use common_error::RivuletResult;
use rivulet_core::QuerySpec;

use crate::procedure::{Procedure, ProcedureId, ProcedureSpec};

/// A logical plan: a near-isomorphic copy of the operation DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalPlanSpec {
    /// Procedures by id.
    pub procedures: HashMap<ProcedureId, Procedure>,
    /// Deterministic topological order.
    pub order: Vec<ProcedureId>,
}

impl LogicalPlanSpec {
    /// Look up a procedure.
    pub fn procedure(&self, id: ProcedureId) -> Option<&Procedure> {
        self.procedures.get(&id)
    }
}

/// Builds logical plans from validated query specs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalPlanner;

impl LogicalPlanner {
    /// Create a logical planner.
    pub fn new() -> Self {
        Self
    }

    /// Plan a query.
    pub fn plan(&self, query: &QuerySpec) -> RivuletResult<LogicalPlanSpec> {
        query.validate()?;

        let mut procedures = HashMap::with_capacity(query.operations.len());
        for op in &query.operations {
            let id = ProcedureId::from_operation(&op.id);
            procedures.insert(
                id,
                Procedure::new(id, ProcedureSpec::from_operation(&op.spec)),
            );
        }
        for edge in &query.edges {
            let parent = ProcedureId::from_operation(&edge.parent);
            let child = ProcedureId::from_operation(&edge.child);
            if let Some(p) = procedures.get_mut(&parent) {
                p.children.push(child);
            }
            if let Some(c) = procedures.get_mut(&child) {
                c.parents.push(parent);
            }
        }

        let order = query
            .topo_order()?
            .iter()
            .map(ProcedureId::from_operation)
            .collect();

        Ok(LogicalPlanSpec { procedures, order })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::query::{
        Edge, FromOpSpec, Operation, OperationId, OperationSpec, SelectorOpSpec,
    };

    #[test]
    fn test_plan_mirrors_operations() {
        let query = QuerySpec {
            operations: vec![
                Operation::new(
                    "from0",
                    OperationSpec::From(FromOpSpec {
                        database: "mydb".to_string(),
                    }),
                ),
                Operation::new("last1", OperationSpec::Last(SelectorOpSpec::default())),
            ],
            edges: vec![Edge::new("from0", "last1")],
        };
        let plan = LogicalPlanner::new().plan(&query).unwrap();

        let from_id = ProcedureId::from_operation(&OperationId::new("from0"));
        let last_id = ProcedureId::from_operation(&OperationId::new("last1"));
        assert_eq!(plan.order, vec![from_id, last_id]);

        let from = plan.procedure(from_id).unwrap();
        assert!(from.parents.is_empty());
        assert_eq!(from.children, vec![last_id]);

        let last = plan.procedure(last_id).unwrap();
        assert_eq!(last.parents, vec![from_id]);
        assert!(last.children.is_empty());
    }

    #[test]
    fn test_invalid_query_rejected() {
        let query = QuerySpec {
            operations: vec![],
            edges: vec![],
        };
        assert!(LogicalPlanner::new().plan(&query).is_err());
    }
}
