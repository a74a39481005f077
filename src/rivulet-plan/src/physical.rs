//! Physical planning: push-down rewrites with sub-plan duplication.
//!
//! Procedures that advertise a [`PushDownRule`] are fused into their storage
//! source in topological order. When a rewrite conflicts with one the source
//! has already absorbed, the source is duplicated for the conflicting branch;
//! the last colliding rewrite is the one that triggers duplication.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use common_error::{RivuletError, RivuletResult};
use rivulet_core::BoundsSpec;

use crate::logical::LogicalPlanSpec;
use crate::procedure::{Procedure, ProcedureId, ProcedureSpec, PushDownRule};

/// A physical plan, ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    /// Procedures by id.
    pub procedures: HashMap<ProcedureId, Procedure>,
    /// Topological order of the rewritten graph.
    pub order: Vec<ProcedureId>,
    /// Procedures whose output leaves the system, in first-seen order.
    pub results: Vec<ProcedureId>,
    /// The query-wide time window, still unresolved.
    pub bounds: BoundsSpec,
}

impl PlanSpec {
    /// Look up a procedure.
    pub fn procedure(&self, id: ProcedureId) -> Option<&Procedure> {
        self.procedures.get(&id)
    }
}

/// Applies push-down rewrites to a logical plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysicalPlanner;

impl PhysicalPlanner {
    /// Create a physical planner.
    pub fn new() -> Self {
        Self
    }

    /// Rewrite a logical plan into a physical plan.
    pub fn plan(&self, logical: &LogicalPlanSpec) -> RivuletResult<PlanSpec> {
        let mut procedures = logical.procedures.clone();
        let mut order = logical.order.clone();
        let mut bounds = BoundsSpec::default_window();

        for id in &logical.order {
            let id = *id;
            let Some(proc) = procedures.get(&id) else {
                // Already absorbed by an earlier rewrite.
                continue;
            };
            let Some(rule) = proc.spec.push_down_rule() else {
                continue;
            };
            let Some((root_id, path)) = find_push_down_path(&procedures, id, rule) else {
                continue;
            };

            if let ProcedureSpec::Range(range) = &procedures[&id].spec {
                bounds = range.bounds;
            }

            let spec = procedures[&id].spec.clone();
            let target = if spec.collides_with(&procedures[&root_id].spec) {
                duplicate_root(&mut procedures, &mut order, root_id, id, &path)
            } else {
                root_id
            };
            if let Some(t) = procedures.get_mut(&target) {
                spec.push_down(&mut t.spec);
            }
            splice_out(&mut procedures, &mut order, id);
        }

        for proc in procedures.values_mut() {
            if let ProcedureSpec::From(from) = &mut proc.spec {
                if !from.bounds_set {
                    from.bounds_set = true;
                    from.bounds = BoundsSpec::default_window();
                }
            }
        }

        let order = topo_sort(&procedures, &order)?;
        let results = order
            .iter()
            .copied()
            .filter(|id| procedures[id].children.is_empty())
            .collect();

        Ok(PlanSpec {
            procedures,
            order,
            results,
            bounds,
        })
    }
}

/// Walk ancestors of `id` looking for a procedure of the rule's root kind,
/// passing only through allowed single-child procedures. Returns the root id
/// and the intermediate path, nearest parent first.
fn find_push_down_path(
    procedures: &HashMap<ProcedureId, Procedure>,
    id: ProcedureId,
    rule: PushDownRule,
) -> Option<(ProcedureId, Vec<ProcedureId>)> {
    let mut path = Vec::new();
    let mut cur = id;
    loop {
        let proc = procedures.get(&cur)?;
        let [parent] = proc.parents.as_slice() else {
            return None;
        };
        let parent = *parent;
        let parent_proc = procedures.get(&parent)?;
        if parent_proc.spec.kind() == rule.root {
            return Some((parent, path));
        }
        if !rule.through.contains(&parent_proc.spec.kind()) {
            return None;
        }
        if parent_proc.children.len() != 1 {
            return None;
        }
        path.push(parent);
        cur = parent;
    }
}

/// Derive an unused duplicate id for `base`.
fn fresh_duplicate_id(
    procedures: &HashMap<ProcedureId, Procedure>,
    base: ProcedureId,
) -> ProcedureId {
    let mut id = base.for_duplicate();
    while procedures.contains_key(&id) {
        id = id.for_duplicate();
    }
    id
}

/// Deep-copy the root procedure for a conflicting branch and re-hang the
/// branch (the pushing procedure, or the top of its through-path) off the
/// copy. Returns the duplicate's id.
fn duplicate_root(
    procedures: &mut HashMap<ProcedureId, Procedure>,
    order: &mut Vec<ProcedureId>,
    root_id: ProcedureId,
    pushing_id: ProcedureId,
    path: &[ProcedureId],
) -> ProcedureId {
    let new_id = fresh_duplicate_id(procedures, root_id);
    let mut dup = procedures[&root_id].clone();
    dup.id = new_id;
    dup.children = Vec::new();

    for parent in dup.parents.clone() {
        if let Some(p) = procedures.get_mut(&parent) {
            p.children.push(new_id);
        }
    }

    let branch_top = path.last().copied().unwrap_or(pushing_id);
    if let Some(root) = procedures.get_mut(&root_id) {
        root.children.retain(|c| *c != branch_top);
    }
    dup.children.push(branch_top);
    if let Some(top) = procedures.get_mut(&branch_top) {
        for p in &mut top.parents {
            if *p == root_id {
                *p = new_id;
            }
        }
    }

    procedures.insert(new_id, dup);
    order.push(new_id);
    new_id
}

/// Remove an absorbed procedure, splicing its children onto its parents.
fn splice_out(
    procedures: &mut HashMap<ProcedureId, Procedure>,
    order: &mut Vec<ProcedureId>,
    id: ProcedureId,
) {
    let Some(proc) = procedures.remove(&id) else {
        return;
    };
    order.retain(|x| *x != id);

    for parent in &proc.parents {
        if let Some(p) = procedures.get_mut(parent) {
            if let Some(pos) = p.children.iter().position(|c| *c == id) {
                p.children.splice(pos..pos + 1, proc.children.iter().copied());
            }
        }
    }
    for child in &proc.children {
        if let Some(c) = procedures.get_mut(child) {
            if let Some(pos) = c.parents.iter().position(|x| *x == id) {
                c.parents.splice(pos..pos + 1, proc.parents.iter().copied());
            }
        }
    }
}

/// Fresh topological sort, seeded in the given order for determinism.
fn topo_sort(
    procedures: &HashMap<ProcedureId, Procedure>,
    seed: &[ProcedureId],
) -> RivuletResult<Vec<ProcedureId>> {
    let mut in_degree: HashMap<ProcedureId, usize> = procedures
        .iter()
        .map(|(id, proc)| (*id, proc.parents.len()))
        .collect();

    let mut queue: VecDeque<ProcedureId> = seed
        .iter()
        .filter(|id| in_degree.get(*id) == Some(&0))
        .copied()
        .collect();

    let mut out = Vec::with_capacity(procedures.len());
    while let Some(id) = queue.pop_front() {
        out.push(id);
        for child in &procedures[&id].children {
            if let Some(d) = in_degree.get_mut(child) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    if out.len() != procedures.len() {
        return Err(RivuletError::planning("procedure graph contains a cycle"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::LogicalPlanner;
    use crate::procedure::FromProcedureSpec;
    use rivulet_core::query::{
        Edge, FromOpSpec, Operation, OperationId, OperationSpec, SelectorOpSpec,
    };
    use rivulet_core::QuerySpec;

    fn plan_query(query: &QuerySpec) -> PlanSpec {
        let logical = LogicalPlanner::new().plan(query).unwrap();
        PhysicalPlanner::new().plan(&logical).unwrap()
    }

    #[test]
    fn test_last_push_down_single() {
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
        let plan = plan_query(&query);

        let from_id = ProcedureId::from_operation(&OperationId::new("from0"));
        assert_eq!(plan.procedures.len(), 1);
        assert_eq!(plan.order, vec![from_id]);
        assert_eq!(plan.results, vec![from_id]);
        assert_eq!(plan.bounds, BoundsSpec::default_window());

        let ProcedureSpec::From(from) = &plan.procedures[&from_id].spec else {
            panic!("expected from procedure");
        };
        let mut want = FromProcedureSpec::new("mydb");
        want.bounds_set = true;
        want.bounds = BoundsSpec::default_window();
        want.limit_set = true;
        want.points_limit = 1;
        want.descending_set = true;
        want.descending = true;
        assert_eq!(from, &want);
    }

    #[test]
    fn test_push_down_skipped_without_source() {
        // A limit whose only ancestor chain holds a non-through procedure
        // stays in the plan.
        let query = QuerySpec {
            operations: vec![
                Operation::new(
                    "from0",
                    OperationSpec::From(FromOpSpec {
                        database: "mydb".to_string(),
                    }),
                ),
                Operation::new("sum1", OperationSpec::Sum {}),
                Operation::new(
                    "limit2",
                    OperationSpec::Limit(rivulet_core::query::LimitOpSpec { n: 3, offset: 0 }),
                ),
            ],
            edges: vec![Edge::new("from0", "sum1"), Edge::new("sum1", "limit2")],
        };
        let plan = plan_query(&query);
        assert_eq!(plan.procedures.len(), 3);
        let limit_id = ProcedureId::from_operation(&OperationId::new("limit2"));
        assert!(plan.procedures.contains_key(&limit_id));
        assert_eq!(plan.results, vec![limit_id]);
    }
}
