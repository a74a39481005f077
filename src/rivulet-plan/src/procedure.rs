//! Procedures: the planner-level mirror of operations.
//!
//! A [`Procedure`] wraps a [`ProcedureSpec`] together with its graph
//! pointers. Procedure ids are derived deterministically from operation ids
//! so plans are stable across runs; duplicates derive a fresh id from the
//! original's.

use serde::{Deserialize, Serialize};

use rivulet_core::query::{GroupOpSpec, JoinOpSpec, LimitOpSpec, SelectorOpSpec, WindowOpSpec};
use rivulet_core::{BoundsSpec, Duration, Expression, OperationId, OperationSpec, TimeSpec};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic procedure identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProcedureId(pub u64);

impl ProcedureId {
    /// Derive the procedure id for an operation.
    pub fn from_operation(id: &OperationId) -> Self {
        Self(fnv1a(id.as_str().as_bytes()))
    }

    /// Derive the id used when this procedure is duplicated.
    pub fn for_duplicate(self) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&self.0.to_le_bytes());
        bytes[8..].copy_from_slice(b"/dup");
        Self(fnv1a(&bytes))
    }
}

impl std::fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The kind of a procedure, used by push-down rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcedureKind {
    /// Storage source.
    From,
    /// Time range restriction.
    Range,
    /// Predicate filter.
    Filter,
    /// Regroup by tag keys.
    Group,
    /// Windowing.
    Window,
    /// Row count limit.
    Limit,
    /// First-row selector.
    First,
    /// Last-row selector.
    Last,
    /// Minimum-row selector.
    Min,
    /// Maximum-row selector.
    Max,
    /// Sum aggregate.
    Sum,
    /// Count aggregate.
    Count,
    /// Mean aggregate.
    Mean,
    /// Join on time and tag keys.
    Join,
}

impl std::fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::From => "from",
            Self::Range => "range",
            Self::Filter => "filter",
            Self::Group => "group",
            Self::Window => "window",
            Self::Limit => "limit",
            Self::First => "first",
            Self::Last => "last",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Mean => "mean",
            Self::Join => "join",
        };
        write!(f, "{name}")
    }
}

/// Physical spec of the storage source, carrying the flags push-down
/// rewrites absorb into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromProcedureSpec {
    /// Database to read from.
    pub database: String,

    /// Whether bounds were absorbed.
    pub bounds_set: bool,
    /// Absorbed bounds.
    pub bounds: BoundsSpec,

    /// Whether a filter predicate was absorbed.
    pub filter_set: bool,
    /// Absorbed predicate.
    pub filter: Option<Expression>,

    /// Whether a point limit was absorbed.
    pub limit_set: bool,
    /// Absorbed per-series point limit.
    pub points_limit: i64,
    /// Absorbed row offset.
    pub offset: i64,

    /// Whether a read direction was absorbed.
    pub descending_set: bool,
    /// Absorbed read direction.
    pub descending: bool,
}

impl FromProcedureSpec {
    /// Create the physical source spec for a database.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            bounds_set: false,
            bounds: BoundsSpec::default_window(),
            filter_set: false,
            filter: None,
            limit_set: false,
            points_limit: 0,
            offset: 0,
            descending_set: false,
            descending: false,
        }
    }
}

/// Physical spec of `range`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeProcedureSpec {
    /// The requested bounds, still unresolved.
    pub bounds: BoundsSpec,
}

/// Physical spec of `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterProcedureSpec {
    /// The predicate arrow function.
    pub expression: Expression,
}

/// Physical spec of `window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowProcedureSpec {
    /// Window stride.
    pub every: Duration,
    /// Window length.
    pub period: Duration,
    /// Rounding applied to boundaries.
    pub round: Duration,
    /// Alignment origin; `None` aligns to the resolved query start.
    pub start: Option<TimeSpec>,
}

/// The spec of a single procedure, keyed by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "camelCase")]
pub enum ProcedureSpec {
    /// Storage source.
    From(FromProcedureSpec),
    /// Time range restriction.
    Range(RangeProcedureSpec),
    /// Predicate filter.
    Filter(FilterProcedureSpec),
    /// Regroup by tag keys.
    Group(GroupOpSpec),
    /// Windowing.
    Window(WindowProcedureSpec),
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

/// A push-down rule: the procedure can be fused into an ancestor of kind
/// `root`, passing transparently through single-child procedures of the
/// `through` kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushDownRule {
    /// Kind of the procedure absorbing the rewrite.
    pub root: ProcedureKind,
    /// Kinds the rewrite may pass through.
    pub through: &'static [ProcedureKind],
}

const RANGE_THROUGH: &[ProcedureKind] = &[
    ProcedureKind::Group,
    ProcedureKind::Limit,
    ProcedureKind::Filter,
];
const FILTER_THROUGH: &[ProcedureKind] = &[
    ProcedureKind::Group,
    ProcedureKind::Limit,
    ProcedureKind::Range,
];
const LIMIT_THROUGH: &[ProcedureKind] = &[
    ProcedureKind::Group,
    ProcedureKind::Range,
    ProcedureKind::Filter,
];
const SELECTOR_THROUGH: &[ProcedureKind] = &[
    ProcedureKind::Group,
    ProcedureKind::Range,
    ProcedureKind::Filter,
];

impl ProcedureSpec {
    /// Map an operation spec to its physical counterpart.
    pub fn from_operation(spec: &OperationSpec) -> Self {
        match spec {
            OperationSpec::From(s) => Self::From(FromProcedureSpec::new(&s.database)),
            OperationSpec::Range(s) => Self::Range(RangeProcedureSpec {
                bounds: BoundsSpec::new(s.start, s.stop),
            }),
            OperationSpec::Filter(s) => Self::Filter(FilterProcedureSpec {
                expression: s.expression.clone(),
            }),
            OperationSpec::Group(s) => Self::Group(s.clone()),
            OperationSpec::Window(s) => Self::Window(WindowProcedureSpec {
                every: s.every,
                period: s.period.unwrap_or(s.every),
                round: s.round.unwrap_or(Duration::ZERO),
                start: s.start,
            }),
            OperationSpec::Limit(s) => Self::Limit(s.clone()),
            OperationSpec::First(s) => Self::First(s.clone()),
            OperationSpec::Last(s) => Self::Last(s.clone()),
            OperationSpec::Min(s) => Self::Min(s.clone()),
            OperationSpec::Max(s) => Self::Max(s.clone()),
            OperationSpec::Sum {} => Self::Sum {},
            OperationSpec::Count {} => Self::Count {},
            OperationSpec::Mean {} => Self::Mean {},
            OperationSpec::Join(s) => Self::Join(s.clone()),
        }
    }

    /// The kind of this procedure.
    pub const fn kind(&self) -> ProcedureKind {
        match self {
            Self::From(_) => ProcedureKind::From,
            Self::Range(_) => ProcedureKind::Range,
            Self::Filter(_) => ProcedureKind::Filter,
            Self::Group(_) => ProcedureKind::Group,
            Self::Window(_) => ProcedureKind::Window,
            Self::Limit(_) => ProcedureKind::Limit,
            Self::First(_) => ProcedureKind::First,
            Self::Last(_) => ProcedureKind::Last,
            Self::Min(_) => ProcedureKind::Min,
            Self::Max(_) => ProcedureKind::Max,
            Self::Sum {} => ProcedureKind::Sum,
            Self::Count {} => ProcedureKind::Count,
            Self::Mean {} => ProcedureKind::Mean,
            Self::Join(_) => ProcedureKind::Join,
        }
    }

    /// Whether this procedure is a source.
    pub const fn is_source(&self) -> bool {
        matches!(self, Self::From(_))
    }

    /// The push-down rule for this procedure, if it has one.
    pub fn push_down_rule(&self) -> Option<PushDownRule> {
        match self {
            Self::Range(_) => Some(PushDownRule {
                root: ProcedureKind::From,
                through: RANGE_THROUGH,
            }),
            Self::Filter(_) => Some(PushDownRule {
                root: ProcedureKind::From,
                through: FILTER_THROUGH,
            }),
            Self::Limit(_) => Some(PushDownRule {
                root: ProcedureKind::From,
                through: LIMIT_THROUGH,
            }),
            Self::First(_) | Self::Last(_) => Some(PushDownRule {
                root: ProcedureKind::From,
                through: SELECTOR_THROUGH,
            }),
            _ => None,
        }
    }

    /// Whether absorbing this procedure into `root` would conflict with a
    /// rewrite the root has already absorbed. A collision forces the planner
    /// to duplicate the root for this branch.
    pub fn collides_with(&self, root: &ProcedureSpec) -> bool {
        let ProcedureSpec::From(from) = root else {
            return false;
        };
        match self {
            Self::Range(_) => from.bounds_set,
            Self::Filter(_) => from.filter_set,
            Self::Limit(_) => from.limit_set,
            Self::First(_) | Self::Last(_) => from.limit_set || from.descending_set,
            _ => false,
        }
    }

    /// Absorb this procedure's behavior into `root`. The root is either the
    /// original source or a freshly duplicated copy; fields owned by this
    /// rewrite are overwritten outright.
    pub fn push_down(&self, root: &mut ProcedureSpec) {
        let ProcedureSpec::From(from) = root else {
            return;
        };
        match self {
            Self::Range(range) => {
                from.bounds_set = true;
                from.bounds = range.bounds;
            }
            Self::Filter(filter) => {
                from.filter_set = true;
                from.filter = Some(filter.expression.clone());
            }
            Self::Limit(limit) => {
                from.limit_set = true;
                from.points_limit = limit.n;
                from.offset = limit.offset;
            }
            Self::First(_) => {
                from.limit_set = true;
                from.points_limit = 1;
                from.offset = 0;
                from.descending_set = true;
                from.descending = false;
            }
            Self::Last(_) => {
                from.limit_set = true;
                from.points_limit = 1;
                from.offset = 0;
                from.descending_set = true;
                from.descending = true;
            }
            _ => {}
        }
    }
}

/// A procedure: planner-level node with graph pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    /// Procedure id.
    pub id: ProcedureId,
    /// Kind-tagged spec.
    pub spec: ProcedureSpec,
    /// Parent procedure ids.
    pub parents: Vec<ProcedureId>,
    /// Child procedure ids.
    pub children: Vec<ProcedureId>,
}

impl Procedure {
    /// Create a procedure with no graph pointers.
    pub fn new(id: ProcedureId, spec: ProcedureSpec) -> Self {
        Self {
            id,
            spec,
            parents: Vec::new(),
            children: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_procedure_id_is_deterministic() {
        let a = ProcedureId::from_operation(&OperationId::new("from0"));
        let b = ProcedureId::from_operation(&OperationId::new("from0"));
        let c = ProcedureId::from_operation(&OperationId::new("from1"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.for_duplicate(), b.for_duplicate());
        assert_ne!(a, a.for_duplicate());
    }

    #[test]
    fn test_last_absorbs_into_from() {
        let mut root = ProcedureSpec::From(FromProcedureSpec::new("mydb"));
        let last = ProcedureSpec::Last(SelectorOpSpec::default());
        assert!(!last.collides_with(&root));
        last.push_down(&mut root);
        let ProcedureSpec::From(from) = &root else {
            unreachable!()
        };
        assert!(from.limit_set && from.descending_set && from.descending);
        assert_eq!(from.points_limit, 1);

        // A second selector collides with the first.
        let first = ProcedureSpec::First(SelectorOpSpec::default());
        assert!(first.collides_with(&root));
    }

    #[test]
    fn test_filter_collision() {
        let mut root = ProcedureSpec::From(FromProcedureSpec::new("mydb"));
        let filter = ProcedureSpec::Filter(FilterProcedureSpec {
            expression: Expression::new(rivulet_core::Node::reference("$")),
        });
        filter.push_down(&mut root);
        assert!(filter.collides_with(&root));
    }
}
