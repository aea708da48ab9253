//! Schema-bound expression language
//!
//! Expressions are built with the free constructors ([`lit`], [`col`], [`id`],
//! [`if_else`], ...) and combinator methods on [`Expr`], then compiled to
//! parameterized SQL by [`compile::Compiler`].
//!
//! ```
//! use genflow_core::expr::{col, lit};
//! use genflow_core::schema::Path;
//!
//! let sample = Path::root("sample");
//! let heavy = col(&sample, "mass").greater(lit(10)).and(col(&sample, "label").like(lit("A%")));
//! assert!(!heavy.is_aggregate());
//! ```

pub mod compile;

use genflow_common::{SqlType, Value};

use crate::query::Query;
use crate::schema::Path;

pub use compile::{CompiledQuery, Compiler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Not,
    IsNull,
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    Regex,
    /// Byte-for-byte equality of the text renderings
    BinaryEq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Min,
    Max,
    Avg,
    Stddev,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Expression tree node
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Column { path: Path, attribute: String },
    Id { path: Path },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    If { cond: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Case { branches: Vec<(Expr, Expr)>, otherwise: Option<Box<Expr>> },
    InList { expr: Box<Expr>, list: Vec<Expr> },
    InQuery { expr: Box<Expr>, query: Box<Query> },
    Subselect(Box<Query>),
    Concat(Vec<Expr>),
    Replace { expr: Box<Expr>, from: Box<Expr>, to: Box<Expr> },
    Substring { expr: Box<Expr>, side: Side, len: i64 },
    Cast { expr: Box<Expr>, ty: SqlType },
    JsonField { expr: Box<Expr>, keys: Vec<String> },
    GroupConcat { expr: Box<Expr>, delimiter: String },
    Aggregate { func: Aggregate, expr: Box<Expr> },
    Corr(Box<Expr>, Box<Expr>),
    Coalesce(Vec<Expr>),
}

// ============================================================================
// Constructors
// ============================================================================

pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

pub fn null() -> Expr {
    Expr::Literal(Value::Null)
}

/// Attribute (or relation column) of the entity at the end of `path`
pub fn col(path: &Path, attribute: impl Into<String>) -> Expr {
    Expr::Column {
        path: path.clone(),
        attribute: attribute.into(),
    }
}

/// Surrogate key of the entity at the end of `path`
pub fn id(path: &Path) -> Expr {
    Expr::Id { path: path.clone() }
}

pub fn if_else(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
    Expr::If {
        cond: Box::new(cond),
        then: Box::new(then),
        otherwise: Box::new(otherwise),
    }
}

pub fn case(branches: Vec<(Expr, Expr)>, otherwise: Option<Expr>) -> Expr {
    Expr::Case {
        branches,
        otherwise: otherwise.map(Box::new),
    }
}

pub fn concat(parts: Vec<Expr>) -> Expr {
    Expr::Concat(parts)
}

pub fn coalesce(exprs: Vec<Expr>) -> Expr {
    Expr::Coalesce(exprs)
}

pub fn corr(x: Expr, y: Expr) -> Expr {
    Expr::Corr(Box::new(x), Box::new(y))
}

/// Scalar subquery; the query must have exactly one output.
///
/// Subqueries are uncorrelated: they compile against their own basis and
/// cannot reference entities of the enclosing query.
pub fn subselect(query: Query) -> Expr {
    Expr::Subselect(Box::new(query))
}

impl Expr {
    fn unary(self, op: UnaryOp) -> Expr {
        Expr::Unary {
            op,
            expr: Box::new(self),
        }
    }

    fn binary(self, op: BinaryOp, other: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    fn aggregate(self, func: Aggregate) -> Expr {
        Expr::Aggregate {
            func,
            expr: Box::new(self),
        }
    }

    pub fn plus(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Add, other)
    }

    pub fn minus(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn times(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn divided_by(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Div, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(self) -> Expr {
        self.unary(UnaryOp::Neg)
    }

    pub fn abs(self) -> Expr {
        self.unary(UnaryOp::Abs)
    }

    pub fn equals(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn not_equals(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn less(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn less_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Le, other)
    }

    pub fn greater(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn greater_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn like(self, pattern: Expr) -> Expr {
        self.binary(BinaryOp::Like, pattern)
    }

    /// POSIX regular expression match
    pub fn matches(self, pattern: Expr) -> Expr {
        self.binary(BinaryOp::Regex, pattern)
    }

    pub fn binary_equals(self, other: Expr) -> Expr {
        self.binary(BinaryOp::BinaryEq, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Or, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        self.unary(UnaryOp::Not)
    }

    pub fn is_null(self) -> Expr {
        self.unary(UnaryOp::IsNull)
    }

    pub fn length(self) -> Expr {
        self.unary(UnaryOp::Length)
    }

    pub fn in_list(self, list: Vec<Expr>) -> Expr {
        Expr::InList {
            expr: Box::new(self),
            list,
        }
    }

    /// Membership in a single-output subquery. Like [`subselect`], the
    /// subquery cannot reference the enclosing query's basis.
    pub fn in_query(self, query: Query) -> Expr {
        Expr::InQuery {
            expr: Box::new(self),
            query: Box::new(query),
        }
    }

    pub fn replace(self, from: Expr, to: Expr) -> Expr {
        Expr::Replace {
            expr: Box::new(self),
            from: Box::new(from),
            to: Box::new(to),
        }
    }

    pub fn left(self, len: i64) -> Expr {
        Expr::Substring {
            expr: Box::new(self),
            side: Side::Left,
            len,
        }
    }

    pub fn right(self, len: i64) -> Expr {
        Expr::Substring {
            expr: Box::new(self),
            side: Side::Right,
            len,
        }
    }

    pub fn cast(self, ty: SqlType) -> Expr {
        Expr::Cast {
            expr: Box::new(self),
            ty,
        }
    }

    /// Text value at `keys` inside a JSON document
    pub fn json_field<S: Into<String>>(self, keys: impl IntoIterator<Item = S>) -> Expr {
        Expr::JsonField {
            expr: Box::new(self),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn group_concat(self, delimiter: impl Into<String>) -> Expr {
        Expr::GroupConcat {
            expr: Box::new(self),
            delimiter: delimiter.into(),
        }
    }

    pub fn sum(self) -> Expr {
        self.aggregate(Aggregate::Sum)
    }

    pub fn min(self) -> Expr {
        self.aggregate(Aggregate::Min)
    }

    pub fn max(self) -> Expr {
        self.aggregate(Aggregate::Max)
    }

    pub fn avg(self) -> Expr {
        self.aggregate(Aggregate::Avg)
    }

    pub fn stddev(self) -> Expr {
        self.aggregate(Aggregate::Stddev)
    }

    pub fn count(self) -> Expr {
        self.aggregate(Aggregate::Count)
    }

    /// Direct children, not descending into subqueries
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_) | Expr::Column { .. } | Expr::Id { .. } | Expr::Subselect(_) => Vec::new(),
            Expr::Unary { expr, .. }
            | Expr::Substring { expr, .. }
            | Expr::Cast { expr, .. }
            | Expr::JsonField { expr, .. }
            | Expr::GroupConcat { expr, .. }
            | Expr::Aggregate { expr, .. }
            | Expr::InQuery { expr, .. } => vec![expr.as_ref()],
            Expr::Binary { left, right, .. } | Expr::Corr(left, right) => vec![left.as_ref(), right.as_ref()],
            Expr::If { cond, then, otherwise } => vec![cond.as_ref(), then.as_ref(), otherwise.as_ref()],
            Expr::Case { branches, otherwise } => branches
                .iter()
                .flat_map(|(c, v)| [c, v])
                .chain(otherwise.as_deref())
                .collect(),
            Expr::InList { expr, list } => std::iter::once(expr.as_ref()).chain(list.iter()).collect(),
            Expr::Concat(parts) | Expr::Coalesce(parts) => parts.iter().collect(),
            Expr::Replace { expr, from, to } => vec![expr.as_ref(), from.as_ref(), to.as_ref()],
        }
    }

    /// Subqueries referenced directly by this node
    pub fn subqueries(&self) -> Vec<&Query> {
        match self {
            Expr::Subselect(q) | Expr::InQuery { query: q, .. } => vec![q.as_ref()],
            _ => Vec::new(),
        }
    }

    fn is_aggregate_node(&self) -> bool {
        matches!(self, Expr::Aggregate { .. } | Expr::GroupConcat { .. } | Expr::Corr(..))
    }

    /// Contains an aggregate outside any subquery
    pub fn is_aggregate(&self) -> bool {
        self.is_aggregate_node() || self.children().into_iter().any(Expr::is_aggregate)
    }

    /// Contains a column or key reference that is not wrapped in an aggregate
    pub fn has_bare_column(&self) -> bool {
        match self {
            Expr::Column { .. } | Expr::Id { .. } => true,
            e if e.is_aggregate_node() => false,
            e => e.children().into_iter().any(Expr::has_bare_column),
        }
    }

    /// Visit every column/key reference as `(path, Some(attribute))` or
    /// `(path, None)` for surrogate keys, descending into subqueries
    pub fn visit_columns<'a>(&'a self, f: &mut dyn FnMut(&'a Path, Option<&'a str>)) {
        match self {
            Expr::Column { path, attribute } => f(path, Some(attribute)),
            Expr::Id { path } => f(path, None),
            _ => {},
        }
        for q in self.subqueries() {
            q.visit_columns(f);
        }
        for child in self.children() {
            child.visit_columns(f);
        }
    }
}
