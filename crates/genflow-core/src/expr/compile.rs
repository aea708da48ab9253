//! Expression-to-SQL compiler
//!
//! Produces Postgres SQL with `$n` placeholders plus the ordered bind values.
//! Path references become `LEFT JOIN`s, one per distinct hop prefix, so two
//! expressions reaching the same entity through the same hops share a join.

use genflow_common::Value;

use super::{Aggregate, BinaryOp, Expr, Side, UnaryOp};
use crate::error::CompilationError;
use crate::query::Query;
use crate::schema::{id_column, Direction, Hop, Path, Schema};
use crate::sql::quote_ident;

type Result<T> = std::result::Result<T, CompilationError>;

/// SQL text ready to execute, with binds in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub binds: Vec<Value>,
    pub outputs: Vec<String>,
}

struct Join {
    base: String,
    hops: Vec<Hop>,
    alias: String,
}

/// Per-SELECT state: the basis aliases and the joins emitted so far
struct Scope {
    basis: Vec<(String, String)>,
    from: String,
    joins: Vec<Join>,
    join_sql: Vec<String>,
}

impl Scope {
    fn basis_alias(&self, entity: &str) -> Option<&str> {
        self.basis
            .iter()
            .find(|(e, _)| e == entity)
            .map(|(_, alias)| alias.as_str())
    }
}

/// Compiles queries against a schema; binds and aliases are numbered across
/// nested subqueries
pub struct Compiler<'s> {
    schema: &'s Schema,
    binds: Vec<Value>,
    next_alias: usize,
}

impl<'s> Compiler<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            binds: Vec::new(),
            next_alias: 0,
        }
    }

    /// Compile a top-level query
    pub fn compile(schema: &Schema, query: &Query) -> Result<CompiledQuery> {
        let mut compiler = Compiler::new(schema);
        let sql = compiler.query(query)?;
        Ok(CompiledQuery {
            sql,
            binds: compiler.binds,
            outputs: query.outputs(),
        })
    }

    fn bind(&mut self, value: Value) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }

    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    fn query(&mut self, query: &Query) -> Result<String> {
        let context = format!("query over [{}]", query.basis.join(", "));
        check_shape(query, &context)?;

        let mut scope = self.scope(query, &context)?;

        let mut columns = Vec::with_capacity(query.exprs.len());
        for (name, expr) in &query.exprs {
            let sql = self.expr(&mut scope, expr)?;
            columns.push(format!("{} AS {}", sql, quote_ident(name)));
        }

        let filter = match query.filter {
            Some(ref f) => Some(self.expr(&mut scope, f)?),
            None => None,
        };

        let mut group_by = Vec::with_capacity(query.group_by.len());
        for expr in &query.group_by {
            group_by.push(self.expr(&mut scope, expr)?);
        }

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), scope.from);
        for join in &scope.join_sql {
            sql.push(' ');
            sql.push_str(join);
        }
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter);
        }
        if !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.join(", "));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(sql)
    }

    /// FROM clause: the first basis entity, then every other basis entity
    /// joined through a direct relation to an earlier one
    fn scope(&mut self, query: &Query, context: &str) -> Result<Scope> {
        let mut basis: Vec<(String, String)> = Vec::with_capacity(query.basis.len());
        let mut from = String::new();

        for (i, entity) in query.basis.iter().enumerate() {
            if self.schema.entity(entity).is_none() {
                return Err(CompilationError::new(context, format!("unknown basis entity '{}'", entity)));
            }
            if basis.iter().any(|(e, _)| e == entity) {
                return Err(CompilationError::new(context, format!("basis entity '{}' listed twice", entity)));
            }
            let alias = self.alias();
            if i == 0 {
                from = format!("{} AS {}", quote_ident(entity), alias);
                basis.push((entity.clone(), alias));
                continue;
            }

            let mut candidates = Vec::new();
            for (earlier, earlier_alias) in &basis {
                for rel in self.schema.relations() {
                    if rel.source == *entity && rel.target == *earlier {
                        candidates.push(format!(
                            "{}.{} = {}.{}",
                            alias,
                            quote_ident(&rel.name),
                            earlier_alias,
                            quote_ident(&id_column(earlier))
                        ));
                    } else if rel.source == *earlier && rel.target == *entity {
                        candidates.push(format!(
                            "{}.{} = {}.{}",
                            alias,
                            quote_ident(&id_column(entity)),
                            earlier_alias,
                            quote_ident(&rel.name)
                        ));
                    }
                }
            }
            let condition = match candidates.len() {
                1 => candidates.remove(0),
                0 => {
                    return Err(CompilationError::new(
                        context,
                        format!("basis entity '{}' has no direct relation to an earlier basis entity", entity),
                    ))
                },
                n => {
                    return Err(CompilationError::new(
                        context,
                        format!("basis entity '{}' is related to earlier basis entities in {} ways", entity, n),
                    ))
                },
            };
            from.push_str(&format!(" JOIN {} AS {} ON {}", quote_ident(entity), alias, condition));
            basis.push((entity.clone(), alias));
        }

        Ok(Scope {
            basis,
            from,
            joins: Vec::new(),
            join_sql: Vec::new(),
        })
    }

    /// Alias of the entity at the end of `path`, emitting any missing joins
    fn resolve_path(&mut self, scope: &mut Scope, path: &Path) -> Result<String> {
        let mut current = match scope.basis_alias(path.base()) {
            Some(alias) => alias.to_string(),
            None => {
                return Err(CompilationError::new(
                    format!("path {}", path),
                    format!(
                        "base entity '{}' is not in the query basis [{}]",
                        path.base(),
                        scope
                            .basis
                            .iter()
                            .map(|(e, _)| e.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ))
            },
        };

        for i in 0..path.hops().len() {
            let prefix = &path.hops()[..=i];
            if let Some(existing) = scope
                .joins
                .iter()
                .find(|j| j.base == path.base() && j.hops.as_slice() == prefix)
            {
                current = existing.alias.clone();
                continue;
            }

            let hop = &prefix[i];
            let alias = self.alias();
            let condition = match hop.direction {
                Direction::Forward => format!(
                    "{}.{} = {}.{}",
                    alias,
                    quote_ident(&id_column(&hop.to)),
                    current,
                    quote_ident(&hop.relation)
                ),
                Direction::Backward => format!(
                    "{}.{} = {}.{}",
                    alias,
                    quote_ident(&hop.relation),
                    current,
                    quote_ident(&id_column(&hop.from))
                ),
            };
            scope.join_sql.push(format!(
                "LEFT JOIN {} AS {} ON {}",
                quote_ident(&hop.to),
                alias,
                condition
            ));
            scope.joins.push(Join {
                base: path.base().to_string(),
                hops: prefix.to_vec(),
                alias: alias.clone(),
            });
            current = alias;
        }
        Ok(current)
    }

    fn subquery(&mut self, query: &Query) -> Result<String> {
        if query.exprs.len() != 1 {
            return Err(CompilationError::new(
                format!("subquery over [{}]", query.basis.join(", ")),
                format!("must select exactly one expression, found {}", query.exprs.len()),
            ));
        }
        self.query(query)
    }

    fn list(&mut self, scope: &mut Scope, exprs: &[Expr]) -> Result<String> {
        let mut parts = Vec::with_capacity(exprs.len());
        for e in exprs {
            parts.push(self.expr(scope, e)?);
        }
        Ok(parts.join(", "))
    }

    fn expr(&mut self, scope: &mut Scope, expr: &Expr) -> Result<String> {
        let sql = match expr {
            Expr::Literal(Value::Null) => "NULL".to_string(),
            Expr::Literal(v) => self.bind(v.clone()),
            Expr::Column { path, attribute } => {
                if self.schema.column(path.target(), attribute).is_none() {
                    return Err(CompilationError::new(
                        format!("column {}.{}", path.target(), attribute),
                        "no such attribute or relation",
                    ));
                }
                let alias = self.resolve_path(scope, path)?;
                format!("{}.{}", alias, quote_ident(attribute))
            },
            Expr::Id { path } => {
                if self.schema.entity(path.target()).is_none() {
                    return Err(CompilationError::new(
                        format!("key of {}", path.target()),
                        "unknown entity",
                    ));
                }
                let alias = self.resolve_path(scope, path)?;
                format!("{}.{}", alias, quote_ident(&id_column(path.target())))
            },
            Expr::Unary { op, expr } => {
                let inner = self.expr(scope, expr)?;
                match op {
                    UnaryOp::Neg => format!("(-{})", inner),
                    UnaryOp::Abs => format!("ABS({})", inner),
                    UnaryOp::Not => format!("(NOT {})", inner),
                    UnaryOp::IsNull => format!("({} IS NULL)", inner),
                    UnaryOp::Length => format!("LENGTH({})", inner),
                }
            },
            Expr::Binary { op, left, right } => {
                let l = self.expr(scope, left)?;
                let r = self.expr(scope, right)?;
                match op {
                    BinaryOp::BinaryEq => format!(
                        "(convert_to(CAST({} AS TEXT), 'UTF8') = convert_to(CAST({} AS TEXT), 'UTF8'))",
                        l, r
                    ),
                    op => format!("({} {} {})", l, binary_operator(*op), r),
                }
            },
            Expr::If { cond, then, otherwise } => {
                let c = self.expr(scope, cond)?;
                let t = self.expr(scope, then)?;
                let o = self.expr(scope, otherwise)?;
                format!("CASE WHEN {} THEN {} ELSE {} END", c, t, o)
            },
            Expr::Case { branches, otherwise } => {
                if branches.is_empty() {
                    return Err(CompilationError::new("CASE expression", "needs at least one branch"));
                }
                let mut sql = String::from("CASE");
                for (cond, value) in branches {
                    let c = self.expr(scope, cond)?;
                    let v = self.expr(scope, value)?;
                    sql.push_str(&format!(" WHEN {} THEN {}", c, v));
                }
                if let Some(otherwise) = otherwise {
                    let o = self.expr(scope, otherwise)?;
                    sql.push_str(&format!(" ELSE {}", o));
                }
                sql.push_str(" END");
                sql
            },
            Expr::InList { expr, list } => {
                if list.is_empty() {
                    "FALSE".to_string()
                } else {
                    let e = self.expr(scope, expr)?;
                    let items = self.list(scope, list)?;
                    format!("({} IN ({}))", e, items)
                }
            },
            Expr::InQuery { expr, query } => {
                let e = self.expr(scope, expr)?;
                let sub = self.subquery(query)?;
                format!("({} IN ({}))", e, sub)
            },
            Expr::Subselect(query) => format!("({})", self.subquery(query)?),
            Expr::Concat(parts) => {
                if parts.is_empty() {
                    return Err(CompilationError::new("CONCAT expression", "needs at least one argument"));
                }
                format!("CONCAT({})", self.list(scope, parts)?)
            },
            Expr::Replace { expr, from, to } => {
                let e = self.expr(scope, expr)?;
                let f = self.expr(scope, from)?;
                let t = self.expr(scope, to)?;
                format!("REPLACE({}, {}, {})", e, f, t)
            },
            Expr::Substring { expr, side, len } => {
                let e = self.expr(scope, expr)?;
                match side {
                    Side::Left => format!("LEFT({}, {})", e, len),
                    Side::Right => format!("RIGHT({}, {})", e, len),
                }
            },
            Expr::Cast { expr, ty } => format!("CAST({} AS {})", self.expr(scope, expr)?, ty.ddl()),
            Expr::JsonField { expr, keys } => {
                if keys.is_empty() {
                    return Err(CompilationError::new("JSON field extraction", "needs at least one key"));
                }
                let doc = self.expr(scope, expr)?;
                let keys: Vec<String> = keys.iter().map(|k| self.bind(Value::Text(k.clone()))).collect();
                format!("jsonb_extract_path_text(CAST({} AS JSONB), {})", doc, keys.join(", "))
            },
            Expr::GroupConcat { expr, delimiter } => {
                let e = self.expr(scope, expr)?;
                let d = self.bind(Value::Text(delimiter.clone()));
                format!("STRING_AGG(CAST({} AS TEXT), {})", e, d)
            },
            Expr::Aggregate { func, expr } => {
                let e = self.expr(scope, expr)?;
                let name = match func {
                    Aggregate::Sum => "SUM",
                    Aggregate::Min => "MIN",
                    Aggregate::Max => "MAX",
                    Aggregate::Avg => "AVG",
                    Aggregate::Stddev => "STDDEV",
                    Aggregate::Count => "COUNT",
                };
                format!("{}({})", name, e)
            },
            Expr::Corr(x, y) => {
                let x = self.expr(scope, x)?;
                let y = self.expr(scope, y)?;
                format!("CORR({}, {})", x, y)
            },
            Expr::Coalesce(exprs) => {
                if exprs.is_empty() {
                    return Err(CompilationError::new("COALESCE expression", "needs at least one argument"));
                }
                format!("COALESCE({})", self.list(scope, exprs)?)
            },
        };
        Ok(sql)
    }
}

fn binary_operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "<>",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::Like => "LIKE",
        BinaryOp::Regex => "~",
        BinaryOp::BinaryEq => "=",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
    }
}

/// Structural checks that need no schema: outputs, aggregation and grouping
fn check_shape(query: &Query, context: &str) -> Result<()> {
    if query.basis.is_empty() {
        return Err(CompilationError::new(context, "query has no basis entity"));
    }
    if query.exprs.is_empty() {
        return Err(CompilationError::new(context, "query selects no expressions"));
    }
    for (i, (name, _)) in query.exprs.iter().enumerate() {
        if query.exprs[..i].iter().any(|(n, _)| n == name) {
            return Err(CompilationError::new(context, format!("output '{}' selected twice", name)));
        }
    }
    if query.filter.as_ref().is_some_and(Expr::is_aggregate) {
        return Err(CompilationError::new(context, "filter cannot contain aggregates"));
    }
    if query.group_by.iter().any(Expr::is_aggregate) {
        return Err(CompilationError::new(context, "grouping expressions cannot contain aggregates"));
    }
    if query.group_by.is_empty() {
        let aggregated = query.exprs.iter().filter(|(_, e)| e.is_aggregate()).count();
        if aggregated > 0 {
            if let Some((name, _)) = query.exprs.iter().find(|(_, e)| e.has_bare_column()) {
                return Err(CompilationError::new(
                    context,
                    format!("'{}' mixes with aggregate expressions but no grouping key is given", name),
                ));
            }
        }
    }
    Ok(())
}
