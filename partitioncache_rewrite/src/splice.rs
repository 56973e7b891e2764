//! SQL-level mechanics for embedding a cache restriction into a query
//! (spec §4.5 "splice method").
//!
//! Rather than hand-building `sqlparser` AST nodes whose exact field set
//! varies release to release, every fragment of SQL this module needs is
//! obtained by parsing a small synthetic snippet and pulling the relevant
//! node back out — the same traversal [`partitioncache_query::fragment`]
//! already uses to read a query's `WHERE` clause, just run on throwaway
//! input. The only node we mutate directly is `Select::selection` and
//! `Select::from`, both plain public fields.

use partitioncache_types::{Error, Identifier};
use sqlparser::ast::{Expr, Select, SetExpr, Statement, TableWithJoins};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// How the cache's partition-key restriction is embedded into the
/// rewritten query (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceMethod {
    /// `partition_key IN (<values or subquery>)`, inline in the outer
    /// `WHERE`.
    InSubquery,
    /// A `WITH __pc_cache(pk) AS (...)` CTE, referenced via `IN (SELECT
    /// pk FROM __pc_cache)`.
    TmpTableIn,
    /// The same CTE, joined into the query's `FROM` list instead of
    /// referenced through `IN`.
    TmpTableJoin,
}

/// A query parsed down to its first (only, for a plain `SELECT`) target
/// `SELECT`, per the Open Question decision already applied by
/// [`partitioncache_query::canonical`]: only the first arm of a
/// `UNION`/`INTERSECT`/`EXCEPT` is considered.
pub(crate) struct Target {
    statement: Statement,
}

impl Target {
    pub(crate) fn parse(sql: &str) -> Result<Self, Error> {
        Ok(Self {
            statement: parse_single(sql)?,
        })
    }

    pub(crate) fn select_mut(&mut self) -> Option<&mut Select> {
        match &mut self.statement {
            Statement::Query(query) => select_mut_body(query.body.as_mut()),
            _ => None,
        }
    }

    /// AND a predicate onto the target `SELECT`'s `WHERE` clause.
    pub(crate) fn and_where(&mut self, predicate: Expr) {
        let Some(select) = self.select_mut() else {
            return;
        };
        select.selection = Some(match select.selection.take() {
            Some(existing) => Expr::BinaryOp {
                left: Box::new(existing),
                op: sqlparser::ast::BinaryOperator::And,
                right: Box::new(predicate),
            },
            None => predicate,
        });
    }

    /// Append a table reference to the target `SELECT`'s `FROM` list
    /// (a cross join; the accompanying `WHERE` predicate narrows it).
    pub(crate) fn add_from(&mut self, table_sql: &str) -> Result<(), Error> {
        let twj = from_table_fragment(table_sql)?;
        if let Some(select) = self.select_mut() {
            select.from.push(twj);
        }
        Ok(())
    }

    pub(crate) fn render(&self) -> String {
        self.statement.to_string()
    }
}

/// Parses `"WHERE {text}"` against a dummy `SELECT` and returns the
/// resulting predicate expression.
pub(crate) fn parse_predicate(text: &str) -> Result<Expr, Error> {
    let statement = parse_single(&format!("SELECT 1 WHERE {text}"))?;
    match statement {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => select.selection.ok_or_else(malformed_snippet),
            _ => Err(malformed_snippet()),
        },
        _ => Err(malformed_snippet()),
    }
}

fn from_table_fragment(table_sql: &str) -> Result<TableWithJoins, Error> {
    let statement = parse_single(&format!("SELECT 1 FROM {table_sql}"))?;
    match statement {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(mut select) => {
                if select.from.is_empty() {
                    Err(malformed_snippet())
                } else {
                    Ok(select.from.remove(0))
                }
            }
            _ => Err(malformed_snippet()),
        },
        _ => Err(malformed_snippet()),
    }
}

fn select_mut_body(set_expr: &mut SetExpr) -> Option<&mut Select> {
    match set_expr {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(inner) => select_mut_body(inner.body.as_mut()),
        SetExpr::SetOperation { left, .. } => select_mut_body(left),
        _ => None,
    }
}

fn parse_single(sql: &str) -> Result<Statement, Error> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|source| Error::InvalidQuery { source })?;
    if statements.is_empty() {
        return Err(Error::InvalidQuery {
            source: sqlparser::parser::ParserError::ParserError("empty statement".to_string()),
        });
    }
    Ok(statements.remove(0))
}

fn malformed_snippet() -> Error {
    Error::InvalidQuery {
        source: sqlparser::parser::ParserError::ParserError(
            "internal splice snippet failed to parse back to a SELECT".to_string(),
        ),
    }
}

/// Renders an [`Identifier`] as a SQL literal suitable for an `IN` list
/// or `VALUES` row.
pub(crate) fn sql_literal(identifier: &Identifier) -> String {
    match identifier {
        Identifier::Integer(v) => v.to_string(),
        Identifier::Float(v) => v.to_string(),
        Identifier::Text(v) => format!("'{}'", v.replace('\'', "''")),
        Identifier::Timestamp(millis) => format!("to_timestamp({}::double precision / 1000.0)", millis),
        Identifier::Geometry(wkb) => format!("ST_GeomFromWKB(decode('{}', 'hex'), 0)", hex_encode(wkb)),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_where_appends_to_empty_selection() {
        let mut target = Target::parse("SELECT * FROM t").unwrap();
        target.and_where(parse_predicate("zip IN (1, 2)").unwrap());
        assert!(target.render().contains("WHERE zip IN (1, 2)"));
    }

    #[test]
    fn and_where_ands_onto_existing_selection() {
        let mut target = Target::parse("SELECT * FROM t WHERE active = true").unwrap();
        target.and_where(parse_predicate("zip IN (1, 2)").unwrap());
        let rendered = target.render();
        assert!(rendered.contains("active = true"));
        assert!(rendered.contains("AND"));
        assert!(rendered.contains("zip IN (1, 2)"));
    }

    #[test]
    fn add_from_appends_table() {
        let mut target = Target::parse("SELECT * FROM t").unwrap();
        target.add_from("__pc_cache").unwrap();
        assert!(target.render().contains("__pc_cache"));
    }

    #[test]
    fn sql_literal_quotes_text_and_escapes_quotes() {
        assert_eq!(sql_literal(&Identifier::Text("O'Brien".to_string())), "'O''Brien'");
        assert_eq!(sql_literal(&Identifier::Integer(42)), "42");
    }
}
