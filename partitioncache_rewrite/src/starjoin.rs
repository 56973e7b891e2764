//! Undoing a detected star-join reattachment in the outer query (spec
//! §4.5 step 5): "when a star-join was detected on the input query, its
//! re-attachment is undone in the rewritten query — it is the cache's
//! job, not the user's".
//!
//! The fragment generator excludes the star-join table from enumeration
//! but reattaches it onto every generated fragment, so the cached
//! partition-key set already reflects the star table's constraint. Once
//! the cache restriction is spliced in, the user's own join to that
//! table is redundant and is dropped here.

use sqlparser::ast::{BinaryOperator, Expr, Select, TableFactor, TableWithJoins};
use std::collections::BTreeSet;

/// Removes the table referenced by `alias` from `select`'s `FROM` list
/// and drops every `WHERE` conjunct that references it (its join
/// predicate to the rest of the query included — the cache restriction
/// replaces what that join contributed). Returns `true` if the table
/// was found and removed.
pub(crate) fn undo_star_join(select: &mut Select, alias: &str) -> bool {
    let before = select.from.len();
    select.from.retain(|twj| table_with_joins_alias(twj).as_deref() != Some(alias));
    let removed = select.from.len() != before;
    if !removed {
        return false;
    }

    if let Some(selection) = select.selection.take() {
        let mut conjuncts = Vec::new();
        flatten_and(selection, &mut conjuncts);
        let kept: Vec<Expr> = conjuncts
            .into_iter()
            .filter(|expr| !referenced_aliases(expr).contains(alias))
            .collect();
        select.selection = rebuild_and(kept);
    }
    true
}

fn table_with_joins_alias(twj: &TableWithJoins) -> Option<String> {
    table_factor_alias(&twj.relation)
}

fn table_factor_alias(factor: &TableFactor) -> Option<String> {
    if let TableFactor::Table { name, alias, .. } = factor {
        Some(
            alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| name.0.last().map(|i| i.value.clone()).unwrap_or_default()),
        )
    } else {
        None
    }
}

fn flatten_and(expr: Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            flatten_and(*left, out);
            flatten_and(*right, out);
        }
        Expr::Nested(inner) => flatten_and(*inner, out),
        other => out.push(other),
    }
}

fn rebuild_and(mut conjuncts: Vec<Expr>) -> Option<Expr> {
    let mut iter = conjuncts.drain(..);
    let first = iter.next()?;
    Some(iter.fold(first, |acc, next| Expr::BinaryOp {
        left: Box::new(acc),
        op: BinaryOperator::And,
        right: Box::new(next),
    }))
}

fn referenced_aliases(expr: &Expr) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect(expr, &mut out);
    out
}

fn collect(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::CompoundIdentifier(parts) => {
            if let Some(first) = parts.first() {
                out.insert(first.value.clone());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect(left, out);
            collect(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::IsNull(expr) | Expr::IsNotNull(expr) => {
            collect(expr, out)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect(expr, out);
            collect(low, out);
            collect(high, out);
        }
        Expr::InList { expr, list, .. } => {
            collect(expr, out);
            for item in list {
                collect(item, out);
            }
        }
        Expr::InSubquery { expr, .. } => collect(expr, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn parse_select(sql: &str) -> Select {
        let mut statements = Parser::parse_sql(&GenericDialect {}, sql).unwrap();
        match statements.remove(0) {
            sqlparser::ast::Statement::Query(q) => match *q.body {
                sqlparser::ast::SetExpr::Select(s) => *s,
                _ => panic!("not a select"),
            },
            _ => panic!("not a query"),
        }
    }

    #[test]
    fn removes_matching_table_and_its_sole_predicate() {
        let mut select = parse_select(
            "SELECT b.zip FROM biz b, p0_meta p WHERE b.zip = p.zip AND p.active = true AND b.category = 'cafe'",
        );
        let removed = undo_star_join(&mut select, "p");
        assert!(removed);
        assert_eq!(select.from.len(), 1);
        let rendered = select.to_string();
        assert!(!rendered.contains("p0_meta"));
        assert!(rendered.contains("category"));
    }

    #[test]
    fn returns_false_when_alias_absent() {
        let mut select = parse_select("SELECT b.zip FROM biz b WHERE b.category = 'cafe'");
        assert!(!undo_star_join(&mut select, "p"));
    }
}
