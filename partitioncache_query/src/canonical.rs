//! SQL query canonicalisation (spec §4.1).
//!
//! Parses a `SELECT` string, strips constructs that don't change which
//! rows match (trailing ordering/pagination, `DISTINCT ON`), rewrites table
//! references onto a stable canonical alias scheme, and normalises numeric
//! range predicates onto bucket boundaries. The result is a pure function:
//! given the same input text and options, the output text is always
//! identical, and re-canonicalising an already-canonical query is a no-op
//! (spec §3 "canonicalising is idempotent").

use crate::options::CanonicalizeOptions;
use partitioncache_types::error::{Error, InvalidQuerySnafu};
use snafu::ResultExt;
use sqlparser::ast::{
    Distinct, Expr, Function, FunctionArg, FunctionArgExpr, Ident, ObjectName, Query, Select,
    SelectItem, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeMap;

/// A canonicalised query: its re-serialised text, plus the table-alias map
/// used to produce it (original reference -> canonical alias).
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalQuery {
    /// The canonical SQL text.
    pub text: String,
    /// Map from original table reference (alias if present, else table
    /// name) to the canonical alias (`t1`, `t2`, ...) it was rewritten to.
    pub table_aliases: BTreeMap<String, String>,
}

/// Names recognised as distance-style functions whose arguments are
/// eligible for bucketing when `distance_functions_only` is set (spec
/// §4.1 step 5).
const DISTANCE_FUNCTION_NAMES: &[&str] = &["dist", "st_distance"];

/// Canonicalise a single `SELECT` query.
pub fn canonicalize(sql: &str, options: &CanonicalizeOptions) -> Result<CanonicalQuery, Error> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql).context(InvalidQuerySnafu)?;

    if statements.is_empty() {
        return Err(Error::InvalidQuery {
            source: sqlparser::parser::ParserError::ParserError("empty statement".to_string()),
        });
    }
    let mut statement = statements.remove(0);

    let table_aliases = match &mut statement {
        Statement::Query(query) => canonicalize_query(query, options),
        other => {
            // Anything that isn't a bare SELECT is accepted syntactically
            // (it parsed) but isn't decomposable; surface it unchanged.
            // The fragment generator documents this as partial coverage.
            return Ok(CanonicalQuery {
                text: other.to_string(),
                table_aliases: BTreeMap::new(),
            });
        }
    };

    Ok(CanonicalQuery {
        text: statement.to_string(),
        table_aliases,
    })
}

fn canonicalize_query(query: &mut Query, options: &CanonicalizeOptions) -> BTreeMap<String, String> {
    // Strip trailing ordering, pagination: these never change which rows
    // match, only their order/count.
    query.order_by = Vec::new();
    query.limit = None;
    query.offset = None;
    query.fetch = None;

    match query.body.as_mut() {
        SetExpr::Select(select) => canonicalize_select(select, options),
        SetExpr::Query(inner) => canonicalize_query(inner, options),
        SetExpr::SetOperation { left, .. } => {
            // Open Question (spec §9): only the first arm of
            // UNION/INTERSECT/EXCEPT is processed. This is documented
            // partial coverage, not a bug.
            match left.as_mut() {
                SetExpr::Select(select) => canonicalize_select(select, options),
                SetExpr::Query(inner) => canonicalize_query(inner, options),
                _ => BTreeMap::new(),
            }
        }
        _ => BTreeMap::new(),
    }
}

fn canonicalize_select(select: &mut Select, options: &CanonicalizeOptions) -> BTreeMap<String, String> {
    // Strip DISTINCT ON (but keep a plain DISTINCT, which does change
    // which *duplicate* rows are returned is irrelevant to partition-key
    // membership, but dropping it would be an unjustified behavioural
    // change outside what spec §4.1 step 1 asks for).
    if let Some(Distinct::On(_)) = &select.distinct {
        select.distinct = None;
    }

    let alias_map = assign_canonical_aliases(select);
    rewrite_select_aliases(select, &alias_map);

    if options.bucket_steps.enabled() {
        if let Some(selection) = &mut select.selection {
            bucket_numeric_ranges(selection, &options.bucket_steps);
        }
    }

    alias_map
}

/// Collects base-table references from `FROM`, assigns canonical aliases
/// `t1, t2, ...` in the stable order `(table_name, original_alias)`, and
/// rewrites each `TableFactor::Table`'s alias in place. Returns a map from
/// original reference key (alias if present, else table name) to the
/// canonical alias.
fn assign_canonical_aliases(select: &mut Select) -> BTreeMap<String, String> {
    let mut refs: Vec<(String, String)> = Vec::new(); // (table_name, original_key)
    collect_table_refs(&mut select.from, &mut refs);

    let mut sorted = refs.clone();
    sorted.sort();

    let mut canonical_of_key: BTreeMap<String, String> = BTreeMap::new();
    for (i, (_, original_key)) in sorted.iter().enumerate() {
        canonical_of_key.insert(original_key.clone(), format!("t{}", i + 1));
    }

    apply_canonical_aliases(&mut select.from, &canonical_of_key);
    canonical_of_key
}

fn collect_table_refs(from: &mut [TableWithJoins], out: &mut Vec<(String, String)>) {
    for twj in from.iter() {
        collect_table_factor_ref(&twj.relation, out);
        for join in &twj.joins {
            collect_table_factor_ref(&join.relation, out);
        }
    }
}

fn collect_table_factor_ref(factor: &TableFactor, out: &mut Vec<(String, String)>) {
    if let TableFactor::Table { name, alias, .. } = factor {
        let table_name = object_name_to_string(name);
        let key = alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| table_name.clone());
        out.push((table_name, key));
    }
    // Derived tables (subqueries) keep their own existing alias namespace
    // and are not renumbered: spec §4.1 step 2 "Subqueries in the FROM
    // clause receive their own alias namespace".
}

fn apply_canonical_aliases(from: &mut [TableWithJoins], canonical_of_key: &BTreeMap<String, String>) {
    for twj in from.iter_mut() {
        apply_canonical_alias_to_factor(&mut twj.relation, canonical_of_key);
        for join in &mut twj.joins {
            apply_canonical_alias_to_factor(&mut join.relation, canonical_of_key);
        }
    }
}

fn apply_canonical_alias_to_factor(
    factor: &mut TableFactor,
    canonical_of_key: &BTreeMap<String, String>,
) {
    if let TableFactor::Table { name, alias, .. } = factor {
        let table_name = object_name_to_string(name);
        let key = alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or(table_name);
        if let Some(canonical) = canonical_of_key.get(&key) {
            *alias = Some(TableAlias {
                name: Ident::new(canonical.clone()),
                columns: Vec::new(),
            });
        }
    }
}

fn object_name_to_string(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

/// Rewrites every qualified column reference in the projection and
/// predicate clauses from its original table key onto the canonical
/// alias. Unqualified identifiers are left untouched.
fn rewrite_select_aliases(select: &mut Select, alias_map: &BTreeMap<String, String>) {
    for item in &mut select.projection {
        match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                rewrite_expr_aliases(e, alias_map)
            }
            _ => {}
        }
    }
    if let Some(selection) = &mut select.selection {
        rewrite_expr_aliases(selection, alias_map);
    }
    if let Some(having) = &mut select.having {
        rewrite_expr_aliases(having, alias_map);
    }
    for expr in &mut select.group_by_exprs_mut_compat() {
        rewrite_expr_aliases(expr, alias_map);
    }
}

/// Recursively rewrites the table qualifier of every
/// [`Expr::CompoundIdentifier`] found in `expr`. Expression kinds outside
/// this list pass through unchanged — accepted as documented partial
/// coverage (spec §4.2 "never raises for advanced constructs").
fn rewrite_expr_aliases(expr: &mut Expr, alias_map: &BTreeMap<String, String>) {
    match expr {
        Expr::CompoundIdentifier(parts) => {
            if let Some(first) = parts.first_mut() {
                if let Some(canonical) = alias_map.get(&first.value) {
                    first.value = canonical.clone();
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            rewrite_expr_aliases(left, alias_map);
            rewrite_expr_aliases(right, alias_map);
        }
        Expr::UnaryOp { expr, .. } => rewrite_expr_aliases(expr, alias_map),
        Expr::Nested(inner) => rewrite_expr_aliases(inner, alias_map),
        Expr::Between {
            expr, low, high, ..
        } => {
            rewrite_expr_aliases(expr, alias_map);
            rewrite_expr_aliases(low, alias_map);
            rewrite_expr_aliases(high, alias_map);
        }
        Expr::InList { expr, list, .. } => {
            rewrite_expr_aliases(expr, alias_map);
            for item in list {
                rewrite_expr_aliases(item, alias_map);
            }
        }
        Expr::InSubquery { expr, .. } => {
            // The inner subquery has its own alias namespace (spec §4.1
            // step 2); only the probe expression is rewritten.
            rewrite_expr_aliases(expr, alias_map);
        }
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => rewrite_expr_aliases(inner, alias_map),
        Expr::Cast { expr, .. } => rewrite_expr_aliases(expr, alias_map),
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                rewrite_expr_aliases(operand, alias_map);
            }
            for c in conditions {
                rewrite_expr_aliases(c, alias_map);
            }
            for r in results {
                rewrite_expr_aliases(r, alias_map);
            }
            if let Some(e) = else_result {
                rewrite_expr_aliases(e, alias_map);
            }
        }
        Expr::Function(Function { args, .. }) => {
            for arg in args {
                let expr = match arg {
                    FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(e),
                        ..
                    } => Some(e),
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Some(e),
                    _ => None,
                };
                if let Some(e) = expr {
                    rewrite_expr_aliases(e, alias_map);
                }
            }
        }
        _ => {
            // Window functions, subqueries-as-values, and other advanced
            // constructs pass through unrewritten: documented partial
            // coverage rather than a parse failure.
        }
    }
}

/// Walks an AND/OR predicate tree looking for `BETWEEN lo AND hi` and the
/// equivalent `expr >= lo AND expr <= hi` shape, bucketing the bounds
/// outward to the nearest multiple of the configured step (spec §4.1
/// step 4-5).
fn bucket_numeric_ranges(expr: &mut Expr, bucket: &crate::options::BucketSteps) {
    match expr {
        Expr::BinaryOp { left, op, right } => {
            use sqlparser::ast::BinaryOperator::And;
            if matches!(op, And) {
                if let Some((lo_expr, hi_expr, subject)) = match_range_conjunction(left, right) {
                    if !bucket.distance_functions_only || is_distance_like(subject) {
                        if let (Some(lo), Some(hi)) = (as_number(lo_expr), as_number(hi_expr)) {
                            let (blo, bhi) = bucket.bucket(lo, hi);
                            *lo_expr = number_expr(blo);
                            *hi_expr = number_expr(bhi);
                        }
                    }
                    return;
                }
            }
            bucket_numeric_ranges(left, bucket);
            bucket_numeric_ranges(right, bucket);
        }
        Expr::Nested(inner) => bucket_numeric_ranges(inner, bucket),
        Expr::Between {
            expr: subject,
            low,
            high,
            negated: false,
        } => {
            if !bucket.distance_functions_only || is_distance_like(subject) {
                if let (Some(lo), Some(hi)) = (as_number(low), as_number(high)) {
                    let (blo, bhi) = bucket.bucket(lo, hi);
                    **low = number_expr(blo);
                    **high = number_expr(bhi);
                }
            }
        }
        _ => {}
    }
}

/// Recognises `a >= lo AND a <= hi` (in either operand order) as a BETWEEN
/// equivalent. Returns `(&mut lo, &mut hi, subject)` so the caller can
/// rewrite the literals in place.
fn match_range_conjunction<'a>(
    left: &'a mut Expr,
    right: &'a mut Expr,
) -> Option<(&'a mut Expr, &'a mut Expr, &'a Expr)> {
    use sqlparser::ast::BinaryOperator::{GtEq, LtEq};
    let same_subject = matches!(
        (&*left, &*right),
        (
            Expr::BinaryOp { left: l1, op: GtEq, .. },
            Expr::BinaryOp { left: l2, op: LtEq, .. },
        ) | (
            Expr::BinaryOp { left: l1, op: LtEq, .. },
            Expr::BinaryOp { left: l2, op: GtEq, .. },
        ) if l1 == l2
    );
    if !same_subject {
        return None;
    }
    let Expr::BinaryOp { left: l1, right: r1, .. } = left else {
        return None;
    };
    let Expr::BinaryOp { right: r2, .. } = right else {
        return None;
    };
    Some((r1.as_mut(), r2.as_mut(), l1.as_ref()))
}

fn is_distance_like(expr: &Expr) -> bool {
    match expr {
        Expr::Function(Function { name, .. }) => {
            let name = object_name_to_string(name).to_ascii_lowercase();
            DISTANCE_FUNCTION_NAMES.contains(&name.as_str()) || name == "sqrt"
        }
        _ => false,
    }
}

fn as_number(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Value(Value::Number(s, _)) => s.parse().ok(),
        Expr::UnaryOp {
            op: sqlparser::ast::UnaryOperator::Minus,
            expr,
        } => as_number(expr).map(|v| -v),
        _ => None,
    }
}

fn number_expr(v: f64) -> Expr {
    let text = if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    };
    Expr::Value(Value::Number(text, false))
}

/// Compatibility shim: older/newer `sqlparser` releases expose `GROUP BY`
/// expressions either as `Vec<Expr>` directly or wrapped in a
/// `GroupByExpr` enum. This crate only needs to iterate them mutably.
trait GroupByCompat {
    fn group_by_exprs_mut_compat(&mut self) -> Vec<&mut Expr>;
}

impl GroupByCompat for Select {
    fn group_by_exprs_mut_compat(&mut self) -> Vec<&mut Expr> {
        match &mut self.group_by {
            sqlparser::ast::GroupByExpr::All => Vec::new(),
            sqlparser::ast::GroupByExpr::Expressions(exprs) => exprs.iter_mut().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BucketSteps;

    fn opts(step: f64) -> CanonicalizeOptions {
        CanonicalizeOptions {
            bucket_steps: BucketSteps {
                step,
                distance_functions_only: false,
            },
        }
    }

    #[test]
    fn strips_order_by_and_limit() {
        let sql = "SELECT * FROM users ORDER BY id LIMIT 10";
        let out = canonicalize(sql, &opts(1.0)).unwrap();
        assert!(!out.text.to_uppercase().contains("ORDER BY"));
        assert!(!out.text.to_uppercase().contains("LIMIT"));
    }

    #[test]
    fn assigns_stable_canonical_aliases() {
        let sql = "SELECT * FROM biz b, loc l WHERE b.id = l.biz_id";
        let out = canonicalize(sql, &opts(1.0)).unwrap();
        // "biz" sorts before "loc" alphabetically, so biz -> t1, loc -> t2.
        assert_eq!(out.table_aliases.get("b"), Some(&"t1".to_string()));
        assert_eq!(out.table_aliases.get("l"), Some(&"t2".to_string()));
        assert!(out.text.contains("t1.id = t2.biz_id"));
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        let sql = "SELECT * FROM biz b, loc l WHERE b.id = l.biz_id ORDER BY b.id";
        let once = canonicalize(sql, &opts(1.0)).unwrap();
        let twice = canonicalize(&once.text, &opts(1.0)).unwrap();
        assert_eq!(once.text, twice.text);
    }

    #[test]
    fn buckets_between_outward() {
        let sql = "SELECT * FROM t WHERE dist BETWEEN 1.6 AND 3.6";
        let with_one = canonicalize(sql, &opts(1.0)).unwrap();
        assert!(with_one.text.contains("BETWEEN 1 AND 4"));

        let with_half = canonicalize(sql, &opts(0.5)).unwrap();
        assert!(with_half.text.contains("BETWEEN 1.5 AND 4"));
    }

    #[test]
    fn bucket_disjoint_across_step_sizes() {
        let sql = "SELECT * FROM t WHERE dist BETWEEN 1.6 AND 3.6";
        let a = canonicalize(sql, &opts(1.0)).unwrap();
        let b = canonicalize(sql, &opts(0.5)).unwrap();
        assert_ne!(a.text, b.text);
    }

    #[test]
    fn strips_distinct_on_but_keeps_plain_distinct() {
        let sql = "SELECT DISTINCT * FROM t";
        let out = canonicalize(sql, &opts(1.0)).unwrap();
        assert!(out.text.to_uppercase().contains("DISTINCT"));
    }

    #[test]
    fn rejects_unparseable_input() {
        let err = canonicalize("not even close to sql (((", &opts(1.0)).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery { .. }));
    }
}
