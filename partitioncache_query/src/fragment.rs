//! Fragment generation (spec §4.2): turns one canonicalised query into the
//! family of smaller, independently cacheable sub-queries whose results
//! can later be intersected to reconstruct (a superset of) the original
//! query's partition-key matches.

use crate::canonical::{self};
use crate::graph::{select_of, EdgeKind, JoinGraph};
use crate::options::FragmentOptions;
use partitioncache_types::error::Error;
use partitioncache_types::Fingerprint;
use sqlparser::ast::{Expr, Statement, TableFactor, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeMap, BTreeSet};

/// One generated fragment: a connected sub-join of the original query,
/// restricted to the tables in `aliases`, with its own fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// The fragment's canonical SQL text.
    pub sql: String,
    /// Fingerprint of `sql`, the cache key this fragment is stored under.
    pub fingerprint: Fingerprint,
    /// Canonical aliases of the tables this fragment joins, including a
    /// reattached star-join table if one was detected.
    pub aliases: BTreeSet<String>,
}

/// The full family of fragments generated from one input query.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentSet {
    /// The partition key this fragment set is scoped to.
    pub partition_key: String,
    /// Fingerprint of the whole canonicalised input query. Intersecting
    /// every fragment's result is a superset of this query's own result
    /// (spec §4.2 "superset property").
    pub source_fingerprint: Fingerprint,
    /// Generated fragments, sorted and de-duplicated by fingerprint.
    pub fragments: Vec<Fragment>,
    /// The star-join table's canonical alias, if one was detected and
    /// reattached onto every enumerated fragment (spec §4.2 "star-join
    /// optimisation"). The apply-cache rewriter uses this to decide
    /// whether `p0_rewritten` applies to a given input query.
    pub star_join_alias: Option<String>,
}

/// Generates the fragment family for `sql` under `partition_key`.
pub fn generate_fragments(
    sql: &str,
    partition_key: &str,
    options: &FragmentOptions,
) -> Result<FragmentSet, Error> {
    let canonical = canonical::canonicalize(sql, &options.canonicalize)?;
    let source_fingerprint = Fingerprint::of(&canonical.text);

    let statement = parse_single(&canonical.text)?;
    let graph = JoinGraph::build(&statement, partition_key);

    if graph.aliases.is_empty() {
        // A single-table query (or one this graph model can't decompose)
        // is its own only fragment.
        return Ok(FragmentSet {
            partition_key: partition_key.to_string(),
            source_fingerprint,
            fragments: vec![Fragment {
                sql: canonical.text.clone(),
                fingerprint: source_fingerprint,
                aliases: BTreeSet::new(),
            }],
            star_join_alias: None,
        });
    }

    let star_alias = detect_star_join(&graph, &options.star_join);
    let mut enumerable = graph.aliases.clone();
    if let Some(star) = &star_alias {
        enumerable.remove(star);
    }
    let restricted = graph.restrict(&enumerable);

    let subsets = if enumerable.is_empty() {
        // Every table was absorbed into the star join; the star table
        // alone is the only fragment.
        vec![BTreeSet::new()]
    } else {
        restricted.connected_subsets(
            options.min_component_size,
            options.max_component_size,
            options.follow_partition_key_joins,
        )
    };

    let conjuncts = flatten_and(select_where(&statement));

    let mut by_fingerprint: BTreeMap<Fingerprint, Fragment> = BTreeMap::new();
    for subset in &subsets {
        let mut effective: BTreeSet<String> = subset.clone();
        if let Some(star) = &star_alias {
            effective.insert(star.clone());
        }

        let predicates: Vec<&Expr> = conjuncts
            .iter()
            .filter(|e| referenced_aliases(e).iter().all(|a| effective.contains(a)))
            .collect();

        add_candidate(
            &graph,
            &effective,
            &predicates,
            partition_key,
            options,
            &mut by_fingerprint,
        )?;

        if !options.constraints.remove_constraints_add.is_empty() {
            let stripped: Vec<&Expr> = predicates
                .iter()
                .filter(|e| {
                    column_names(e).is_disjoint(
                        &options
                            .constraints
                            .remove_constraints_add
                            .iter()
                            .cloned()
                            .collect(),
                    )
                })
                .copied()
                .collect();
            add_candidate(
                &graph,
                &effective,
                &stripped,
                partition_key,
                options,
                &mut by_fingerprint,
            )?;
        }

        extract_in_list_atoms(
            &graph,
            &effective,
            &predicates,
            partition_key,
            options,
            &mut by_fingerprint,
        )?;
    }

    let fragments = by_fingerprint.into_values().collect();
    Ok(FragmentSet {
        partition_key: partition_key.to_string(),
        source_fingerprint,
        fragments,
        star_join_alias: star_alias,
    })
}

fn add_candidate(
    graph: &JoinGraph,
    aliases: &BTreeSet<String>,
    predicates: &[&Expr],
    partition_key: &str,
    options: &FragmentOptions,
    out: &mut BTreeMap<Fingerprint, Fragment>,
) -> Result<(), Error> {
    let sql = render_fragment(graph, aliases, predicates, partition_key, options);
    let canonical = canonical::canonicalize(&sql, &options.canonicalize)?;
    let fingerprint = Fingerprint::of(&canonical.text);
    out.entry(fingerprint).or_insert(Fragment {
        sql: canonical.text,
        fingerprint,
        aliases: aliases.clone(),
    });
    Ok(())
}

/// Renders a fragment's SQL from its table subset and predicate list: a
/// plain `SELECT alias.partition_key FROM t1 AS alias1, ... WHERE ...`,
/// plus any per-table constraints configured for the tables involved
/// (spec §4.2 "Constraint transforms").
fn render_fragment(
    graph: &JoinGraph,
    aliases: &BTreeSet<String>,
    predicates: &[&Expr],
    partition_key: &str,
    options: &FragmentOptions,
) -> String {
    let projected_alias = aliases.iter().next().cloned().unwrap_or_default();

    let from_list = aliases
        .iter()
        .map(|alias| {
            let table = graph
                .tables
                .get(alias)
                .cloned()
                .unwrap_or_else(|| alias.clone());
            if &table == alias {
                table
            } else {
                format!("{table} AS {alias}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut predicate_texts: Vec<String> = predicates.iter().map(|e| e.to_string()).collect();

    for alias in aliases {
        if let Some(table) = graph.tables.get(alias) {
            if let Some(extra) = options.constraints.add_constraints.get(table) {
                predicate_texts.push(extra.clone());
            }
        }
    }

    if !options.constraints.remove_constraints_all.is_empty() {
        let removed: BTreeSet<String> = options
            .constraints
            .remove_constraints_all
            .iter()
            .cloned()
            .collect();
        predicate_texts.retain(|text| !attribute_names_in_text(text).iter().any(|a| removed.contains(a)));
    }

    if predicate_texts.is_empty() {
        format!("SELECT {projected_alias}.{partition_key} FROM {from_list}")
    } else {
        format!(
            "SELECT {projected_alias}.{partition_key} FROM {from_list} WHERE {}",
            predicate_texts.join(" AND ")
        )
    }
}

/// Cheap attribute-name extraction from already-rendered predicate text,
/// used only to apply `remove_constraints_all` to the synthetic
/// constraints appended by `add_constraints` (which are stored as plain
/// strings, not parsed `Expr`s).
fn attribute_names_in_text(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '.')
        .filter(|s| !s.is_empty())
        .map(|s| s.rsplit('.').next().unwrap_or(s).to_string())
        .collect()
}

/// Expands `alias.col IN (v1, v2, ...)` predicates into one fragment per
/// value atom (spec §4.2 "atom extraction"): each becomes its own
/// cacheable `alias.col = v_i` fragment, alongside (not instead of) the
/// fragment generated from the full predicate set.
fn extract_in_list_atoms(
    graph: &JoinGraph,
    aliases: &BTreeSet<String>,
    predicates: &[&Expr],
    partition_key: &str,
    options: &FragmentOptions,
    out: &mut BTreeMap<Fingerprint, Fragment>,
) -> Result<(), Error> {
    for (idx, predicate) in predicates.iter().enumerate() {
        if let Expr::InList {
            expr,
            list,
            negated: false,
        } = predicate
        {
            // An unqualified column (`zipcode IN (...)`) has zero referenced
            // aliases; it's only unambiguous when the fragment itself joins
            // exactly one table, so treat that case like a single alias ref.
            let alias_refs = referenced_aliases(expr);
            let unambiguous = alias_refs.len() == 1 || (alias_refs.is_empty() && aliases.len() <= 1);
            if !unambiguous || !list.iter().all(|v| matches!(v, Expr::Value(_))) {
                continue;
            }
            let rest: Vec<&Expr> = predicates
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != idx)
                .map(|(_, p)| *p)
                .collect();
            for value in list {
                let Expr::Value(v) = value else { continue };
                let atom = Expr::BinaryOp {
                    left: expr.clone(),
                    op: sqlparser::ast::BinaryOperator::Eq,
                    right: Box::new(Expr::Value(v.clone())),
                };
                let mut with_atom = rest.clone();
                with_atom.push(&atom);
                let sql = render_fragment(graph, aliases, &with_atom, partition_key, options);
                let canonical = canonical::canonicalize(&sql, &options.canonicalize)?;
                let fingerprint = Fingerprint::of(&canonical.text);
                out.entry(fingerprint).or_insert(Fragment {
                    sql: canonical.text,
                    fingerprint,
                    aliases: aliases.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Identifies the star-join table, if any, per the precedence rule in
/// [`crate::options::StarJoinDetection`]: explicit name/alias, then
/// naming-convention prefix, then automatic detection. Ties within a
/// rule are broken by the alphabetically-first alias, so detection is
/// deterministic run to run.
fn detect_star_join(
    graph: &JoinGraph,
    detection: &crate::options::StarJoinDetection,
) -> Option<String> {
    if let Some(explicit) = &detection.explicit {
        if graph.aliases.contains(explicit) {
            return Some(explicit.clone());
        }
    }

    if let Some(prefix) = &detection.naming_prefix {
        let mut candidates: Vec<String> = graph
            .aliases
            .iter()
            .filter(|alias| {
                alias.starts_with(prefix.as_str())
                    || graph
                        .tables
                        .get(*alias)
                        .map(|t| t.starts_with(prefix.as_str()))
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        candidates.sort();
        if let Some(first) = candidates.into_iter().next() {
            return Some(first);
        }
    }

    if detection.auto_detect {
        let n = graph.aliases.len();
        if n > 1 {
            let mut candidates: Vec<String> = graph
                .aliases
                .iter()
                .filter(|alias| {
                    let neighbours = graph.neighbours(alias);
                    neighbours.len() == n - 1
                        && neighbours.iter().all(|(_, kind)| *kind == EdgeKind::PartitionKeyEqui)
                })
                .cloned()
                .collect();
            candidates.sort();
            if let Some(first) = candidates.into_iter().next() {
                return Some(first);
            }
        }
    }

    None
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

fn select_where(statement: &Statement) -> Option<&Expr> {
    match statement {
        Statement::Query(query) => select_of(&query.body).and_then(|s| s.selection.as_ref()),
        _ => None,
    }
}

fn flatten_and(expr: Option<&Expr>) -> Vec<Expr> {
    let mut out = Vec::new();
    if let Some(expr) = expr {
        flatten_and_into(expr, &mut out);
    }
    out
}

fn flatten_and_into(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: sqlparser::ast::BinaryOperator::And,
            right,
        } => {
            flatten_and_into(left, out);
            flatten_and_into(right, out);
        }
        Expr::Nested(inner) => flatten_and_into(inner, out),
        other => out.push(other.clone()),
    }
}

/// All table aliases referenced anywhere within `expr`.
fn referenced_aliases(expr: &Expr) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_qualifiers(expr, &mut out);
    out
}

fn collect_qualifiers(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::CompoundIdentifier(parts) => {
            if let Some(first) = parts.first() {
                out.insert(first.value.clone());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_qualifiers(left, out);
            collect_qualifiers(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::IsNull(expr) | Expr::IsNotNull(expr) => {
            collect_qualifiers(expr, out)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_qualifiers(expr, out);
            collect_qualifiers(low, out);
            collect_qualifiers(high, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_qualifiers(expr, out);
            for item in list {
                collect_qualifiers(item, out);
            }
        }
        Expr::InSubquery { expr, .. } => collect_qualifiers(expr, out),
        Expr::Function(sqlparser::ast::Function { args, .. }) => {
            for arg in args {
                if let sqlparser::ast::FunctionArg::Unnamed(sqlparser::ast::FunctionArgExpr::Expr(e))
                | sqlparser::ast::FunctionArg::Named {
                    arg: sqlparser::ast::FunctionArgExpr::Expr(e),
                    ..
                } = arg
                {
                    collect_qualifiers(e, out);
                }
            }
        }
        _ => {}
    }
}

/// All bare column/attribute names (the last segment of any identifier)
/// referenced anywhere within `expr`. Used by `remove_constraints_all`
/// and `remove_constraints_add` to drop predicates by attribute name.
fn column_names(expr: &Expr) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_column_names(expr, &mut out);
    out
}

fn collect_column_names(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::CompoundIdentifier(parts) => {
            if let Some(last) = parts.last() {
                out.insert(last.value.clone());
            }
        }
        Expr::Identifier(ident) => {
            out.insert(ident.value.clone());
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_column_names(left, out);
            collect_column_names(right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => collect_column_names(expr, out),
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_column_names(expr, out);
            collect_column_names(low, out);
            collect_column_names(high, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_column_names(expr, out);
            for item in list {
                collect_column_names(item, out);
            }
        }
        _ => {}
    }
}

#[allow(dead_code)]
fn is_literal(expr: &Expr) -> bool {
    matches!(expr, Expr::Value(Value::Number(_, _) | Value::SingleQuotedString(_)))
}

#[allow(dead_code)]
fn is_table_factor_subquery(factor: &TableFactor) -> bool {
    matches!(factor, TableFactor::Derived { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{FragmentOptions, StarJoinDetection};

    #[test]
    fn single_table_query_is_its_own_fragment() {
        let set = generate_fragments(
            "SELECT * FROM biz WHERE zipcode = 1",
            "zipcode",
            &FragmentOptions::default(),
        )
        .unwrap();
        assert_eq!(set.fragments.len(), 1);
    }

    #[test]
    fn two_table_join_generates_component_fragments() {
        let sql = "SELECT * FROM biz b, loc l WHERE b.zipcode = l.zipcode AND b.category = 'cafe'";
        let set = generate_fragments(sql, "zipcode", &FragmentOptions::default()).unwrap();
        // At least the two singleton components and the joined pair.
        assert!(set.fragments.len() >= 3);
    }

    #[test]
    fn fragment_generation_is_deterministic() {
        let sql = "SELECT * FROM biz b, loc l WHERE b.zipcode = l.zipcode AND b.category = 'cafe'";
        let a = generate_fragments(sql, "zipcode", &FragmentOptions::default()).unwrap();
        let b = generate_fragments(sql, "zipcode", &FragmentOptions::default()).unwrap();
        assert_eq!(a.fragments, b.fragments);
    }

    #[test]
    fn star_join_table_is_excluded_from_enumeration_but_reattached() {
        let sql = "SELECT * FROM biz b, loc l, p0_meta p WHERE b.zipcode = l.zipcode AND b.zipcode = p.zipcode AND p.active = true";
        let options = FragmentOptions {
            star_join: StarJoinDetection::default_policy(),
            ..FragmentOptions::default()
        };
        let set = generate_fragments(sql, "zipcode", &options).unwrap();
        // No fragment should enumerate {p} alone or {p, l} etc. as an
        // independent combinatorial branch: p0_meta only ever appears
        // reattached onto fragments built from {b}, {l}, or {b,l}.
        assert!(set
            .fragments
            .iter()
            .all(|f| f.aliases.contains("b") || f.aliases.contains("l")));
    }

    #[test]
    fn in_list_expands_into_value_atoms() {
        let sql = "SELECT * FROM biz WHERE zipcode IN (1, 2, 3)";
        let set = generate_fragments(sql, "zipcode", &FragmentOptions::default()).unwrap();
        let equalities = set
            .fragments
            .iter()
            .filter(|f| f.sql.contains("zipcode = "))
            .count();
        assert_eq!(equalities, 3);
    }

    #[test]
    fn respects_min_component_size() {
        let sql = "SELECT * FROM biz b, loc l WHERE b.zipcode = l.zipcode";
        let options = FragmentOptions {
            min_component_size: 2,
            ..FragmentOptions::default()
        };
        let set = generate_fragments(sql, "zipcode", &options).unwrap();
        assert!(set.fragments.iter().all(|f| f.aliases.len() >= 2));
    }
}
