//! The apply-cache rewriter entry point (spec §4.5).

use crate::options::RewriteOptions;
use crate::splice::{parse_predicate, sql_literal, SpliceMethod, Target};
use crate::starjoin;
use crate::stats::RewriteStats;
use observability_deps::tracing::debug;
use partitioncache_cache::CacheHandler;
use partitioncache_query::{canonicalize, generate_fragments, FragmentSet};
use partitioncache_types::{Fingerprint, IdentifierSet, Result};

const CACHE_CTE_ALIAS: &str = "__pc_cache";

/// Runs the apply-cache rewriter over `sql` (spec §4.5): decomposes it
/// into fragments, looks up which are already cached, and — if any are —
/// splices the cached restriction into a rewritten query.
///
/// Returns the original `sql` unchanged, with `stats.enhanced == false`,
/// whenever nothing in the fragment family is cached yet.
pub async fn apply_cache(
    handler: &dyn CacheHandler,
    sql: &str,
    partition_key: &str,
    options: &RewriteOptions,
) -> Result<(String, RewriteStats)> {
    let fragment_set = generate_fragments(sql, partition_key, &options.fragment)?;
    let generated_variants = fragment_set.fragments.len();

    let keys: Vec<Fingerprint> = fragment_set.fragments.iter().map(|f| f.fingerprint).collect();
    let existing = handler.filter_existing_keys(&keys, partition_key, true).await?;

    let mut stats = RewriteStats {
        generated_variants,
        cache_hits: existing.len(),
        enhanced: false,
        p0_rewritten: false,
    };

    if existing.is_empty() {
        return Ok((sql.to_string(), stats));
    }
    let existing_keys: Vec<Fingerprint> = existing.into_iter().collect();

    let spliced = if options.wants_spatial() {
        splice_spatial(handler, &existing_keys, partition_key, options).await?
    } else {
        splice_restriction(handler, &existing_keys, partition_key, options).await?
    };

    let Some(spliced) = spliced else {
        return Ok((sql.to_string(), stats));
    };

    let mut target = Target::parse(sql)?;

    if let Some(star_alias) = resolve_star_alias(sql, options, &fragment_set)? {
        if let Some(select) = target.select_mut() {
            if starjoin::undo_star_join(select, &star_alias) {
                stats.p0_rewritten = true;
            }
        }
    }

    target.and_where(parse_predicate(&spliced.predicate)?);
    if let Some(from_fragment) = &spliced.from_fragment {
        target.add_from(from_fragment)?;
    }

    let rendered = match &spliced.cte {
        Some(cte) => format!("{cte} {}", target.render()),
        None => target.render(),
    };

    stats.enhanced = true;
    debug!(
        partition_key,
        generated_variants = stats.generated_variants,
        cache_hits = stats.cache_hits,
        p0_rewritten = stats.p0_rewritten,
        "applied cache restriction to query"
    );
    Ok((rendered, stats))
}

/// Maps the fragment generator's detected star-join alias (a canonical
/// `tN` alias, assigned against the fragment generator's own internal
/// re-canonicalisation of `sql`) back onto the original table reference
/// in `sql`, by re-running the same canonicalisation step ourselves and
/// inverting its alias map. Canonicalisation is deterministic given the
/// same options, so this always agrees with the fragment generator's
/// numbering.
fn resolve_star_alias(sql: &str, options: &RewriteOptions, fragment_set: &FragmentSet) -> Result<Option<String>> {
    let Some(canonical_alias) = &fragment_set.star_join_alias else {
        return Ok(None);
    };
    let canonical = canonicalize(sql, &options.fragment.canonicalize)?;
    Ok(canonical
        .table_aliases
        .iter()
        .find(|(_, canon)| *canon == canonical_alias)
        .map(|(original, _)| original.clone()))
}

/// The restriction text (and any supporting CTE/`FROM` addition) to
/// splice into the outer query.
struct Spliced {
    predicate: String,
    cte: Option<String>,
    from_fragment: Option<String>,
}

enum Source {
    Lazy(String),
    Eager(IdentifierSet),
}

async fn splice_restriction(
    handler: &dyn CacheHandler,
    keys: &[Fingerprint],
    partition_key: &str,
    options: &RewriteOptions,
) -> Result<Option<Spliced>> {
    if let Some(lazy) = handler.as_lazy() {
        let (select_sql, hits) = lazy.get_intersected_lazy(keys, partition_key).await?;
        if let Some(select_sql) = select_sql {
            debug!(partition_key, hits, "using lazy cache intersection for splice");
            return Ok(Some(build_splice(options.splice, partition_key, Source::Lazy(select_sql))));
        }
    }

    let (ids, hits) = handler.get_intersected(keys, partition_key).await?;
    let Some(ids) = ids else { return Ok(None) };
    debug!(partition_key, hits, count = ids.len(), "using eager cache intersection for splice");
    Ok(Some(build_splice(options.splice, partition_key, Source::Eager(ids))))
}

async fn splice_spatial(
    handler: &dyn CacheHandler,
    keys: &[Fingerprint],
    partition_key: &str,
    options: &RewriteOptions,
) -> Result<Option<Spliced>> {
    let Some(spatial) = handler.as_spatial() else {
        debug!(
            partition_key,
            "spatial splice requested but this backend has no spatial capability; falling back to restriction splice"
        );
        return splice_restriction(handler, keys, partition_key, options).await;
    };

    let buffer_distance = options.buffer_distance.unwrap_or(0.0);
    let geometry_column = options.geometry_column.as_deref().unwrap_or(partition_key);
    let Some(filter) = spatial.get_spatial_filter(keys, partition_key, buffer_distance).await? else {
        return Ok(None);
    };

    let hex = filter.wkb.iter().map(|b| format!("{b:02x}")).collect::<String>();
    let predicate = format!(
        "ST_DWithin({geometry_column}, ST_GeomFromWKB(decode('{hex}', 'hex'), {srid}), {buffer_distance})",
        srid = filter.srid,
    );
    Ok(Some(Spliced {
        predicate,
        cte: None,
        from_fragment: None,
    }))
}

fn build_splice(method: SpliceMethod, partition_key: &str, source: Source) -> Spliced {
    match method {
        SpliceMethod::InSubquery => Spliced {
            predicate: match &source {
                Source::Lazy(select_sql) => format!("{partition_key} IN ({select_sql})"),
                Source::Eager(ids) => in_list_predicate(partition_key, ids),
            },
            cte: None,
            from_fragment: None,
        },
        SpliceMethod::TmpTableIn => Spliced {
            predicate: format!("{partition_key} IN (SELECT pk FROM {CACHE_CTE_ALIAS})"),
            cte: Some(cte_text(&source)),
            from_fragment: None,
        },
        SpliceMethod::TmpTableJoin => Spliced {
            predicate: format!("{partition_key} = {CACHE_CTE_ALIAS}.pk"),
            cte: Some(cte_text(&source)),
            from_fragment: Some(CACHE_CTE_ALIAS.to_string()),
        },
    }
}

fn in_list_predicate(partition_key: &str, ids: &IdentifierSet) -> String {
    if ids.is_empty() {
        // A legitimate empty intersection: no identifier could ever
        // match, so the restriction is unsatisfiable rather than absent.
        return "1 = 0".to_string();
    }
    let values = ids.iter().map(sql_literal).collect::<Vec<_>>().join(", ");
    format!("{partition_key} IN ({values})")
}

fn cte_text(source: &Source) -> String {
    match source {
        Source::Lazy(select_sql) => format!("WITH {CACHE_CTE_ALIAS}(pk) AS ({select_sql})"),
        Source::Eager(ids) if ids.is_empty() => {
            format!("WITH {CACHE_CTE_ALIAS}(pk) AS (SELECT NULL WHERE FALSE)")
        }
        Source::Eager(ids) => {
            let rows = ids
                .iter()
                .map(|id| format!("({})", sql_literal(id)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("WITH {CACHE_CTE_ALIAS}(pk) AS (VALUES {rows})")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partitioncache_types::Identifier;

    #[test]
    fn in_list_predicate_handles_empty_set() {
        let ids: IdentifierSet = IdentifierSet::new();
        assert_eq!(in_list_predicate("zip", &ids), "1 = 0");
    }

    #[test]
    fn in_list_predicate_renders_values() {
        let mut ids: IdentifierSet = IdentifierSet::new();
        ids.insert(Identifier::Integer(1));
        ids.insert(Identifier::Integer(2));
        assert_eq!(in_list_predicate("zip", &ids), "zip IN (1, 2)");
    }

    #[test]
    fn cte_text_for_eager_empty_set_is_dry() {
        let cte = cte_text(&Source::Eager(IdentifierSet::new()));
        assert!(cte.contains("WHERE FALSE"));
    }
}
