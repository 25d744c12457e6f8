//! Relevance scoring for non-semantic sources.
//!
//! The semantic index scores by similarity on its own. Everything else
//! (sibling files, resource listings, documentation pages) is scored by a
//! [`RelevanceScorer`], kept pluggable so weights can be tuned per source
//! without touching the adapters. Scores are in `[0.0, 1.0]`.

use crate::models::CompletionQuery;

pub trait RelevanceScorer: Send + Sync {
    /// Score a candidate identified by `candidate` (a path or resource URI).
    fn score(&self, query: &CompletionQuery, candidate: &str) -> f32;
}

/// Scores by directory distance and shared file-name tokens.
///
/// `proximity = 1 / (1 + hops)` where `hops` counts the directory steps
/// between the query file and the candidate; `name` is the Jaccard overlap
/// of file-stem tokens.
#[derive(Debug, Clone)]
pub struct PathProximityScorer {
    pub proximity_weight: f32,
    pub name_weight: f32,
}

impl Default for PathProximityScorer {
    fn default() -> Self {
        Self {
            proximity_weight: 0.7,
            name_weight: 0.3,
        }
    }
}

impl RelevanceScorer for PathProximityScorer {
    fn score(&self, query: &CompletionQuery, candidate: &str) -> f32 {
        let candidate = strip_scheme(candidate);
        if candidate == query.file_path {
            return 0.0;
        }
        let hops = directory_hops(query.directory(), parent_dir(candidate));
        let proximity = 1.0 / (1.0 + hops as f32);
        let name = jaccard(&stem_tokens(&query.file_path), &stem_tokens(candidate));
        let total = self.proximity_weight * proximity + self.name_weight * name;
        total.clamp(0.0, 1.0)
    }
}

/// Scores by how many query terms (language plus file-stem tokens) occur in
/// the candidate name. Used for documentation listings.
#[derive(Debug, Clone, Default)]
pub struct KeywordScorer;

impl RelevanceScorer for KeywordScorer {
    fn score(&self, query: &CompletionQuery, candidate: &str) -> f32 {
        let mut terms = stem_tokens(&query.file_path);
        if !query.language.is_empty() {
            terms.push(query.language.to_lowercase());
        }
        terms.sort();
        terms.dedup();
        if terms.is_empty() {
            return 0.0;
        }
        let haystack = candidate.to_lowercase();
        let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
        hits as f32 / terms.len() as f32
    }
}

/// Strip a `scheme://` prefix from a resource URI.
pub fn strip_scheme(s: &str) -> &str {
    match s.find("://") {
        Some(idx) => &s[idx + 3..],
        None => s,
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn components(dir: &str) -> Vec<&str> {
    dir.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}

/// Steps up from `from` to the common ancestor plus steps down to `to`.
fn directory_hops(from: &str, to: &str) -> usize {
    let a = components(from);
    let b = components(to);
    let common = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    (a.len() - common) + (b.len() - common)
}

/// Lowercased tokens of a file stem, split on `_`, `-`, `.` and camelCase.
fn stem_tokens(path: &str) -> Vec<String> {
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = match file.rfind('.') {
        Some(idx) if idx > 0 => &file[..idx],
        _ => file,
    };

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in stem.chars() {
        if ch == '_' || ch == '-' || ch == '.' || ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn jaccard(a: &[String], b: &[String]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.iter().filter(|t| b.contains(t)).count();
    let union = a.len() + b.len() - inter;
    inter as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Position;

    fn query(path: &str) -> CompletionQuery {
        CompletionQuery::new(path, Position::default(), "rust")
    }

    #[test]
    fn same_directory_beats_distant() {
        let scorer = PathProximityScorer::default();
        let q = query("src/net/conn.rs");
        let near = scorer.score(&q, "src/net/socket.rs");
        let far = scorer.score(&q, "docs/guide/socket.rs");
        assert!(near > far, "near={near} far={far}");
    }

    #[test]
    fn shared_name_tokens_raise_score() {
        let scorer = PathProximityScorer::default();
        let q = query("src/conn_pool.rs");
        let related = scorer.score(&q, "src/conn_pool_test.rs");
        let unrelated = scorer.score(&q, "src/parser.rs");
        assert!(related > unrelated);
    }

    #[test]
    fn current_file_scores_zero() {
        let scorer = PathProximityScorer::default();
        let q = query("src/lib.rs");
        assert_eq!(scorer.score(&q, "src/lib.rs"), 0.0);
        assert_eq!(scorer.score(&q, "file://src/lib.rs"), 0.0);
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let scorer = PathProximityScorer::default();
        let q = query("a/b/c/d.rs");
        for cand in ["a/b/c/e.rs", "x.rs", "a/b/c/d_d.rs", "z/y/x/w/v.rs"] {
            let s = scorer.score(&q, cand);
            assert!((0.0..=1.0).contains(&s), "{cand}: {s}");
        }
    }

    #[test]
    fn camel_case_tokens() {
        assert_eq!(stem_tokens("src/HttpClient.ts"), vec!["http", "client"]);
        assert_eq!(stem_tokens("conn_pool.rs"), vec!["conn", "pool"]);
    }

    #[test]
    fn keyword_scorer_matches_language_and_stem() {
        let scorer = KeywordScorer;
        let q = query("src/http_client.rs");
        let hit = scorer.score(&q, "docs://rust/std/http");
        let miss = scorer.score(&q, "docs://python/asyncio");
        assert!(hit > miss);
        assert_eq!(miss, 0.0);
    }
}
