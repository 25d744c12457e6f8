//! Ranker / Truncator.
//!
//! Merges items from every source, orders them by the score each source
//! assigned, and cuts the list at the byte budget.
//!
//! # Algorithm
//!
//! 1. Pull out the current-file item; it is always kept and always first.
//! 2. Stable-sort the rest by score (desc), then `byte_size` (asc). Items
//!    that tie on both keep their discovery order.
//! 3. Drop exact-duplicate content, keeping the higher-ranked copy.
//! 4. Accumulate in order until the next item would exceed the budget,
//!    then stop. Items are never split.
//!
//! The current file may overrun the budget on its own; that is reported as
//! [`ContextError::BudgetExceededByMandatoryItem`] and tolerated.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::ContextError;
use crate::models::ContextItem;

/// Result of [`rank_and_truncate`].
#[derive(Debug)]
pub struct Truncation {
    pub items: Vec<ContextItem>,
    pub total_bytes: usize,
    /// Items dropped because the budget ran out.
    pub excluded_by_budget: usize,
    /// Set when the mandatory item alone exceeds the budget.
    pub overrun: Option<ContextError>,
}

/// Ordering used by the ranker: score descending, then size ascending.
pub fn compare_items(a: &ContextItem, b: &ContextItem) -> Ordering {
    score_key(b.relevance_score())
        .total_cmp(&score_key(a.relevance_score()))
        .then(a.byte_size().cmp(&b.byte_size()))
}

fn score_key(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

/// Rank `items` (in discovery order) and truncate them to `budget_bytes`.
pub fn rank_and_truncate(items: Vec<ContextItem>, budget_bytes: usize) -> Truncation {
    let mut mandatory: Option<ContextItem> = None;
    let mut rest = Vec::with_capacity(items.len());
    for item in items {
        if item.is_current_file() && mandatory.is_none() {
            mandatory = Some(item);
        } else {
            rest.push(item);
        }
    }

    // `sort_by` is stable, which keeps discovery order inside a tie.
    rest.sort_by(compare_items);

    let mut seen: HashSet<&str> = HashSet::new();
    let mut keep = vec![false; rest.len()];
    if let Some(m) = &mandatory {
        seen.insert(m.content());
    }
    for (i, item) in rest.iter().enumerate() {
        keep[i] = seen.insert(item.content());
    }

    let mut out = Vec::new();
    let mut total_bytes = 0usize;
    let mut overrun = None;

    if let Some(m) = mandatory {
        total_bytes = m.byte_size();
        if total_bytes > budget_bytes {
            overrun = Some(ContextError::BudgetExceededByMandatoryItem {
                item_bytes: total_bytes,
                budget_bytes,
            });
        }
        out.push(m);
    }

    let candidates: Vec<ContextItem> = rest
        .into_iter()
        .zip(keep)
        .filter_map(|(item, k)| k.then_some(item))
        .collect();
    let candidate_count = candidates.len();

    for item in candidates {
        if total_bytes + item.byte_size() > budget_bytes {
            break;
        }
        total_bytes += item.byte_size();
        out.push(item);
    }

    let kept_candidates = out.len() - usize::from(out.first().is_some_and(|i| i.is_current_file()));

    Truncation {
        excluded_by_budget: candidate_count - kept_candidates,
        items: out,
        total_bytes,
        overrun,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceId;

    fn item(source: &str, bytes: usize, score: f32) -> ContextItem {
        ContextItem::new(SourceId::new(source), "x".repeat(bytes), score)
    }

    fn tagged(source: &str, tag: &str, bytes: usize, score: f32) -> ContextItem {
        let mut content = tag.to_string();
        content.push_str(&"x".repeat(bytes.saturating_sub(tag.len())));
        ContextItem::new(SourceId::new(source), content, score)
    }

    #[test]
    fn current_file_only_when_related_file_is_too_big() {
        let current = tagged("buffer", "cur", 2 * 1024, 1.0).as_current_file();
        let related = tagged("mcp:fs", "rel", 60 * 1024, 0.6);
        let t = rank_and_truncate(vec![related, current], 50 * 1024);
        assert_eq!(t.items.len(), 1);
        assert!(t.items[0].is_current_file());
        assert_eq!(t.total_bytes, 2 * 1024);
        assert_eq!(t.excluded_by_budget, 1);
        assert!(t.overrun.is_none());
    }

    #[test]
    fn mandatory_item_may_overrun() {
        let current = item("buffer", 100, 1.0).as_current_file();
        let other = tagged("semantic", "o", 10, 0.9);
        let t = rank_and_truncate(vec![other, current], 50);
        assert_eq!(t.items.len(), 1);
        assert_eq!(t.total_bytes, 100);
        assert!(matches!(
            t.overrun,
            Some(ContextError::BudgetExceededByMandatoryItem { item_bytes: 100, budget_bytes: 50 })
        ));
    }

    #[test]
    fn score_desc_then_size_asc() {
        let a = tagged("s", "a", 30, 0.5);
        let b = tagged("s", "b", 10, 0.5);
        let c = tagged("s", "c", 20, 0.9);
        let t = rank_and_truncate(vec![a, b, c], 1000);
        let order: Vec<&str> = t.items.iter().map(|i| &i.content()[..1]).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn full_ties_keep_discovery_order() {
        let items: Vec<ContextItem> = ["p", "q", "r", "s"]
            .iter()
            .map(|t| tagged("s", t, 8, 0.4))
            .collect();
        let t = rank_and_truncate(items, 1000);
        let order: Vec<&str> = t.items.iter().map(|i| &i.content()[..1]).collect();
        assert_eq!(order, vec!["p", "q", "r", "s"]);
    }

    #[test]
    fn stops_at_first_non_fitting_item() {
        // The third item would fit on its own but comes after one that doesn't.
        let a = tagged("s", "a", 40, 0.9);
        let b = tagged("s", "b", 40, 0.8);
        let c = tagged("s", "c", 5, 0.1);
        let t = rank_and_truncate(vec![a, b, c], 60);
        assert_eq!(t.items.len(), 1);
        assert_eq!(t.total_bytes, 40);
    }

    #[test]
    fn duplicates_collapse_to_best_copy() {
        let a = ContextItem::new(SourceId::new("buffer"), "fn shared() {}", 0.3);
        let b = ContextItem::new(SourceId::new("mcp:fs"), "fn shared() {}", 0.7);
        let t = rank_and_truncate(vec![a, b], 1000);
        assert_eq!(t.items.len(), 1);
        assert_eq!(t.items[0].source_id().as_str(), "mcp:fs");
    }

    #[test]
    fn nan_scores_sink_to_the_bottom() {
        let a = tagged("s", "a", 5, f32::NAN);
        let b = tagged("s", "b", 5, 0.1);
        let t = rank_and_truncate(vec![a, b], 1000);
        assert_eq!(&t.items[0].content()[..1], "b");
    }

    #[test]
    fn never_exceeds_budget_without_mandatory_item() {
        let items: Vec<ContextItem> = (0..50)
            .map(|i| tagged("s", &format!("{i:02}"), 7 + (i * 13) % 40, (i % 7) as f32 / 7.0))
            .collect();
        for budget in [0, 1, 50, 123, 400, 10_000] {
            let t = rank_and_truncate(items.clone(), budget);
            assert!(t.total_bytes <= budget);
            let sum: usize = t.items.iter().map(|i| i.byte_size()).sum();
            assert_eq!(sum, t.total_bytes);
        }
    }
}
