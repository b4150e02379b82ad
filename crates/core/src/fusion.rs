//! Reciprocal Rank Fusion.
//!
//! Merges ranked result lists from multiple sources into one ordering:
//! `score(r) = Σ_c w_c · 1 / (k + pos_c(r))` with `k = 60`. Used both to
//! fan results in across collections and to fuse a collection's dense and
//! sparse lists when the store has no native hybrid query.

use std::collections::HashMap;
use std::hash::Hash;

/// The standard RRF smoothing constant.
pub const RRF_K: f64 = 60.0;

/// Default weights for client-side dense + sparse fusion.
pub const DENSE_WEIGHT: f64 = 0.6;
pub const SPARSE_WEIGHT: f64 = 0.4;

/// One ranked list entering the fusion, best first.
#[derive(Debug, Clone)]
pub struct RankedList<T> {
    /// Source name; lists are processed in sorted-name order so ties break
    /// deterministically.
    pub name: String,
    pub weight: f64,
    pub items: Vec<T>,
}

impl<T> RankedList<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        RankedList { name: name.into(), weight: 1.0, items }
    }

    pub fn weighted(name: impl Into<String>, weight: f64, items: Vec<T>) -> Self {
        RankedList { name: name.into(), weight, items }
    }
}

/// A fused item with its combined score.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused<T> {
    pub item: T,
    pub score: f64,
}

/// Fuse ranked lists with reciprocal-rank scoring.
///
/// The output is a pure function of the inputs: lists are visited in
/// sorted-name order, and score ties resolve by (first list that saw the
/// item, rank within that list).
pub fn rrf_fuse<T: Clone + Eq + Hash>(mut lists: Vec<RankedList<T>>, k: f64) -> Vec<Fused<T>> {
    lists.sort_by(|a, b| a.name.cmp(&b.name));

    struct Acc {
        score: f64,
        /// (list index, rank) of the first appearance, for tie-breaking.
        first_seen: (usize, usize),
        order: usize,
    }

    let mut acc: HashMap<T, Acc> = HashMap::new();
    let mut insertion = 0usize;

    for (list_idx, list) in lists.iter().enumerate() {
        for (rank, item) in list.items.iter().enumerate() {
            let contribution = list.weight / (k + (rank + 1) as f64);
            acc.entry(item.clone())
                .and_modify(|a| a.score += contribution)
                .or_insert_with(|| {
                    insertion += 1;
                    Acc { score: contribution, first_seen: (list_idx, rank), order: insertion }
                });
        }
    }

    let mut fused: Vec<(T, Acc)> = acc.into_iter().collect();
    fused.sort_by(|(_, a), (_, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.first_seen.cmp(&b.first_seen))
            .then(a.order.cmp(&b.order))
    });

    fused.into_iter().map(|(item, a)| Fused { item, score: a.score }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names<'a>(fused: &'a [Fused<&'a str>]) -> Vec<&'a str> {
        fused.iter().map(|f| f.item).collect()
    }

    #[test]
    fn single_list_preserves_order() {
        let fused = rrf_fuse(vec![RankedList::new("a", vec!["x", "y", "z"])], RRF_K);
        assert_eq!(names(&fused), vec!["x", "y", "z"]);
    }

    #[test]
    fn item_in_both_lists_outranks_single_list_items() {
        let fused = rrf_fuse(
            vec![
                RankedList::new("a", vec!["shared", "only_a"]),
                RankedList::new("b", vec!["only_b", "shared"]),
            ],
            RRF_K,
        );
        assert_eq!(fused[0].item, "shared");
        // 1/(60+1) + 1/(60+2) vs 1/(60+1)
        assert!(fused[0].score > fused[1].score);
    }

    #[test]
    fn fusion_is_deterministic_under_input_order() {
        let a = RankedList::new("alpha", vec!["x", "y"]);
        let b = RankedList::new("beta", vec!["p", "q"]);
        let one = rrf_fuse(vec![a.clone(), b.clone()], RRF_K);
        let two = rrf_fuse(vec![b, a], RRF_K);
        assert_eq!(names(&one), names(&two));
    }

    #[test]
    fn ties_break_by_sorted_list_name() {
        // "x" at rank 0 of "beta", "y" at rank 0 of "alpha": equal score,
        // alpha sorts first so y wins.
        let fused = rrf_fuse(
            vec![RankedList::new("beta", vec!["x"]), RankedList::new("alpha", vec!["y"])],
            RRF_K,
        );
        assert_eq!(names(&fused), vec!["y", "x"]);
    }

    #[test]
    fn weights_scale_contributions() {
        let fused = rrf_fuse(
            vec![
                RankedList::weighted("dense", DENSE_WEIGHT, vec!["d"]),
                RankedList::weighted("sparse", SPARSE_WEIGHT, vec!["s"]),
            ],
            RRF_K,
        );
        assert_eq!(fused[0].item, "d");
        let ratio = fused[0].score / fused[1].score;
        assert!((ratio - DENSE_WEIGHT / SPARSE_WEIGHT).abs() < 1e-9);
    }
}
