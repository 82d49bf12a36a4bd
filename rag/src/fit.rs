//! `fit`: greedy selection of ranked chunks into a fixed token budget.

use crate::core::RetrievedChunk;

/// Below this many remaining tokens we stop trying chunks even if one
/// would technically fit — leaves headroom for prompt boilerplate that the
/// caller's budget didn't already account for.
pub const DEFAULT_BUDGET_FLOOR_TOKENS: u32 = 64;

/// Result of a `fit` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub selected: Vec<RetrievedChunk>,
    pub tokens_used: u32,
}

impl FitOutcome {
    pub fn is_fallback(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Greedily select the highest-ranked chunks that fit within `budget_tokens`.
///
/// Walks `ranked` in order; a chunk that doesn't fit in the remaining budget
/// is skipped (not a hard stop) so a smaller, lower-ranked chunk later in
/// the list can still be picked up. Stops early once the remaining budget
/// drops below `floor_tokens` or every remaining chunk has been rejected.
pub fn fit(ranked: &[RetrievedChunk], budget_tokens: u32, floor_tokens: u32) -> FitOutcome {
    let mut remaining = budget_tokens;
    let mut selected = Vec::new();
    let mut used = 0u32;

    for chunk in ranked {
        if remaining < floor_tokens {
            break;
        }
        if chunk.token_count <= remaining {
            remaining -= chunk.token_count;
            used += chunk.token_count;
            selected.push(chunk.clone());
        }
    }

    FitOutcome { selected, tokens_used: used }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, tokens: u32, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.into(),
            text: format!("text-{id}"),
            book_id: "book-1".into(),
            book_title: "Buku Informatika".into(),
            ordinal: 0,
            token_count: tokens,
            score,
            subject_match: false,
        }
    }

    #[test]
    fn greedy_skip_then_continue() {
        // budget 100: first chunk (80) fits, second (30) doesn't after that,
        // third (10) still fits.
        let ranked = vec![chunk("a", 80, 0.9), chunk("b", 30, 0.8), chunk("c", 10, 0.7)];
        let outcome = fit(&ranked, 100, 0);
        assert_eq!(
            outcome.selected.iter().map(|c| c.chunk_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(outcome.tokens_used, 90);
    }

    #[test]
    fn empty_when_nothing_fits() {
        let ranked = vec![chunk("a", 500, 0.9)];
        let outcome = fit(&ranked, 100, 0);
        assert!(outcome.is_fallback());
    }

    #[test]
    fn stops_below_floor() {
        let ranked = vec![chunk("a", 10, 0.9), chunk("b", 5, 0.8)];
        // after taking "a", remaining=90 is still above floor=95? no: budget 100, floor 95
        let outcome = fit(&ranked, 100, 95);
        // remaining starts at 100 >= 95, take "a" (10) -> remaining 90 < 95, stop.
        assert_eq!(outcome.selected.len(), 1);
        assert_eq!(outcome.selected[0].chunk_id, "a");
    }

    #[test]
    fn empty_input_is_fallback() {
        let outcome = fit(&[], 3000, 1000);
        assert!(outcome.is_fallback());
        assert_eq!(outcome.tokens_used, 0);
    }
}
