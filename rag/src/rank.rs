//! `rank`: stable ordering of retrieved chunks ahead of budget fitting.

use crate::core::RetrievedChunk;

/// Order chunks by similarity score (descending); chunks matching the
/// request's subject filter break ties over equally-scored chunks that
/// don't. The sort is stable, so chunks tied on both keys keep the order
/// the vector store returned them in (which is itself tie-broken by chunk
/// ordinal per the gateway's contract).
pub fn rank(mut chunks: Vec<RetrievedChunk>, _question: &str) -> Vec<RetrievedChunk> {
    chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.subject_match.cmp(&a.subject_match))
    });
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, score: f32, subject_match: bool) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.into(),
            text: format!("text-{id}"),
            book_id: "book-1".into(),
            book_title: "Buku Informatika".into(),
            ordinal: 0,
            token_count: 10,
            score,
            subject_match,
        }
    }

    #[test]
    fn orders_by_score_descending() {
        let chunks = vec![chunk("a", 0.2, false), chunk("b", 0.9, false), chunk("c", 0.5, false)];
        let ranked = rank(chunks, "apa itu variabel?");
        assert_eq!(ranked.iter().map(|c| c.chunk_id.as_str()).collect::<Vec<_>>(), vec!["b", "c", "a"]);
    }

    #[test]
    fn score_outranks_subject_match() {
        let chunks = vec![chunk("a", 0.9, false), chunk("b", 0.3, true)];
        let ranked = rank(chunks, "apa itu variabel?");
        assert_eq!(ranked[0].chunk_id, "a");
    }

    #[test]
    fn subject_match_breaks_score_ties() {
        let chunks = vec![chunk("a", 0.5, false), chunk("b", 0.5, true)];
        let ranked = rank(chunks, "apa itu variabel?");
        assert_eq!(ranked[0].chunk_id, "b");
    }

    #[test]
    fn stable_on_exact_ties() {
        let chunks = vec![chunk("a", 0.5, false), chunk("b", 0.5, false)];
        let ranked = rank(chunks, "q");
        assert_eq!(ranked.iter().map(|c| c.chunk_id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
