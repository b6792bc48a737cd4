//! Embedding Client (C2): batches texts into a remote embedding API and
//! returns fixed-dimension float vectors in input order.

mod http;

pub use http::HttpEmbeddingClient;

use async_trait::async_trait;

use crate::error::CidxResult;

/// Default count limit per embedding-API batch (SPEC_FULL.md §4.2).
pub const DEFAULT_BATCH_COUNT_LIMIT: usize = 128;

/// Default total-token budget per batch, approximated in characters.
pub const DEFAULT_BATCH_CHAR_BUDGET: usize = 100_000;

/// Per-item truncation ceiling, in characters (a proxy for a token ceiling).
pub const DEFAULT_ITEM_CHAR_CEILING: usize = 20_000;

/// Abstracts the remote embedding API so the retry/batching policy can be
/// exercised in tests against a deterministic stub instead of the network.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed `texts`, returning one vector per input text, in the same
    /// order. Internally handles batching and retry; callers never see a
    /// partial-batch result — either the whole call succeeds or it returns
    /// the first unrecoverable error.
    async fn embed(&self, texts: &[String]) -> CidxResult<Vec<Vec<f32>>>;

    /// Declared output dimensionality, used to size the projection matrix.
    fn dimensions(&self) -> usize;
}

/// Split `texts` into batches respecting both the count limit and the
/// character budget. A single oversized text is truncated (and logged) to
/// `item_char_ceiling` before batching, so it never blocks the whole batch.
pub fn plan_batches(
    texts: &[String],
    count_limit: usize,
    char_budget: usize,
    item_char_ceiling: usize,
) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_chars = 0usize;

    for text in texts {
        let truncated = if text.len() > item_char_ceiling {
            tracing::warn!(
                original_len = text.len(),
                ceiling = item_char_ceiling,
                "truncating oversized text before embedding"
            );
            text.chars().take(item_char_ceiling).collect::<String>()
        } else {
            text.clone()
        };

        let would_overflow_chars = current_chars + truncated.len() > char_budget && !current.is_empty();
        let would_overflow_count = current.len() >= count_limit;

        if would_overflow_chars || would_overflow_count {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }

        current_chars += truncated.len();
        current.push(truncated);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_respect_count_limit() {
        let texts: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
        let batches = plan_batches(&texts, 3, 1_000_000, 1_000_000);
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.len() <= 3));
    }

    #[test]
    fn batches_respect_char_budget() {
        let texts: Vec<String> = vec!["a".repeat(40), "b".repeat(40), "c".repeat(40)];
        let batches = plan_batches(&texts, 100, 50, 1_000_000);
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn oversized_item_is_truncated() {
        let texts = vec!["x".repeat(100)];
        let batches = plan_batches(&texts, 100, 1_000_000, 10);
        assert_eq!(batches[0][0].len(), 10);
    }

    #[test]
    fn order_is_preserved_across_batches() {
        let texts: Vec<String> = (0..7).map(|i| format!("item-{i}")).collect();
        let batches = plan_batches(&texts, 2, 1_000_000, 1_000_000);
        let flattened: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, texts);
    }
}
