use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CidxError, CidxResult};

use super::{
    plan_batches, EmbeddingClient, DEFAULT_BATCH_CHAR_BUDGET, DEFAULT_BATCH_COUNT_LIMIT,
    DEFAULT_ITEM_CHAR_CEILING,
};

/// Retry/backoff tuning, separated from the client itself so it can be
/// asserted against directly in tests without making real requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter: `Uniform(0, min(max, base *
    /// factor^attempt))`. `attempt` is 0-based (first retry is attempt 0).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt);
        let capped = self
            .base_delay
            .saturating_mul(exp)
            .min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
        Duration::from_millis(jitter_ms)
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponseItem {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedResponseItem>,
}

/// HTTP-backed embedding client against a Voyage-style API (SPEC_FULL.md
/// §4.2/§6): `POST {endpoint}` with `Authorization: Bearer <key>`, body
/// `{model, input}`, response `{data: [{embedding, index}...]}`.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    retry: RetryPolicy,
    batch_count_limit: usize,
    batch_char_budget: usize,
    item_char_ceiling: usize,
}

impl HttpEmbeddingClient {
    pub fn new(endpoint: String, api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
            dimensions,
            retry: RetryPolicy::default(),
            batch_count_limit: DEFAULT_BATCH_COUNT_LIMIT,
            batch_char_budget: DEFAULT_BATCH_CHAR_BUDGET,
            item_char_ceiling: DEFAULT_ITEM_CHAR_CEILING,
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> CidxResult<Vec<Vec<f32>>> {
        let body = EmbedRequest {
            model: &self.model,
            input: batch,
        };

        let mut attempt = 0u32;
        loop {
            let send_result = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .timeout(Duration::from_secs(60))
                .send()
                .await;

            let response = match send_result {
                Ok(resp) => resp,
                Err(e) if attempt + 1 < self.retry.max_attempts => {
                    tracing::warn!(attempt, error = %e, "embedding request failed, retrying");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(CidxError::Network(e.to_string())),
            };

            let status = response.status();

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(CidxError::Auth);
            }

            if status.as_u16() == 400 {
                let text = response.text().await.unwrap_or_default();
                return Err(CidxError::BadInput(format!(
                    "embedding API rejected batch: {text}"
                )));
            }

            let is_retryable = status.is_server_error() || status.as_u16() == 429;
            if is_retryable {
                if attempt + 1 < self.retry.max_attempts {
                    tracing::warn!(attempt, status = %status, "embedding API returned transient error, retrying");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return Err(CidxError::Network(format!(
                    "embedding API returned {status} after {} attempts",
                    self.retry.max_attempts
                )));
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(CidxError::Network(format!(
                    "embedding API returned {status}: {text}"
                )));
            }

            let parsed: EmbedResponse = response
                .json()
                .await
                .map_err(|e| CidxError::Network(format!("malformed embedding response: {e}")))?;

            // The remote API's `index` field is authoritative for ordering;
            // never assume `data` arrives in request order.
            let mut vectors: Vec<Option<Vec<f32>>> = vec![None; batch.len()];
            for item in parsed.data {
                if item.index < vectors.len() {
                    vectors[item.index] = Some(item.embedding);
                }
            }

            let mut ordered = Vec::with_capacity(vectors.len());
            for (i, v) in vectors.into_iter().enumerate() {
                match v {
                    Some(v) => ordered.push(v),
                    None => {
                        return Err(CidxError::Network(format!(
                            "embedding response missing vector for batch index {i}"
                        )))
                    }
                }
            }

            return Ok(ordered);
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> CidxResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches = plan_batches(
            texts,
            self.batch_count_limit,
            self.batch_char_budget,
            self.item_char_ceiling,
        );

        let mut results = Vec::with_capacity(texts.len());
        for batch in batches {
            let vectors = self.embed_batch(&batch).await?;
            results.extend(vectors);
        }
        Ok(results)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_by_max_delay() {
        let policy = RetryPolicy::default();
        for attempt in 0..20 {
            assert!(policy.delay_for_attempt(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn backoff_base_case_is_within_base_delay() {
        let policy = RetryPolicy::default();
        // attempt 0 should never exceed base_delay (factor^0 == 1).
        assert!(policy.delay_for_attempt(0) <= policy.base_delay);
    }
}
