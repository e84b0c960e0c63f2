//! External collaborators: the embedding service and the re-ranker.
//!
//! Both are plain traits; the index only talks to them through
//! [`GuardedEmbedder`] / [`GuardedReranker`], which add batching, a per-call
//! deadline and bounded retries with exponential backoff.
//!
//! A call that misses its deadline is abandoned, not interrupted: the worker
//! thread finishes on its own and its result is dropped.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::CollaboratorConfig;
use crate::error::{LeannError, Result};

/// Turns text into embeddings.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    /// One embedding per input, same order.
    fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Scores a candidate's relevance to a query. Higher is better.
pub trait Reranker: Send + Sync {
    fn score(&self, query: &str, candidate: &str) -> Result<f32>;
}

#[derive(Debug, Clone, Copy)]
struct CallPolicy {
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl CallPolicy {
    fn run<T, F>(&self, operation: &'static str, make_call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Box<dyn FnOnce() -> Result<T> + Send>,
    {
        let mut attempt = 0u32;
        loop {
            match call_with_timeout(operation, self.timeout, make_call()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff.saturating_mul(1 << (attempt - 1).min(16));
                    warn!(operation, attempt, ?delay, error = %e, "collaborator call failed, retrying");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run `call` on a worker thread and wait at most `timeout` for it.
pub(crate) fn call_with_timeout<T>(
    operation: &'static str,
    timeout: Duration,
    call: Box<dyn FnOnce() -> Result<T> + Send>,
) -> Result<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let start = Instant::now();
    thread::Builder::new()
        .name(format!("leann-{operation}"))
        .spawn(move || {
            // The receiver is gone if the caller already timed out.
            let _ = tx.send(call());
        })
        .map_err(|e| LeannError::Unavailable(format!("cannot spawn {operation} worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!(operation, ?timeout, "collaborator call timed out");
            Err(LeannError::Timeout {
                operation,
                elapsed: start.elapsed(),
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(LeannError::Unavailable(format!(
            "{operation} worker exited without a result"
        ))),
    }
}

/// [`Embedder`] wrapper with batching, deadlines and retries.
#[derive(Clone)]
pub struct GuardedEmbedder {
    inner: Arc<dyn Embedder>,
    batch_size: usize,
    policy: CallPolicy,
}

impl std::fmt::Debug for GuardedEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedEmbedder")
            .field("dimension", &self.inner.dimension())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl GuardedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, config: &CollaboratorConfig) -> Self {
        Self {
            inner,
            batch_size: config.embed_batch_size.max(1),
            policy: CallPolicy {
                timeout: Duration::from_millis(config.embed_timeout_ms),
                max_retries: config.max_retries,
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
        }
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    /// Embed `texts` in batches. Fails as a whole if any batch fails.
    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let dimension = self.inner.dimension();
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let batch: Arc<[String]> = chunk.into();
            let vectors = self.policy.run("embed", || {
                let inner = Arc::clone(&self.inner);
                let batch = Arc::clone(&batch);
                let call: Box<dyn FnOnce() -> Result<Vec<Vec<f32>>> + Send> =
                    Box::new(move || inner.embed(&batch));
                call
            })?;
            if vectors.len() != chunk.len() {
                return Err(LeannError::Unavailable(format!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    chunk.len()
                )));
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
                return Err(LeannError::DimensionMismatch {
                    expected: dimension,
                    actual: bad.len(),
                });
            }
            out.extend(vectors);
        }
        debug!(items = texts.len(), "embedded batch");
        Ok(out)
    }

    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])?
            .pop()
            .ok_or_else(|| LeannError::Unavailable("embedder returned no vector".to_string()))
    }
}

/// [`Reranker`] wrapper: one deadline for a whole candidate list.
#[derive(Clone)]
pub struct GuardedReranker {
    inner: Arc<dyn Reranker>,
    policy: CallPolicy,
}

impl std::fmt::Debug for GuardedReranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedReranker")
            .field("timeout", &self.policy.timeout)
            .finish()
    }
}

impl GuardedReranker {
    pub fn new(inner: Arc<dyn Reranker>, config: &CollaboratorConfig) -> Self {
        Self {
            inner,
            policy: CallPolicy {
                timeout: Duration::from_millis(config.rerank_timeout_ms),
                max_retries: config.max_retries,
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
        }
    }

    /// Score every candidate against `query`, same order.
    pub fn score_all(&self, query: &str, candidates: Vec<String>) -> Result<Vec<f32>> {
        let query: Arc<str> = query.into();
        let candidates: Arc<[String]> = candidates.into();
        self.policy.run("rerank", || {
            let inner = Arc::clone(&self.inner);
            let query = Arc::clone(&query);
            let candidates = Arc::clone(&candidates);
            let call: Box<dyn FnOnce() -> Result<Vec<f32>> + Send> = Box::new(move || {
                candidates
                    .iter()
                    .map(|c| inner.score(&query, c))
                    .collect()
            });
            call
        })
    }
}
