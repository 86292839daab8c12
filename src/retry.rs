//! Batch-embedding retry policy used when a provider rejects a full batch.

use std::ops::Range;
use std::time::Duration;

use crate::config::Number;
use crate::embedding::{check_batch, Embedder};
use crate::error::{IndexError, ProviderError, RagError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    batch_size: usize,
    max_attempts: usize,
    pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, 3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn new(batch_size: usize, max_attempts: usize, pause: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_attempts: max_attempts.max(1),
            pause,
        }
    }

    /// No waiting between batches or attempts.
    pub fn immediate(batch_size: usize, max_attempts: usize) -> Self {
        Self::new(batch_size, max_attempts, Duration::ZERO)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Sub-batch ranges covering `0..total`.
    pub fn batches(&self, total: usize) -> impl Iterator<Item = Range<usize>> {
        let size = self.batch_size;
        (0..total)
            .step_by(size)
            .map(move |start| start..(start + size).min(total))
    }

    /// Pause before attempt number `attempt` (1-based) of a sub-batch. Only
    /// rate-limit errors back off, doubling each time.
    pub fn backoff(&self, attempt: usize, error: &ProviderError) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = if error.is_rate_limited() {
            1u32 << (attempt - 2).min(16)
        } else {
            1
        };
        self.pause * factor
    }

    /// Pause between two consecutive sub-batches.
    pub fn pause(&self) -> Duration {
        self.pause
    }
}

/// What a batched embedding run committed.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub committed: usize,
    pub batches: usize,
    /// Why the run stopped early: an exhausted provider or a rejected commit.
    pub failure: Option<RagError>,
}

fn embed_checked(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<Number>>, ProviderError> {
    let vectors = embedder.embed(texts)?;
    check_batch(embedder, texts.len(), &vectors)?;
    Ok(vectors)
}

/// Embeds `texts` in one call; if that fails, falls back to sub-batches of
/// `policy.batch_size()` with pauses in between. `commit` receives the range
/// and vectors of every batch that embedded successfully.
///
/// Stops at the first sub-batch that exhausts its attempts, and at the first
/// commit error, which is not retried.
pub fn embed_in_batches<F>(
    embedder: &dyn Embedder,
    texts: &[String],
    policy: &RetryPolicy,
    sleep: &dyn Fn(Duration),
    mut commit: F,
) -> BatchOutcome
where
    F: FnMut(Range<usize>, Vec<Vec<Number>>) -> Result<(), IndexError>,
{
    let mut outcome = BatchOutcome::default();
    if texts.is_empty() {
        return outcome;
    }

    match embed_checked(embedder, texts) {
        Ok(vectors) => {
            if let Err(err) = commit(0..texts.len(), vectors) {
                log::error!("failed to commit {} embedded documents: {err}", texts.len());
                outcome.failure = Some(err.into());
                return outcome;
            }
            outcome.committed = texts.len();
            outcome.batches = 1;
            return outcome;
        }
        Err(err) => {
            log::warn!(
                "batch embedding of {} documents failed ({err}); retrying in batches of {}",
                texts.len(),
                policy.batch_size()
            );
        }
    }

    for (batch_number, range) in policy.batches(texts.len()).enumerate() {
        if batch_number > 0 {
            sleep(policy.pause());
        }
        let batch = &texts[range.clone()];
        let mut attempt = 1;
        let vectors = loop {
            log::info!(
                "retry batch {}: {} documents (attempt {attempt})",
                batch_number + 1,
                batch.len()
            );
            match embed_checked(embedder, batch) {
                Ok(vectors) => break vectors,
                Err(err) if attempt < policy.max_attempts() => {
                    log::warn!("retry batch {} failed: {err}", batch_number + 1);
                    attempt += 1;
                    sleep(policy.backoff(attempt, &err));
                }
                Err(err) => {
                    log::warn!("retry batch {} gave up after {attempt} attempts: {err}", batch_number + 1);
                    outcome.failure = Some(err.into());
                    return outcome;
                }
            }
        };
        if let Err(err) = commit(range, vectors) {
            log::error!("failed to commit retry batch {}: {err}", batch_number + 1);
            outcome.failure = Some(err.into());
            return outcome;
        }
        outcome.committed += batch.len();
        outcome.batches += 1;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::sync::Mutex;

    /// Fails every call whose batch is larger than `max_batch`, and the first
    /// `flaky` calls of any size.
    struct PickyEmbedder {
        max_batch: usize,
        flaky: Mutex<usize>,
        calls: Mutex<Vec<usize>>,
    }

    impl PickyEmbedder {
        fn new(max_batch: usize, flaky: usize) -> Self {
            Self {
                max_batch,
                flaky: Mutex::new(flaky),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Embedder for PickyEmbedder {
        fn model_id(&self) -> &str {
            "picky"
        }

        fn dimensions(&self) -> usize {
            8
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<Number>>, ProviderError> {
            self.calls.lock().unwrap().push(texts.len());
            if texts.len() > self.max_batch {
                return Err(ProviderError::RateLimited("batch too large".into()));
            }
            let mut flaky = self.flaky.lock().unwrap();
            if *flaky > 0 {
                *flaky -= 1;
                return Err(ProviderError::RateLimited("slow down".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0; 8]).collect())
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("doc {i}")).collect()
    }

    #[test]
    fn batches_cover_range() {
        let policy = RetryPolicy::immediate(10, 1);
        let ranges: Vec<_> = policy.batches(25).collect();
        assert_eq!(ranges, vec![0..10, 10..20, 20..25]);
        assert_eq!(policy.batches(0).count(), 0);
    }

    #[test]
    fn backoff_doubles_only_for_rate_limits() {
        let policy = RetryPolicy::new(10, 4, Duration::from_millis(100));
        let limited = ProviderError::RateLimited("x".into());
        let down = ProviderError::Unavailable("x".into());
        assert_eq!(policy.backoff(1, &limited), Duration::ZERO);
        assert_eq!(policy.backoff(2, &limited), Duration::from_millis(100));
        assert_eq!(policy.backoff(3, &limited), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, &down), Duration::from_millis(100));
    }

    #[test]
    fn single_call_when_batch_succeeds() {
        let embedder = PickyEmbedder::new(100, 0);
        let outcome = embed_in_batches(
            &embedder,
            &texts(25),
            &RetryPolicy::immediate(10, 1),
            &|_| {},
            |_, _| Ok(()),
        );
        assert_eq!(outcome.committed, 25);
        assert_eq!(outcome.batches, 1);
        assert_eq!(*embedder.calls.lock().unwrap(), vec![25]);
    }

    #[test]
    fn falls_back_to_sub_batches_with_pauses() {
        let embedder = PickyEmbedder::new(10, 0);
        let pauses = RefCell::new(Vec::new());
        let mut committed = Vec::new();
        let outcome = embed_in_batches(
            &embedder,
            &texts(25),
            &RetryPolicy::new(10, 1, Duration::from_millis(5)),
            &|d| pauses.borrow_mut().push(d),
            |range, vectors| {
                assert_eq!(range.len(), vectors.len());
                committed.push(range);
                Ok(())
            },
        );
        assert_eq!(outcome.committed, 25);
        assert_eq!(outcome.batches, 3);
        assert!(outcome.failure.is_none());
        assert_eq!(committed, vec![0..10, 10..20, 20..25]);
        assert_eq!(*embedder.calls.lock().unwrap(), vec![25, 10, 10, 5]);
        assert_eq!(pauses.borrow().len(), 2);
    }

    #[test]
    fn flaky_sub_batch_is_retried() {
        // First full call fails on size, first sub-batch call fails once.
        let embedder = PickyEmbedder::new(10, 1);
        let outcome = embed_in_batches(
            &embedder,
            &texts(15),
            &RetryPolicy::immediate(10, 2),
            &|_| {},
            |_, _| Ok(()),
        );
        assert_eq!(outcome.committed, 15);
        assert_eq!(*embedder.calls.lock().unwrap(), vec![15, 10, 10, 5]);
    }

    #[test]
    fn exhausted_batch_stops_the_run() {
        let embedder = PickyEmbedder::new(0, 0);
        let outcome = embed_in_batches(
            &embedder,
            &texts(15),
            &RetryPolicy::immediate(10, 2),
            &|_| {},
            |_, _| Ok(()),
        );
        assert_eq!(outcome.committed, 0);
        assert!(matches!(
            outcome.failure,
            Some(RagError::Provider(ProviderError::RateLimited(_)))
        ));
        assert_eq!(*embedder.calls.lock().unwrap(), vec![15, 10, 10]);
    }

    #[test]
    fn rejected_commit_stops_without_retry() {
        let embedder = PickyEmbedder::new(100, 0);
        let outcome = embed_in_batches(
            &embedder,
            &texts(25),
            &RetryPolicy::immediate(10, 3),
            &|_| {},
            |_, _| Err(IndexError::DimensionMismatch { expected: 8, got: 4 }),
        );
        assert_eq!(outcome.committed, 0);
        assert!(matches!(
            outcome.failure,
            Some(RagError::Index(IndexError::DimensionMismatch { .. }))
        ));
        assert_eq!(*embedder.calls.lock().unwrap(), vec![25]);
    }
}
