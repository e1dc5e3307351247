//! Bounded fan-out with a single batch deadline.
//!
//! Every item is paired with its key in the work stream, so results are merged
//! by key regardless of completion order. Failed items, items that panic and
//! items still running at the deadline are simply absent from the result map.

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Per-batch counters, for status reporting only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub submitted: usize,
    pub succeeded: usize,
    /// Items that returned an error or panicked.
    pub failed: usize,
    /// Items with no outcome when the deadline passed.
    pub abandoned: usize,
    pub deadline_hit: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug)]
pub struct BatchOutcome<K, T> {
    pub results: BTreeMap<K, T>,
    pub stats: BatchStats,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchRunner {
    max_workers: usize,
    timeout: Duration,
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new(8, Duration::from_secs(300))
    }
}

impl BatchRunner {
    pub fn new(max_workers: usize, timeout: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            timeout,
        }
    }

    /// Run `work` once per item with at most `max_workers` in flight.
    ///
    /// No retries. Never returns an error: per-item failures and panics are
    /// logged and dropped, and whatever finished before the deadline is returned.
    pub async fn run<K, T, E, I, F, Fut>(&self, phase: &str, items: I, work: F) -> BatchOutcome<K, T>
    where
        K: Ord + Clone + Display,
        E: Display,
        I: IntoIterator<Item = K>,
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let items: Vec<K> = items.into_iter().collect();
        let mut stats = BatchStats {
            submitted: items.len(),
            ..Default::default()
        };
        let mut results = BTreeMap::new();

        if items.is_empty() {
            return BatchOutcome { results, stats };
        }

        let started = Instant::now();
        let deadline = started + self.timeout;

        let mut pending = stream::iter(items)
            .map(|key| {
                let fut = AssertUnwindSafe(work(key.clone())).catch_unwind();
                async move { (key, fut.await) }
            })
            .buffer_unordered(self.max_workers);

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((key, Ok(Ok(value))))) => {
                    stats.succeeded += 1;
                    debug!(
                        phase,
                        item = %key,
                        done = stats.succeeded + stats.failed,
                        total = stats.submitted,
                        "batch item completed"
                    );
                    results.insert(key, value);
                }
                Ok(Some((key, Ok(Err(e))))) => {
                    stats.failed += 1;
                    debug!(phase, item = %key, error = %e, "batch item failed");
                }
                Ok(Some((key, Err(panic)))) => {
                    stats.failed += 1;
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    warn!(phase, item = %key, panic = %msg, "batch item panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    stats.deadline_hit = true;
                    break;
                }
            }
        }

        // Dropping the stream abandons anything still in flight.
        drop(pending);

        stats.abandoned = stats.submitted - stats.succeeded - stats.failed;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        if stats.deadline_hit {
            warn!(
                phase,
                succeeded = stats.succeeded,
                failed = stats.failed,
                abandoned = stats.abandoned,
                timeout_secs = self.timeout.as_secs_f64(),
                "batch deadline reached, keeping partial results"
            );
        } else {
            info!(
                phase,
                succeeded = stats.succeeded,
                failed = stats.failed,
                elapsed_ms = stats.elapsed_ms,
                "batch finished"
            );
        }

        BatchOutcome { results, stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_all_items_succeed() {
        let runner = BatchRunner::new(8, Duration::from_secs(5));
        let outcome = runner
            .run("square", 1..=20u32, |n| async move { Ok::<_, String>(n * n) })
            .await;
        assert_eq!(outcome.results.len(), 20);
        assert_eq!(outcome.results[&7], 49);
        assert_eq!(outcome.stats.succeeded, 20);
        assert!(!outcome.stats.deadline_hit);
    }

    #[tokio::test]
    async fn test_failed_items_are_absent() {
        let runner = BatchRunner::default();
        let outcome = runner
            .run("odd_only", 1..=10u32, |n| async move {
                if n % 2 == 0 {
                    Err(format!("{} is even", n))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(outcome.results.keys().copied().collect::<Vec<_>>(), vec![1, 3, 5, 7, 9]);
        assert_eq!(outcome.stats.failed, 5);
        assert_eq!(outcome.stats.abandoned, 0);
    }

    #[tokio::test]
    async fn test_deadline_returns_partial_results() {
        let runner = BatchRunner::new(8, Duration::from_millis(200));
        let outcome = runner
            .run("slow_tail", 1..=10u32, |n| async move {
                if n > 5 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok::<_, String>(n)
            })
            .await;
        assert_eq!(
            outcome.results.keys().copied().collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(outcome.stats.deadline_hit);
        assert_eq!(outcome.stats.abandoned, 5);
    }

    #[tokio::test]
    async fn test_worker_limit_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runner = BatchRunner::new(3, Duration::from_secs(5));

        let outcome = runner
            .run("bounded", 0..12u32, |n| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n)
                }
            })
            .await;

        assert_eq!(outcome.results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panicking_item_is_dropped() {
        let runner = BatchRunner::default();
        let outcome = runner
            .run("slice", 1..=4u32, |n| async move {
                let text = "x’y";
                // Byte 2 is inside the multi-byte quote.
                let cut = if n == 2 { &text[..2] } else { &text[..1] };
                Ok::<_, String>(format!("{}{}", n, cut))
            })
            .await;
        assert_eq!(outcome.results.keys().copied().collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(outcome.results[&3], "3x");
        assert_eq!(outcome.stats.failed, 1);
        assert_eq!(outcome.stats.abandoned, 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let runner = BatchRunner::default();
        let outcome = runner
            .run("empty", Vec::<u32>::new(), |n| async move { Ok::<_, String>(n) })
            .await;
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.stats, BatchStats::default());
    }
}
