//! Rate-limits how often the growing buffer reaches observers.
//!
//! Trailing-edge debounce with a delay that grows with the content size and
//! with how recently the last flush happened. A pending flush is never pushed
//! back further than `max_wait` after the first unflushed change, so a fast,
//! steady token stream still shows progress.

use std::time::Duration;

use tokio::time::Instant;

use crate::store::StreamPhase;

/// Tunables for [`DebouncedPublisher`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DebounceConfig {
    /// Delay for short content.
    pub base_delay: Duration,
    /// Extra delay per full 1000 characters of content.
    pub per_kilochar: Duration,
    /// Upper bound for any computed delay.
    pub max_delay: Duration,
    /// A flush younger than this counts as a burst.
    pub burst_window: Duration,
    /// Extra delay applied during a burst.
    pub burst_penalty: Duration,
    /// Longest a change may stay unpublished while new changes keep arriving.
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(80),
            per_kilochar: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            burst_window: Duration::from_millis(50),
            burst_penalty: Duration::from_millis(40),
            max_wait: Duration::from_millis(400),
        }
    }
}

impl DebounceConfig {
    /// Overrides the base delay, keeping `max_delay` at least as large.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = self.max_delay.max(base_delay);
        self.max_wait = self.max_wait.max(base_delay);
        self
    }

    /// Delay for content of `len` bytes given the time since the last flush.
    pub fn compute_delay(&self, len: usize, since_last_flush: Option<Duration>) -> Duration {
        let steps = u32::try_from(len / 1000).unwrap_or(u32::MAX);
        let sized = self
            .base_delay
            .saturating_add(self.per_kilochar.saturating_mul(steps))
            .min(self.max_delay);
        match since_last_flush {
            Some(elapsed) if elapsed < self.burst_window => {
                sized.saturating_add(self.burst_penalty).min(self.max_delay)
            }
            _ => sized,
        }
    }
}

/// Receives published content.
///
/// Returns `false` when the publish was rejected (for example because the
/// stream it belongs to has been superseded).
pub trait PublishSink {
    fn publish(&self, content: &str, phase: StreamPhase) -> bool;
}

/// Debounce state for one stream.
pub struct DebouncedPublisher<S> {
    config: DebounceConfig,
    sink: S,
    pending: Option<String>,
    deadline: Option<Instant>,
    first_pending_at: Option<Instant>,
    last_flush: Option<Instant>,
    flushes: u64,
}

impl<S: PublishSink> DebouncedPublisher<S> {
    pub fn new(config: DebounceConfig, sink: S) -> Self {
        Self {
            config,
            sink,
            pending: None,
            deadline: None,
            first_pending_at: None,
            last_flush: None,
            flushes: 0,
        }
    }

    /// Records `content` as the latest value and (re)arms the flush deadline.
    pub fn schedule(&mut self, content: &str) {
        let now = Instant::now();
        let since_last = self.last_flush.map(|at| now.saturating_duration_since(at));
        let delay = self.config.compute_delay(content.len(), since_last);

        let first = *self.first_pending_at.get_or_insert(now);
        let deadline = (now + delay).min(first + self.config.max_wait);
        self.deadline = Some(deadline);

        match self.pending.as_mut() {
            Some(pending) => {
                pending.clear();
                pending.push_str(content);
            }
            None => self.pending = Some(content.to_string()),
        }
    }

    /// When the pending flush is due, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves when the pending flush is due; never resolves if none is armed.
    pub async fn wait_due(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Publishes the pending content as an intermediate update.
    pub fn flush(&mut self) -> bool {
        self.deadline = None;
        self.first_pending_at = None;
        let Some(content) = self.pending.take() else {
            return false;
        };
        self.last_flush = Some(Instant::now());
        self.flushes += 1;
        self.sink.publish(&content, StreamPhase::Streaming)
    }

    /// Drops any pending flush and publishes `content` immediately.
    pub fn publish_now(&mut self, content: &str, phase: StreamPhase) -> bool {
        self.cancel_pending();
        self.last_flush = Some(Instant::now());
        self.flushes += 1;
        self.sink.publish(content, phase)
    }

    /// Disarms the pending flush without publishing it.
    pub fn cancel_pending(&mut self) {
        self.pending = None;
        self.deadline = None;
        self.first_pending_at = None;
    }

    /// Number of publishes attempted so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}
