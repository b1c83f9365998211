//! Backoff and requeue decisions.
//!
//! Everything here is a pure function of the attempt counter, the configured
//! limits and an injected random source, so stages never compute delays
//! inline and tests can pin the jitter.

use rand::Rng;

use crate::message::RequeueCount;

/// Outcome of asking whether a message may be requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDecision {
    /// Requeue with the given counter after `delay_secs` of invisibility.
    Requeue { delay_secs: u64, next: RequeueCount },
    /// The ceiling was reached; the caller moves to a terminal Error.
    Exhausted,
}

/// Retry and backoff tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Ceiling on whole-job resubmissions (and chunk requeues after 429).
    pub max_submit_requeue_count: u32,
    /// Ceiling on polls of one job while it is still running.
    pub max_polling_requeue_count: u32,
    /// Fixed hide delay for resubmissions and throttled chunks.
    pub submit_requeue_hide_seconds: u64,
    /// Base of the quadratic polling backoff.
    pub polling_backoff: u64,
    /// Upper bound (inclusive) of the jitter added to polling backoff.
    pub polling_jitter_seconds: u64,
    /// Upper bound (inclusive) of the spread delay on fresh enqueues.
    pub max_seconds_hide_on_upload: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_submit_requeue_count: 10,
            max_polling_requeue_count: 10,
            submit_requeue_hide_seconds: 60,
            polling_backoff: 30,
            polling_jitter_seconds: 10,
            max_seconds_hide_on_upload: 300,
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the polling delay: `base * attempt²`.
    pub fn polling_base_delay(&self, attempt: RequeueCount) -> u64 {
        let n = u64::from(attempt.get());
        self.polling_backoff.saturating_mul(n.saturating_mul(n))
    }

    /// Requeue decision for a job that is still running.
    pub fn polling<R: Rng>(&self, attempt: RequeueCount, rng: &mut R) -> RequeueDecision {
        if !attempt.below(self.max_polling_requeue_count) {
            return RequeueDecision::Exhausted;
        }
        let jitter = rng.gen_range(0..=self.polling_jitter_seconds);
        RequeueDecision::Requeue {
            delay_secs: self.polling_base_delay(attempt).saturating_add(jitter),
            next: attempt.next(),
        }
    }

    /// Requeue decision for a whole-job resubmission or a throttled chunk.
    pub fn resubmit(&self, attempt: RequeueCount) -> RequeueDecision {
        if !attempt.below(self.max_submit_requeue_count) {
            return RequeueDecision::Exhausted;
        }
        RequeueDecision::Requeue {
            delay_secs: self.submit_requeue_hide_seconds,
            next: attempt.next(),
        }
    }

    /// Random visibility delay in `[1, max_seconds_hide_on_upload]`.
    pub fn spread_delay<R: Rng>(&self, rng: &mut R) -> u64 {
        rng.gen_range(1..=self.max_seconds_hide_on_upload.max(1))
    }
}
