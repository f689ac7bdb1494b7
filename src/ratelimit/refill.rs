//! Periodic token refill.
//!
//! Every worker runs its own refill tick, so each rule is refilled in two
//! steps. First the workers race to advance the rule's refill marker with a
//! single compare-and-swap; the one that succeeds owns this interval's refill
//! and everybody else walks away. The winner then adds tokens to the bucket
//! with a compare-and-swap loop, which only contends with request-time
//! decrements.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::keys::{decode_timestamp, decode_tokens, encode_timestamp, encode_tokens};
use super::rules::{RateLimitRule, RuleTable};
use crate::clock::Clock;
use crate::store::{SharedStore, StoreError};

/// Consecutive token update conflicts between escalation warnings.
const CONFLICT_WARN_EVERY: u64 = 100;

/// What one tick did for one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillOutcome {
    /// This worker won the interval and the bucket now holds `tokens`.
    Refilled { tokens: u64 },
    /// The refill interval has not elapsed yet.
    NotDue,
    /// Another worker advanced the marker first.
    LostRace,
    /// The store failed before the marker moved; the rule is retried next tick.
    Skipped,
    /// This worker won the interval but could not update the bucket. The
    /// marker has already advanced, so no worker refills until the next interval.
    Forfeited,
}

/// Per-table summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillReport {
    pub refilled: usize,
    pub not_due: usize,
    pub lost_race: usize,
    pub skipped: usize,
    pub forfeited: usize,
}

impl RefillReport {
    fn record(&mut self, outcome: RefillOutcome) {
        match outcome {
            RefillOutcome::Refilled { .. } => self.refilled += 1,
            RefillOutcome::NotDue => self.not_due += 1,
            RefillOutcome::LostRace => self.lost_race += 1,
            RefillOutcome::Skipped => self.skipped += 1,
            RefillOutcome::Forfeited => self.forfeited += 1,
        }
    }
}

/// Tops up buckets whose refill interval has elapsed.
pub struct Refiller {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl Refiller {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Run one tick over every rule of `table`.
    pub async fn tick(&self, table: &RuleTable) -> RefillReport {
        let mut report = RefillReport::default();
        for rule in table.rules() {
            report.record(self.refill_rule(rule).await);
        }

        trace!(
            generation = %table.generation(),
            refilled = report.refilled,
            not_due = report.not_due,
            lost_race = report.lost_race,
            skipped = report.skipped,
            forfeited = report.forfeited,
            "Refill tick complete"
        );
        report
    }

    /// Refill one rule if it is due and this worker wins the interval.
    pub async fn refill_rule(&self, rule: &RateLimitRule) -> RefillOutcome {
        let marker_key = rule.marker_key();
        let entry = match self.store.get(marker_key.as_str()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                warn!(key = %marker_key, "Refill marker missing, skipping");
                return RefillOutcome::Skipped;
            }
            Err(e) => {
                warn!(key = %marker_key, error = %e, "Failed to read refill marker, skipping");
                return RefillOutcome::Skipped;
            }
        };
        let last_refilled_at = match decode_timestamp(&marker_key, &entry.value) {
            Ok(nanos) => nanos,
            Err(e) => {
                warn!(key = %marker_key, error = %e, "Unreadable refill marker, skipping");
                return RefillOutcome::Skipped;
            }
        };

        let now = self.clock.now_nanos();
        if now.saturating_sub(last_refilled_at) < rule.refill_interval_nanos() {
            return RefillOutcome::NotDue;
        }

        // Exactly one worker per interval gets past this write.
        match self
            .store
            .set(marker_key.as_str(), &encode_timestamp(now), Some(entry.version))
            .await
        {
            Ok(()) => {}
            Err(StoreError::CasMismatch(_)) => {
                debug!(key = %marker_key, "Another worker owns this refill");
                return RefillOutcome::LostRace;
            }
            Err(e) => {
                warn!(key = %marker_key, error = %e, "Failed to advance refill marker, skipping");
                return RefillOutcome::Skipped;
            }
        }

        match self.top_up(rule).await {
            Ok(tokens) => {
                debug!(key = %rule.bucket_key(), tokens, "Refilled token bucket");
                RefillOutcome::Refilled { tokens }
            }
            Err(e) => {
                warn!(
                    key = %rule.bucket_key(),
                    error = %e,
                    "Failed to refill token bucket, refill for this interval forfeited"
                );
                RefillOutcome::Forfeited
            }
        }
    }

    /// Add one refill worth of tokens, capped at the rule's maximum.
    async fn top_up(&self, rule: &RateLimitRule) -> Result<u64, StoreError> {
        let key = rule.bucket_key();
        let mut conflicts: u64 = 0;
        loop {
            let entry = self
                .store
                .get(key.as_str())
                .await?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let current = decode_tokens(&key, &entry.value)?;
            let refilled = current
                .saturating_add(rule.tokens_per_refill())
                .min(rule.max_tokens());
            if refilled == current {
                return Ok(current);
            }

            match self
                .store
                .set(key.as_str(), &encode_tokens(refilled), Some(entry.version))
                .await
            {
                Ok(()) => return Ok(refilled),
                Err(StoreError::CasMismatch(_)) => {
                    conflicts += 1;
                    if conflicts % CONFLICT_WARN_EVERY == 0 {
                        warn!(key = %key, conflicts, "Token refill keeps losing to concurrent updates");
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
