//! Seeding and retiring bucket state in the shared store.

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::keys::{encode_timestamp, encode_tokens, StoreKey};
use super::rules::{RateLimitRule, RuleTable};
use crate::store::{SharedStore, StoreError};

/// What initialization did to one rule's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// At least one entry was missing and was written.
    Created,
    /// Both entries already existed and were left alone.
    Existing,
}

/// Per-table summary of an initialization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitReport {
    pub created: usize,
    pub existing: usize,
}

/// Creates the bucket and refill marker of every rule.
///
/// Every worker loads the same sequence of configurations, so a worker that
/// reloads late finds entries its peers already seeded and are consuming
/// from. Those entries are live state and are never overwritten.
pub struct BucketInitializer {
    store: Arc<dyn SharedStore>,
}

impl BucketInitializer {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Seed every rule of `table`.
    pub async fn initialize(&self, table: &RuleTable) -> Result<InitReport, StoreError> {
        let mut report = InitReport::default();
        for rule in table.rules() {
            match self.initialize_rule(rule).await? {
                InitOutcome::Created => report.created += 1,
                InitOutcome::Existing => report.existing += 1,
            }
        }

        info!(
            generation = %table.generation(),
            created = report.created,
            existing = report.existing,
            "Initialized token buckets"
        );
        Ok(report)
    }

    /// Seed one rule: a full bucket and a refill marker at zero, each only if absent.
    pub async fn initialize_rule(&self, rule: &RateLimitRule) -> Result<InitOutcome, StoreError> {
        let bucket_key = rule.bucket_key();
        let bucket_created = self
            .create_missing(&bucket_key, &encode_tokens(rule.max_tokens()))
            .await?;
        let marker_created = self
            .create_missing(&rule.marker_key(), &encode_timestamp(0))
            .await?;

        if bucket_created || marker_created {
            debug!(key = %bucket_key, tokens = rule.max_tokens(), "Created token bucket");
            Ok(InitOutcome::Created)
        } else {
            trace!(key = %bucket_key, "Token bucket already seeded");
            Ok(InitOutcome::Existing)
        }
    }

    /// Write `value` under `key` unless the key exists. Returns whether it wrote.
    async fn create_missing(&self, key: &StoreKey, value: &[u8]) -> Result<bool, StoreError> {
        if self.store.get(key.as_str()).await?.is_some() {
            return Ok(false);
        }
        self.store.set(key.as_str(), value, None).await?;
        Ok(true)
    }

    /// Delete the entries of a superseded table.
    ///
    /// Returns how many keys were removed. Stores without deletion leave the
    /// keys in place.
    pub async fn retire(&self, table: &RuleTable) -> usize {
        let mut removed = 0;
        for rule in table.rules() {
            for key in [rule.bucket_key(), rule.marker_key()] {
                match self.store.delete(key.as_str()).await {
                    Ok(()) => removed += 1,
                    Err(StoreError::Unsupported(_)) => {
                        debug!(
                            generation = %table.generation(),
                            "Store cannot delete, leaving retired buckets in place"
                        );
                        return removed;
                    }
                    Err(e) => warn!(key = %key, error = %e, "Failed to delete retired key"),
                }
            }
        }

        info!(generation = %table.generation(), removed, "Retired token buckets");
        removed
    }
}
