//! Request-time token consumption.

use std::sync::Arc;
use tracing::{trace, warn};

use super::keys::{decode_tokens, encode_tokens};
use super::rules::RateLimitRule;
use crate::store::{SharedStore, StoreError};

/// Default number of compare-and-swap attempts before giving up on a decrement.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Result of trying to take one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// A token was taken; `remaining` are left.
    Consumed { remaining: u64 },
    /// The bucket is empty.
    Exhausted,
    /// Every attempt lost a race against another writer.
    Contended { attempts: u32 },
    /// The bucket could not be read or written.
    Unavailable(StoreError),
}

/// Takes one token from a bucket with bounded compare-and-swap retries.
pub struct TokenConsumer {
    store: Arc<dyn SharedStore>,
    max_attempts: u32,
}

impl TokenConsumer {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_max_attempts(store, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(store: Arc<dyn SharedStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Try to take one token from `rule`'s bucket.
    pub async fn consume(&self, rule: &RateLimitRule) -> ConsumeOutcome {
        let key = rule.bucket_key();
        for attempt in 1..=self.max_attempts {
            let entry = match self.store.get(key.as_str()).await {
                Ok(Some(entry)) => entry,
                Ok(None) => return ConsumeOutcome::Unavailable(StoreError::NotFound(key.to_string())),
                Err(e) => return ConsumeOutcome::Unavailable(e),
            };
            let tokens = match decode_tokens(&key, &entry.value) {
                Ok(tokens) => tokens,
                Err(e) => return ConsumeOutcome::Unavailable(e),
            };
            if tokens == 0 {
                return ConsumeOutcome::Exhausted;
            }

            let remaining = tokens - 1;
            match self
                .store
                .set(key.as_str(), &encode_tokens(remaining), Some(entry.version))
                .await
            {
                Ok(()) => {
                    trace!(key = %key, remaining, attempt, "Consumed token");
                    return ConsumeOutcome::Consumed { remaining };
                }
                Err(StoreError::CasMismatch(_)) => {
                    trace!(key = %key, attempt, "Token decrement lost a race, retrying");
                }
                Err(e) => return ConsumeOutcome::Unavailable(e),
            }
        }

        warn!(key = %key, attempts = self.max_attempts, "Gave up taking a token under contention");
        ConsumeOutcome::Contended {
            attempts: self.max_attempts,
        }
    }
}
