//! Key-scoped token bucket rate limiting over a shared store.

mod bucket;
mod consumer;
mod keys;
mod limiter;
mod refill;
mod rules;

pub use bucket::{BucketInitializer, InitOutcome, InitReport};
pub use consumer::{ConsumeOutcome, TokenConsumer, DEFAULT_MAX_ATTEMPTS};
pub use keys::{StoreKey, StorePurpose};
pub use limiter::{
    extract_key, AllowReason, Decision, Limiter, LimiterSettings, REJECT_BODY, REJECT_STATUS,
};
pub use refill::{RefillOutcome, RefillReport, Refiller};
pub use rules::{
    Generation, KeyRateConfig, LimitKeyConfig, LimitSource, RateLimitRule, RefillPeriod, RuleTable,
};
