//! The per-worker rate limiter.
//!
//! A [`Limiter`] is one isolated worker's view of the rate limiting state: its
//! own rule table and generation counter, and a handle to the store that all
//! workers share. Requests flow through [`Limiter::check`]:
//!
//! 1. read the limit key from the configured header or query parameter; a
//!    missing or empty key is never limited,
//! 2. look the key up in the rule table; unknown keys are never limited,
//! 3. take one token from the key's bucket; an empty bucket denies.

use axum::extract::Query;
use http::{HeaderMap, StatusCode, Uri};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::bucket::BucketInitializer;
use super::consumer::{ConsumeOutcome, TokenConsumer, DEFAULT_MAX_ATTEMPTS};
use super::refill::{RefillReport, Refiller};
use super::rules::{Generation, KeyRateConfig, LimitSource, RuleTable};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::SharedStore;

/// Status sent for a denied request.
pub const REJECT_STATUS: StatusCode = StatusCode::TOO_MANY_REQUESTS;
/// Body sent for a denied request.
pub const REJECT_BODY: &str = "Too many requests,rate_limited";

/// Why a request was let through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowReason {
    /// The request carried no limit key.
    NoKey,
    /// No rule exists for the request's key.
    NoRule,
    /// A token was taken.
    TokenConsumed { remaining: u64 },
    /// Every decrement attempt lost a race and contention fails open.
    Contended,
    /// The store could not tell whether a token was available.
    StoreUnavailable,
}

/// The outcome of checking one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed(AllowReason),
    Denied { key: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }
}

/// Tunables that are not part of the rule configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSettings {
    /// Compare-and-swap attempts per token decrement
    pub max_consume_attempts: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_consume_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Read the limit key from a request. Empty values count as absent.
///
/// Query parameters are percent-decoded and the first occurrence wins.
pub fn extract_key(source: &LimitSource, headers: &HeaderMap, uri: &Uri) -> Option<String> {
    match source {
        LimitSource::Header(name) => headers
            .get(name.as_str())
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        LimitSource::Param(name) => Query::<Vec<(String, String)>>::try_from_uri(uri)
            .ok()
            .and_then(|Query(pairs)| pairs.into_iter().find(|(param, _)| param == name))
            .map(|(_, value)| value)
            .filter(|value| !value.is_empty()),
    }
}

/// One worker's rate limiter.
pub struct Limiter {
    rules: RwLock<Arc<RuleTable>>,
    /// The table replaced by the last reload, swept on the next one
    superseded: Mutex<Option<Arc<RuleTable>>>,
    initializer: BucketInitializer,
    refiller: Refiller,
    consumer: TokenConsumer,
    reload_lock: tokio::sync::Mutex<()>,
}

impl Limiter {
    /// Build the first rule table and seed its buckets.
    ///
    /// Fails when the configuration is invalid or the buckets cannot be seeded.
    pub async fn start(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: &KeyRateConfig,
        settings: LimiterSettings,
    ) -> Result<Self> {
        let table = RuleTable::build(config, Generation::default())?;
        let initializer = BucketInitializer::new(store.clone());
        initializer.initialize(&table).await?;

        Ok(Self {
            rules: RwLock::new(Arc::new(table)),
            superseded: Mutex::new(None),
            initializer,
            refiller: Refiller::new(store.clone(), clock),
            consumer: TokenConsumer::with_max_attempts(store, settings.max_consume_attempts),
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The active rule table.
    pub fn rules(&self) -> Arc<RuleTable> {
        self.rules.read().clone()
    }

    pub fn generation(&self) -> Generation {
        self.rules.read().generation()
    }

    /// Switch to a new configuration under the next generation.
    ///
    /// On error the current table stays active. On success the table replaced
    /// by the reload before this one is swept: peers reload at their own pace,
    /// and the generation just replaced here may still be live on one of them.
    pub async fn reload(&self, config: &KeyRateConfig) -> Result<Generation> {
        let _guard = self.reload_lock.lock().await;
        let previous = self.rules();

        let table = match RuleTable::build(config, previous.generation()) {
            Ok(table) => table,
            Err(e) => {
                warn!(generation = %previous.generation(), error = %e, "Rejected rule reload");
                return Err(e);
            }
        };
        self.initializer.initialize(&table).await?;

        let generation = table.generation();
        *self.rules.write() = Arc::new(table);
        info!(from = %previous.generation(), to = %generation, "Reloaded rate limit rules");

        let stale = self.superseded.lock().replace(previous);
        if let Some(stale) = stale {
            self.initializer.retire(&stale).await;
        }
        Ok(generation)
    }

    /// Decide whether a request may proceed.
    pub async fn check(&self, headers: &HeaderMap, uri: &Uri) -> Decision {
        let table = self.rules();
        let key = extract_key(table.source(), headers, uri);
        self.decide(&table, key.as_deref()).await
    }

    /// Decide for an already extracted limit key.
    pub async fn check_key(&self, key: Option<&str>) -> Decision {
        let table = self.rules();
        self.decide(&table, key).await
    }

    async fn decide(&self, table: &RuleTable, key: Option<&str>) -> Decision {
        let Some(key) = key.filter(|key| !key.is_empty()) else {
            trace!("No limit key in request");
            return Decision::Allowed(AllowReason::NoKey);
        };

        let Some(rule) = table.find(key) else {
            trace!(key, "No rate limit rule for key");
            return Decision::Allowed(AllowReason::NoRule);
        };

        match self.consumer.consume(rule).await {
            ConsumeOutcome::Consumed { remaining } => {
                Decision::Allowed(AllowReason::TokenConsumed { remaining })
            }
            ConsumeOutcome::Exhausted => {
                info!(key, "Request rate limited by key");
                Decision::Denied {
                    key: key.to_string(),
                }
            }
            ConsumeOutcome::Contended { attempts } => {
                if table.fail_open_on_contention() {
                    Decision::Allowed(AllowReason::Contended)
                } else {
                    info!(key, attempts, "Request denied under contention");
                    Decision::Denied {
                        key: key.to_string(),
                    }
                }
            }
            ConsumeOutcome::Unavailable(e) => {
                warn!(key, error = %e, "Cannot read token bucket, allowing request");
                Decision::Allowed(AllowReason::StoreUnavailable)
            }
        }
    }

    /// Run one refill pass over the active rule table.
    pub async fn refill_tick(&self) -> RefillReport {
        let table = self.rules();
        self.refiller.tick(&table).await
    }

    /// Run [`Limiter::refill_tick`] every `period` until the task is aborted.
    pub fn spawn_refill_task(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        debug!(period_ms = period.as_millis() as u64, "Starting refill task");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                limiter.refill_tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::KeyrateError;
    use crate::store::InMemoryStore;
    use crate::testing::{gold_config, ConflictingStore, SwitchableStore, UnavailableStore};
    use http::HeaderValue;

    const START: i64 = 1_700_000_000_000_000_000;

    fn headers(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(key).unwrap());
        headers
    }

    fn uri(path: &str) -> Uri {
        path.parse().unwrap()
    }

    async fn start(store: Arc<dyn SharedStore>, clock: Arc<ManualClock>, config: &KeyRateConfig) -> Limiter {
        Limiter::start(store, clock, config, LimiterSettings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_gold_scenario() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let limiter = start(store, clock.clone(), &gold_config()).await;
        limiter.refill_tick().await;

        let request = headers("gold");
        let path = uri("/");
        assert_eq!(
            limiter.check(&request, &path).await,
            Decision::Allowed(AllowReason::TokenConsumed { remaining: 1 })
        );
        assert_eq!(
            limiter.check(&request, &path).await,
            Decision::Allowed(AllowReason::TokenConsumed { remaining: 0 })
        );
        assert_eq!(
            limiter.check(&request, &path).await,
            Decision::Denied { key: "gold".to_string() }
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.refill_tick().await.refilled, 1);
        assert_eq!(
            limiter.check(&request, &path).await,
            Decision::Allowed(AllowReason::TokenConsumed { remaining: 1 })
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_always_allowed() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = start(store, Arc::new(ManualClock::new(START)), &gold_config()).await;
        for _ in 0..2 {
            limiter.check_key(Some("gold")).await;
        }
        assert!(!limiter.check_key(Some("gold")).await.is_allowed());

        let path = uri("/?x-api-key=gold");
        for _ in 0..5 {
            assert_eq!(
                limiter.check(&HeaderMap::new(), &path).await,
                Decision::Allowed(AllowReason::NoKey)
            );
        }
        assert_eq!(
            limiter.check(&headers(""), &path).await,
            Decision::Allowed(AllowReason::NoKey)
        );
    }

    #[tokio::test]
    async fn test_unknown_key_is_allowed() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = start(store, Arc::new(ManualClock::new(START)), &gold_config()).await;
        assert_eq!(
            limiter.check(&headers("silver"), &uri("/")).await,
            Decision::Allowed(AllowReason::NoRule)
        );
    }

    #[test]
    fn test_extract_key_from_query() {
        let source = LimitSource::Param("apikey".to_string());
        let empty = HeaderMap::new();

        assert_eq!(
            extract_key(&source, &empty, &uri("/v1/items?page=2&apikey=gold&apikey=other")),
            Some("gold".to_string())
        );
        assert_eq!(extract_key(&source, &empty, &uri("/v1/items?apikey=")), None);
        assert_eq!(extract_key(&source, &empty, &uri("/v1/items?apikey")), None);
        assert_eq!(extract_key(&source, &empty, &uri("/v1/items?key=gold")), None);
        assert_eq!(extract_key(&source, &empty, &uri("/v1/items")), None);
    }

    #[test]
    fn test_extract_key_decodes_query() {
        let source = LimitSource::Param("apikey".to_string());
        let empty = HeaderMap::new();

        assert_eq!(
            extract_key(&source, &empty, &uri("/?apikey=%67old")),
            Some("gold".to_string())
        );
        assert_eq!(
            extract_key(&source, &empty, &uri("/?api%6Bey=gold")),
            Some("gold".to_string())
        );
        assert_eq!(
            extract_key(&source, &empty, &uri("/?apikey=go+ld&apikey=gold")),
            Some("go ld".to_string())
        );
        assert_eq!(
            extract_key(&source, &empty, &uri("/?apikey=go%20ld")),
            Some("go ld".to_string())
        );
    }

    #[tokio::test]
    async fn test_encoded_query_key_is_limited() {
        let config = KeyRateConfig::from_json(
            r#"{"limit_keys": [{"key": "gold", "query_per_second": 1}], "limit_by_param": "apikey"}"#,
        )
        .unwrap();
        let limiter = start(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(START)),
            &config,
        )
        .await;

        assert!(limiter.check(&HeaderMap::new(), &uri("/?apikey=gold")).await.is_allowed());
        assert_eq!(
            limiter.check(&HeaderMap::new(), &uri("/?apikey=%67old")).await,
            Decision::Denied { key: "gold".to_string() }
        );
    }

    #[test]
    fn test_extract_key_from_header() {
        let source = LimitSource::Header("x-api-key".to_string());
        assert_eq!(
            extract_key(&source, &headers("gold"), &uri("/?x-api-key=silver")),
            Some("gold".to_string())
        );
        assert_eq!(extract_key(&source, &HeaderMap::new(), &uri("/")), None);
    }

    #[tokio::test]
    async fn test_contention_fails_open_by_default() {
        let store = Arc::new(ConflictingStore::default());
        let limiter = start(store.clone(), Arc::new(ManualClock::new(START)), &gold_config()).await;

        assert_eq!(
            limiter.check_key(Some("gold")).await,
            Decision::Allowed(AllowReason::Contended)
        );
        assert_eq!(store.rejected(), DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_contention_can_fail_closed() {
        let mut config = gold_config();
        config.fail_open_on_contention = false;
        let store = Arc::new(ConflictingStore::default());
        let limiter = start(store, Arc::new(ManualClock::new(START)), &config).await;

        assert_eq!(
            limiter.check_key(Some("gold")).await,
            Decision::Denied { key: "gold".to_string() }
        );
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let store = Arc::new(SwitchableStore::default());
        let limiter = start(store.clone(), Arc::new(ManualClock::new(START)), &gold_config()).await;
        limiter.check_key(Some("gold")).await;
        limiter.check_key(Some("gold")).await;

        store.go_offline();
        assert_eq!(
            limiter.check_key(Some("gold")).await,
            Decision::Allowed(AllowReason::StoreUnavailable)
        );
        assert_eq!(limiter.refill_tick().await.skipped, 1);
    }

    #[tokio::test]
    async fn test_start_fails_without_store() {
        let result = Limiter::start(
            Arc::new(UnavailableStore),
            Arc::new(ManualClock::new(START)),
            &gold_config(),
            LimiterSettings::default(),
        )
        .await;
        assert!(matches!(result, Err(KeyrateError::Store(_))));
    }

    #[tokio::test]
    async fn test_start_fails_on_invalid_config() {
        let config = KeyRateConfig::from_json(r#"{"limit_keys": [{"key": "gold"}], "limit_by_header": "x"}"#)
            .unwrap();
        let result = Limiter::start(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(START)),
            &config,
            LimiterSettings::default(),
        )
        .await;
        assert!(matches!(result, Err(KeyrateError::Config(_))));
    }

    #[tokio::test]
    async fn test_workers_share_buckets() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let first = start(store.clone(), clock.clone(), &gold_config()).await;
        let second = start(store.clone(), clock.clone(), &gold_config()).await;
        assert_eq!(first.generation(), second.generation());

        assert!(first.check_key(Some("gold")).await.is_allowed());
        assert!(second.check_key(Some("gold")).await.is_allowed());
        assert!(!first.check_key(Some("gold")).await.is_allowed());
        assert!(!second.check_key(Some("gold")).await.is_allowed());

        // Both workers tick, only one refill lands.
        clock.advance(Duration::from_secs(1));
        let reports = [first.refill_tick().await, second.refill_tick().await];
        assert_eq!(reports.iter().map(|report| report.refilled).sum::<usize>(), 1);
        assert!(first.check_key(Some("gold")).await.is_allowed());
        assert!(second.check_key(Some("gold")).await.is_allowed());
        assert!(!first.check_key(Some("gold")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_reload_starts_fresh_generation() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = start(store.clone(), Arc::new(ManualClock::new(START)), &gold_config()).await;
        limiter.check_key(Some("gold")).await;
        limiter.check_key(Some("gold")).await;
        assert!(!limiter.check_key(Some("gold")).await.is_allowed());

        let config = KeyRateConfig::from_json(
            r#"{"limit_keys": [{"key": "gold", "query_per_minute": 3}], "limit_by_header": "x-api-key"}"#,
        )
        .unwrap();
        let generation = limiter.reload(&config).await.unwrap();
        assert_eq!(generation, Generation::new(2));

        for remaining in [2, 1, 0] {
            assert_eq!(
                limiter.check_key(Some("gold")).await,
                Decision::Allowed(AllowReason::TokenConsumed { remaining })
            );
        }
        // The replaced generation stays until the next reload sweeps it.
        assert_eq!(store.len(), 4);
        limiter.reload(&config).await.unwrap();
        assert_eq!(store.len(), 4);
        assert!(!store.contains_key("1:tokens:gold"));
        assert!(store.contains_key("2:tokens:gold"));
        assert!(store.contains_key("3:tokens:gold"));
    }

    #[tokio::test]
    async fn test_staggered_reload_keeps_quota() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let a = start(store.clone(), clock.clone(), &gold_config()).await;
        let b = start(store.clone(), clock.clone(), &gold_config()).await;
        a.refill_tick().await;

        let reloaded = KeyRateConfig::from_json(
            r#"{"limit_keys": [{"key": "gold", "query_per_second": 2}], "limit_by_header": "x-api-key"}"#,
        )
        .unwrap();

        // Only `a` has moved on; `b` keeps limiting on the old generation.
        a.reload(&reloaded).await.unwrap();
        let mut b_allowed = 0;
        for _ in 0..10 {
            if b.check_key(Some("gold")).await.is_allowed() {
                b_allowed += 1;
            }
        }
        assert_eq!(b_allowed, 2);

        // `a` refills and drains the new bucket, then `b` catches up without
        // touching it.
        assert_eq!(a.refill_tick().await.refilled, 1);
        a.check_key(Some("gold")).await;
        a.check_key(Some("gold")).await;
        b.reload(&reloaded).await.unwrap();
        assert_eq!(a.generation(), b.generation());

        let mut allowed = 0;
        for _ in 0..3 {
            for worker in [&a, &b] {
                if worker.check_key(Some("gold")).await.is_allowed() {
                    allowed += 1;
                }
            }
        }
        assert_eq!(allowed, 0);

        // The refill marker was not rewound either.
        assert_eq!(a.refill_tick().await.not_due, 1);
        assert_eq!(b.refill_tick().await.not_due, 1);
        clock.advance(Duration::from_secs(1));
        assert_eq!(b.refill_tick().await.refilled, 1);
        assert_eq!(a.refill_tick().await.not_due, 1);
    }

    #[tokio::test]
    async fn test_check_reads_one_table() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = start(store, Arc::new(ManualClock::new(START)), &gold_config()).await;
        let before = limiter.rules();

        let by_param = KeyRateConfig::from_json(
            r#"{"limit_keys": [{"key": "gold", "query_per_second": 5}], "limit_by_param": "apikey"}"#,
        )
        .unwrap();
        limiter.reload(&by_param).await.unwrap();

        // A request decided against the table it started with uses that
        // table's extraction mode and bucket.
        let key = extract_key(before.source(), &headers("gold"), &uri("/"));
        assert_eq!(
            limiter.decide(&before, key.as_deref()).await,
            Decision::Allowed(AllowReason::TokenConsumed { remaining: 1 })
        );
        assert_eq!(
            limiter.check(&headers("gold"), &uri("/?apikey=gold")).await,
            Decision::Allowed(AllowReason::TokenConsumed { remaining: 4 })
        );
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_current_rules() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = start(store, Arc::new(ManualClock::new(START)), &gold_config()).await;

        let config = KeyRateConfig::from_json(r#"{"limit_keys": [], "limit_by_header": "x-api-key"}"#).unwrap();
        assert!(limiter.reload(&config).await.is_err());
        assert_eq!(limiter.generation(), Generation::new(1));
        assert!(limiter.check_key(Some("gold")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_refill_task_tops_up_buckets() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let limiter = Arc::new(start(store, clock.clone(), &gold_config()).await);
        limiter.refill_tick().await;
        limiter.check_key(Some("gold")).await;
        limiter.check_key(Some("gold")).await;
        assert!(!limiter.check_key(Some("gold")).await.is_allowed());

        clock.advance(Duration::from_secs(1));
        let task = limiter.spawn_refill_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert!(limiter.check_key(Some("gold")).await.is_allowed());
    }
}
