//! Rate limit rule configuration and the per-generation rule table.
//!
//! The rule configuration names a set of limit keys, each with exactly one
//! quota (per second, minute, hour or day), and exactly one place to read the
//! key from on a request: a header or a query parameter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::keys::{StoreKey, StorePurpose};
use crate::error::{KeyrateError, Result};

const SECOND_NANOS: i64 = 1_000_000_000;
const MINUTE_NANOS: i64 = 60 * SECOND_NANOS;
const HOUR_NANOS: i64 = 60 * MINUTE_NANOS;
const DAY_NANOS: i64 = 24 * HOUR_NANOS;

/// Refill granularity for a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefillPeriod {
    Second,
    Minute,
    Hour,
    Day,
}

impl RefillPeriod {
    /// Length of the period in nanoseconds.
    pub fn as_nanos(&self) -> i64 {
        match self {
            RefillPeriod::Second => SECOND_NANOS,
            RefillPeriod::Minute => MINUTE_NANOS,
            RefillPeriod::Hour => HOUR_NANOS,
            RefillPeriod::Day => DAY_NANOS,
        }
    }

    /// Length of the period.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.as_nanos() as u64)
    }
}

/// Identifier of one configuration load.
///
/// Every successful parse produces the next generation, and every shared store
/// key is prefixed with it, so a reload never reads counters left behind by a
/// previous configuration for the same limit key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Wrap a raw generation number.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The generation that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of `limit_keys`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitKeyConfig {
    /// The limit key value to match, e.g. an API key
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_per_hour: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_per_day: Option<u64>,
}

impl LimitKeyConfig {
    /// Resolve the single configured quota. A quota of zero counts as unset.
    fn quota(&self) -> Result<(u64, RefillPeriod)> {
        let configured: Vec<(u64, RefillPeriod)> = [
            (self.query_per_second, RefillPeriod::Second),
            (self.query_per_minute, RefillPeriod::Minute),
            (self.query_per_hour, RefillPeriod::Hour),
            (self.query_per_day, RefillPeriod::Day),
        ]
        .into_iter()
        .filter_map(|(quota, period)| quota.filter(|&n| n > 0).map(|n| (n, period)))
        .collect();

        match configured.as_slice() {
            [single] => Ok(*single),
            [] => Err(KeyrateError::Config(format!(
                "limit key {}: one of query_per_second/query_per_minute/query_per_hour/query_per_day is required",
                self.key
            ))),
            _ => Err(KeyrateError::Config(format!(
                "limit key {}: only one of query_per_second/query_per_minute/query_per_hour/query_per_day may be set",
                self.key
            ))),
        }
    }
}

/// The rule configuration as delivered by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRateConfig {
    #[serde(default)]
    pub limit_keys: Vec<LimitKeyConfig>,

    /// Header to read the limit key from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_by_header: Option<String>,

    /// Query parameter to read the limit key from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_by_param: Option<String>,

    /// Allow a request whose token decrement kept losing compare-and-swap races
    #[serde(default = "default_fail_open_on_contention")]
    pub fail_open_on_contention: bool,
}

fn default_fail_open_on_contention() -> bool {
    true
}

impl KeyRateConfig {
    /// Load rules from a file, picking YAML or JSON by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents, path)
    }

    /// Parse rules read from `path`, picking YAML or JSON by its extension.
    pub fn parse(contents: &str, path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(contents),
            _ => Self::from_json(contents),
        }
    }

    /// Parse rules from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| KeyrateError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Parse rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| KeyrateError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Resolve the key extraction mode. Empty names count as unset.
    fn source(&self) -> Result<LimitSource> {
        let header = self.limit_by_header.as_deref().filter(|h| !h.is_empty());
        let param = self.limit_by_param.as_deref().filter(|p| !p.is_empty());

        match (header, param) {
            (Some(header), None) => Ok(LimitSource::Header(header.to_ascii_lowercase())),
            (None, Some(param)) => Ok(LimitSource::Param(param.to_string())),
            _ => Err(KeyrateError::Config(
                "exactly one of limit_by_header/limit_by_param must be set".to_string(),
            )),
        }
    }
}

/// Where the limit key is read from on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitSource {
    /// Header name, lowercased
    Header(String),
    /// Query parameter name
    Param(String),
}

/// A single limit for one key in one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    generation: Generation,
    key: String,
    tokens_per_refill: u64,
    refill_interval_nanos: i64,
    max_tokens: u64,
}

impl RateLimitRule {
    pub fn new(
        generation: Generation,
        key: impl Into<String>,
        tokens_per_refill: u64,
        refill_interval: Duration,
        max_tokens: u64,
    ) -> Self {
        Self {
            generation,
            key: key.into(),
            tokens_per_refill,
            refill_interval_nanos: i64::try_from(refill_interval.as_nanos()).unwrap_or(i64::MAX),
            max_tokens,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tokens_per_refill(&self) -> u64 {
        self.tokens_per_refill
    }

    pub fn refill_interval_nanos(&self) -> i64 {
        self.refill_interval_nanos
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// Store key of this rule's token count.
    pub fn bucket_key(&self) -> StoreKey {
        StoreKey::new(self.generation, StorePurpose::Tokens, &self.key)
    }

    /// Store key of this rule's last refill timestamp.
    pub fn marker_key(&self) -> StoreKey {
        StoreKey::new(self.generation, StorePurpose::RefillMarker, &self.key)
    }
}

/// The immutable rule set of one configuration generation.
#[derive(Debug, Clone)]
pub struct RuleTable {
    generation: Generation,
    source: LimitSource,
    rules: HashMap<String, RateLimitRule>,
    fail_open_on_contention: bool,
}

impl RuleTable {
    /// Validate `config` and build the table for the generation after `previous`.
    pub fn build(config: &KeyRateConfig, previous: Generation) -> Result<Self> {
        if config.limit_keys.is_empty() {
            return Err(KeyrateError::Config(
                "limit_keys cannot be empty".to_string(),
            ));
        }
        let source = config.source()?;
        let generation = previous.next();

        let mut rules = HashMap::with_capacity(config.limit_keys.len());
        for item in &config.limit_keys {
            if item.key.is_empty() {
                return Err(KeyrateError::Config(
                    "limit_keys key name is required".to_string(),
                ));
            }
            if rules.contains_key(&item.key) {
                return Err(KeyrateError::Config(format!(
                    "duplicate limit_keys key name: {}",
                    item.key
                )));
            }
            let (quota, period) = item.quota()?;
            rules.insert(
                item.key.clone(),
                RateLimitRule::new(generation, item.key.clone(), quota, period.duration(), quota),
            );
        }

        info!(
            generation = %generation,
            rules = rules.len(),
            source = ?source,
            "Built rate limit rule table"
        );

        Ok(Self {
            generation,
            source,
            rules,
            fail_open_on_contention: config.fail_open_on_contention,
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn source(&self) -> &LimitSource {
        &self.source
    }

    pub fn fail_open_on_contention(&self) -> bool {
        self.fail_open_on_contention
    }

    /// Find the rule for an extracted limit key.
    pub fn find(&self, key: &str) -> Option<&RateLimitRule> {
        self.rules.get(key)
    }

    pub fn rules(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
