//! Shared store key layout and value encoding.
//!
//! Keys are `{generation}{purpose-prefix}{limit key}`. Values are fixed-width
//! little-endian 64-bit integers so the store can compare-and-swap them as
//! opaque byte strings.

use std::fmt;

use super::rules::Generation;
use crate::store::StoreError;

/// What a store key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorePurpose {
    /// Remaining tokens of a bucket
    Tokens,
    /// Timestamp of the bucket's last refill
    RefillMarker,
}

impl StorePurpose {
    fn prefix(&self) -> &'static str {
        match self {
            StorePurpose::Tokens => ":tokens:",
            StorePurpose::RefillMarker => ":refill:",
        }
    }
}

/// A composite key addressing one record in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(generation: Generation, purpose: StorePurpose, limit_key: &str) -> Self {
        Self(format!("{}{}{}", generation, purpose.prefix(), limit_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn encode_tokens(tokens: u64) -> [u8; 8] {
    tokens.to_le_bytes()
}

pub fn decode_tokens(key: &StoreKey, value: &[u8]) -> Result<u64, StoreError> {
    fixed_width(key, value).map(u64::from_le_bytes)
}

pub fn encode_timestamp(nanos: i64) -> [u8; 8] {
    nanos.to_le_bytes()
}

pub fn decode_timestamp(key: &StoreKey, value: &[u8]) -> Result<i64, StoreError> {
    fixed_width(key, value).map(i64::from_le_bytes)
}

fn fixed_width(key: &StoreKey, value: &[u8]) -> Result<[u8; 8], StoreError> {
    value.try_into().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        len: value.len(),
    })
}
