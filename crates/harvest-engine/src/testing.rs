//! Deterministic source for tests and the `demo` command
//!
//! [`SyntheticSource`] fails or returns nothing for a pseudo-random but
//! reproducible subset of items. The decision depends on the seed, the item
//! key and how many times that key has been fetched, so a retry of a
//! transiently failing item usually succeeds.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::source::ScrapeSource;

pub struct SyntheticSource {
    name: String,
    seed: u64,
    fail_rate: f64,
    zero_rate: f64,
    rows_per_item: usize,
    delay: Option<Duration>,
    always_fail: HashSet<String>,
    always_zero: HashSet<String>,
    fetches: AtomicU64,
    per_key: Mutex<HashMap<String, u32>>,
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: 0,
            fail_rate: 0.0,
            zero_rate: 0.0,
            rows_per_item: 1,
            delay: None,
            always_fail: HashSet::new(),
            always_zero: HashSet::new(),
            fetches: AtomicU64::new(0),
            per_key: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Fraction of fetches (0.0..=1.0) that fail transiently
    pub fn with_fail_rate(mut self, rate: f64) -> Self {
        self.fail_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Fraction of fetches (0.0..=1.0) that return no rows
    pub fn with_zero_rate(mut self, rate: f64) -> Self {
        self.zero_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_rows_per_item(mut self, rows: usize) -> Self {
        self.rows_per_item = rows;
        self
    }

    /// Sleep this long in every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Keys that fail on every attempt
    pub fn with_always_fail<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.always_fail.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Keys that return no rows on every attempt
    pub fn with_always_zero<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.always_zero.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Total fetch calls so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetch calls for one key so far
    pub fn fetches_for(&self, item_key: &str) -> u32 {
        self.per_key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(item_key)
            .copied()
            .unwrap_or(0)
    }

    fn next_attempt(&self, item_key: &str) -> u32 {
        let mut per_key = self.per_key.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let attempt = per_key.entry(item_key.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }

    /// Uniform value in [0, 1) derived from seed, salt, key and attempt
    fn roll(&self, salt: u64, item_key: &str, attempt: u32) -> f64 {
        let digest = Sha256::digest(item_key.as_bytes());
        let mut key_bits = [0u8; 8];
        key_bits.copy_from_slice(&digest[..8]);

        let seed = self.seed ^ u64::from_le_bytes(key_bits) ^ salt ^ u64::from(attempt).rotate_left(32);
        ChaCha8Rng::seed_from_u64(seed).gen::<f64>()
    }
}

#[async_trait]
impl ScrapeSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, item_key: &str) -> Result<Vec<Value>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let attempt = self.next_attempt(item_key);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail.contains(item_key) {
            bail!("synthetic permanent failure for {item_key}");
        }
        if self.roll(0xF417, item_key, attempt) < self.fail_rate {
            bail!("synthetic transient failure for {item_key} (attempt {attempt})");
        }
        if self.always_zero.contains(item_key) || self.roll(0x2E60, item_key, attempt) < self.zero_rate {
            return Ok(Vec::new());
        }

        let scraped_at = chrono::Utc::now().to_rfc3339();
        Ok((0..self.rows_per_item)
            .map(|index| {
                json!({
                    "item_key": item_key,
                    "index": index,
                    "value": format!("{item_key}-{index}"),
                    "scraped_at": scraped_at,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clean_source_returns_rows() {
        let source = SyntheticSource::new("synthetic").with_rows_per_item(3);
        let rows = source.fetch("item-1").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["value"], "item-1-2");
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(source.fetches_for("item-1"), 1);
    }

    #[tokio::test]
    async fn test_always_fail_and_zero() {
        let source = SyntheticSource::new("synthetic")
            .with_always_fail(["bad"])
            .with_always_zero(["empty"]);

        assert!(source.fetch("bad").await.is_err());
        assert!(source.fetch("bad").await.is_err());
        assert!(source.fetch("empty").await.unwrap().is_empty());
        assert_eq!(source.fetches_for("bad"), 2);
    }

    #[tokio::test]
    async fn test_failure_rate_is_deterministic() {
        let run = |seed| async move {
            let source = SyntheticSource::new("synthetic").with_seed(seed).with_fail_rate(0.3);
            let mut failed = Vec::new();
            for i in 0..200 {
                let key = format!("k{i}");
                if source.fetch(&key).await.is_err() {
                    failed.push(key);
                }
            }
            failed
        };

        let first = run(7).await;
        let second = run(7).await;
        assert_eq!(first, second);
        assert!(first.len() > 30 && first.len() < 90, "got {}", first.len());
    }

    #[test]
    fn test_roll_depends_on_seed_and_attempt() {
        let a = SyntheticSource::new("synthetic").with_seed(1);
        let b = SyntheticSource::new("synthetic").with_seed(2);

        assert_eq!(a.roll(1, "key", 1), a.roll(1, "key", 1));
        assert_ne!(a.roll(1, "key", 1), b.roll(1, "key", 1));
        assert_ne!(a.roll(1, "key", 1), a.roll(1, "key", 2));
        assert_ne!(a.roll(1, "key", 1), a.roll(2, "key", 1));
    }

    #[test]
    fn test_roll_in_unit_interval() {
        let source = SyntheticSource::new("synthetic");
        for i in 0..1000 {
            let r = source.roll(1, &format!("key-{i}"), 1);
            assert!((0.0..1.0).contains(&r));
        }
    }
}
