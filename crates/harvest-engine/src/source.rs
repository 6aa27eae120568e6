//! Scrape source trait
//!
//! Implement this trait for any target site or API. The engine only ever
//! calls [`ScrapeSource::fetch`] with an item key and treats the returned rows
//! as opaque JSON; parsing and transport live entirely in the implementation.

use anyhow::Result;
use async_trait::async_trait;
use harvest_common::hashing::{content_hash, DEFAULT_VOLATILE_FIELDS};
use serde_json::Value;

use crate::types::ResultRecord;

/// A source of result rows, keyed by work item
#[async_trait]
pub trait ScrapeSource: Send + Sync {
    /// Scraper name recorded in the run ledger
    ///
    /// E.g., "pharmacy_de", "drug_register_fr"
    fn name(&self) -> &str;

    /// Fetch and parse one work item
    ///
    /// # Returns
    /// The item's rows. An empty vector means the source answered but had no
    /// data; an error means the attempt failed and may be retried.
    async fn fetch(&self, item_key: &str) -> Result<Vec<Value>>;

    /// Whether a row carries usable data
    ///
    /// Default: a non-empty JSON object.
    fn is_meaningful(&self, row: &Value) -> bool {
        matches!(row, Value::Object(map) if !map.is_empty())
    }

    /// Fields that define a row's identity for deduplication
    ///
    /// Default `None` hashes every field except [`ScrapeSource::volatile_fields`].
    fn hash_fields(&self) -> Option<&[&'static str]> {
        None
    }

    /// Fields excluded from the content hash
    fn volatile_fields(&self) -> &[&'static str] {
        DEFAULT_VOLATILE_FIELDS
    }

    /// Turn a fetched row into a result record
    fn to_result(&self, run_id: &str, item_key: &str, row: Value) -> ResultRecord {
        let hash = content_hash(&row, self.hash_fields(), self.volatile_fields());
        ResultRecord {
            run_id: run_id.to_string(),
            item_key: item_key.to_string(),
            content_hash: hash,
            payload: row,
        }
    }
}
