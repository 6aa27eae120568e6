//! Harvest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the Harvest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`HarvestError`] and the [`Result`] alias
//! - **Hashing**: canonical JSON and content hashes used for result deduplication
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use harvest_common::hashing::content_hash;
//! use serde_json::json;
//!
//! let row = json!({"name": "Paracetamol 500mg", "scraped_at": "2024-01-01T00:00:00Z"});
//! let hash = content_hash(&row, None, &["scraped_at"]);
//! assert_eq!(hash.len(), 64);
//! ```

pub mod error;
pub mod hashing;
pub mod logging;

// Re-export commonly used types
pub use error::{HarvestError, Result};
