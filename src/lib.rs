//! Resilient client-side data layer for a file-storage backend.
//!
//! [`DataLayer`] is the entry point. Reads are revalidated with ETags and fall
//! back to the last known body when the network is down; uploads and downloads
//! go through pre-signed URLs and are de-duplicated by fingerprint; pinned
//! files live in a local SQLite store that outlives sessions.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod offline;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use client::{open_offline_store, DataLayer};
pub use config::Config;
pub use error::{DataError, Result, RetryGuidance};
