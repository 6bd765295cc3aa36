//! Collaborator interfaces consumed by the scheduler
//!
//! The orchestration engine is deliberately ignorant of vendor DOM
//! heuristics, persistence schemas, and inbox mechanics. Those concerns
//! live behind the traits here; the engine only sequences and bounds
//! them. Reference implementations backed by the local filesystem live
//! in [`builtin`].

pub mod builtin;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Reference to one listing record in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    /// Source the record was collected from
    pub source: String,
    /// Source-scoped record identifier
    pub id: String,
}

impl std::fmt::Display for RecordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source, self.id)
    }
}

/// A derived valuation produced by an enrichment pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Whole currency units
    pub amount: u64,
    pub derived_at: DateTime<Utc>,
}

impl Estimate {
    pub fn new(amount: u64) -> Self {
        Self {
            amount,
            derived_at: Utc::now(),
        }
    }
}

/// One collected property listing with its persisted vendor inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: String,
    pub source: String,
    pub address: String,
    /// Comparable sale amounts captured at scrape time; the valuer's raw
    /// inputs
    #[serde(default)]
    pub comparables: Vec<u64>,
    #[serde(default)]
    pub estimate: Option<Estimate>,
    /// Set on upsert, cleared once a valuation pass has handled the record
    #[serde(default)]
    pub needs_valuation: bool,
    pub scraped_at: DateTime<Utc>,
}

impl ListingRecord {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef {
            source: self.source.clone(),
            id: self.id.clone(),
        }
    }
}

/// One external listing source (a vendor site)
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Stable source identifier used in configuration and stats
    fn id(&self) -> &str;

    /// Collect at most `allowance` new records into the catalog; returns
    /// how many new records were stored.
    async fn scrape(&self, allowance: u64) -> Result<u64, JobError>;
}

/// Persisted listing records, keyed by source
#[async_trait]
pub trait ListingCatalog: Send + Sync {
    /// Number of records still awaiting a valuation pass for the source.
    /// With `only_missing`, records that already carry an estimate are
    /// not counted.
    async fn pending_count(&self, source: &str, only_missing: bool) -> Result<u64, JobError>;

    /// Up to `limit` records awaiting a valuation pass, oldest first
    async fn pending_valuations(
        &self,
        source: &str,
        only_missing: bool,
        limit: usize,
    ) -> Result<Vec<RecordRef>, JobError>;

    /// Insert or refresh a scraped record; returns true when it is new.
    /// Marks the record as awaiting valuation either way.
    async fn upsert_listing(&self, record: ListingRecord) -> Result<bool, JobError>;

    async fn get_listing(&self, record: &RecordRef) -> Result<Option<ListingRecord>, JobError>;

    /// Attach a derived estimate and clear the record's pending flag
    async fn store_estimate(&self, record: &RecordRef, estimate: Estimate) -> Result<(), JobError>;

    /// The valuer had nothing to say; clear the pending flag so the
    /// record stops re-entering the enrich backlog.
    async fn record_no_value(&self, record: &RecordRef) -> Result<(), JobError>;
}

/// Derives a valuation from a record's persisted vendor inputs
#[async_trait]
pub trait Valuer: Send + Sync {
    /// `Ok(None)` when the inputs are insufficient for an estimate
    async fn derive_value(&self, record: &RecordRef) -> Result<Option<Estimate>, JobError>;
}

/// Health surface of the network-egress pool
#[async_trait]
pub trait EgressPool: Send + Sync {
    /// Number of healthy egress units available for parallel work
    async fn healthy_units(&self) -> usize;

    /// Put the unit implicated in a recoverable failure on cooldown
    async fn cooldown(&self, reason: &str);
}

/// Automatic one-time-code extraction from a received message
#[async_trait]
pub trait InboxFetcher: Send + Sync {
    async fn fetch_code(&self, service: &str, timeout: Duration) -> Result<String, JobError>;
}
