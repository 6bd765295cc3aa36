//! JSON-file listing catalog
//!
//! All records live in one JSON document, rewritten on every mutation.
//! Good enough for the scales this daemon batches at; the production
//! deployment points the scheduler at a real database through the same
//! trait.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::JobError;
use crate::sources::{Estimate, ListingCatalog, ListingRecord, RecordRef};

/// Single-file catalog of listing records
pub struct JsonCatalog {
    path: PathBuf,
    // Serializes load-modify-save sequences within this process.
    guard: Mutex<()>,
}

impl JsonCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    /// All records currently stored (test and CLI convenience)
    pub fn all(&self) -> Result<Vec<ListingRecord>, JobError> {
        let _guard = self.guard.lock().unwrap();
        self.load()
    }

    fn load(&self) -> Result<Vec<ListingRecord>, JobError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| JobError::Other(format!("corrupt catalog file: {e}")))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(JobError::Other(format!("failed to read catalog: {e}"))),
        }
    }

    fn save(&self, records: &[ListingRecord]) -> Result<(), JobError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| JobError::Other(format!("failed to create catalog dir: {e}")))?;
        }
        let json =
            serde_json::to_string_pretty(records).map_err(|e| JobError::Other(format!("serialize catalog: {e}")))?;
        fs::write(&self.path, json).map_err(|e| JobError::Other(format!("failed to write catalog: {e}")))
    }

    fn pending<'a>(records: &'a [ListingRecord], source: &str, only_missing: bool) -> Vec<&'a ListingRecord> {
        let mut pending: Vec<_> = records
            .iter()
            .filter(|r| r.source == source && r.needs_valuation)
            .filter(|r| !only_missing || r.estimate.is_none())
            .collect();
        pending.sort_by(|a, b| a.scraped_at.cmp(&b.scraped_at));
        pending
    }
}

#[async_trait]
impl ListingCatalog for JsonCatalog {
    async fn pending_count(&self, source: &str, only_missing: bool) -> Result<u64, JobError> {
        let _guard = self.guard.lock().unwrap();
        let records = self.load()?;
        Ok(Self::pending(&records, source, only_missing).len() as u64)
    }

    async fn pending_valuations(
        &self,
        source: &str,
        only_missing: bool,
        limit: usize,
    ) -> Result<Vec<RecordRef>, JobError> {
        let _guard = self.guard.lock().unwrap();
        let records = self.load()?;
        Ok(Self::pending(&records, source, only_missing)
            .into_iter()
            .take(limit)
            .map(|r| r.record_ref())
            .collect())
    }

    async fn upsert_listing(&self, record: ListingRecord) -> Result<bool, JobError> {
        let _guard = self.guard.lock().unwrap();
        let mut records = self.load()?;

        let existing = records.iter_mut().find(|r| r.source == record.source && r.id == record.id);
        let is_new = match existing {
            Some(current) => {
                current.address = record.address;
                current.comparables = record.comparables;
                current.scraped_at = record.scraped_at;
                current.needs_valuation = true;
                false
            }
            None => {
                let mut record = record;
                record.needs_valuation = true;
                records.push(record);
                true
            }
        };

        self.save(&records)?;
        Ok(is_new)
    }

    async fn get_listing(&self, record: &RecordRef) -> Result<Option<ListingRecord>, JobError> {
        let _guard = self.guard.lock().unwrap();
        let records = self.load()?;
        Ok(records.into_iter().find(|r| r.source == record.source && r.id == record.id))
    }

    async fn store_estimate(&self, record: &RecordRef, estimate: Estimate) -> Result<(), JobError> {
        let _guard = self.guard.lock().unwrap();
        let mut records = self.load()?;

        let Some(current) = records.iter_mut().find(|r| r.source == record.source && r.id == record.id) else {
            return Err(JobError::Other(format!("unknown record {record}")));
        };
        current.estimate = Some(estimate);
        current.needs_valuation = false;
        debug!(record = %record, amount = estimate.amount, "Estimate stored");

        self.save(&records)
    }

    async fn record_no_value(&self, record: &RecordRef) -> Result<(), JobError> {
        let _guard = self.guard.lock().unwrap();
        let mut records = self.load()?;

        let Some(current) = records.iter_mut().find(|r| r.source == record.source && r.id == record.id) else {
            return Ok(());
        };
        current.needs_valuation = false;
        debug!(record = %record, "Record marked as unvaluable for this cycle");

        self.save(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(source: &str, id: &str, comparables: Vec<u64>) -> ListingRecord {
        ListingRecord {
            id: id.to_string(),
            source: source.to_string(),
            address: format!("{id} Main St"),
            comparables,
            estimate: None,
            needs_valuation: false,
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_marks_pending_and_detects_new() {
        let dir = TempDir::new().unwrap();
        let catalog = JsonCatalog::new(dir.path().join("catalog.json"));

        assert!(catalog.upsert_listing(record("a", "1", vec![100])).await.unwrap());
        assert!(!catalog.upsert_listing(record("a", "1", vec![100, 200])).await.unwrap());

        assert_eq!(catalog.pending_count("a", true).await.unwrap(), 1);
        assert_eq!(catalog.pending_count("b", true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_estimate_drains_backlog() {
        let dir = TempDir::new().unwrap();
        let catalog = JsonCatalog::new(dir.path().join("catalog.json"));

        catalog.upsert_listing(record("a", "1", vec![100])).await.unwrap();
        let record_ref = RecordRef {
            source: "a".into(),
            id: "1".into(),
        };

        catalog.store_estimate(&record_ref, Estimate::new(150)).await.unwrap();
        assert_eq!(catalog.pending_count("a", true).await.unwrap(), 0);

        let stored = catalog.get_listing(&record_ref).await.unwrap().unwrap();
        assert_eq!(stored.estimate.unwrap().amount, 150);
    }

    #[tokio::test]
    async fn test_only_missing_filter_skips_estimated_records() {
        let dir = TempDir::new().unwrap();
        let catalog = JsonCatalog::new(dir.path().join("catalog.json"));

        catalog.upsert_listing(record("a", "1", vec![100])).await.unwrap();
        let record_ref = RecordRef {
            source: "a".into(),
            id: "1".into(),
        };
        catalog.store_estimate(&record_ref, Estimate::new(150)).await.unwrap();

        // Re-scraping queues the record again.
        catalog.upsert_listing(record("a", "1", vec![100, 120])).await.unwrap();

        assert_eq!(catalog.pending_count("a", true).await.unwrap(), 0, "only-missing skips it");
        assert_eq!(catalog.pending_count("a", false).await.unwrap(), 1, "refresh mode re-enriches");
    }

    #[tokio::test]
    async fn test_record_no_value_clears_pending_flag() {
        let dir = TempDir::new().unwrap();
        let catalog = JsonCatalog::new(dir.path().join("catalog.json"));

        catalog.upsert_listing(record("a", "1", vec![])).await.unwrap();
        let record_ref = RecordRef {
            source: "a".into(),
            id: "1".into(),
        };

        catalog.record_no_value(&record_ref).await.unwrap();
        assert_eq!(catalog.pending_count("a", true).await.unwrap(), 0);
        assert!(catalog.get_listing(&record_ref).await.unwrap().unwrap().estimate.is_none());
    }

    #[tokio::test]
    async fn test_pending_valuations_oldest_first_with_limit() {
        let dir = TempDir::new().unwrap();
        let catalog = JsonCatalog::new(dir.path().join("catalog.json"));

        for i in 0..5 {
            let mut r = record("a", &format!("{i}"), vec![100]);
            r.scraped_at = Utc::now() - chrono::Duration::seconds(100 - i);
            catalog.upsert_listing(r).await.unwrap();
        }

        let refs = catalog.pending_valuations("a", true, 3).await.unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].id, "0");
    }
}
