//! Comparables-average valuer
//!
//! Derives an estimate as the mean of the comparable sale amounts
//! persisted with the record at scrape time. Records without comparables
//! produce no value.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::JobError;
use crate::sources::{Estimate, ListingCatalog, RecordRef, Valuer};

/// Valuation from persisted comparable sales
pub struct CompsValuer {
    catalog: Arc<dyn ListingCatalog>,
}

impl CompsValuer {
    pub fn new(catalog: Arc<dyn ListingCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Valuer for CompsValuer {
    async fn derive_value(&self, record: &RecordRef) -> Result<Option<Estimate>, JobError> {
        let Some(listing) = self.catalog.get_listing(record).await? else {
            debug!(record = %record, "Record vanished before valuation");
            return Ok(None);
        };

        if listing.comparables.is_empty() {
            return Ok(None);
        }

        let sum: u64 = listing.comparables.iter().sum();
        let amount = sum / listing.comparables.len() as u64;
        Ok(Some(Estimate::new(amount)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::ListingRecord;
    use crate::sources::builtin::JsonCatalog;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn seeded_catalog(dir: &TempDir, comparables: Vec<u64>) -> (Arc<JsonCatalog>, RecordRef) {
        let catalog = Arc::new(JsonCatalog::new(dir.path().join("catalog.json")));
        catalog
            .upsert_listing(ListingRecord {
                id: "l1".into(),
                source: "vendor-a".into(),
                address: "1 Elm St".into(),
                comparables,
                estimate: None,
                needs_valuation: true,
                scraped_at: Utc::now(),
            })
            .await
            .unwrap();
        (
            catalog,
            RecordRef {
                source: "vendor-a".into(),
                id: "l1".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_derives_mean_of_comparables() {
        let dir = TempDir::new().unwrap();
        let (catalog, record_ref) = seeded_catalog(&dir, vec![300, 350, 400]).await;
        let valuer = CompsValuer::new(catalog);

        let estimate = valuer.derive_value(&record_ref).await.unwrap().unwrap();
        assert_eq!(estimate.amount, 350);
    }

    #[tokio::test]
    async fn test_no_comparables_yields_absent() {
        let dir = TempDir::new().unwrap();
        let (catalog, record_ref) = seeded_catalog(&dir, vec![]).await;
        let valuer = CompsValuer::new(catalog);

        assert!(valuer.derive_value(&record_ref).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_record_yields_absent() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(JsonCatalog::new(dir.path().join("catalog.json")));
        let valuer = CompsValuer::new(catalog);

        let missing = RecordRef {
            source: "vendor-a".into(),
            id: "ghost".into(),
        };
        assert!(valuer.derive_value(&missing).await.unwrap().is_none());
    }
}
