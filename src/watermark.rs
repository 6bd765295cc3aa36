//! Incremental-scan watermark
//!
//! A single file holding the last-processed record identifier. Deleting
//! the file restarts the incremental scan from the beginning on the next
//! cycle.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use eyre::{Context, Result};
use tracing::debug;

/// Last-processed record marker
#[derive(Debug, Clone)]
pub struct Watermark {
    path: PathBuf,
}

impl Watermark {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the stored record identifier. Missing file means a fresh scan.
    pub fn load(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.trim().to_string();
                Ok(if id.is_empty() { None } else { Some(id) })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read watermark file"),
        }
    }

    /// Record the identifier of the last processed record
    pub fn store(&self, record_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create watermark directory")?;
        }
        fs::write(&self.path, record_id).context("Failed to write watermark file")?;
        debug!(record_id, path = %self.path.display(), "Watermark stored");
        Ok(())
    }

    /// Remove the watermark, restarting the incremental scan cycle
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Watermark cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove watermark file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = TempDir::new().unwrap();
        let watermark = Watermark::new(dir.path().join("watermark"));

        assert_eq!(watermark.load().unwrap(), None);
    }

    #[test]
    fn test_store_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let watermark = Watermark::new(dir.path().join("watermark"));

        watermark.store("listing-8812").unwrap();
        assert_eq!(watermark.load().unwrap(), Some("listing-8812".to_string()));

        watermark.store("listing-9001").unwrap();
        assert_eq!(watermark.load().unwrap(), Some("listing-9001".to_string()));
    }

    #[test]
    fn test_clear_restarts_scan() {
        let dir = TempDir::new().unwrap();
        let watermark = Watermark::new(dir.path().join("watermark"));

        watermark.store("listing-1").unwrap();
        watermark.clear().unwrap();
        assert_eq!(watermark.load().unwrap(), None);

        // Clearing twice is fine.
        watermark.clear().unwrap();
    }
}
