//! File-backed high-water mark.
//!
//! In publish-only mode nothing is written to the store, so
//! `last_indexed_number` cannot drive back-fill after a restart. The mark
//! keeps the highest fully-processed block number in a small file so the
//! synchronizer can resume from it regardless of mode.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use crate::error::IngestError;

/// Highest fully-processed block number, persisted to a file.
pub struct HighWaterMark {
    path: PathBuf,
    current: Mutex<Option<u64>>,
}

impl HighWaterMark {
    /// Load the mark from `path`, or start empty when the file does not
    /// exist yet.
    pub async fn load(path: PathBuf) -> Result<Self, IngestError> {
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let number = contents.trim().parse::<u64>().map_err(|e| {
                    IngestError::Watermark(format!(
                        "unreadable mark in {}: {e}",
                        path.display()
                    ))
                })?;
                Some(number)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(IngestError::Watermark(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            current: Mutex::new(current),
        })
    }

    pub fn get(&self) -> Option<u64> {
        *self.current.lock().unwrap()
    }

    /// Raise the mark to `number` if it is higher than the current value,
    /// and persist it. Lower numbers are a no-op — blocks complete out of
    /// order.
    pub async fn advance(&self, number: u64) -> Result<(), IngestError> {
        {
            let mut current = self.current.lock().unwrap();
            if current.is_some_and(|c| c >= number) {
                return Ok(());
            }
            *current = Some(number);
        }
        tokio::fs::write(&self.path, format!("{number}\n"))
            .await
            .map_err(|e| {
                IngestError::Watermark(format!("failed to write {}: {e}", self.path.display()))
            })?;
        debug!(number, "advanced high-water mark");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chainingest-hwm-{name}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn starts_empty_without_file() {
        let path = temp_path("empty");
        let _ = tokio::fs::remove_file(&path).await;
        let mark = HighWaterMark::load(path).await.unwrap();
        assert_eq!(mark.get(), None);
    }

    #[tokio::test]
    async fn advance_persists_and_reloads() {
        let path = temp_path("reload");
        let _ = tokio::fs::remove_file(&path).await;

        let mark = HighWaterMark::load(path.clone()).await.unwrap();
        mark.advance(120).await.unwrap();
        assert_eq!(mark.get(), Some(120));

        let reloaded = HighWaterMark::load(path.clone()).await.unwrap();
        assert_eq!(reloaded.get(), Some(120));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn advance_is_monotonic() {
        let path = temp_path("monotonic");
        let _ = tokio::fs::remove_file(&path).await;

        let mark = HighWaterMark::load(path.clone()).await.unwrap();
        mark.advance(50).await.unwrap();
        mark.advance(30).await.unwrap(); // out-of-order completion
        assert_eq!(mark.get(), Some(50));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
