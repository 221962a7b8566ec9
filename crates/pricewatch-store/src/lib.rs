//! Durable keyed subscription store: one JSON snapshot on disk,
//! atomically rewritten on every mutation, migrated on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use pricewatch_core::Subscription;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("loading subscription data: {0}")]
    Load(#[source] anyhow::Error),
    #[error("persisting subscription data: {0}")]
    Persist(#[source] anyhow::Error),
}

/// Single source of truth for subscriber state. All access goes through
/// one async mutex, so at most one writer touches any record at a time;
/// the in-memory map stays authoritative even when a disk write fails.
pub struct SubscriptionStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, Subscription>>,
}

impl SubscriptionStore {
    /// Load the store from `path`. A missing file is an empty store;
    /// records persisted before the identifier index existed get one
    /// backfilled from URL structure, best-effort.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut records: BTreeMap<String, Subscription> = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))
                .map_err(StoreError::Load)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(StoreError::Load(
                    anyhow::Error::new(err).context(format!("reading {}", path.display())),
                ))
            }
        };

        let mut backfilled = 0usize;
        for record in records.values_mut() {
            if record.identifiers.is_empty() && !record.items.is_empty() {
                record.backfill_identifiers();
                backfilled += 1;
            }
        }
        if backfilled > 0 {
            info!(backfilled, "migrated legacy records without identifier index");
        }
        info!(subscribers = records.len(), path = %path.display(), "subscription store loaded");

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.lock().await.contains_key(id)
    }

    pub async fn subscriber_ids(&self) -> Vec<String> {
        self.records.lock().await.keys().cloned().collect()
    }

    /// Cloned view of one record.
    pub async fn subscription(&self, id: &str) -> Option<Subscription> {
        self.records.lock().await.get(id).cloned()
    }

    /// Create the record on first interaction; returns whether it was
    /// newly created.
    pub async fn ensure_subscription(&self, id: &str, now: DateTime<Utc>) -> bool {
        let mut records = self.records.lock().await;
        if records.contains_key(id) {
            return false;
        }
        records.insert(id.to_string(), Subscription::new(now));
        self.persist(&records).await;
        true
    }

    /// Mutate one record under the store lock and persist the result.
    /// Returns `None` when the subscriber is unknown. A failed write is
    /// logged and the in-memory mutation stands.
    pub async fn update<T>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Subscription) -> T,
    ) -> Option<T> {
        let mut records = self.records.lock().await;
        let outcome = mutate(records.get_mut(id)?);
        self.persist(&records).await;
        Some(outcome)
    }

    /// Hard-delete one record. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let mut records = self.records.lock().await;
        let removed = records.remove(id).is_some();
        if removed {
            self.persist(&records).await;
        }
        removed
    }

    /// Delete every record failing `keep`; returns the removed ids.
    pub async fn retain(&self, keep: impl Fn(&str, &Subscription) -> bool) -> Vec<String> {
        let mut records = self.records.lock().await;
        let removed: Vec<String> = records
            .iter()
            .filter(|(id, sub)| !keep(id, sub))
            .map(|(id, _)| id.clone())
            .collect();
        if removed.is_empty() {
            return removed;
        }
        for id in &removed {
            records.remove(id);
        }
        self.persist(&records).await;
        removed
    }

    /// Force a write of the current state, surfacing the error. Used at
    /// shutdown, where a silent failure would lose the final state.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let records = self.records.lock().await;
        self.write_snapshot(&records).await
    }

    async fn persist(&self, records: &BTreeMap<String, Subscription>) {
        if let Err(err) = self.write_snapshot(records).await {
            warn!(error = %err, path = %self.path.display(), "subscription snapshot write failed; memory state stays authoritative");
        }
    }

    /// Full atomic rewrite: serialize everything, write a temp file in
    /// the target directory, flush, rename over the old snapshot. Either
    /// the write completes or the prior file remains intact.
    async fn write_snapshot(
        &self,
        records: &BTreeMap<String, Subscription>,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(records)
            .context("serializing subscription snapshot")
            .map_err(StoreError::Persist)?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating store directory {}", parent.display()))
            .map_err(StoreError::Persist)?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &self.path).await.with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            })
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result.map_err(StoreError::Persist)
    }
}
