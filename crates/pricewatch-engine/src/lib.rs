//! Schedule manager: drift-free per-subscriber checkpointing, tick
//! pipelines, maintenance jobs and subscriber-initiated operations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use pricewatch_core::{
    compare_snapshots, is_notifiable, ChangeKind, DuplicateMatch, IntervalPolicy, PriceChange,
    TrackedItem, UnknownInterval, MAX_ITEMS_PER_SUBSCRIPTION,
};
use pricewatch_fetch::{
    fetch_batch_normalized, FetchConfig, FetchError, FetchResult, FetchService, HttpFetchService,
    SelectorRules,
};
use pricewatch_notify::{DeliveryOutcome, DeliveryService, LogDelivery, ProductNotice};
use pricewatch_store::SubscriptionStore;
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-engine";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_file: PathBuf,
    pub selectors_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fixed_tick_cron: String,
    pub on_change_tick_cron: String,
    pub sweep_cron: String,
    pub identity_refresh_cron: String,
    pub fixed_tick_jitter_secs: u64,
    pub on_change_tick_jitter_secs: u64,
    /// Minimum elapsed time between two on-change polls of the same
    /// subscriber, decoupling notification policy from tick cadence.
    pub on_change_min_gap_minutes: i64,
    pub inactive_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("./subscriptions.json"),
            selectors_file: None,
            user_agent: "pricewatch/0.1".to_string(),
            http_timeout_secs: 15,
            fixed_tick_cron: "0 */10 * * * *".to_string(),
            on_change_tick_cron: "0 */30 * * * *".to_string(),
            sweep_cron: "0 0 3 * * *".to_string(),
            identity_refresh_cron: "0 0 4 * * *".to_string(),
            fixed_tick_jitter_secs: 30,
            on_change_tick_jitter_secs: 300,
            on_change_min_gap_minutes: 25,
            inactive_days: 30,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_file: std::env::var("PRICEWATCH_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_file),
            selectors_file: std::env::var("PRICEWATCH_SELECTORS_FILE")
                .map(PathBuf::from)
                .ok(),
            user_agent: std::env::var("PRICEWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("PRICEWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            fixed_tick_cron: std::env::var("PRICEWATCH_FIXED_TICK_CRON")
                .unwrap_or(defaults.fixed_tick_cron),
            on_change_tick_cron: std::env::var("PRICEWATCH_ON_CHANGE_TICK_CRON")
                .unwrap_or(defaults.on_change_tick_cron),
            sweep_cron: std::env::var("PRICEWATCH_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            identity_refresh_cron: std::env::var("PRICEWATCH_IDENTITY_REFRESH_CRON")
                .unwrap_or(defaults.identity_refresh_cron),
            fixed_tick_jitter_secs: defaults.fixed_tick_jitter_secs,
            on_change_tick_jitter_secs: defaults.on_change_tick_jitter_secs,
            on_change_min_gap_minutes: std::env::var("PRICEWATCH_ON_CHANGE_GAP_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.on_change_min_gap_minutes),
            inactive_days: std::env::var("PRICEWATCH_INACTIVE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.inactive_days),
        }
    }
}

/// User-visible failures of subscriber-initiated operations. Everything
/// on the scheduled path is recovered locally and logged instead.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("product already tracked via {}", .0.existing_url)]
    Duplicate(DuplicateMatch),
    #[error("tracked item limit of {cap} reached")]
    LimitExceeded { cap: usize },
    #[error(transparent)]
    UnknownInterval(#[from] UnknownInterval),
    #[error("not a valid product link")]
    InvalidUrl,
    #[error("product data unavailable")]
    Unavailable,
    #[error("product is out of stock")]
    OutOfStock,
    #[error("no tracked item at position {0}")]
    NoSuchItem(usize),
    #[error("unknown subscriber")]
    UnknownSubscriber,
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub tracking_enabled: bool,
    pub interval: String,
    pub last_check: Option<DateTime<Utc>>,
    pub items: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SubscriberOutcome {
    pub items_checked: usize,
    pub notified: usize,
    pub purged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub run_id: Uuid,
    pub examined: usize,
    pub checked: usize,
    pub notified: usize,
    pub purged: usize,
    pub failed: usize,
}

impl TickSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            examined: 0,
            checked: 0,
            notified: 0,
            purged: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub subscribers: usize,
    pub remapped: usize,
}

/// Next due checkpoint for a fixed-interval subscriber. Missed windows
/// are skipped in whole-interval steps so checks stay anchored to the
/// original grid instead of drifting toward whenever a tick happened to
/// run. Closed form; a corrupt future timestamp degrades to "one
/// interval later" instead of looping.
pub fn next_checkpoint(
    last_check: DateTime<Utc>,
    interval_hours: u8,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let interval_secs = i64::from(interval_hours) * 3600;
    let elapsed_secs = (now - last_check).num_seconds();
    let steps = (elapsed_secs / interval_secs).max(1);
    last_check + Duration::seconds(steps * interval_secs)
}

struct ItemUpdate {
    changes: Vec<PriceChange>,
    identifier: Option<String>,
    policy: IntervalPolicy,
}

/// The price-monitoring engine. Owns the store and the two external
/// service seams; every mutation funnels through the store's
/// single-writer lock.
pub struct Engine {
    store: Arc<SubscriptionStore>,
    fetch: Arc<dyn FetchService>,
    delivery: Arc<dyn DeliveryService>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<SubscriptionStore>,
        fetch: Arc<dyn FetchService>,
        delivery: Arc<dyn DeliveryService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            fetch,
            delivery,
            config,
        }
    }

    /// Wire up the default services: the store at the configured path,
    /// the HTTP fetcher and log-only delivery.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let store = SubscriptionStore::open(&config.data_file)
            .await
            .context("opening subscription store")?;
        let rules = match &config.selectors_file {
            Some(path) => SelectorRules::from_yaml_file(path)?,
            None => SelectorRules::default(),
        };
        let fetch = HttpFetchService::new(FetchConfig {
            timeout: StdDuration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            rules,
            ..FetchConfig::default()
        });
        Ok(Self::new(
            Arc::new(store),
            Arc::new(fetch),
            Arc::new(LogDelivery),
            config,
        ))
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create the subscriber record on first interaction.
    pub async fn ensure_subscriber(&self, subscriber: &str, now: DateTime<Utc>) -> bool {
        self.store.ensure_subscription(subscriber, now).await
    }

    /// Validate, fetch and track a new product for a subscriber.
    pub async fn add_product(
        &self,
        subscriber: &str,
        raw_url: &str,
        now: DateTime<Utc>,
    ) -> Result<TrackedItem, SubscribeError> {
        let url = normalize_product_url(raw_url)?;
        let sub = self
            .store
            .subscription(subscriber)
            .await
            .ok_or(SubscribeError::UnknownSubscriber)?;
        if sub.at_capacity() {
            return Err(SubscribeError::LimitExceeded {
                cap: MAX_ITEMS_PER_SUBSCRIPTION,
            });
        }
        if let Some(dup) = sub.resolve_duplicate(&url, None) {
            return Err(SubscribeError::Duplicate(dup));
        }

        let urls = vec![url.clone()];
        let results = fetch_batch_normalized(self.fetch.as_ref(), &urls).await?;
        let result = results
            .get(&url)
            .cloned()
            .unwrap_or_else(FetchResult::failed);
        let Some(identifier) = result.identifier.clone() else {
            return Err(SubscribeError::Unavailable);
        };
        if result.out_of_stock {
            return Err(SubscribeError::OutOfStock);
        }
        let Some(name) = result.name.clone() else {
            return Err(SubscribeError::Unavailable);
        };
        if result.prices.is_empty() {
            return Err(SubscribeError::Unavailable);
        }

        // Re-validate under the store lock: the record may have changed
        // between the read above and now.
        self.store
            .update(subscriber, |sub| {
                if sub.at_capacity() {
                    return Err(SubscribeError::LimitExceeded {
                        cap: MAX_ITEMS_PER_SUBSCRIPTION,
                    });
                }
                if let Some(dup) = sub.resolve_duplicate(&url, Some(&identifier)) {
                    return Err(SubscribeError::Duplicate(dup));
                }
                sub.insert_item(
                    url.clone(),
                    name.clone(),
                    result.prices.clone(),
                    identifier.clone(),
                );
                sub.last_active = now;
                Ok(sub.tracked_item(&url))
            })
            .await
            .ok_or(SubscribeError::UnknownSubscriber)?
    }

    /// Remove the item at a 1-based list position.
    pub async fn remove_product(
        &self,
        subscriber: &str,
        position: usize,
        now: DateTime<Utc>,
    ) -> Result<String, SubscribeError> {
        self.store
            .update(subscriber, |sub| {
                let index = position
                    .checked_sub(1)
                    .ok_or(SubscribeError::NoSuchItem(position))?;
                let url = sub
                    .remove_item_at(index)
                    .ok_or(SubscribeError::NoSuchItem(position))?;
                sub.last_active = now;
                Ok(url)
            })
            .await
            .ok_or(SubscribeError::UnknownSubscriber)?
    }

    /// Bulk clear. The subscription record itself persists, empty.
    pub async fn clear_products(
        &self,
        subscriber: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, SubscribeError> {
        self.store
            .update(subscriber, |sub| {
                let count = sub.items.len();
                sub.clear_items();
                sub.last_active = now;
                count
            })
            .await
            .ok_or(SubscribeError::UnknownSubscriber)
    }

    pub async fn set_interval(
        &self,
        subscriber: &str,
        hours: i64,
        now: DateTime<Utc>,
    ) -> Result<IntervalPolicy, SubscribeError> {
        let policy = IntervalPolicy::from_hours(hours)?;
        self.store
            .update(subscriber, |sub| {
                sub.interval = policy;
                sub.last_active = now;
                policy
            })
            .await
            .ok_or(SubscribeError::UnknownSubscriber)
    }

    pub async fn set_tracking(
        &self,
        subscriber: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SubscribeError> {
        self.store
            .update(subscriber, |sub| {
                sub.tracking_enabled = enabled;
                sub.last_active = now;
            })
            .await
            .ok_or(SubscribeError::UnknownSubscriber)
    }

    pub async fn list_products(&self, subscriber: &str) -> Result<Vec<TrackedItem>, SubscribeError> {
        let sub = self
            .store
            .subscription(subscriber)
            .await
            .ok_or(SubscribeError::UnknownSubscriber)?;
        Ok(sub.items.iter().map(|url| sub.tracked_item(url)).collect())
    }

    pub async fn stats(&self, subscriber: &str) -> Result<SubscriberStats, SubscribeError> {
        let sub = self
            .store
            .subscription(subscriber)
            .await
            .ok_or(SubscribeError::UnknownSubscriber)?;
        Ok(SubscriberStats {
            tracking_enabled: sub.tracking_enabled,
            interval: sub.interval.describe(),
            last_check: sub.last_check,
            items: sub.items.len(),
            capacity: MAX_ITEMS_PER_SUBSCRIPTION,
        })
    }

    /// Subscriber-forced check: bypasses notification suppression and
    /// counts as activity.
    pub async fn check_now(
        &self,
        subscriber: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriberOutcome, SubscribeError> {
        if !self.store.contains(subscriber).await {
            return Err(SubscribeError::UnknownSubscriber);
        }
        self.store
            .update(subscriber, |sub| sub.last_active = now)
            .await;
        let outcome = self.process_subscriber(subscriber, true, now).await?;
        if !outcome.purged {
            self.store
                .update(subscriber, |sub| sub.advance_last_check(now))
                .await;
        }
        Ok(outcome)
    }

    /// One pass over every fixed-interval subscriber, acting on the
    /// ones whose checkpoint is due. `last_check` is persisted as the
    /// computed checkpoint, never the wall clock.
    pub async fn run_fixed_tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::new(Uuid::new_v4());
        for id in self.store.subscriber_ids().await {
            let Some(sub) = self.store.subscription(&id).await else {
                continue;
            };
            if !sub.tracking_enabled {
                continue;
            }
            let IntervalPolicy::Every(hours) = sub.interval else {
                continue;
            };
            summary.examined += 1;

            let (due, next) = match sub.last_check {
                None => (true, now),
                Some(last) => {
                    let next = next_checkpoint(last, hours, now);
                    (now >= next, next)
                }
            };
            if !due {
                continue;
            }

            info!(run_id = %summary.run_id, subscriber = id.as_str(), hours, "fixed-interval check due");
            match self.process_subscriber(&id, false, now).await {
                Ok(outcome) => {
                    summary.checked += 1;
                    summary.notified += outcome.notified;
                    if outcome.purged {
                        summary.purged += 1;
                        continue;
                    }
                    self.store
                        .update(&id, |sub| sub.advance_last_check(next))
                        .await;
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(run_id = %summary.run_id, subscriber = id.as_str(), error = %err,
                        "subscriber tick aborted; state unchanged, retried next tick");
                }
            }
        }
        summary
    }

    /// One pass over every on-change subscriber. The minimum-gap guard
    /// keeps a jittery tick from re-polling anyone too soon.
    pub async fn run_on_change_tick(&self, now: DateTime<Utc>) -> TickSummary {
        let gap = Duration::minutes(self.config.on_change_min_gap_minutes);
        let mut summary = TickSummary::new(Uuid::new_v4());
        for id in self.store.subscriber_ids().await {
            let Some(sub) = self.store.subscription(&id).await else {
                continue;
            };
            if !sub.tracking_enabled || sub.interval != IntervalPolicy::OnChange {
                continue;
            }
            summary.examined += 1;

            if let Some(last) = sub.last_check {
                if now - last < gap {
                    continue;
                }
            }

            info!(run_id = %summary.run_id, subscriber = id.as_str(), "on-change check due");
            match self.process_subscriber(&id, false, now).await {
                Ok(outcome) => {
                    summary.checked += 1;
                    summary.notified += outcome.notified;
                    if outcome.purged {
                        summary.purged += 1;
                        continue;
                    }
                    self.store
                        .update(&id, |sub| sub.advance_last_check(now))
                        .await;
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(run_id = %summary.run_id, subscriber = id.as_str(), error = %err,
                        "subscriber tick aborted; state unchanged, retried next tick");
                }
            }
        }
        summary
    }

    /// Fetch, diff, persist and notify for one subscriber. A whole-
    /// batch fetch failure propagates and leaves the record untouched;
    /// unusable per-item results are skipped without clobbering
    /// last-known data.
    async fn process_subscriber(
        &self,
        id: &str,
        force_notify: bool,
        now: DateTime<Utc>,
    ) -> Result<SubscriberOutcome, FetchError> {
        let mut outcome = SubscriberOutcome::default();
        let Some(sub) = self.store.subscription(id).await else {
            return Ok(outcome);
        };
        if !sub.tracking_enabled || sub.items.is_empty() {
            return Ok(outcome);
        }

        let results = fetch_batch_normalized(self.fetch.as_ref(), &sub.items).await?;

        for url in &sub.items {
            let Some(result) = results.get(url) else {
                continue;
            };
            if !result.is_usable() {
                continue;
            }
            let Some(name) = result.name.clone() else {
                continue;
            };

            let update = self
                .store
                .update(id, |sub| {
                    // The item may have been removed since the batch
                    // was read; never resurrect it.
                    if !sub.items.contains(url) {
                        return None;
                    }
                    let previous = sub.snapshots.get(url).cloned();
                    let changes = compare_snapshots(previous.as_ref(), &result.prices);
                    sub.names.insert(url.clone(), name.clone());
                    if let Some(new_id) = &result.identifier {
                        sub.remap_identifier(url, new_id);
                    }
                    sub.snapshots.insert(url.clone(), result.prices.clone());
                    Some(ItemUpdate {
                        changes,
                        identifier: sub.identifier_for(url).map(str::to_string),
                        policy: sub.interval,
                    })
                })
                .await;
            let Some(Some(update)) = update else {
                continue;
            };
            outcome.items_checked += 1;

            if !force_notify && suppress_delivery(&update.changes, update.policy) {
                continue;
            }

            let notice = ProductNotice {
                name: &name,
                url,
                identifier: update.identifier.as_deref(),
                prices: &result.prices,
                changes: &update.changes,
                policy: update.policy,
                now,
            };
            match self.delivery.send(id, &notice.render()).await {
                DeliveryOutcome::Delivered => outcome.notified += 1,
                DeliveryOutcome::PermanentlyUnreachable => {
                    warn!(subscriber = id, "subscriber permanently unreachable; purging record");
                    self.store.delete(id).await;
                    outcome.purged = true;
                    return Ok(outcome);
                }
                DeliveryOutcome::TransientFailure(reason) => {
                    warn!(subscriber = id, reason, "notification delivery failed; continuing");
                }
            }
        }
        Ok(outcome)
    }

    /// Drop every subscription idle past the configured age.
    pub async fn run_inactivity_sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = now - Duration::days(self.config.inactive_days);
        let removed = self
            .store
            .retain(|_, sub| sub.last_active >= threshold)
            .await;
        if !removed.is_empty() {
            info!(removed = removed.len(), "inactive subscriptions deleted");
        }
        removed
    }

    /// Re-fetch every tracked URL and remap identifiers that changed
    /// upstream. Progress persists item by item, so an abort loses at
    /// most the in-flight item and a re-run is a no-op.
    pub async fn run_identity_refresh(&self) -> RefreshSummary {
        let run_id = Uuid::new_v4();
        let mut summary = RefreshSummary {
            run_id,
            subscribers: 0,
            remapped: 0,
        };
        for id in self.store.subscriber_ids().await {
            let Some(sub) = self.store.subscription(&id).await else {
                continue;
            };
            if sub.items.is_empty() {
                continue;
            }
            summary.subscribers += 1;

            let results = match fetch_batch_normalized(self.fetch.as_ref(), &sub.items).await {
                Ok(results) => results,
                Err(err) => {
                    warn!(run_id = %run_id, subscriber = id.as_str(), error = %err,
                        "identity refresh fetch failed; subscriber skipped");
                    continue;
                }
            };

            for url in &sub.items {
                let Some(new_id) = results.get(url).and_then(|r| r.identifier.clone()) else {
                    continue;
                };
                let remapped = self
                    .store
                    .update(&id, |sub| {
                        if sub.items.contains(url) {
                            sub.remap_identifier(url, &new_id)
                        } else {
                            false
                        }
                    })
                    .await;
                if remapped == Some(true) {
                    summary.remapped += 1;
                }
            }
        }
        info!(run_id = %run_id, subscribers = summary.subscribers, remapped = summary.remapped,
            "identity refresh complete");
        summary
    }

    /// Wire the recurring drivers: fixed tick, on-change tick, daily
    /// inactivity sweep and daily identity refresh.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let engine = Arc::clone(self);
        let jitter = self.config.fixed_tick_jitter_secs;
        let job = Job::new_async(self.config.fixed_tick_cron.as_str(), move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                tokio::time::sleep(jitter_delay(jitter)).await;
                let summary = engine.run_fixed_tick(Utc::now()).await;
                info!(run_id = %summary.run_id, checked = summary.checked,
                    notified = summary.notified, failed = summary.failed, "fixed tick complete");
            })
        })
        .with_context(|| format!("creating fixed tick job for cron {}", self.config.fixed_tick_cron))?;
        sched.add(job).await.context("adding fixed tick job")?;

        let engine = Arc::clone(self);
        let jitter = self.config.on_change_tick_jitter_secs;
        let job = Job::new_async(self.config.on_change_tick_cron.as_str(), move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                tokio::time::sleep(jitter_delay(jitter)).await;
                let summary = engine.run_on_change_tick(Utc::now()).await;
                info!(run_id = %summary.run_id, checked = summary.checked,
                    notified = summary.notified, failed = summary.failed, "on-change tick complete");
            })
        })
        .with_context(|| {
            format!(
                "creating on-change tick job for cron {}",
                self.config.on_change_tick_cron
            )
        })?;
        sched.add(job).await.context("adding on-change tick job")?;

        let engine = Arc::clone(self);
        let job = Job::new_async(self.config.sweep_cron.as_str(), move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                engine.run_inactivity_sweep(Utc::now()).await;
            })
        })
        .with_context(|| format!("creating sweep job for cron {}", self.config.sweep_cron))?;
        sched.add(job).await.context("adding sweep job")?;

        let engine = Arc::clone(self);
        let job = Job::new_async(self.config.identity_refresh_cron.as_str(), move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                engine.run_identity_refresh().await;
            })
        })
        .with_context(|| {
            format!(
                "creating identity refresh job for cron {}",
                self.config.identity_refresh_cron
            )
        })?;
        sched.add(job).await.context("adding identity refresh job")?;

        Ok(sched)
    }

    /// Start the scheduler and block until ctrl-c, then flush the store.
    pub async fn run_until_shutdown(self: Arc<Self>) -> Result<()> {
        let mut sched = self.build_scheduler().await?;
        sched.start().await.context("starting scheduler")?;
        info!("pricewatch engine running; ctrl-c to stop");
        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        sched.shutdown().await.context("stopping scheduler")?;
        self.store
            .flush()
            .await
            .context("flushing subscription store")?;
        Ok(())
    }
}

/// On-change subscribers are only notified on actual deltas, and the
/// very first observation is suppressed under any policy.
fn suppress_delivery(changes: &[PriceChange], policy: IntervalPolicy) -> bool {
    let first_only =
        changes.len() == 1 && matches!(changes[0].change, ChangeKind::FirstObservation);
    first_only || (policy == IntervalPolicy::OnChange && !is_notifiable(changes))
}

fn normalize_product_url(raw: &str) -> Result<String, SubscribeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return Err(SubscribeError::InvalidUrl);
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else if trimmed.contains('/') {
        // Bare shortlinks like "shop.example/t/AbCdEf".
        Ok(format!("https://{trimmed}"))
    } else {
        Err(SubscribeError::InvalidUrl)
    }
}

/// Small de-synchronizing delay before each scheduled job, derived from
/// the clock's subsecond nanos.
fn jitter_delay(max_secs: u64) -> StdDuration {
    if max_secs == 0 {
        return StdDuration::ZERO;
    }
    let nanos = u64::from(Utc::now().timestamp_subsec_nanos());
    StdDuration::from_secs(nanos % (max_secs + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use pricewatch_core::{PriceKind, PriceSnapshot};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn snapshot(pairs: &[(PriceKind, i64)]) -> PriceSnapshot {
        pairs.iter().copied().collect()
    }

    fn usable(name: &str, card: i64, identifier: &str) -> FetchResult {
        FetchResult {
            name: Some(name.to_string()),
            prices: snapshot(&[(PriceKind::Card, card)]),
            identifier: Some(identifier.to_string()),
            out_of_stock: false,
        }
    }

    #[derive(Default)]
    struct ScriptedFetch {
        results: Mutex<HashMap<String, FetchResult>>,
        calls: AtomicUsize,
        fail_batch: AtomicBool,
    }

    impl ScriptedFetch {
        fn set(&self, url: &str, result: FetchResult) {
            self.results
                .lock()
                .expect("fetch mock lock")
                .insert(url.to_string(), result);
        }
    }

    #[async_trait]
    impl FetchService for ScriptedFetch {
        async fn fetch_batch(
            &self,
            urls: &[String],
        ) -> Result<HashMap<String, FetchResult>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_batch.load(Ordering::SeqCst) {
                return Err(FetchError::Batch(anyhow::anyhow!("scrape backend unreachable")));
            }
            let results = self.results.lock().expect("fetch mock lock");
            Ok(urls
                .iter()
                .map(|u| {
                    (
                        u.clone(),
                        results.get(u).cloned().unwrap_or_else(FetchResult::failed),
                    )
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct ScriptedDelivery {
        // Popped front-first; empty means Delivered.
        outcomes: Mutex<Vec<DeliveryOutcome>>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedDelivery {
        fn push_outcome(&self, outcome: DeliveryOutcome) {
            self.outcomes.lock().expect("delivery mock lock").push(outcome);
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().expect("delivery mock lock").clone()
        }
    }

    #[async_trait]
    impl DeliveryService for ScriptedDelivery {
        async fn send(&self, subscriber_id: &str, message: &str) -> DeliveryOutcome {
            self.sent
                .lock()
                .expect("delivery mock lock")
                .push((subscriber_id.to_string(), message.to_string()));
            let mut outcomes = self.outcomes.lock().expect("delivery mock lock");
            if outcomes.is_empty() {
                DeliveryOutcome::Delivered
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct Harness {
        engine: Engine,
        fetch: Arc<ScriptedFetch>,
        delivery: Arc<ScriptedDelivery>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let store = SubscriptionStore::open(dir.path().join("data.json"))
            .await
            .expect("store");
        let fetch = Arc::new(ScriptedFetch::default());
        let delivery = Arc::new(ScriptedDelivery::default());
        let engine = Engine::new(
            Arc::new(store),
            fetch.clone(),
            delivery.clone(),
            EngineConfig::default(),
        );
        Harness {
            engine,
            fetch,
            delivery,
            _dir: dir,
        }
    }

    const URL: &str = "https://shop.example/product/445566/";

    async fn seed_subscriber(h: &Harness, id: &str, policy: IntervalPolicy, last_check: Option<DateTime<Utc>>) {
        h.engine.ensure_subscriber(id, t0()).await;
        h.engine
            .store()
            .update(id, |sub| {
                sub.interval = policy;
                sub.last_check = last_check;
                sub.insert_item(
                    URL.to_string(),
                    "Cordless Drill X200".to_string(),
                    snapshot(&[(PriceKind::Card, 12990)]),
                    "445566".to_string(),
                );
            })
            .await;
    }

    #[test]
    fn checkpoint_fast_forwards_missed_windows() {
        let last = t0();
        let now = last + Duration::hours(7);
        assert_eq!(next_checkpoint(last, 3, now), last + Duration::hours(6));
    }

    #[test]
    fn checkpoint_single_interval_when_on_time() {
        let last = t0();
        assert_eq!(
            next_checkpoint(last, 3, last + Duration::hours(3)),
            last + Duration::hours(3)
        );
        // Not yet due: the next checkpoint still sits one interval out.
        assert_eq!(
            next_checkpoint(last, 3, last + Duration::hours(1)),
            last + Duration::hours(3)
        );
    }

    #[test]
    fn checkpoint_tolerates_future_timestamp() {
        let last = t0();
        let now = last - Duration::hours(5);
        assert_eq!(next_checkpoint(last, 3, now), last + Duration::hours(3));
    }

    #[tokio::test]
    async fn fixed_tick_anchors_last_check_to_the_grid() {
        let h = harness().await;
        seed_subscriber(&h, "1", IntervalPolicy::Every(3), Some(t0())).await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12490, "445566"));

        let now = t0() + Duration::hours(7);
        let summary = h.engine.run_fixed_tick(now).await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.notified, 1);

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert_eq!(sub.last_check, Some(t0() + Duration::hours(6)));
        assert_eq!(sub.snapshots[URL].get(PriceKind::Card), Some(12490));

        let sent = h.delivery.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("card price down to 12 490 (-500)"));
    }

    #[tokio::test]
    async fn fixed_tick_skips_subscribers_not_yet_due() {
        let h = harness().await;
        let last = t0() - Duration::hours(1);
        seed_subscriber(&h, "1", IntervalPolicy::Every(3), Some(last)).await;

        let summary = h.engine.run_fixed_tick(t0()).await;
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.checked, 0);
        assert_eq!(h.fetch.calls.load(Ordering::SeqCst), 0);

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert_eq!(sub.last_check, Some(last));
    }

    #[tokio::test]
    async fn first_observation_is_stored_but_not_delivered() {
        let h = harness().await;
        h.engine.ensure_subscriber("1", t0()).await;
        h.engine
            .store()
            .update("1", |sub| {
                sub.interval = IntervalPolicy::Every(3);
                sub.items.push(URL.to_string());
                sub.identifiers.insert("445566".into(), URL.to_string());
            })
            .await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12990, "445566"));

        let summary = h.engine.run_fixed_tick(t0()).await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.notified, 0);
        assert!(h.delivery.sent().is_empty());

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert_eq!(sub.snapshots[URL].get(PriceKind::Card), Some(12990));
        assert_eq!(sub.last_check, Some(t0()));
    }

    #[tokio::test]
    async fn fixed_policy_still_reports_unchanged_prices() {
        let h = harness().await;
        seed_subscriber(&h, "1", IntervalPolicy::Every(3), Some(t0() - Duration::hours(3))).await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12990, "445566"));

        let summary = h.engine.run_fixed_tick(t0()).await;
        assert_eq!(summary.notified, 1);
        assert!(h.delivery.sent()[0].1.contains("card price unchanged"));
    }

    #[tokio::test]
    async fn on_change_tick_respects_minimum_gap() {
        let h = harness().await;
        seed_subscriber(
            &h,
            "1",
            IntervalPolicy::OnChange,
            Some(t0() - Duration::minutes(10)),
        )
        .await;

        let summary = h.engine.run_on_change_tick(t0()).await;
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.checked, 0);
        assert_eq!(h.fetch.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn on_change_suppresses_unchanged_but_advances_last_check() {
        let h = harness().await;
        seed_subscriber(
            &h,
            "1",
            IntervalPolicy::OnChange,
            Some(t0() - Duration::minutes(30)),
        )
        .await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12990, "445566"));

        let summary = h.engine.run_on_change_tick(t0()).await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.notified, 0);
        assert!(h.delivery.sent().is_empty());

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert_eq!(sub.last_check, Some(t0()));
    }

    #[tokio::test]
    async fn on_change_notifies_on_delta() {
        let h = harness().await;
        seed_subscriber(
            &h,
            "1",
            IntervalPolicy::OnChange,
            Some(t0() - Duration::minutes(40)),
        )
        .await;
        h.fetch.set(URL, usable("Cordless Drill X200", 11990, "445566"));

        let summary = h.engine.run_on_change_tick(t0()).await;
        assert_eq!(summary.notified, 1);
        assert!(h.delivery.sent()[0].1.contains("card price down to 11 990 (-1 000)"));
    }

    #[tokio::test]
    async fn permanently_unreachable_subscriber_is_purged() {
        let h = harness().await;
        seed_subscriber(&h, "1", IntervalPolicy::Every(3), Some(t0() - Duration::hours(3))).await;
        h.fetch.set(URL, usable("Cordless Drill X200", 11990, "445566"));
        h.delivery
            .push_outcome(DeliveryOutcome::PermanentlyUnreachable);

        let summary = h.engine.run_fixed_tick(t0()).await;
        assert_eq!(summary.purged, 1);
        assert!(!h.engine.store().contains("1").await);
    }

    #[tokio::test]
    async fn transient_delivery_failure_continues_with_next_item() {
        let h = harness().await;
        let url2 = "https://shop.example/product/778899/";
        seed_subscriber(&h, "1", IntervalPolicy::Every(3), Some(t0() - Duration::hours(3))).await;
        h.engine
            .store()
            .update("1", |sub| {
                sub.insert_item(
                    url2.to_string(),
                    "Impact Driver Y10".to_string(),
                    snapshot(&[(PriceKind::Card, 8990)]),
                    "778899".to_string(),
                );
            })
            .await;
        h.fetch.set(URL, usable("Cordless Drill X200", 11990, "445566"));
        h.fetch.set(url2, usable("Impact Driver Y10", 7990, "778899"));
        h.delivery
            .push_outcome(DeliveryOutcome::TransientFailure("flood limit".into()));

        let summary = h.engine.run_fixed_tick(t0()).await;
        assert_eq!(summary.notified, 1);
        assert_eq!(h.delivery.sent().len(), 2);
        assert!(h.engine.store().contains("1").await);
    }

    #[tokio::test]
    async fn batch_failure_leaves_subscriber_state_untouched() {
        let h = harness().await;
        let last = t0() - Duration::hours(3);
        seed_subscriber(&h, "1", IntervalPolicy::Every(3), Some(last)).await;
        h.fetch.fail_batch.store(true, Ordering::SeqCst);

        let summary = h.engine.run_fixed_tick(t0()).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.checked, 0);

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert_eq!(sub.last_check, Some(last));
        assert_eq!(sub.snapshots[URL].get(PriceKind::Card), Some(12990));
    }

    #[tokio::test]
    async fn out_of_stock_item_keeps_last_known_data() {
        let h = harness().await;
        seed_subscriber(&h, "1", IntervalPolicy::Every(3), Some(t0() - Duration::hours(3))).await;
        h.fetch.set(
            URL,
            FetchResult {
                name: Some("Cordless Drill X200".into()),
                prices: snapshot(&[(PriceKind::Card, 1)]),
                identifier: Some("445566".into()),
                out_of_stock: true,
            },
        );

        let summary = h.engine.run_fixed_tick(t0()).await;
        assert_eq!(summary.notified, 0);

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert_eq!(sub.snapshots[URL].get(PriceKind::Card), Some(12990));
        assert_eq!(sub.names[URL], "Cordless Drill X200");
        // The check itself still happened, so the checkpoint advances.
        assert_eq!(sub.last_check, Some(t0()));
    }

    #[tokio::test]
    async fn add_product_tracks_and_seeds_item() {
        let h = harness().await;
        h.engine.ensure_subscriber("1", t0()).await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12990, "445566"));

        let item = h
            .engine
            .add_product("1", URL, t0())
            .await
            .expect("add succeeds");
        assert_eq!(item.identifier.as_deref(), Some("445566"));

        let listed = h.engine.list_products("1").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name.as_deref(), Some("Cordless Drill X200"));

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert_eq!(sub.items, vec![URL.to_string()]);
        assert_eq!(sub.last_active, t0());
    }

    #[tokio::test]
    async fn add_product_rejects_identifier_duplicate_across_urls() {
        let h = harness().await;
        h.engine.ensure_subscriber("1", t0()).await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12990, "445566"));
        h.engine.add_product("1", URL, t0()).await.expect("first add");

        let other = "https://shop.example/t/AbCdEf";
        h.fetch.set(other, usable("Same Drill, Short Link", 12990, "445566"));
        let err = h.engine.add_product("1", other, t0()).await.unwrap_err();
        assert!(matches!(err, SubscribeError::Duplicate(_)));
    }

    #[tokio::test]
    async fn add_product_rejects_canonical_url_duplicate() {
        let h = harness().await;
        h.engine.ensure_subscriber("1", t0()).await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12990, "445566"));
        h.engine.add_product("1", URL, t0()).await.expect("first add");

        let variant = "https://WWW.shop.example/product/445566/?utm=ad";
        let err = h.engine.add_product("1", variant, t0()).await.unwrap_err();
        assert!(matches!(err, SubscribeError::Duplicate(_)));
    }

    #[tokio::test]
    async fn add_product_enforces_item_cap() {
        let h = harness().await;
        h.engine.ensure_subscriber("1", t0()).await;
        for i in 0..MAX_ITEMS_PER_SUBSCRIPTION {
            let url = format!("https://shop.example/product/10000{i}/");
            h.fetch.set(&url, usable(&format!("Item {i}"), 100 + i as i64, &format!("10000{i}")));
            h.engine.add_product("1", &url, t0()).await.expect("within cap");
        }

        let url = "https://shop.example/product/999999/";
        h.fetch.set(url, usable("One Too Many", 100, "999999"));
        let err = h.engine.add_product("1", url, t0()).await.unwrap_err();
        assert!(matches!(err, SubscribeError::LimitExceeded { cap: MAX_ITEMS_PER_SUBSCRIPTION }));
    }

    #[tokio::test]
    async fn add_product_rejects_unusable_results() {
        let h = harness().await;
        h.engine.ensure_subscriber("1", t0()).await;

        h.fetch.set(URL, FetchResult::failed());
        assert!(matches!(
            h.engine.add_product("1", URL, t0()).await,
            Err(SubscribeError::Unavailable)
        ));

        h.fetch.set(
            URL,
            FetchResult {
                name: Some("Cordless Drill X200".into()),
                prices: snapshot(&[(PriceKind::Card, 12990)]),
                identifier: Some("445566".into()),
                out_of_stock: true,
            },
        );
        assert!(matches!(
            h.engine.add_product("1", URL, t0()).await,
            Err(SubscribeError::OutOfStock)
        ));
    }

    #[tokio::test]
    async fn remove_and_clear_keep_the_record_alive() {
        let h = harness().await;
        seed_subscriber(&h, "1", IntervalPolicy::Every(3), None).await;

        let removed = h.engine.remove_product("1", 1, t0()).await.expect("remove");
        assert_eq!(removed, URL);
        assert!(matches!(
            h.engine.remove_product("1", 1, t0()).await,
            Err(SubscribeError::NoSuchItem(1))
        ));

        h.engine.clear_products("1", t0()).await.expect("clear");
        assert!(h.engine.store().contains("1").await);
    }

    #[tokio::test]
    async fn set_interval_rejects_values_outside_the_set() {
        let h = harness().await;
        h.engine.ensure_subscriber("1", t0()).await;
        assert!(h.engine.set_interval("1", 3, t0()).await.is_ok());
        assert!(matches!(
            h.engine.set_interval("1", 7, t0()).await,
            Err(SubscribeError::UnknownInterval(UnknownInterval(7)))
        ));
    }

    #[tokio::test]
    async fn check_now_bypasses_suppression_and_counts_as_activity() {
        let h = harness().await;
        seed_subscriber(&h, "1", IntervalPolicy::OnChange, Some(t0() - Duration::minutes(5))).await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12990, "445566"));

        let now = t0();
        let outcome = h.engine.check_now("1", now).await.expect("forced check");
        assert_eq!(outcome.notified, 1);
        assert!(h.delivery.sent()[0].1.contains("card price unchanged"));

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert_eq!(sub.last_active, now);
        assert_eq!(sub.last_check, Some(now));
    }

    #[tokio::test]
    async fn inactivity_sweep_honors_the_age_threshold() {
        let h = harness().await;
        let now = t0();
        h.engine.ensure_subscriber("stale", now).await;
        h.engine.ensure_subscriber("fresh", now).await;
        h.engine
            .store()
            .update("stale", |sub| {
                sub.last_active = now - Duration::days(30) - Duration::seconds(1);
            })
            .await;
        h.engine
            .store()
            .update("fresh", |sub| {
                sub.last_active = now - Duration::days(29);
            })
            .await;

        let removed = h.engine.run_inactivity_sweep(now).await;
        assert_eq!(removed, vec!["stale".to_string()]);
        assert!(h.engine.store().contains("fresh").await);
    }

    #[tokio::test]
    async fn identity_refresh_remaps_changed_identifiers() {
        let h = harness().await;
        seed_subscriber(&h, "1", IntervalPolicy::Every(24), None).await;
        h.fetch.set(URL, usable("Cordless Drill X200", 12990, "999999"));

        let summary = h.engine.run_identity_refresh().await;
        assert_eq!(summary.remapped, 1);

        let sub = h.engine.store().subscription("1").await.expect("record");
        assert!(sub.identifiers.get("445566").is_none());
        assert_eq!(sub.identifiers.get("999999").map(String::as_str), Some(URL));
        assert_eq!(sub.items, vec![URL.to_string()]);

        // Second run observes the same identifier: nothing to remap.
        let summary = h.engine.run_identity_refresh().await;
        assert_eq!(summary.remapped, 0);
    }

    #[test]
    fn normalize_prefixes_bare_shortlinks() {
        assert_eq!(
            normalize_product_url("shop.example/t/AbCdEf").expect("shortlink"),
            "https://shop.example/t/AbCdEf"
        );
        assert!(normalize_product_url("not a url").is_err());
        assert!(normalize_product_url("").is_err());
    }
}
