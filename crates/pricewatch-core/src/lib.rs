//! Core domain model for pricewatch: subscriptions, price snapshots,
//! product identity resolution and snapshot diffing. Pure, no I/O.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pricewatch-core";

/// Hard cap on tracked products per subscription.
pub const MAX_ITEMS_PER_SUBSCRIPTION: usize = 10;

/// Fixed-interval hour counts a subscriber may choose from.
pub const ALLOWED_INTERVAL_HOURS: [u8; 5] = [1, 3, 5, 10, 24];

pub const DEFAULT_INTERVAL_HOURS: u8 = 24;

/// Price kinds observed on a product page. `Card` is the primary
/// (discounted/member) price, `Regular` the secondary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    Card,
    Regular,
}

impl PriceKind {
    pub fn label(self) -> &'static str {
        match self {
            PriceKind::Card => "card",
            PriceKind::Regular => "regular",
        }
    }
}

/// One observation of a product's prices: kind -> integer amount.
/// Absence of a kind means "not observed", not zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceSnapshot(BTreeMap<PriceKind, i64>);

impl PriceSnapshot {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, kind: PriceKind, amount: i64) {
        self.0.insert(kind, amount);
    }

    pub fn get(&self, kind: PriceKind) -> Option<i64> {
        self.0.get(&kind).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PriceKind, i64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(PriceKind, i64)> for PriceSnapshot {
    fn from_iter<I: IntoIterator<Item = (PriceKind, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How a single price kind moved between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "change")]
pub enum ChangeKind {
    /// No prior snapshot existed at all; emitted once, without a kind.
    FirstObservation,
    /// The kind had no prior value.
    Added { amount: i64 },
    Increased { to: i64, delta: i64 },
    Decreased { to: i64, delta: i64 },
    Unchanged { amount: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    /// `None` only for the synthetic first-observation record.
    pub kind: Option<PriceKind>,
    #[serde(flatten)]
    pub change: ChangeKind,
}

/// Diff two snapshots into an ordered list of change records, one per
/// kind present in `current`. No prior snapshot yields exactly one
/// synthetic first-observation record and nothing else.
pub fn compare_snapshots(
    previous: Option<&PriceSnapshot>,
    current: &PriceSnapshot,
) -> Vec<PriceChange> {
    let Some(previous) = previous else {
        return vec![PriceChange {
            kind: None,
            change: ChangeKind::FirstObservation,
        }];
    };

    current
        .iter()
        .map(|(kind, amount)| {
            let change = match previous.get(kind) {
                None => ChangeKind::Added { amount },
                Some(prev) if amount > prev => ChangeKind::Increased {
                    to: amount,
                    delta: amount - prev,
                },
                Some(prev) if amount < prev => ChangeKind::Decreased {
                    to: amount,
                    delta: prev - amount,
                },
                Some(_) => ChangeKind::Unchanged { amount },
            };
            PriceChange {
                kind: Some(kind),
                change,
            }
        })
        .collect()
}

/// A result set consisting solely of unchanged and/or first-observation
/// records carries nothing worth delivering.
pub fn is_notifiable(changes: &[PriceChange]) -> bool {
    changes.iter().any(|c| {
        !matches!(
            c.change,
            ChangeKind::Unchanged { .. } | ChangeKind::FirstObservation
        )
    })
}

/// Canonical form of a product URL: lowercase, query string stripped,
/// literal "www." stripped. Two URLs with the same canonical form refer
/// to the same product page.
pub fn canonical_url(url: &str) -> String {
    let lower = url.to_lowercase();
    let without_query = lower.split('?').next().unwrap_or(&lower);
    without_query.replacen("www.", "", 1)
}

/// Best-effort identifier extraction from a URL's structure, used when
/// migrating records stored before identifiers were captured. Prefers
/// the digit segment following `/product/`, else any path segment of
/// six or more digits.
pub fn extract_identifier(url: &str) -> Option<String> {
    let path = canonical_url(url);
    let segments: Vec<&str> = path.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if *segment == "product" {
            if let Some(next) = segments.get(i + 1) {
                let digits: String = next.chars().take_while(|c| c.is_ascii_digit()).collect();
                if !digits.is_empty() {
                    return Some(digits);
                }
            }
        }
    }
    segments
        .iter()
        .find(|s| s.len() >= 6 && s.chars().all(|c| c.is_ascii_digit()))
        .map(|s| s.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBy {
    Identifier,
    CanonicalUrl,
}

/// Why an add was rejected as a duplicate: the tracked URL it collided
/// with and which key matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub matched_by: MatchBy,
    pub existing_url: String,
}

/// Interval policy: poll-and-notify every fixed hour count, or poll on
/// the on-change cadence and notify only on an actual delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum IntervalPolicy {
    OnChange,
    Every(u8),
}

impl IntervalPolicy {
    /// `0` means on-change; anything else must be in the allowed set.
    pub fn from_hours(hours: i64) -> Result<Self, UnknownInterval> {
        if hours == 0 {
            return Ok(IntervalPolicy::OnChange);
        }
        let h = u8::try_from(hours).map_err(|_| UnknownInterval(hours))?;
        if ALLOWED_INTERVAL_HOURS.contains(&h) {
            Ok(IntervalPolicy::Every(h))
        } else {
            Err(UnknownInterval(hours))
        }
    }

    pub fn describe(self) -> String {
        match self {
            IntervalPolicy::OnChange => "on price change".to_string(),
            IntervalPolicy::Every(1) => "every 1 hour".to_string(),
            IntervalPolicy::Every(h) => format!("every {h} hours"),
        }
    }
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        IntervalPolicy::Every(DEFAULT_INTERVAL_HOURS)
    }
}

impl From<IntervalPolicy> for i64 {
    fn from(policy: IntervalPolicy) -> i64 {
        match policy {
            IntervalPolicy::OnChange => 0,
            IntervalPolicy::Every(h) => i64::from(h),
        }
    }
}

impl TryFrom<i64> for IntervalPolicy {
    type Error = UnknownInterval;

    fn try_from(hours: i64) -> Result<Self, Self::Error> {
        IntervalPolicy::from_hours(hours)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownInterval(pub i64);

impl std::fmt::Display for UnknownInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown check interval: {}", self.0)
    }
}

impl std::error::Error for UnknownInterval {}

/// Read-only view of one tracked product, assembled from the
/// subscription's parallel maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedItem {
    pub url: String,
    pub name: Option<String>,
    pub identifier: Option<String>,
    pub snapshot: Option<PriceSnapshot>,
}

/// One subscriber's durable record. Item order is user-visible and
/// preserved; `identifiers` is the dedup index (identifier -> URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub snapshots: BTreeMap<String, PriceSnapshot>,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
    #[serde(default)]
    pub interval: IntervalPolicy,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    pub last_active: DateTime<Utc>,
    #[serde(default = "default_tracking")]
    pub tracking_enabled: bool,
}

fn default_tracking() -> bool {
    true
}

impl Subscription {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            items: Vec::new(),
            snapshots: BTreeMap::new(),
            names: BTreeMap::new(),
            identifiers: BTreeMap::new(),
            interval: IntervalPolicy::default(),
            last_check: None,
            last_active: now,
            tracking_enabled: true,
        }
    }

    /// Duplicate check for an incoming product reference: a known
    /// identifier wins regardless of URL, else a canonical URL match
    /// under any identifier.
    pub fn resolve_duplicate(&self, url: &str, identifier: Option<&str>) -> Option<DuplicateMatch> {
        if let Some(id) = identifier {
            if let Some(existing) = self.identifiers.get(id) {
                return Some(DuplicateMatch {
                    matched_by: MatchBy::Identifier,
                    existing_url: existing.clone(),
                });
            }
        }
        let canonical = canonical_url(url);
        self.items
            .iter()
            .find(|u| canonical_url(u) == canonical)
            .map(|u| DuplicateMatch {
                matched_by: MatchBy::CanonicalUrl,
                existing_url: u.clone(),
            })
    }

    pub fn at_capacity(&self) -> bool {
        self.items.len() >= MAX_ITEMS_PER_SUBSCRIPTION
    }

    pub fn insert_item(
        &mut self,
        url: String,
        name: String,
        snapshot: PriceSnapshot,
        identifier: String,
    ) {
        self.names.insert(url.clone(), name);
        self.snapshots.insert(url.clone(), snapshot);
        self.identifiers.insert(identifier, url.clone());
        self.items.push(url);
    }

    /// Remove the item at a zero-based position together with its
    /// snapshot, name and identifier index entries.
    pub fn remove_item_at(&mut self, index: usize) -> Option<String> {
        if index >= self.items.len() {
            return None;
        }
        let url = self.items.remove(index);
        self.snapshots.remove(&url);
        self.names.remove(&url);
        self.identifiers.retain(|_, u| *u != url);
        Some(url)
    }

    pub fn clear_items(&mut self) {
        self.items.clear();
        self.snapshots.clear();
        self.names.clear();
        self.identifiers.clear();
    }

    /// Swap the identifier pointing at `url` for a new one. Removes
    /// every stale identifier mapped to the URL first; the URL itself
    /// is never touched.
    pub fn remap_identifier(&mut self, url: &str, new_identifier: &str) -> bool {
        let stale: Vec<String> = self
            .identifiers
            .iter()
            .filter(|(id, u)| *u == url && id.as_str() != new_identifier)
            .map(|(id, _)| id.clone())
            .collect();
        let already_current = self
            .identifiers
            .get(new_identifier)
            .is_some_and(|u| u == url);
        if stale.is_empty() && already_current {
            return false;
        }
        for id in stale {
            self.identifiers.remove(&id);
        }
        self.identifiers
            .insert(new_identifier.to_string(), url.to_string());
        true
    }

    pub fn identifier_for(&self, url: &str) -> Option<&str> {
        self.identifiers
            .iter()
            .find(|(_, u)| *u == url)
            .map(|(id, _)| id.as_str())
    }

    pub fn tracked_item(&self, url: &str) -> TrackedItem {
        TrackedItem {
            url: url.to_string(),
            name: self.names.get(url).cloned(),
            identifier: self.identifier_for(url).map(str::to_string),
            snapshot: self.snapshots.get(url).cloned(),
        }
    }

    /// `last_check` only ever moves forward.
    pub fn advance_last_check(&mut self, ts: DateTime<Utc>) {
        self.last_check = Some(match self.last_check {
            Some(current) if current > ts => current,
            _ => ts,
        });
    }

    /// Backfill the identifier index from URL structure for records
    /// persisted before identifiers were captured. Extraction failures
    /// leave the item unindexed.
    pub fn backfill_identifiers(&mut self) {
        if !self.identifiers.is_empty() {
            return;
        }
        for url in &self.items {
            if let Some(id) = extract_identifier(url) {
                self.identifiers.insert(id, url.clone());
            }
        }
    }
}
