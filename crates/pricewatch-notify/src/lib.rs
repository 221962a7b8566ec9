//! Delivery contract and the notification composer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{ChangeKind, IntervalPolicy, PriceChange, PriceKind, PriceSnapshot};
use tracing::info;

pub const CRATE_NAME: &str = "pricewatch-notify";

/// What happened to one delivery attempt. The engine branches on this;
/// it is an outcome, not an error to propagate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The subscriber can never be reached again; their record is
    /// purged by the caller.
    PermanentlyUnreachable,
    TransientFailure(String),
}

/// The opaque outbound channel.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn send(&self, subscriber_id: &str, message: &str) -> DeliveryOutcome;
}

/// Default channel: log the rendered message. Keeps the binary runnable
/// without any messenger wired up.
#[derive(Debug, Default)]
pub struct LogDelivery;

#[async_trait]
impl DeliveryService for LogDelivery {
    async fn send(&self, subscriber_id: &str, message: &str) -> DeliveryOutcome {
        info!(subscriber_id, %message, "notification");
        DeliveryOutcome::Delivered
    }
}

/// Everything the composer needs for one product notification.
#[derive(Debug, Clone)]
pub struct ProductNotice<'a> {
    pub name: &'a str,
    pub url: &'a str,
    pub identifier: Option<&'a str>,
    pub prices: &'a PriceSnapshot,
    pub changes: &'a [PriceChange],
    pub policy: IntervalPolicy,
    pub now: DateTime<Utc>,
}

impl ProductNotice<'_> {
    /// Plain-text notification block: name, price line, identifier,
    /// link, timestamp, cadence line, then one bullet per change.
    pub fn render(&self) -> String {
        let mut lines = vec![
            self.name.to_string(),
            price_line(self.prices),
        ];
        if let Some(id) = self.identifier {
            lines.push(format!("id {id}"));
        }
        lines.push(self.url.to_string());
        lines.push(self.now.format("%H:%M %d.%m.%Y").to_string());
        lines.push(match self.policy {
            IntervalPolicy::OnChange => "mode: on price change".to_string(),
            IntervalPolicy::Every(h) => format!(
                "next check: {}",
                (self.now + chrono::Duration::hours(i64::from(h)))
                    .format("%H:%M %d.%m.%Y")
            ),
        });
        lines.push("changes:".to_string());
        for change in self.changes {
            lines.push(format!("- {}", describe_change(change)));
        }
        lines.join("\n")
    }
}

/// "card 12 990 | regular 14 490"; a missing regular price falls back
/// to the card price, a fully empty snapshot renders "n/a".
pub fn price_line(prices: &PriceSnapshot) -> String {
    let card = prices.get(PriceKind::Card);
    let regular = prices.get(PriceKind::Regular).or(card);
    match (card, regular) {
        (Some(c), Some(r)) => format!(
            "card {} | regular {}",
            group_thousands(c),
            group_thousands(r)
        ),
        _ => "n/a".to_string(),
    }
}

pub fn describe_change(change: &PriceChange) -> String {
    let kind = change
        .kind
        .map(PriceKind::label)
        .unwrap_or("price");
    match change.change {
        ChangeKind::FirstObservation => "first price observation".to_string(),
        ChangeKind::Added { amount } => {
            format!("{kind} price added: {}", group_thousands(amount))
        }
        ChangeKind::Increased { to, delta } => format!(
            "{kind} price up to {} (+{})",
            group_thousands(to),
            group_thousands(delta)
        ),
        ChangeKind::Decreased { to, delta } => format!(
            "{kind} price down to {} (-{})",
            group_thousands(to),
            group_thousands(delta)
        ),
        ChangeKind::Unchanged { .. } => format!("{kind} price unchanged"),
    }
}

/// Thousands grouping with spaces: 1299990 -> "1 299 990".
pub fn group_thousands(amount: i64) -> String {
    let negative = amount < 0;
    let digits: Vec<char> = amount.unsigned_abs().to_string().chars().collect();
    let mut grouped = String::new();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(*c);
    }
    if negative {
        format!("-{grouped}")
    } else {
        grouped
    }
}
