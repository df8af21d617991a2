#![forbid(unsafe_code)]

//! Client-side display of campaign totals.
//!
//! Polls may arrive stale or out of order, and the client may know about its own
//! payment before any poll reflects it. Every input is folded through a per-field
//! max, so the displayed values never regress.

use std::time::Duration;

use rust_decimal::Decimal;
use tally_contracts::campaign::CampaignAggregate;
use tally_contracts::money::CurrencyCode;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregateSnapshot {
    pub total_donated: Decimal,
    pub donors_count: u64,
    pub currency: Option<CurrencyCode>,
}

impl AggregateSnapshot {
    pub fn new(total_donated: Decimal, donors_count: u64, currency: Option<CurrencyCode>) -> Self {
        Self {
            total_donated,
            donors_count,
            currency,
        }
    }

    pub fn from_campaign(campaign: &CampaignAggregate) -> Self {
        Self {
            total_donated: campaign.total_donated,
            donors_count: campaign.donors_count,
            currency: Some(campaign.currency.clone()),
        }
    }
}

pub fn merge_monotonic(prev: &AggregateSnapshot, next: &AggregateSnapshot) -> AggregateSnapshot {
    AggregateSnapshot {
        total_donated: prev.total_donated.max(next.total_donated),
        donors_count: prev.donors_count.max(next.donors_count),
        currency: next.currency.clone().or_else(|| prev.currency.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayTracker {
    current: AggregateSnapshot,
}

impl DisplayTracker {
    pub fn new(initial: AggregateSnapshot) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> &AggregateSnapshot {
        &self.current
    }

    pub fn apply_poll(&mut self, polled: &AggregateSnapshot) -> &AggregateSnapshot {
        self.current = merge_monotonic(&self.current, polled);
        &self.current
    }

    /// Optimistic fold of a payment the client saw succeed locally.
    pub fn apply_local_payment(&mut self, amount: Decimal) -> &AggregateSnapshot {
        let optimistic = AggregateSnapshot {
            total_donated: self.current.total_donated.saturating_add(amount),
            donors_count: self.current.donors_count.saturating_add(1),
            currency: None,
        };
        self.current = merge_monotonic(&self.current, &optimistic);
        &self.current
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    /// Offsets from local payment success; the first is the immediate refresh.
    pub reconciliation_offsets: Vec<Duration>,
    pub background_interval: Duration,
}

impl PollSchedule {
    pub fn mvp_v1() -> Self {
        Self {
            reconciliation_offsets: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            background_interval: Duration::from_secs(20),
        }
    }

    pub fn reconciliation_offsets_ms(&self) -> Vec<u64> {
        self.reconciliation_offsets
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect()
    }

    /// Earliest poll strictly after `elapsed` (time since local payment success).
    pub fn next_due_after(&self, elapsed: Duration) -> Duration {
        let reconciliation = self
            .reconciliation_offsets
            .iter()
            .copied()
            .find(|offset| *offset > elapsed);
        let background = if self.background_interval.is_zero() {
            None
        } else {
            let interval_ms = self.background_interval.as_millis();
            let ticks = elapsed.as_millis() / interval_ms + 1;
            Some(Duration::from_millis((ticks * interval_ms) as u64))
        };
        match (reconciliation, background) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => elapsed,
        }
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::mvp_v1()
    }
}
