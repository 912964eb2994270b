//! Token usage recording and windowed USD budget enforcement.

use std::collections::HashMap;

use aegis_domain::config::{BudgetConfig, BudgetPeriod};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use parking_lot::RwLock;
use serde::Serialize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One recorded LLM call.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub at: DateTime<Utc>,
}

/// Aggregated totals for one (provider, model) pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TokenTracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records per-call usage and enforces the configured spend budget.
///
/// Records older than the widest window (monthly) are pruned on write so
/// memory stays bounded.
pub struct TokenTracker {
    budget: Option<BudgetConfig>,
    records: RwLock<Vec<UsageRecord>>,
}

impl TokenTracker {
    pub fn new(budget: Option<BudgetConfig>) -> Self {
        Self {
            budget,
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn record(
        &self,
        provider: &str,
        model: &str,
        agent_id: Option<&str>,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: f64,
    ) {
        let now = Utc::now();
        let mut records = self.records.write();
        records.push(UsageRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            agent_id: agent_id.map(String::from),
            input_tokens,
            output_tokens,
            cost_usd,
            at: now,
        });

        // Bound memory: nothing looks further back than a monthly window.
        let horizon = window_start(BudgetPeriod::Monthly, now);
        if records.first().is_some_and(|r| r.at < horizon) {
            records.retain(|r| r.at >= horizon);
        }
    }

    /// Spend inside the current budget window. 0 when no budget is set.
    pub fn window_spend(&self) -> f64 {
        let Some(budget) = &self.budget else { return 0.0 };
        let start = window_start(budget.period, Utc::now());
        self.records
            .read()
            .iter()
            .filter(|r| r.at >= start)
            .map(|r| r.cost_usd)
            .sum()
    }

    /// Whether further requests are allowed. With no budget configured,
    /// always `true`; once the window's spend reaches the limit, `false`
    /// until the window rolls.
    pub fn is_under_budget(&self) -> bool {
        match &self.budget {
            None => true,
            Some(budget) => self.window_spend() < budget.limit_usd,
        }
    }

    /// Whether a projected additional cost would cross the limit.
    pub fn would_exceed(&self, projected_cost_usd: f64) -> bool {
        match &self.budget {
            None => false,
            Some(budget) => self.window_spend() + projected_cost_usd > budget.limit_usd,
        }
    }

    pub fn budget(&self) -> Option<&BudgetConfig> {
        self.budget.as_ref()
    }

    /// Totals per (provider, model) over everything retained.
    pub fn totals(&self) -> HashMap<(String, String), UsageTotals> {
        let mut out: HashMap<(String, String), UsageTotals> = HashMap::new();
        for record in self.records.read().iter() {
            let entry = out
                .entry((record.provider.clone(), record.model.clone()))
                .or_default();
            entry.requests += 1;
            entry.input_tokens += record.input_tokens as u64;
            entry.output_tokens += record.output_tokens as u64;
            entry.cost_usd += record.cost_usd;
        }
        out
    }

    /// An agent's spend since the start of the current UTC day.
    pub fn agent_daily_spend(&self, agent_id: &str) -> f64 {
        let start = window_start(BudgetPeriod::Daily, Utc::now());
        self.records
            .read()
            .iter()
            .filter(|r| r.at >= start && r.agent_id.as_deref() == Some(agent_id))
            .map(|r| r.cost_usd)
            .sum()
    }
}

/// Start of the budget window containing `now`.
fn window_start(period: BudgetPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        BudgetPeriod::Hourly => truncate_to_hour(now),
        BudgetPeriod::Daily => truncate_to_day(now),
        BudgetPeriod::Weekly => {
            let days_from_monday = now.weekday().num_days_from_monday() as i64;
            truncate_to_day(now) - Duration::days(days_from_monday)
        }
        BudgetPeriod::Monthly => Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now),
    }
}

fn truncate_to_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
        .single()
        .unwrap_or(now)
}

fn truncate_to_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily_budget(limit: f64) -> Option<BudgetConfig> {
        Some(BudgetConfig {
            limit_usd: limit,
            period: BudgetPeriod::Daily,
        })
    }

    #[test]
    fn no_budget_is_never_exceeded() {
        let tracker = TokenTracker::new(None);
        tracker.record("p", "m", None, 1_000_000, 0, 100.0);
        assert!(tracker.is_under_budget());
        assert!(!tracker.would_exceed(1_000.0));
    }

    #[test]
    fn budget_blocks_once_crossed() {
        let tracker = TokenTracker::new(daily_budget(0.0001));
        assert!(tracker.is_under_budget());

        // First large call succeeds, then the window is exhausted.
        tracker.record("p", "m", None, 1_000_000, 0, 3.0);
        assert!(!tracker.is_under_budget());
    }

    #[test]
    fn projected_cost_counts() {
        let tracker = TokenTracker::new(daily_budget(1.0));
        tracker.record("p", "m", None, 1000, 100, 0.6);
        assert!(tracker.is_under_budget());
        assert!(tracker.would_exceed(0.5)); // 0.6 + 0.5 > 1.0
        assert!(!tracker.would_exceed(0.3));
    }

    #[test]
    fn totals_aggregate_by_provider_model() {
        let tracker = TokenTracker::new(None);
        tracker.record("a", "m1", None, 10, 20, 0.01);
        tracker.record("a", "m1", None, 30, 40, 0.02);
        tracker.record("b", "m2", None, 5, 5, 0.005);

        let totals = tracker.totals();
        let a = &totals[&("a".to_string(), "m1".to_string())];
        assert_eq!(a.requests, 2);
        assert_eq!(a.input_tokens, 40);
        assert_eq!(a.output_tokens, 60);
        assert!((a.cost_usd - 0.03).abs() < 1e-9);
        assert_eq!(totals.len(), 2);
    }

    #[test]
    fn agent_spend_tracked_separately() {
        let tracker = TokenTracker::new(None);
        tracker.record("p", "m", Some("calc"), 100, 10, 0.5);
        tracker.record("p", "m", Some("other"), 100, 10, 0.25);
        tracker.record("p", "m", None, 100, 10, 0.25);
        assert!((tracker.agent_daily_spend("calc") - 0.5).abs() < 1e-9);
        assert!((tracker.agent_daily_spend("other") - 0.25).abs() < 1e-9);
    }

    #[test]
    fn window_starts() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 13, 45, 30).unwrap(); // Saturday
        assert_eq!(
            window_start(BudgetPeriod::Hourly, now),
            Utc.with_ymd_and_hms(2024, 6, 15, 13, 0, 0).unwrap()
        );
        assert_eq!(
            window_start(BudgetPeriod::Daily, now),
            Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            window_start(BudgetPeriod::Weekly, now),
            Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap() // Monday
        );
        assert_eq!(
            window_start(BudgetPeriod::Monthly, now),
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
        );
    }
}
