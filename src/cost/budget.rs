//! Advisory spend tracking against optional daily and monthly budgets.
//!
//! Each period escalates through `Warning`, `Alert` and `Exceeded` at most once;
//! the counters roll over when the UTC day or month changes. Nothing here ever
//! blocks a request.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::BudgetConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

impl BudgetPeriod {
    fn key(self, ts: DateTime<Utc>) -> String {
        match self {
            BudgetPeriod::Daily => ts.format("%Y-%m-%d").to_string(),
            BudgetPeriod::Monthly => ts.format("%Y-%m").to_string(),
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPeriod::Daily => write!(f, "daily"),
            BudgetPeriod::Monthly => write!(f, "monthly"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    #[default]
    Ok,
    Warning,
    Alert,
    Exceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAlert {
    pub period: BudgetPeriod,
    pub period_key: String,
    pub level: BudgetLevel,
    pub spent_usd: f64,
    pub limit_usd: f64,
}

pub type AlertCallback = Arc<dyn Fn(&BudgetAlert) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub daily_spent_usd: f64,
    pub daily_limit_usd: Option<f64>,
    pub daily_level: BudgetLevel,
    pub monthly_spent_usd: f64,
    pub monthly_limit_usd: Option<f64>,
    pub monthly_level: BudgetLevel,
}

#[derive(Debug, Default)]
struct PeriodTracker {
    key: String,
    spent: f64,
    level: BudgetLevel,
}

#[derive(Debug, Default)]
struct BudgetState {
    daily: PeriodTracker,
    monthly: PeriodTracker,
}

pub struct BudgetMonitor {
    config: BudgetConfig,
    state: Mutex<BudgetState>,
    on_alert: Option<AlertCallback>,
}

impl BudgetMonitor {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BudgetState::default()),
            on_alert: None,
        }
    }

    pub fn with_callback(mut self, callback: AlertCallback) -> Self {
        self.on_alert = Some(callback);
        self
    }

    /// Add `cost_usd` spent at `ts` and return any newly crossed thresholds.
    pub fn record(&self, ts: DateTime<Utc>, cost_usd: f64) -> Vec<BudgetAlert> {
        let mut alerts = Vec::new();
        {
            let mut state = self.state.lock();
            let periods = [
                (BudgetPeriod::Daily, self.config.daily_usd),
                (BudgetPeriod::Monthly, self.config.monthly_usd),
            ];
            for (period, limit) in periods {
                let tracker = match period {
                    BudgetPeriod::Daily => &mut state.daily,
                    BudgetPeriod::Monthly => &mut state.monthly,
                };
                if let Some(alert) = self.apply(tracker, period, limit, ts, cost_usd) {
                    alerts.push(alert);
                }
            }
        }

        for alert in &alerts {
            match alert.level {
                BudgetLevel::Exceeded => tracing::error!(
                    period = %alert.period,
                    spent_usd = alert.spent_usd,
                    limit_usd = alert.limit_usd,
                    "Budget exceeded"
                ),
                _ => tracing::warn!(
                    period = %alert.period,
                    level = ?alert.level,
                    spent_usd = alert.spent_usd,
                    limit_usd = alert.limit_usd,
                    "Budget threshold crossed"
                ),
            }
            if let Some(callback) = &self.on_alert {
                callback(alert);
            }
        }

        alerts
    }

    fn apply(
        &self,
        tracker: &mut PeriodTracker,
        period: BudgetPeriod,
        limit: Option<f64>,
        ts: DateTime<Utc>,
        cost_usd: f64,
    ) -> Option<BudgetAlert> {
        let key = period.key(ts);
        if tracker.key != key {
            *tracker = PeriodTracker {
                key,
                ..PeriodTracker::default()
            };
        }
        tracker.spent += cost_usd;

        let limit = limit.filter(|l| *l > 0.0)?;
        let level = self.level_for(tracker.spent / limit);
        if level <= tracker.level {
            return None;
        }
        tracker.level = level;

        Some(BudgetAlert {
            period,
            period_key: tracker.key.clone(),
            level,
            spent_usd: tracker.spent,
            limit_usd: limit,
        })
    }

    fn level_for(&self, ratio: f64) -> BudgetLevel {
        if ratio >= 1.0 {
            BudgetLevel::Exceeded
        } else if ratio >= self.config.alert_ratio {
            BudgetLevel::Alert
        } else if ratio >= self.config.warning_ratio {
            BudgetLevel::Warning
        } else {
            BudgetLevel::Ok
        }
    }

    pub fn status(&self) -> BudgetStatus {
        let state = self.state.lock();
        BudgetStatus {
            daily_spent_usd: state.daily.spent,
            daily_limit_usd: self.config.daily_usd,
            daily_level: state.daily.level,
            monthly_spent_usd: state.monthly.spent,
            monthly_limit_usd: self.config.monthly_usd,
            monthly_level: state.monthly.level,
        }
    }
}
