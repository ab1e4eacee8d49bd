use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::budget::{BudgetAlert, BudgetMonitor, BudgetStatus};
use crate::types::{DispatchError, Result};

const RECENT_EVENTS: usize = 1000;

/// One successful provider call, written as a JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEvent {
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTotals {
    pub events: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Default)]
struct LedgerState {
    totals: CostTotals,
    recent: VecDeque<CostEvent>,
}

/// Append-only cost log with in-memory totals.
pub struct CostLedger {
    log_dir: Option<PathBuf>,
    state: Mutex<LedgerState>,
    // Held across the blocking append so lines land in record order
    write_lock: tokio::sync::Mutex<()>,
    budget: BudgetMonitor,
}

impl CostLedger {
    pub fn new(log_dir: Option<PathBuf>, budget: BudgetMonitor) -> Self {
        Self {
            log_dir,
            state: Mutex::new(LedgerState::default()),
            write_lock: tokio::sync::Mutex::new(()),
            budget,
        }
    }

    /// Record `event`. Totals and budget are updated first; a failed file
    /// write is logged and otherwise ignored.
    pub async fn record(&self, event: CostEvent) -> Vec<BudgetAlert> {
        let alerts = self.budget.record(event.ts, event.cost_usd);

        {
            let mut state = self.state.lock();
            state.totals.events += 1;
            state.totals.tokens_in += event.tokens_in;
            state.totals.tokens_out += event.tokens_out;
            state.totals.cost_usd += event.cost_usd;
            if state.recent.len() == RECENT_EVENTS {
                state.recent.pop_front();
            }
            state.recent.push_back(event.clone());
        }

        if let Some(dir) = &self.log_dir {
            if let Err(e) = self.append(dir, &event).await {
                tracing::warn!(error = %e, dir = %dir.display(), "Failed to write cost event");
            }
        }

        alerts
    }

    async fn append(&self, dir: &Path, event: &CostEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let dir = dir.to_path_buf();
        let path = log_path(&dir, event.ts);

        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || -> Result<()> {
            fs::create_dir_all(&dir)?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(line.as_bytes())?;
            Ok(())
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("Cost log writer task failed: {}", e)))?
    }

    pub fn totals(&self) -> CostTotals {
        self.state.lock().totals
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<CostEvent> {
        let state = self.state.lock();
        let skip = state.recent.len().saturating_sub(limit);
        state.recent.iter().skip(skip).cloned().collect()
    }

    pub fn budget_status(&self) -> BudgetStatus {
        self.budget.status()
    }
}

/// `<dir>/costs-YYYYMMDD.jsonl` for the UTC day of `ts`.
pub fn log_path(dir: &Path, ts: DateTime<Utc>) -> PathBuf {
    dir.join(format!("costs-{}.jsonl", ts.format("%Y%m%d")))
}

/// Parse a cost log; malformed lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<CostEvent>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use chrono::TimeZone;

    fn event(cost: f64) -> CostEvent {
        CostEvent {
            ts: Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap(),
            session_id: "s1".to_string(),
            provider: "primary".to_string(),
            model: "gpt-4o".to_string(),
            latency_ms: 420,
            tokens_in: 100,
            tokens_out: 50,
            cost_usd: cost,
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("llm-dispatch-costs-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let json = serde_json::to_value(event(0.001)).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["latencyMs"], 420);
        assert_eq!(json["tokensIn"], 100);
        assert_eq!(json["costUsd"], 0.001);
    }

    #[tokio::test]
    async fn test_appends_daily_jsonl() {
        let dir = temp_dir();
        let ledger = CostLedger::new(Some(dir.clone()), BudgetMonitor::new(BudgetConfig::default()));

        ledger.record(event(0.001)).await;
        ledger.record(event(0.002)).await;

        let path = dir.join("costs-20260504.jsonl");
        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].cost_usd, 0.002);

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_totals_and_recent() {
        let ledger = CostLedger::new(None, BudgetMonitor::new(BudgetConfig::default()));
        for _ in 0..3 {
            ledger.record(event(0.5)).await;
        }

        let totals = ledger.totals();
        assert_eq!(totals.events, 3);
        assert_eq!(totals.tokens_in, 300);
        assert!((totals.cost_usd - 1.5).abs() < 1e-9);
        assert_eq!(ledger.recent(2).len(), 2);
    }

    #[tokio::test]
    async fn test_unwritable_dir_does_not_fail() {
        let file = std::env::temp_dir().join(format!("llm-dispatch-file-{}", uuid::Uuid::new_v4()));
        fs::write(&file, "not a directory").unwrap();

        let ledger = CostLedger::new(Some(file.clone()), BudgetMonitor::new(BudgetConfig::default()));
        ledger.record(event(0.1)).await;
        assert_eq!(ledger.totals().events, 1);

        fs::remove_file(&file).ok();
    }

    #[tokio::test]
    async fn test_budget_alerts_surface() {
        let budget = BudgetMonitor::new(BudgetConfig {
            daily_usd: Some(1.0),
            ..BudgetConfig::default()
        });
        let ledger = CostLedger::new(None, budget);
        let alerts = ledger.record(event(0.7)).await;
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_write_whole_lines() {
        let dir = temp_dir();
        let ledger = std::sync::Arc::new(CostLedger::new(
            Some(dir.clone()),
            BudgetMonitor::new(BudgetConfig::default()),
        ));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.record(event(i as f64 * 0.001)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let events = read_events(&dir.join("costs-20260504.jsonl")).unwrap();
        assert_eq!(events.len(), 20);
        assert_eq!(ledger.totals().events, 20);

        fs::remove_dir_all(&dir).ok();
    }
}
