//! Cost governance: adaptive tier selection, pricing, the cost log and budgets.

pub mod budget;
pub mod governor;
pub mod ledger;
pub mod pricing;

pub use budget::{AlertCallback, BudgetAlert, BudgetLevel, BudgetMonitor, BudgetPeriod, BudgetStatus};
pub use governor::{CostGovernor, DispatchStats, ModelTier, TierSwitch};
pub use ledger::{CostEvent, CostLedger, CostTotals};
pub use pricing::PriceTable;
