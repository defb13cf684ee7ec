use chrono::{DateTime, Utc};
use kaizen_actions::ReasonCode;

use crate::cycle::ImprovementCycle;

/// Cost/duration ceiling check performed at every phase entry.
///
/// The check is idempotent and runs before any phase side effect, so a
/// budget breach can never let a partial, unrecorded action through. The
/// worst case overshoot is the single action already in flight when the
/// breach is detected.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetGuard;

impl BudgetGuard {
    /// Returns the abort reason when a ceiling is breached, `None` otherwise.
    #[must_use]
    pub fn check(cycle: &ImprovementCycle, now: DateTime<Utc>) -> Option<ReasonCode> {
        if cycle.cumulative_cost >= cycle.budget.max_cost {
            return Some(ReasonCode::BudgetExceeded);
        }
        if cycle.elapsed(now) >= cycle.budget.max_duration {
            return Some(ReasonCode::BudgetExceeded);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleBudget;
    use std::time::Duration;

    #[test]
    fn within_budget_passes() {
        let cycle = ImprovementCycle::new("tenant", CycleBudget::default());
        assert!(BudgetGuard::check(&cycle, Utc::now()).is_none());
    }

    #[test]
    fn cost_ceiling_aborts() {
        let mut cycle = ImprovementCycle::new(
            "tenant",
            CycleBudget {
                max_cost: 100.0,
                max_duration: Duration::from_secs(3600),
            },
        );
        cycle.cumulative_cost = 150.0;
        assert_eq!(
            BudgetGuard::check(&cycle, Utc::now()),
            Some(ReasonCode::BudgetExceeded)
        );
        // Idempotent: the same check yields the same verdict.
        assert_eq!(
            BudgetGuard::check(&cycle, Utc::now()),
            Some(ReasonCode::BudgetExceeded)
        );
    }

    #[test]
    fn duration_ceiling_aborts() {
        let cycle = ImprovementCycle::new(
            "tenant",
            CycleBudget {
                max_cost: 100.0,
                max_duration: Duration::from_secs(60),
            },
        );
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(
            BudgetGuard::check(&cycle, later),
            Some(ReasonCode::BudgetExceeded)
        );
    }
}
