//! Session cost, round and wall-clock budget.

use chrono::{DateTime, Utc};

use crate::config::BudgetConfig;
use crate::state::SessionState;

/// Session ceilings; `None` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBudget {
    max_cost_tokens: Option<u64>,
    max_total_rounds: Option<u32>,
    max_wall_clock_ms: Option<u64>,
}

impl SessionBudget {
    pub fn from_config(config: &BudgetConfig) -> Self {
        Self {
            max_cost_tokens: (config.max_cost_tokens > 0).then_some(config.max_cost_tokens),
            max_total_rounds: (config.max_total_rounds > 0).then_some(config.max_total_rounds),
            max_wall_clock_ms: (config.max_wall_clock_secs > 0)
                .then(|| config.max_wall_clock_secs.saturating_mul(1000)),
        }
    }

    /// Name of the exhausted limit, if any.
    ///
    /// Wall-clock time counts from the start of deliberation.
    pub fn exhausted(&self, state: &SessionState, now: DateTime<Utc>) -> Option<String> {
        if let Some(max) = self.max_cost_tokens {
            if state.cumulative_cost >= max {
                return Some(format!("cost {} >= {} tokens", state.cumulative_cost, max));
            }
        }
        if let Some(max) = self.max_total_rounds {
            if state.cumulative_rounds >= max {
                return Some(format!("rounds {} >= {}", state.cumulative_rounds, max));
            }
        }
        if let Some(max) = self.max_wall_clock_ms {
            let elapsed = state.deliberation_elapsed_ms(now);
            if elapsed >= max {
                return Some(format!("wall clock {}ms >= {}ms", elapsed, max));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Criticality, Problem, SessionStatus};

    fn deliberating() -> SessionState {
        let mut s = SessionState::new(Problem::new("p", "", vec![]), Criticality::Standard);
        s.transition(SessionStatus::Decomposing, "start").unwrap();
        s.transition(SessionStatus::Deliberating, "go").unwrap();
        s
    }

    #[test]
    fn test_cost_limit() {
        let budget = SessionBudget::from_config(&BudgetConfig {
            max_cost_tokens: 100,
            max_wall_clock_secs: 0,
            max_total_rounds: 0,
        });
        let mut s = deliberating();
        assert!(budget.exhausted(&s, Utc::now()).is_none());
        s.cumulative_cost = 100;
        assert!(budget.exhausted(&s, Utc::now()).unwrap().starts_with("cost"));
    }

    #[test]
    fn test_round_limit_spans_sub_problems() {
        let budget = SessionBudget::from_config(&BudgetConfig {
            max_cost_tokens: 0,
            max_wall_clock_secs: 0,
            max_total_rounds: 5,
        });
        let mut s = deliberating();
        s.cumulative_rounds = 4;
        assert!(budget.exhausted(&s, Utc::now()).is_none());
        s.cumulative_rounds = 5;
        assert_eq!(
            budget.exhausted(&s, Utc::now()).as_deref(),
            Some("rounds 5 >= 5")
        );
    }

    #[test]
    fn test_wall_clock_counts_from_deliberation() {
        let budget = SessionBudget::from_config(&BudgetConfig {
            max_cost_tokens: 0,
            max_wall_clock_secs: 60,
            max_total_rounds: 0,
        });
        let s = deliberating();
        let start = s.deliberation_started_at.unwrap();
        assert!(budget
            .exhausted(&s, start + chrono::Duration::seconds(59))
            .is_none());
        assert!(budget
            .exhausted(&s, start + chrono::Duration::seconds(61))
            .unwrap()
            .starts_with("wall clock"));
    }

    #[test]
    fn test_zero_means_unlimited() {
        let budget = SessionBudget::from_config(&BudgetConfig {
            max_cost_tokens: 0,
            max_wall_clock_secs: 0,
            max_total_rounds: 0,
        });
        let mut s = deliberating();
        s.cumulative_cost = u64::MAX;
        s.cumulative_rounds = u32::MAX;
        assert!(budget.exhausted(&s, Utc::now()).is_none());
    }
}
