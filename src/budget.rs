use crate::cost::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

/// Spending ceiling for one billing period. The enforcer only classifies;
/// acting on the verdict (blocking runs, alerting) is the caller's job.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetPolicy {
    pub period: BudgetPeriod,
    pub ceiling: Money,
    pub currency: String,
    /// Fraction of the ceiling at which the verdict turns `Approaching`.
    pub warn_fraction: f64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            period: BudgetPeriod::Monthly,
            ceiling: Money::from_dollars(50.0),
            currency: "USD".to_string(),
            warn_fraction: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BudgetVerdict {
    WithinBudget {
        headroom: Money,
    },
    Approaching {
        headroom: Money,
        spent_fraction: f64,
    },
    Exceeded {
        overage: Money,
    },
}

/// Pure classification of the current period's total against the policy.
/// `Exceeded` at or above the ceiling, `Approaching` at or above the warning
/// fraction, `WithinBudget` otherwise.
pub fn evaluate(policy: &BudgetPolicy, total: Money) -> BudgetVerdict {
    if total >= policy.ceiling {
        return BudgetVerdict::Exceeded {
            overage: total.saturating_sub(policy.ceiling),
        };
    }
    let spent_fraction = if policy.ceiling == Money::ZERO {
        1.0
    } else {
        total.0 as f64 / policy.ceiling.0 as f64
    };
    if spent_fraction >= policy.warn_fraction {
        BudgetVerdict::Approaching {
            headroom: policy.ceiling.saturating_sub(total),
            spent_fraction,
        }
    } else {
        BudgetVerdict::WithinBudget {
            headroom: policy.ceiling.saturating_sub(total),
        }
    }
}
