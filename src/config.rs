use std::time::Duration;

use crate::anomaly::AnomalyConfig;
use crate::budget::BudgetPolicy;
use crate::cost::RateTable;
use crate::recommend::RecommendationThresholds;
use crate::{EngineError, RepoId};

pub const DEFAULT_RUN_LIMIT: usize = 50;
pub const DEFAULT_PAGE_SIZE: u8 = 50;
/// The platform caps page sizes at 100 items.
pub const MAX_PAGE_SIZE: u8 = 100;
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 8;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
/// Remaining-quota level at which the fetcher suspends until reset.
pub const DEFAULT_QUOTA_FLOOR: u64 = 50;

/// Everything the engine consumes but does not own: the repository to
/// analyze, fetch tuning, the rate table, rule thresholds, detector
/// parameters, and an optional budget policy. Validated as a whole before
/// any fetch begins.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub repo: RepoId,
    /// Maximum number of runs to analyze, newest first.
    pub limit: usize,
    pub page_size: u8,
    /// Cap on outstanding per-run detail fetches. Independent of the
    /// platform's own quota; bounds memory and secondary abuse limits.
    pub max_concurrent_fetches: usize,
    /// Attempts per request before the affected run is marked partial.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub quota_floor: u64,
    /// Optional wall-clock bound on the whole fetch stage; on expiry the
    /// partial results gathered so far are reported as partial.
    pub deadline: Option<Duration>,
    pub rates: RateTable,
    pub thresholds: RecommendationThresholds,
    pub anomaly: AnomalyConfig,
    pub budget: Option<BudgetPolicy>,
}

impl EngineConfig {
    pub fn for_repo(repo: RepoId) -> Self {
        Self {
            repo,
            limit: DEFAULT_RUN_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            quota_floor: DEFAULT_QUOTA_FLOOR,
            deadline: None,
            rates: RateTable::default(),
            thresholds: RecommendationThresholds::default(),
            anomaly: AnomalyConfig::default(),
            budget: None,
        }
    }

    /// Rejects invalid values before any work starts (spec'd validation
    /// class of errors: these never reach the fetch stage).
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        if self.limit == 0 {
            return invalid("run limit must be positive".to_string());
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return invalid(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return invalid("fetch concurrency must be positive".to_string());
        }
        if self.max_attempts == 0 {
            return invalid("at least one fetch attempt is required".to_string());
        }
        if self.rates.is_empty() {
            return invalid("rate table must contain at least one runner class".to_string());
        }

        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.workflow_share) || t.workflow_share == 0.0 {
            return invalid(format!(
                "workflow share threshold must be in (0, 1], got {}",
                t.workflow_share
            ));
        }
        if t.long_job_mean_minutes <= 0.0 || t.oversized_runner_minutes <= 0.0 {
            return invalid("job minute thresholds must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&t.redundant_trigger_ratio) {
            return invalid(format!(
                "redundant trigger ratio must be in [0, 1], got {}",
                t.redundant_trigger_ratio
            ));
        }

        let a = &self.anomaly;
        if a.window == 0 {
            return invalid("anomaly window must be positive".to_string());
        }
        if a.min_samples < 3 {
            return invalid("anomaly detection needs at least 3 baseline samples".to_string());
        }
        if a.min_samples > a.window {
            return invalid(format!(
                "anomaly minimum sample count {} exceeds the window size {}",
                a.min_samples, a.window
            ));
        }
        if a.sigma <= 0.0 || !a.sigma.is_finite() {
            return invalid(format!("anomaly sigma must be positive, got {}", a.sigma));
        }

        if let Some(budget) = &self.budget {
            if budget.ceiling == crate::cost::Money::ZERO {
                return invalid("budget ceiling must be positive".to_string());
            }
            if !(budget.warn_fraction > 0.0 && budget.warn_fraction < 1.0) {
                return invalid(format!(
                    "budget warning fraction must be in (0, 1), got {}",
                    budget.warn_fraction
                ));
            }
            if budget.currency.is_empty() {
                return invalid("budget currency must not be empty".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::Money;

    fn config() -> EngineConfig {
        EngineConfig::for_repo(RepoId::parse("acme/app").unwrap())
    }

    #[test]
    fn defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn rejects_zero_limit() {
        let mut cfg = config();
        cfg.limit = 0;
        assert!(matches!(cfg.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_oversized_page() {
        let mut cfg = config();
        cfg.page_size = 150;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_rate_table() {
        let mut cfg = config();
        cfg.rates = RateTable::new(Default::default());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_degenerate_anomaly_window() {
        let mut cfg = config();
        cfg.anomaly.window = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.anomaly.min_samples = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.anomaly.min_samples = 40;
        cfg.anomaly.window = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_budget() {
        let mut cfg = config();
        cfg.budget = Some(BudgetPolicy {
            ceiling: Money::ZERO,
            ..Default::default()
        });
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.budget = Some(BudgetPolicy {
            warn_fraction: 1.5,
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_thresholds() {
        let mut cfg = config();
        cfg.thresholds.workflow_share = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.thresholds.long_job_mean_minutes = -1.0;
        assert!(cfg.validate().is_err());
    }
}
