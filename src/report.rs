use chrono::{DateTime, Utc};
use octocrab::Octocrab;

use crate::aggregate::{aggregate, CostTree};
use crate::anomaly::{detect, AnomalyEvent, CostHistory};
use crate::budget::{evaluate, BudgetVerdict};
use crate::client::{fetch_runs, CancelToken, FetchResult, SkippedRun};
use crate::config::EngineConfig;
use crate::cost::{price_run, PricedJob};
use crate::recommend::{recommend, Recommendation};
use crate::{EngineError, RecordCoverage, RepoId};

/// How much of the requested window the report actually covers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Coverage {
    FullyAnalyzed,
    PartiallyAnalyzed { skipped: Vec<SkippedRun> },
}

/// The structured analysis result handed to rendering/delivery
/// collaborators. Every number in it is an estimate derived from the
/// platform's reported billable time and the configured rate table, never
/// an invoiced amount.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CostReport {
    pub repo: String,
    pub analyzed_runs: usize,
    /// Runs that aggregated with incomplete detail (empty jobs or
    /// wall-clock billing).
    pub partial_runs: usize,
    pub coverage: Coverage,
    pub tree: CostTree,
    pub recommendations: Vec<Recommendation>,
    pub anomalies: Vec<AnomalyEvent>,
    pub budget: Option<BudgetVerdict>,
}

/// Pure assembly of a report from already-fetched records: price, roll up,
/// advise, detect, enforce. Deterministic in its arguments, so running it
/// twice over the same fetch yields identical reports.
pub fn assemble(
    repo: &RepoId,
    fetch: &FetchResult,
    config: &EngineConfig,
    history: &CostHistory,
    as_of: DateTime<Utc>,
) -> CostReport {
    let priced: Vec<PricedJob> = fetch
        .records
        .iter()
        .flat_map(|record| price_run(record, &config.rates))
        .collect();
    let tree = aggregate(&priced);

    let recommendations = recommend(&tree, &config.rates, &config.thresholds);

    let anomalies: Vec<AnomalyEvent> = tree
        .workflows
        .iter()
        .filter_map(|(name, node)| {
            let series = history.series(name)?;
            detect(&config.anomaly, name, series, node.cost.as_dollars(), as_of)
        })
        .collect();

    let budget = config
        .budget
        .as_ref()
        .map(|policy| evaluate(policy, tree.grand_total));

    let partial_runs = fetch
        .records
        .iter()
        .filter(|r| matches!(r.coverage, RecordCoverage::Partial(_)))
        .count();
    let coverage = if fetch.complete && fetch.skipped.is_empty() {
        Coverage::FullyAnalyzed
    } else {
        Coverage::PartiallyAnalyzed {
            skipped: fetch.skipped.clone(),
        }
    };

    CostReport {
        repo: repo.to_string(),
        analyzed_runs: fetch.records.len(),
        partial_runs,
        coverage,
        tree,
        recommendations,
        anomalies,
        budget,
    }
}

/// Runs the whole pipeline: validate configuration, fetch the execution
/// records, and assemble the report. `history` supplies the anomaly
/// baseline (pass a default one to skip detection); `cancel` bounds the
/// fetch stage cooperatively.
pub async fn analyze(
    client: &Octocrab,
    config: &EngineConfig,
    history: &CostHistory,
    cancel: &CancelToken,
) -> Result<CostReport, EngineError> {
    config.validate()?;
    let fetch = fetch_runs(client, config, cancel).await?;
    Ok(assemble(&config.repo, &fetch, config, history, Utc::now()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use octocrab::models::{JobId, RunId};

    use super::*;
    use crate::budget::BudgetPolicy;
    use crate::cost::Money;
    use crate::{ExecutionRecord, JobRecord, RunOutcome};

    fn run(id: u64, workflow: &str, jobs: Vec<JobRecord>) -> ExecutionRecord {
        ExecutionRecord {
            id: RunId(id),
            workflow: workflow.to_string(),
            trigger: Some("push".to_string()),
            created_at: Utc::now(),
            duration: Duration::from_secs(600),
            outcome: RunOutcome::Success,
            coverage: RecordCoverage::Complete,
            jobs,
        }
    }

    fn job(id: u64, run_id: u64, name: &str, minutes: u64) -> JobRecord {
        JobRecord {
            id: JobId(id),
            run_id: RunId(run_id),
            name: name.to_string(),
            runner_class: "UBUNTU".to_string(),
            duration: Duration::from_secs(minutes * 60),
            billable_duration: Duration::from_secs(minutes * 60),
            outcome: RunOutcome::Success,
            steps: vec![],
        }
    }

    fn fetch_of(records: Vec<ExecutionRecord>) -> FetchResult {
        FetchResult {
            records,
            skipped: vec![],
            complete: true,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::for_repo(RepoId::parse("acme/app").unwrap())
    }

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-15T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn two_ci_runs_scenario() {
        // two runs of "CI", one 5-minute build each, base Linux rate
        let fetch = fetch_of(vec![
            run(1, "CI", vec![job(11, 1, "build", 5)]),
            run(2, "CI", vec![job(21, 2, "build", 5)]),
        ]);
        let report = assemble(
            &RepoId::parse("acme/app").unwrap(),
            &fetch,
            &config(),
            &CostHistory::default(),
            fixed_time(),
        );

        assert_eq!(report.analyzed_runs, 2);
        assert_eq!(report.tree.grand_total, Money::from_dollars(0.08));
        let ci = &report.tree.workflows["CI"];
        assert_eq!(ci.run_count, 2);
        assert_eq!(ci.minutes, 10);
        assert_eq!(ci.cost, Money::from_dollars(0.08));
        assert_eq!(report.coverage, Coverage::FullyAnalyzed);
        assert!(report.anomalies.is_empty());
        assert!(report.budget.is_none());
    }

    #[test]
    fn report_is_idempotent() {
        let fetch = fetch_of(vec![
            run(1, "CI", vec![job(11, 1, "build", 7), job(12, 1, "test", 3)]),
            run(2, "Deploy", vec![job(21, 2, "ship", 40)]),
        ]);
        let mut cfg = config();
        cfg.budget = Some(BudgetPolicy::default());
        let mut history = CostHistory::default();
        for value in [0.1, 0.12, 0.09, 0.11, 0.1, 0.12] {
            history.record("CI", value);
        }

        let repo = RepoId::parse("acme/app").unwrap();
        let first = assemble(&repo, &fetch, &cfg, &history, fixed_time());
        let second = assemble(&repo, &fetch, &cfg, &history, fixed_time());
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn partial_fetch_is_reported_with_reasons() {
        let mut degraded = run(2, "CI", vec![]);
        degraded.coverage = RecordCoverage::Partial("retries exhausted".to_string());
        let fetch = FetchResult {
            records: vec![run(1, "CI", vec![job(11, 1, "build", 5)]), degraded],
            skipped: vec![SkippedRun {
                run_id: RunId(2),
                workflow: "CI".to_string(),
                reason: "retries exhausted".to_string(),
            }],
            complete: true,
        };
        let report = assemble(
            &RepoId::parse("acme/app").unwrap(),
            &fetch,
            &config(),
            &CostHistory::default(),
            fixed_time(),
        );

        assert_eq!(report.analyzed_runs, 2);
        assert_eq!(report.partial_runs, 1);
        let Coverage::PartiallyAnalyzed { skipped } = &report.coverage else {
            panic!("expected partial coverage");
        };
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].reason.contains("retries exhausted"));
        // the degraded run still counts as a run, at zero cost
        assert_eq!(report.tree.workflows["CI"].run_count, 1);
        assert_eq!(report.tree.grand_total, Money::from_dollars(0.04));
    }

    #[test]
    fn truncated_fetch_is_partial_even_without_skips() {
        let fetch = FetchResult {
            records: vec![run(1, "CI", vec![job(11, 1, "build", 5)])],
            skipped: vec![],
            complete: false,
        };
        let report = assemble(
            &RepoId::parse("acme/app").unwrap(),
            &fetch,
            &config(),
            &CostHistory::default(),
            fixed_time(),
        );
        assert!(matches!(report.coverage, Coverage::PartiallyAnalyzed { .. }));
    }

    #[test]
    fn budget_verdict_reflects_grand_total() {
        let fetch = fetch_of(vec![run(1, "CI", vec![job(11, 1, "build", 5)])]);
        let mut cfg = config();
        cfg.budget = Some(BudgetPolicy {
            ceiling: Money::from_dollars(0.03),
            ..Default::default()
        });
        let report = assemble(
            &RepoId::parse("acme/app").unwrap(),
            &fetch,
            &cfg,
            &CostHistory::default(),
            fixed_time(),
        );
        assert!(matches!(
            report.budget,
            Some(BudgetVerdict::Exceeded { .. })
        ));
    }

    #[test]
    fn anomaly_fires_on_historic_spike() {
        // 12 quiet days of "CI" history, then a 40-minute macOS day
        let mut j = job(11, 1, "build", 40);
        j.runner_class = "MACOS".to_string();
        let fetch = fetch_of(vec![run(1, "CI", vec![j])]);
        let mut history = CostHistory::default();
        for i in 0..12 {
            history.record("CI", 0.08 + 0.01 * (i % 2) as f64);
        }
        let report = assemble(
            &RepoId::parse("acme/app").unwrap(),
            &fetch,
            &config(),
            &history,
            fixed_time(),
        );
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].workflow, "CI");
        assert_eq!(report.anomalies[0].observed, 3.2);
    }

    #[tokio::test]
    async fn analyze_rejects_invalid_config_before_fetching() {
        let mut cfg = config();
        cfg.limit = 0;
        // never reaches the network: validation fails first
        let client = Octocrab::builder().build().unwrap();
        let result = analyze(&client, &cfg, &CostHistory::default(), &CancelToken::new()).await;
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }
}
