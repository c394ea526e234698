use std::fmt::{Display, Formatter};

use crate::aggregate::{CostTree, JobNode};
use crate::cost::{Money, RateTable};

/// Trigger events that do not correspond to a code change. Runs started by
/// these feed the `redundant_runs` rule.
pub const NON_CODE_TRIGGERS: &[&str] = &["schedule", "workflow_dispatch"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ExpensiveWorkflow,
    LongJob,
    OversizedRunner,
    RedundantRuns,
}

impl RecommendationKind {
    /// Heuristic savings range in percent of the target node's cost. These
    /// are documented constants, not regressions over the data; the report
    /// presents them as rough estimates.
    pub const fn savings_range(self) -> (u8, u8) {
        match self {
            RecommendationKind::ExpensiveWorkflow => (10, 30),
            RecommendationKind::LongJob => (20, 40),
            RecommendationKind::OversizedRunner => (40, 80),
            RecommendationKind::RedundantRuns => (30, 60),
        }
    }

    const fn savings_midpoint(self) -> u8 {
        let (low, high) = self.savings_range();
        (low + high) / 2
    }
}

/// Points at a node in the cost tree.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NodeRef {
    pub workflow: String,
    pub job: Option<String>,
}

impl Display for NodeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.job {
            Some(job) => write!(f, "{}/{}", self.workflow, job),
            None => write!(f, "{}", self.workflow),
        }
    }
}

/// One heuristic advisory. Stateless: regenerated on every analysis run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub target: NodeRef,
    pub rationale: String,
    pub savings_pct_low: u8,
    pub savings_pct_high: u8,
    /// Target node cost scaled by the savings midpoint. Ranking key only;
    /// as heuristic as the range it came from.
    pub estimated_impact: Money,
}

/// Tunable rule thresholds. Data, not code: platform or team conventions
/// change these without touching the rules.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecommendationThresholds {
    /// A workflow exceeding this share of the grand total is expensive.
    pub workflow_share: f64,
    /// Mean billable minutes per run above which a job is long.
    pub long_job_mean_minutes: f64,
    /// Jobs and workflows below this run count are never flagged, so
    /// one-off runs do not trigger advisories.
    pub min_sample_runs: usize,
    /// A multiplier-class job averaging fewer billable minutes than this
    /// would likely fit on a base runner.
    pub oversized_runner_minutes: f64,
    /// Share of tagged runs from non-code triggers above which a workflow's
    /// runs are considered redundant.
    pub redundant_trigger_ratio: f64,
}

impl Default for RecommendationThresholds {
    fn default() -> Self {
        Self {
            workflow_share: 0.15,
            long_job_mean_minutes: 8.0,
            min_sample_runs: 3,
            oversized_runner_minutes: 10.0,
            redundant_trigger_ratio: 0.5,
        }
    }
}

/// Evaluates every rule against every node of the tree and returns the
/// advisories ordered by estimated dollar impact (descending), then savings
/// midpoint (descending), then target name (ascending). The ordering is a
/// total order over the inputs, so identical trees produce identical lists.
pub fn recommend(
    tree: &CostTree,
    rates: &RateTable,
    thresholds: &RecommendationThresholds,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    for (workflow_name, workflow) in &tree.workflows {
        if tree.grand_total > Money::ZERO {
            let share = workflow.cost.0 as f64 / tree.grand_total.0 as f64;
            if share > thresholds.workflow_share {
                out.push(advise(
                    RecommendationKind::ExpensiveWorkflow,
                    NodeRef {
                        workflow: workflow_name.clone(),
                        job: None,
                    },
                    workflow.cost,
                    format!(
                        "accounts for {:.0}% of total spend ({} of {}); consider caching, \
                         narrowing triggers, or splitting rarely-needed jobs out",
                        share * 100.0,
                        workflow.cost,
                        tree.grand_total
                    ),
                ));
            }
        }

        redundant_runs(workflow_name, workflow, thresholds, &mut out);

        for (job_name, job) in &workflow.jobs {
            if job.run_count < thresholds.min_sample_runs {
                continue;
            }
            let mean_minutes = job.minutes as f64 / job.run_count as f64;

            if mean_minutes > thresholds.long_job_mean_minutes {
                out.push(advise(
                    RecommendationKind::LongJob,
                    NodeRef {
                        workflow: workflow_name.clone(),
                        job: Some(job_name.clone()),
                    },
                    job.cost,
                    format!(
                        "averages {mean_minutes:.1} billable minutes over {} runs; \
                         consider caching dependencies or splitting the job",
                        job.run_count
                    ),
                ));
            }

            oversized_runner(
                workflow_name,
                job_name,
                job,
                mean_minutes,
                rates,
                thresholds,
                &mut out,
            );
        }
    }

    out.sort_by(|a, b| {
        b.estimated_impact
            .cmp(&a.estimated_impact)
            .then_with(|| b.kind.savings_midpoint().cmp(&a.kind.savings_midpoint()))
            .then_with(|| a.target.to_string().cmp(&b.target.to_string()))
    });
    out
}

fn redundant_runs(
    workflow_name: &str,
    workflow: &crate::aggregate::WorkflowNode,
    thresholds: &RecommendationThresholds,
    out: &mut Vec<Recommendation>,
) {
    // Requires trigger tags on the runs; without them the rule stays silent.
    let tagged: usize = workflow.triggers.values().sum();
    if tagged == 0 || workflow.run_count < thresholds.min_sample_runs {
        return;
    }
    let non_code: usize = workflow
        .triggers
        .iter()
        .filter(|(trigger, _)| NON_CODE_TRIGGERS.contains(&trigger.as_str()))
        .map(|(_, count)| count)
        .sum();
    let ratio = non_code as f64 / tagged as f64;
    if ratio > thresholds.redundant_trigger_ratio {
        out.push(advise(
            RecommendationKind::RedundantRuns,
            NodeRef {
                workflow: workflow_name.to_string(),
                job: None,
            },
            workflow.cost,
            format!(
                "{:.0}% of its runs come from non-code triggers; consider a lower schedule \
                 frequency or path filters",
                ratio * 100.0
            ),
        ));
    }
}

fn oversized_runner(
    workflow_name: &str,
    job_name: &str,
    job: &JobNode,
    mean_minutes: f64,
    rates: &RateTable,
    thresholds: &RecommendationThresholds,
    out: &mut Vec<Recommendation>,
) {
    if job.max_multiplier <= 1 || mean_minutes >= thresholds.oversized_runner_minutes {
        return;
    }
    // Name the class that carries the multiplier in the rationale.
    let class = job
        .runner_classes
        .keys()
        .find(|class| {
            rates
                .rate(class)
                .map(|rate| rate.multiplier == job.max_multiplier)
                .unwrap_or(false)
        })
        .cloned()
        .unwrap_or_else(|| "a multiplier class".to_string());
    out.push(advise(
        RecommendationKind::OversizedRunner,
        NodeRef {
            workflow: workflow_name.to_string(),
            job: Some(job_name.to_string()),
        },
        job.cost,
        format!(
            "runs on {class} ({}x base rate) but averages only {mean_minutes:.1} billable \
             minutes; a base Linux runner would likely suffice",
            job.max_multiplier
        ),
    ));
}

fn advise(kind: RecommendationKind, target: NodeRef, cost: Money, rationale: String) -> Recommendation {
    let (low, high) = kind.savings_range();
    Recommendation {
        kind,
        target,
        rationale,
        savings_pct_low: low,
        savings_pct_high: high,
        estimated_impact: Money(cost.0 * kind.savings_midpoint() as u64 / 100),
    }
}
