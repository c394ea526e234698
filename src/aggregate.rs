use std::collections::{BTreeMap, BTreeSet};

use octocrab::models::RunId;

use crate::cost::{Confidence, Money, PricedJob};

/// The workflow → job → step rollup over one analysis window, plus the grand
/// total. Rebuilt from scratch every invocation; never incrementally
/// maintained.
///
/// All accumulation is integer addition into ordered maps, so the tree is
/// identical for any permutation of the same input and every parent's cost
/// is the exact sum of its children's.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CostTree {
    /// Distinct runs that contributed to the tree.
    pub total_runs: usize,
    pub total_minutes: u64,
    pub grand_total: Money,
    pub workflows: BTreeMap<String, WorkflowNode>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct WorkflowNode {
    pub run_count: usize,
    pub minutes: u64,
    pub cost: Money,
    /// Run counts per trigger event, for runs that carried a trigger tag.
    pub triggers: BTreeMap<String, usize>,
    pub jobs: BTreeMap<String, JobNode>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct JobNode {
    pub run_count: usize,
    pub minutes: u64,
    pub cost: Money,
    /// Occurrences per runner class seen for this job name.
    pub runner_classes: BTreeMap<String, usize>,
    /// Highest OS multiplier seen across those classes.
    pub max_multiplier: u64,
    /// Executions priced via the unknown-class fallback.
    pub low_confidence: usize,
    /// Executions that carried step detail. Step aggregation is best-effort:
    /// when this is below `run_count`, step costs sum to less than `cost`.
    pub runs_with_steps: usize,
    pub steps: BTreeMap<String, StepNode>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct StepNode {
    pub count: usize,
    pub total_secs: u64,
    pub cost: Money,
}

/// Folds priced jobs into the three-level cost tree. Nodes with identical
/// keys merge; run counts are de-duplicated by run identifier.
pub fn aggregate(jobs: &[PricedJob]) -> CostTree {
    let mut tree = CostTree::default();
    let mut all_runs: BTreeSet<RunId> = BTreeSet::new();
    // (workflow, run) -> trigger, so multi-job runs count once
    let mut workflow_runs: BTreeMap<String, BTreeMap<RunId, Option<String>>> = BTreeMap::new();
    let mut job_runs: BTreeMap<(String, String), BTreeSet<RunId>> = BTreeMap::new();

    for job in jobs {
        all_runs.insert(job.run_id);
        workflow_runs
            .entry(job.workflow.clone())
            .or_default()
            .insert(job.run_id, job.trigger.clone());
        job_runs
            .entry((job.workflow.clone(), job.job.clone()))
            .or_default()
            .insert(job.run_id);

        let workflow = tree.workflows.entry(job.workflow.clone()).or_default();
        workflow.minutes += job.billable_minutes;
        workflow.cost += job.cost;

        let node = workflow.jobs.entry(job.job.clone()).or_default();
        node.minutes += job.billable_minutes;
        node.cost += job.cost;
        *node
            .runner_classes
            .entry(job.runner_class.clone())
            .or_default() += 1;
        node.max_multiplier = node.max_multiplier.max(job.multiplier);
        if job.confidence == Confidence::Low {
            node.low_confidence += 1;
        }
        if !job.steps.is_empty() {
            node.runs_with_steps += 1;
        }
        for step in &job.steps {
            let leaf = node.steps.entry(step.name.clone()).or_default();
            leaf.count += 1;
            leaf.total_secs += step.duration.as_secs();
            leaf.cost += step.cost;
        }

        tree.total_minutes += job.billable_minutes;
        tree.grand_total += job.cost;
    }

    tree.total_runs = all_runs.len();
    for (name, runs) in workflow_runs {
        if let Some(workflow) = tree.workflows.get_mut(&name) {
            workflow.run_count = runs.len();
            for trigger in runs.into_values().flatten() {
                *workflow.triggers.entry(trigger).or_default() += 1;
            }
        }
    }
    for ((workflow, job), runs) in job_runs {
        if let Some(node) = tree
            .workflows
            .get_mut(&workflow)
            .and_then(|w| w.jobs.get_mut(&job))
        {
            node.run_count = runs.len();
        }
    }

    tree
}
