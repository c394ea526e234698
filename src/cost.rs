use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::time::Duration;

use octocrab::models::RunId;

use crate::{ExecutionRecord, JobRecord, RunOutcome, StepRecord};

/// A dollar amount in whole thousandths of a dollar.
///
/// All cost arithmetic in the engine is integer arithmetic on this type, so
/// aggregation is exact: a parent node's cost is always the exact sum of its
/// children's, regardless of summation order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
)]
#[serde(transparent)]
pub struct Money(pub u64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_dollars(dollars: f64) -> Self {
        Self((dollars.max(0.0) * 1000.0).round() as u64)
    }

    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|v| v.0).sum::<u64>())
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.3}", self.0 as f64 / 1000.0)
    }
}

/// Per-minute billing rate for one runner class. The base rate is the Linux
/// rate for the hardware tier; heavier operating systems bill at a fixed
/// multiple of it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunnerRate {
    pub per_minute: Money,
    pub multiplier: u64,
}

impl RunnerRate {
    pub fn effective_per_minute(&self) -> Money {
        Money(self.per_minute.0 * self.multiplier)
    }
}

/// Static mapping from runner class to billing rate. Swappable data, not
/// code: pricing changes are config updates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RateTable {
    rates: BTreeMap<String, RunnerRate>,
}

impl RateTable {
    pub fn new(rates: BTreeMap<String, RunnerRate>) -> Self {
        Self { rates }
    }

    pub fn rate(&self, runner_class: &str) -> Option<&RunnerRate> {
        self.rates.get(runner_class)
    }

    /// Cheapest known class by effective per-minute rate; the fallback for
    /// unrecognized runner classes.
    pub fn cheapest(&self) -> Option<(&str, &RunnerRate)> {
        self.rates
            .iter()
            .min_by(|a, b| {
                a.1.effective_per_minute()
                    .cmp(&b.1.effective_per_minute())
                    .then_with(|| a.0.cmp(b.0))
            })
            .map(|(name, rate)| (name.as_str(), rate))
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.rates.keys().map(String::as_str)
    }
}

impl Default for RateTable {
    /// Hosted-runner rates in thousandths of a dollar per minute, taken from:
    /// https://docs.github.com/en/billing/managing-billing-for-github-actions/about-billing-for-github-actions
    fn default() -> Self {
        let table = [
            ("UBUNTU", 8, 1),
            ("UBUNTU_2_CORE", 8, 1),
            ("UBUNTU_4_CORE", 16, 1),
            ("UBUNTU_8_CORE", 32, 1),
            ("UBUNTU_16_CORE", 64, 1),
            ("WINDOWS", 8, 2),
            ("WINDOWS_8_CORE", 32, 2),
            ("MACOS", 8, 10),
            ("MACOS_XLARGE", 16, 10),
        ];
        Self {
            rates: table
                .into_iter()
                .map(|(name, per_minute, multiplier)| {
                    (
                        name.to_string(),
                        RunnerRate {
                            per_minute: Money(per_minute),
                            multiplier,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Whether a price came straight from the rate table or from the
/// unknown-class fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Confidence {
    Exact,
    /// Unrecognized runner class, priced at the cheapest known rate.
    Low,
}

/// A job with its monetary estimate attached, tagged with everything the
/// aggregator needs to key it into the cost tree.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PricedJob {
    pub run_id: RunId,
    pub workflow: String,
    pub trigger: Option<String>,
    pub job: String,
    pub runner_class: String,
    pub multiplier: u64,
    pub billable_minutes: u64,
    pub cost: Money,
    pub confidence: Confidence,
    pub steps: Vec<PricedStep>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PricedStep {
    pub name: String,
    pub duration: Duration,
    pub cost: Money,
}

/// Rounds a billable duration up to whole minutes, the platform's billing
/// granularity. Never rounds down.
pub fn billable_minutes(duration: Duration) -> u64 {
    (duration.as_millis() as f64 / 60_000.0).ceil() as u64
}

/// Prices every job of a run.
pub fn price_run(record: &ExecutionRecord, rates: &RateTable) -> Vec<PricedJob> {
    record
        .jobs
        .iter()
        .map(|job| price_job(record, job, rates))
        .collect()
}

/// Prices a single job. Cancelled and zero-duration jobs bill at zero; an
/// unrecognized runner class falls back to the cheapest known rate and is
/// flagged [`Confidence::Low`] rather than failing the analysis.
pub fn price_job(record: &ExecutionRecord, job: &JobRecord, rates: &RateTable) -> PricedJob {
    let minutes = match job.outcome {
        RunOutcome::Cancelled => 0,
        _ => billable_minutes(job.billable_duration),
    };

    let (cost, multiplier, confidence) = if minutes == 0 {
        (Money::ZERO, 1, Confidence::Exact)
    } else if let Some(rate) = rates.rate(&job.runner_class) {
        (
            Money(rate.per_minute.0 * minutes * rate.multiplier),
            rate.multiplier,
            Confidence::Exact,
        )
    } else if let Some((class, rate)) = rates.cheapest() {
        log::warn!(
            "unknown runner class {} on job {}, pricing at cheapest known class {class}",
            job.runner_class,
            job.name
        );
        (
            Money(rate.per_minute.0 * minutes * rate.multiplier),
            rate.multiplier,
            Confidence::Low,
        )
    } else {
        (Money::ZERO, 1, Confidence::Low)
    };

    PricedJob {
        run_id: job.run_id,
        workflow: record.workflow.clone(),
        trigger: record.trigger.clone(),
        job: job.name.clone(),
        runner_class: job.runner_class.clone(),
        multiplier,
        billable_minutes: minutes,
        cost,
        confidence,
        steps: distribute_step_costs(&job.steps, cost),
    }
}

/// Distributes a job's cost across its steps proportionally to step
/// duration. The platform only bills at job granularity, so step costs are
/// derived shares; the integer-division remainder is absorbed by the last
/// step so the shares always sum exactly to the job's cost.
fn distribute_step_costs(steps: &[StepRecord], job_cost: Money) -> Vec<PricedStep> {
    let total_ms: u128 = steps.iter().map(|s| s.duration.as_millis()).sum();
    if total_ms == 0 {
        return steps
            .iter()
            .map(|s| PricedStep {
                name: s.name.clone(),
                duration: s.duration,
                cost: Money::ZERO,
            })
            .collect();
    }

    let mut allotted = 0u64;
    let last = steps.len() - 1;
    steps
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let cost = if i == last {
                Money(job_cost.0 - allotted)
            } else {
                let share = (job_cost.0 as u128 * s.duration.as_millis() / total_ms) as u64;
                allotted += share;
                Money(share)
            };
            PricedStep {
                name: s.name.clone(),
                duration: s.duration,
                cost,
            }
        })
        .collect()
}
