use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};

/// Fixed-capacity ring buffer over the trailing cost observations. Keeps
/// the baseline memory bounded no matter how long the supplied history is.
#[derive(Debug, Clone)]
pub struct BaselineWindow {
    capacity: usize,
    values: VecDeque<f64>,
}

impl BaselineWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population standard deviation of the window.
    pub fn std_dev(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.values.len() as f64;
        variance.sqrt()
    }
}

/// Detector parameters. `window` bounds the baseline, `min_samples` gates
/// detection on sparse history, `sigma` is the one-sided spike threshold.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AnomalyConfig {
    pub window: usize,
    pub min_samples: usize,
    pub sigma: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window: 30,
            min_samples: 5,
            sigma: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum Severity {
    Moderate,
    High,
    Critical,
}

impl Severity {
    /// Buckets by how many standard deviations the observation sits beyond
    /// the detection threshold.
    fn from_excess_sigmas(excess: f64) -> Self {
        if excess < 1.0 {
            Severity::Moderate
        } else if excess < 3.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AnomalyEvent {
    pub at: DateTime<Utc>,
    pub workflow: String,
    pub observed: f64,
    pub baseline_mean: f64,
    pub baseline_std_dev: f64,
    pub severity: Severity,
}

/// Per-workflow ordered cost history, supplied by the caller. The detector
/// owns no persistence; whatever store the caller keeps history in, it
/// arrives here as plain ordered series.
#[derive(Debug, Clone, Default)]
pub struct CostHistory {
    series: BTreeMap<String, Vec<f64>>,
}

impl CostHistory {
    /// Appends an observation for a workflow; call in time order.
    pub fn record(&mut self, workflow: &str, dollars: f64) {
        self.series.entry(workflow.to_string()).or_default().push(dollars);
    }

    pub fn series(&self, workflow: &str) -> Option<&[f64]> {
        self.series.get(workflow).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// One-sided spike test of `observed` against the trailing window of
/// `history`. Returns `None` below `min_samples` (sparse history must not
/// produce false positives) and for anything that is not a spike; cost
/// drops are deliberately ignored.
pub fn detect(
    config: &AnomalyConfig,
    workflow: &str,
    history: &[f64],
    observed: f64,
    at: DateTime<Utc>,
) -> Option<AnomalyEvent> {
    let mut window = BaselineWindow::new(config.window.max(1));
    for &value in history {
        window.push(value);
    }
    if window.len() < config.min_samples {
        return None;
    }

    let mean = window.mean();
    let std_dev = window.std_dev();
    let severity = if std_dev == 0.0 {
        // flat baseline: any rise is a spike, with no finite sigma distance
        if observed > mean {
            Severity::Critical
        } else {
            return None;
        }
    } else {
        if observed <= mean + config.sigma * std_dev {
            return None;
        }
        Severity::from_excess_sigmas((observed - mean) / std_dev - config.sigma)
    };

    Some(AnomalyEvent {
        at,
        workflow: workflow.to_string(),
        observed,
        baseline_mean: mean,
        baseline_std_dev: std_dev,
        severity,
    })
}
