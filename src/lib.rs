use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use octocrab::models::{JobId, RunId};

pub mod aggregate;
pub mod anomaly;
pub mod budget;
pub mod client;
pub mod config;
pub mod cost;
pub mod recommend;
pub mod report;

pub use aggregate::{aggregate, CostTree};
pub use anomaly::{AnomalyConfig, AnomalyEvent, CostHistory};
pub use budget::{BudgetPolicy, BudgetVerdict};
pub use client::{fetch_runs, CancelToken, FetchResult, SkippedRun};
pub use config::EngineConfig;
pub use cost::{price_run, Money, RateTable};
pub use recommend::{Recommendation, RecommendationThresholds};
pub use report::{analyze, assemble, CostReport};

/// Errors that abort an analysis outright. Everything else (retries
/// exhausted for a single run, unknown runner classes, missing step detail)
/// degrades the report instead of failing it, see [`RecordCoverage`] and
/// [`report::Coverage`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("authentication rejected by the API: {0}")]
    Auth(String),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    /// Parses `owner/name`. Both segments are restricted to
    /// `[A-Za-z0-9._-]` so a repository identifier can never smuggle path
    /// segments or shell metacharacters into API routes.
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let mut parts = input.split('/');
        let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(EngineError::InvalidConfig(format!(
                "repository must be written as owner/name, got {input:?}"
            )));
        };
        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        };
        if !valid(owner) || !valid(name) {
            return Err(EngineError::InvalidConfig(format!(
                "repository identifier contains forbidden characters: {input:?}"
            )));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl FromStr for RepoId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for RepoId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunOutcome {
    Success,
    Failure,
    Cancelled,
}

/// Completeness tag carried on every fetched record. Degraded fetches are
/// data, not faults: a `Partial` record still flows through pricing and
/// aggregation (contributing whatever detail it has) and is surfaced in the
/// report's coverage section.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum RecordCoverage {
    Complete,
    Partial(String),
}

/// One completed run of a workflow, fully populated with its jobs (and step
/// detail where the platform reported it). Immutable once fetched.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionRecord {
    pub id: RunId,
    pub workflow: String,
    /// The platform event that triggered the run (`push`, `schedule`, ...).
    pub trigger: Option<String>,
    pub created_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: RunOutcome,
    pub coverage: RecordCoverage,
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub run_id: RunId,
    pub name: String,
    /// Billing platform string, e.g. `UBUNTU` or `WINDOWS_8_CORE`.
    pub runner_class: String,
    pub duration: Duration,
    /// Duration the platform bills for, taken from the timing endpoint when
    /// available, otherwise the wall-clock duration.
    pub billable_duration: Duration,
    pub outcome: RunOutcome,
    /// Steps are optional detail; a job without steps is valid.
    pub steps: Vec<StepRecord>,
}

/// Steps are not billed independently by the platform; their cost is a
/// derived share of the owning job's cost, see [`cost::price_job`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepRecord {
    pub name: String,
    pub duration: Duration,
    pub outcome: RunOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_repo() {
        let repo = RepoId::parse("octocat/hello-world").unwrap();
        assert_eq!(repo.owner, "octocat");
        assert_eq!(repo.name, "hello-world");
        assert_eq!(repo.to_string(), "octocat/hello-world");
    }

    #[test]
    fn parses_repo_with_dots() {
        assert!(RepoId::parse("org.name/repo.name").is_ok());
    }

    #[test]
    fn rejects_missing_slash() {
        assert!(matches!(
            RepoId::parse("noslash"),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_injection() {
        assert!(RepoId::parse("owner/repo; rm -rf /").is_err());
        assert!(RepoId::parse("owner/repo evil").is_err());
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(RepoId::parse("../../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(RepoId::parse("/repo").is_err());
        assert!(RepoId::parse("owner/").is_err());
    }
}
