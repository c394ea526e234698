use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{TimeZone, Utc};
use octocrab::models::workflows::{Conclusion, Job, Run, Step};
use octocrab::models::{JobId, RunId};
use octocrab::Octocrab;
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};

use crate::config::EngineConfig;
use crate::{EngineError, ExecutionRecord, JobRecord, RecordCoverage, RunOutcome, StepRecord};

/// Cooperative cancellation flag shared between the caller and the fetch
/// stage. Cancelling abandons in-flight requests at the next checkpoint;
/// results already gathered are retained and reported as partial.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A run whose job details could not be fetched. The run itself stays in
/// the result set (with empty jobs, billing zero) so downstream stages see
/// the degradation as data instead of a fault.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SkippedRun {
    pub run_id: RunId,
    pub workflow: String,
    pub reason: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FetchResult {
    /// Newest first, de-duplicated by run identifier.
    pub records: Vec<ExecutionRecord>,
    pub skipped: Vec<SkippedRun>,
    /// False when pagination stopped early (cancellation, deadline, or a
    /// listing failure after retries).
    pub complete: bool,
}

/// Pages through the platform's completed runs for the configured
/// repository, newest first, fetching job and billable-timing detail for
/// each run with bounded concurrency.
///
/// Only authentication failures abort the fetch; transient failures retry
/// with backoff and, once exhausted, degrade the affected run to a partial
/// record.
pub async fn fetch_runs(
    client: &Octocrab,
    config: &EngineConfig,
    cancel: &CancelToken,
) -> Result<FetchResult, EngineError> {
    let deadline = config.deadline.map(|d| Instant::now() + d);
    let quota = QuotaGate::new(config.quota_floor);
    let semaphore = Semaphore::new(config.max_concurrent_fetches);

    let mut seen: BTreeSet<RunId> = BTreeSet::new();
    let mut records: Vec<ExecutionRecord> = Vec::new();
    let mut skipped: Vec<SkippedRun> = Vec::new();
    let mut complete = true;

    let mut page = 0u32;
    while records.len() < config.limit {
        if interrupted(cancel, deadline) {
            log::info!("fetch interrupted after {} runs", records.len());
            complete = false;
            break;
        }
        if let Err(error) = quota.admit(client, deadline).await {
            log::warn!("run listing stopped: {error:#}");
            complete = false;
            break;
        }

        let response = with_retry(config, "list workflow runs", || async move {
            client
                .workflows(config.repo.owner.as_str(), config.repo.name.as_str())
                .list_all_runs()
                .status("completed")
                .per_page(config.page_size)
                .page(page)
                .send()
                .await
        })
        .await;
        let mut response = match response {
            Ok(response) => response,
            Err(FetchFailure::Fatal(error)) => return Err(error),
            Err(FetchFailure::Degraded(error)) => {
                log::warn!("run listing stopped early: {error:#}");
                complete = false;
                break;
            }
        };
        let page_runs = response.take_items();
        if page_runs.is_empty() {
            break;
        }

        // Concurrent new runs shift pagination boundaries; drop anything
        // already fetched.
        let fresh: Vec<Run> = page_runs
            .into_iter()
            .filter(|run| seen.insert(run.id))
            .take(config.limit - records.len())
            .collect();

        let quota = &quota;
        let semaphore = &semaphore;
        let futs = fresh
            .into_iter()
            .map(|run| fetch_run_detail(client, config, quota, semaphore, cancel, deadline, run))
            .collect::<Vec<_>>();
        for result in futures_util::future::join_all(futs).await {
            let (record, skip) = result?;
            if let Some(skip) = skip {
                skipped.push(skip);
            }
            records.push(record);
        }

        page += 1;
    }

    log::info!(
        "fetched {} runs for {} ({} skipped, complete: {complete})",
        records.len(),
        config.repo,
        skipped.len()
    );
    Ok(FetchResult {
        records,
        skipped,
        complete,
    })
}

async fn fetch_run_detail(
    client: &Octocrab,
    config: &EngineConfig,
    quota: &QuotaGate,
    semaphore: &Semaphore,
    cancel: &CancelToken,
    deadline: Option<Instant>,
    run: Run,
) -> Result<(ExecutionRecord, Option<SkippedRun>), EngineError> {
    let _permit = semaphore.acquire().await.expect("fetch semaphore closed");

    let duration = (run.updated_at - run.created_at).to_std().unwrap_or_default();
    let mut record = ExecutionRecord {
        id: run.id,
        workflow: run.name.clone(),
        trigger: Some(run.event.clone()),
        created_at: run.created_at,
        duration,
        outcome: parse_outcome(run.conclusion.as_deref()),
        coverage: RecordCoverage::Complete,
        jobs: vec![],
    };

    let degrade = |record: &mut ExecutionRecord, reason: String| {
        record.coverage = RecordCoverage::Partial(reason.clone());
        SkippedRun {
            run_id: record.id,
            workflow: record.workflow.clone(),
            reason,
        }
    };

    if interrupted(cancel, deadline) {
        let skip = degrade(&mut record, "analysis interrupted before job details".to_string());
        return Ok((record, Some(skip)));
    }
    if let Err(error) = quota.admit(client, deadline).await {
        let skip = degrade(&mut record, format!("{error:#}"));
        return Ok((record, Some(skip)));
    }

    let run_id = run.id;
    let jobs = with_retry(config, "list run jobs", || async move {
        client
            .workflows(config.repo.owner.as_str(), config.repo.name.as_str())
            .list_jobs(run_id)
            .per_page(100)
            .send()
            .await
    })
    .await;
    let jobs = match jobs {
        Ok(mut page) => page.take_items(),
        Err(FetchFailure::Fatal(error)) => return Err(error),
        Err(FetchFailure::Degraded(error)) => {
            let skip = degrade(&mut record, format!("{error:#}"));
            return Ok((record, Some(skip)));
        }
    };

    // Timing detail is best-effort: without it the job still aggregates,
    // priced from wall clock and labels.
    let mut billable = HashMap::new();
    if quota.admit(client, deadline).await.is_ok() {
        let timing: Result<RunTiming, _> =
            with_retry(config, "fetch billable timing", || async move {
                client
                    .get(
                        format!(
                            "/repos/{}/{}/actions/runs/{}/timing",
                            config.repo.owner, config.repo.name, run_id
                        ),
                        None::<&()>,
                    )
                    .await
            })
            .await;
        match timing {
            Ok(timing) => billable = timing.job_index(),
            Err(FetchFailure::Fatal(error)) => return Err(error),
            Err(FetchFailure::Degraded(error)) => {
                log::warn!("billable timing unavailable for run {}: {error:#}", run.id);
                record.coverage = RecordCoverage::Partial(
                    "billable timing unavailable; billed time estimated from wall clock"
                        .to_string(),
                );
            }
        }
    }

    record.jobs = jobs
        .into_iter()
        .map(|job| parse_job(job, &billable))
        .collect();
    Ok((record, None))
}

fn parse_job(job: Job, billable: &HashMap<JobId, (Duration, String)>) -> JobRecord {
    let wall = (job.completed_at.unwrap_or(job.started_at) - job.started_at)
        .to_std()
        .unwrap_or_default();
    let (billable_duration, runner_class) = match billable.get(&job.id) {
        Some((duration, platform)) => (*duration, platform.clone()),
        None => (wall, runner_class_from_labels(&job.labels)),
    };
    JobRecord {
        id: job.id,
        run_id: job.run_id,
        name: job.name,
        runner_class,
        duration: wall,
        billable_duration,
        outcome: parse_outcome(job.conclusion.as_ref().map(conclusion_str)),
        steps: job.steps.iter().filter_map(parse_step).collect(),
    }
}

fn parse_step(step: &Step) -> Option<StepRecord> {
    let started = step.started_at?;
    let completed = step.completed_at?;
    Some(StepRecord {
        name: step.name.clone(),
        duration: (completed - started).to_std().unwrap_or_default(),
        outcome: parse_outcome(step.conclusion.as_ref().map(conclusion_str)),
    })
}

/// Snake-case wire form of a conclusion, matching what the API serves.
fn conclusion_str(conclusion: &Conclusion) -> &str {
    match conclusion {
        Conclusion::ActionRequired => "action_required",
        Conclusion::Cancelled => "cancelled",
        Conclusion::Failure => "failure",
        Conclusion::Neutral => "neutral",
        Conclusion::Skipped => "skipped",
        Conclusion::Success => "success",
        Conclusion::TimedOut => "timed_out",
        _ => "unknown",
    }
}

fn parse_outcome(conclusion: Option<&str>) -> RunOutcome {
    match conclusion {
        Some("success") => RunOutcome::Success,
        Some("cancelled") | Some("skipped") => RunOutcome::Cancelled,
        _ => RunOutcome::Failure,
    }
}

/// Billing platform from runner labels, for jobs the timing endpoint did
/// not cover. Hosted runners default to Linux.
fn runner_class_from_labels(labels: &[String]) -> String {
    for label in labels {
        let label = label.to_ascii_lowercase();
        if label.contains("windows") {
            return "WINDOWS".to_string();
        }
        if label.contains("macos") || label.contains("osx") {
            return "MACOS".to_string();
        }
    }
    "UBUNTU".to_string()
}

fn interrupted(cancel: &CancelToken, deadline: Option<Instant>) -> bool {
    cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d)
}

enum FetchFailure {
    /// Authentication rejection; retrying cannot succeed.
    Fatal(EngineError),
    /// Everything else; the affected item degrades instead of aborting.
    Degraded(anyhow::Error),
}

enum ApiErrorClass {
    Fatal,
    Transient,
    Permanent,
}

fn classify(error: &octocrab::Error) -> ApiErrorClass {
    match error {
        octocrab::Error::GitHub { source, .. } => {
            let rate_limited = source.message.to_ascii_lowercase().contains("rate limit");
            match source.status_code.as_u16() {
                401 => ApiErrorClass::Fatal,
                403 if rate_limited => ApiErrorClass::Transient,
                403 => ApiErrorClass::Fatal,
                404 | 410 => ApiErrorClass::Permanent,
                _ if source.status_code.is_server_error() => ApiErrorClass::Transient,
                _ => ApiErrorClass::Permanent,
            }
        }
        // transport-level failures (connection reset, timeout, ...)
        _ => ApiErrorClass::Transient,
    }
}

async fn with_retry<T, F, Fut>(
    config: &EngineConfig,
    what: &str,
    mut op: F,
) -> Result<T, FetchFailure>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = octocrab::Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => match classify(&error) {
                ApiErrorClass::Fatal => {
                    return Err(FetchFailure::Fatal(EngineError::Auth(format!(
                        "{what}: {error}"
                    ))))
                }
                ApiErrorClass::Permanent => {
                    return Err(FetchFailure::Degraded(anyhow!("{what}: {error:?}")))
                }
                ApiErrorClass::Transient => {
                    if attempt >= config.max_attempts {
                        return Err(FetchFailure::Degraded(anyhow!(
                            "{what}: retries exhausted after {attempt} attempts: {error:?}"
                        )));
                    }
                    let delay = backoff_delay(config.retry_base_delay, attempt);
                    log::debug!("{what} failed (attempt {attempt}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            },
        }
    }
}

/// Exponential backoff with uniform jitter of up to half the base delay.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    exp + Duration::from_millis(jitter_ms)
}

/// Serializes remaining-quota accounting across concurrent fetchers, so
/// several of them cannot overshoot the quota at once. Holds a local
/// decrementing counter seeded from the platform's rate endpoint; when the
/// platform reports the quota at or under the floor, sleeps until the
/// reported reset time while holding the gate, which suspends the whole
/// fetch stage (and nothing else).
struct QuotaGate {
    floor: u64,
    state: Mutex<Option<QuotaSnapshot>>,
}

#[derive(Debug, Clone, Copy)]
struct QuotaSnapshot {
    remaining: u64,
}

/// Requests to allow on a local counter when the quota probe itself fails.
const PROBE_GRACE: u64 = 100;

impl QuotaGate {
    fn new(floor: u64) -> Self {
        Self {
            floor,
            state: Mutex::new(None),
        }
    }

    async fn admit(&self, client: &Octocrab, deadline: Option<Instant>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        loop {
            if let Some(snapshot) = state.as_mut() {
                if snapshot.remaining > self.floor {
                    snapshot.remaining -= 1;
                    return Ok(());
                }
            }

            let limits = match client.ratelimit().get().await {
                Ok(limits) => limits,
                Err(error) => {
                    // A failing probe must not wedge the fetch stage.
                    log::warn!("rate limit probe failed, proceeding on grace budget: {error:?}");
                    *state = Some(QuotaSnapshot {
                        remaining: self.floor + PROBE_GRACE,
                    });
                    continue;
                }
            };
            let core = limits.resources.core;
            let remaining = core.remaining as u64;
            if remaining > self.floor {
                *state = Some(QuotaSnapshot { remaining });
                continue;
            }

            let reset = Utc
                .timestamp_opt(core.reset as i64, 0)
                .single()
                .unwrap_or_else(Utc::now);
            let wait = (reset - Utc::now()).to_std().unwrap_or_default() + Duration::from_secs(1);
            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    anyhow::bail!(
                        "quota resets in {}s, past the analysis deadline",
                        wait.as_secs()
                    );
                }
            }
            log::warn!(
                "API quota nearly exhausted ({remaining} left), suspending fetch for {}s",
                wait.as_secs()
            );
            tokio::time::sleep(wait).await;
            *state = None;
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct BillableJob {
    job_id: JobId,
    duration_ms: u64,
}

#[derive(Debug, serde::Deserialize)]
struct PlatformTiming {
    #[serde(default)]
    job_runs: Vec<BillableJob>,
}

#[derive(Debug, serde::Deserialize)]
struct BillablePlatforms {
    #[serde(flatten)]
    platforms: HashMap<String, PlatformTiming>,
}

/// Response of the platform's per-run billable timing endpoint.
#[derive(Debug, serde::Deserialize)]
struct RunTiming {
    billable: BillablePlatforms,
}

impl RunTiming {
    /// JobId -> (billable duration, billing platform)
    fn job_index(self) -> HashMap<JobId, (Duration, String)> {
        let mut index = HashMap::new();
        for (platform, timing) in self.billable.platforms {
            for job in timing.job_runs {
                index.insert(
                    job.job_id,
                    (Duration::from_millis(job.duration_ms), platform.clone()),
                );
            }
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_runner_labels() {
        let labels = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(runner_class_from_labels(&labels(&[])), "UBUNTU");
        assert_eq!(runner_class_from_labels(&labels(&["ubuntu-latest"])), "UBUNTU");
        assert_eq!(runner_class_from_labels(&labels(&["windows-2022"])), "WINDOWS");
        assert_eq!(runner_class_from_labels(&labels(&["macOS-13"])), "MACOS");
        assert_eq!(
            runner_class_from_labels(&labels(&["self-hosted", "windows"])),
            "WINDOWS"
        );
    }

    #[test]
    fn parses_conclusions() {
        assert_eq!(parse_outcome(Some("success")), RunOutcome::Success);
        assert_eq!(parse_outcome(Some("cancelled")), RunOutcome::Cancelled);
        assert_eq!(parse_outcome(Some("failure")), RunOutcome::Failure);
        assert_eq!(parse_outcome(None), RunOutcome::Failure);
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let base = Duration::from_millis(500);
        for attempt in 1..10 {
            let delay = backoff_delay(base, attempt);
            assert!(delay >= base.saturating_mul(1 << attempt.min(6)));
            assert!(delay <= base.saturating_mul(1 << attempt.min(6)) + base);
        }
    }

    #[test]
    fn parses_timing_payload() {
        let payload = serde_json::json!({
            "billable": {
                "UBUNTU": {
                    "total_ms": 720_000,
                    "job_runs": [
                        { "job_id": 1, "duration_ms": 600_000 },
                        { "job_id": 2, "duration_ms": 120_000 }
                    ]
                },
                "MACOS": {
                    "total_ms": 60_000,
                    "job_runs": [
                        { "job_id": 3, "duration_ms": 60_000 }
                    ]
                }
            }
        });
        let timing: RunTiming = serde_json::from_value(payload).unwrap();
        let index = timing.job_index();
        assert_eq!(index[&JobId(1)], (Duration::from_secs(600), "UBUNTU".to_string()));
        assert_eq!(index[&JobId(3)].1, "MACOS");
    }

    #[test]
    fn timing_without_job_runs_is_empty() {
        let payload = serde_json::json!({ "billable": { "UBUNTU": { "total_ms": 0 } } });
        let timing: RunTiming = serde_json::from_value(payload).unwrap();
        assert!(timing.job_index().is_empty());
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
