//! Apportioning of job usage to users over query windows.
//!
//! A job is assumed to consume its resources uniformly over its lifetime, so a window that
//! covers a fraction of the job's elapsed time is charged the same fraction of its usage.
use std::fmt::Display;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::*;

/// Type of resource usage to aggregate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Gpu,
}

impl FromStr for ResourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ResourceKind::Cpu),
            "gpu" => Ok(ResourceKind::Gpu),
            _ => bail!("resource kind must be `cpu` or `gpu`: {}", s),
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Cpu => f.write_str("CPU"),
            ResourceKind::Gpu => f.write_str("GPU"),
        }
    }
}

/// A query window `[mintime, maxtime]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Window {
    pub mintime: NaiveDateTime,
    pub maxtime: NaiveDateTime,
}

impl Window {
    pub fn new(mintime: NaiveDateTime, maxtime: NaiveDateTime) -> UsageResult<Window> {
        if maxtime < mintime {
            return Err(UsageError::InvalidWindow { mintime, maxtime });
        }
        Ok(Window { mintime, maxtime })
    }

    pub fn duration(&self) -> Duration {
        self.maxtime - self.mintime
    }

    pub fn midpoint(&self) -> NaiveDateTime {
        self.mintime + self.duration() / 2
    }

    /// Consecutive sub-windows of the given width.  The last one is cut short at `maxtime`
    /// if the width does not divide the window.
    pub fn buckets(&self, width: Duration) -> UsageResult<Vec<Window>> {
        if width <= Duration::zero() {
            return Err(UsageError::InvalidBucketWidth(width.num_seconds()));
        }
        let mut buckets = vec![];
        let mut lo = self.mintime;
        while lo < self.maxtime {
            let hi = lo
                .checked_add_signed(width)
                .map_or(self.maxtime, |hi| std::cmp::min(hi, self.maxtime));
            buckets.push(Window {
                mintime: lo,
                maxtime: hi,
            });
            lo = hi;
        }
        Ok(buckets)
    }
}

/// Bucket width from a count of seconds, as produced by [`parse_duration`].
pub fn bucket_width(secs: u64) -> UsageResult<Duration> {
    match i64::try_from(secs) {
        Ok(0) => Err(UsageError::InvalidBucketWidth(0)),
        Ok(s) if s <= i64::MAX / 1000 => Ok(Duration::seconds(s)),
        _ => Err(UsageError::BucketWidthOutOfRange(secs)),
    }
}

/// Accumulated resource-seconds per user.
pub type UsageAggregate = IndexMap<String, f64>;

/// Usage of one bucket of a time series.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageBucket {
    pub window: Window,
    pub midpoint: NaiveDateTime,
    /// Usage summed over all users
    pub total: f64,
    pub users: UsageAggregate,
}

impl UsageBucket {
    /// Users with non-zero usage in this bucket.
    pub fn active_users(&self) -> usize {
        self.users.values().filter(|&&u| u > 0.).count()
    }
}

fn unfinished_jobs(jobs: &[Job]) -> usize {
    jobs.iter()
        .filter(|j| j.record.elapsed_raw > 0 && (j.record.start.is_none() || j.record.end.is_none()))
        .count()
}

/// Jobs with elapsed time but no start or end are left out of every window.  Reported once
/// per aggregation rather than once per bucket.
fn warn_unfinished(jobs: &[Job]) {
    let skipped = unfinished_jobs(jobs);
    if skipped > 0 {
        warn!(skipped, "jobs without a start or end time are left out of the aggregation");
    }
}

/// Fraction of the job that falls in the window, or `None` if the job is not in range or
/// has no elapsed time.
fn window_fraction(job: &Job, window: &Window) -> UsageResult<Option<f64>> {
    let elapsed = job.record.elapsed_raw;
    if elapsed == 0 {
        return Ok(None);
    }
    let (in_range, d) = overlap(&job.record, window.mintime, window.maxtime)?;
    if !in_range {
        return Ok(None);
    }
    Ok(Some(d.num_seconds() as f64 / elapsed as f64))
}

/// The share of the job's usage of `kind` attributable to `window`.
pub fn apportioned_usage(job: &Job, window: &Window, kind: ResourceKind) -> UsageResult<Option<f64>> {
    Ok(window_fraction(job, window)?.map(|frac| job.time_raw(kind) as f64 * frac))
}

/// Per-user usage of `kind` over `window`.  Users without a job in range are absent.
pub fn aggregate_totals(
    jobs: &[Job],
    window: &Window,
    kind: ResourceKind,
) -> UsageResult<UsageAggregate> {
    warn_unfinished(jobs);
    totals_over(jobs, window, kind)
}

fn totals_over(jobs: &[Job], window: &Window, kind: ResourceKind) -> UsageResult<UsageAggregate> {
    let mut totals = UsageAggregate::default();
    for job in jobs {
        if let Some(usage) = apportioned_usage(job, window, kind)? {
            *totals.entry(job.user.clone()).or_insert(0.) += usage;
        }
    }
    Ok(totals)
}

/// Per-user usage of `kind` in consecutive buckets of `width` covering `window`, in
/// chronological order.
pub fn aggregate_series(
    jobs: &[Job],
    window: &Window,
    width: Duration,
    kind: ResourceKind,
) -> UsageResult<Vec<UsageBucket>> {
    let buckets = window.buckets(width)?;
    warn_unfinished(jobs);
    buckets
        .into_iter()
        .map(|bucket| {
            let users = totals_over(jobs, &bucket, kind)?;
            Ok(UsageBucket {
                window: bucket,
                midpoint: bucket.midpoint(),
                total: users.values().sum(),
                users,
            })
        })
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UserSummary {
    pub user: String,
    /// Number of jobs with a non-zero share of their run time inside the window.  Jobs that
    /// only touch an edge of the window are not counted.
    pub jobs: usize,
    pub cpu_seconds: f64,
    pub gpu_seconds: f64,
}

impl UserSummary {
    pub fn seconds(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_seconds,
            ResourceKind::Gpu => self.gpu_seconds,
        }
    }
}

/// CPU and GPU usage of every user in the log over `window`, heaviest `sort_by` users first.
pub fn summarize_users(
    jobs: &[Job],
    window: &Window,
    sort_by: ResourceKind,
) -> UsageResult<Vec<UserSummary>> {
    warn_unfinished(jobs);
    let mut users = IndexMap::<&str, UserSummary>::default();
    for job in jobs {
        let summary = users.entry(&job.user).or_insert_with(|| UserSummary {
            user: job.user.clone(),
            ..UserSummary::default()
        });
        if let Some(frac) = window_fraction(job, window)?.filter(|&f| f > 0.) {
            summary.jobs += 1;
            summary.cpu_seconds += job.time_raw(ResourceKind::Cpu) as f64 * frac;
            summary.gpu_seconds += job.time_raw(ResourceKind::Gpu) as f64 * frac;
        }
    }
    let mut users: Vec<_> = users.into_values().collect();
    users.sort_by(|a, b| b.seconds(sort_by).total_cmp(&a.seconds(sort_by)));
    Ok(users)
}

/// Drop every job that ran on one of `nodes`.
pub fn exclude_nodes(jobs: Vec<Job>, nodes: &[String]) -> Vec<Job> {
    let before = jobs.len();
    let jobs: Vec<Job> = jobs
        .into_iter()
        .filter(|j| !nodes.iter().any(|n| j.ran_on(n)))
        .collect();
    info!(
        excluded_nodes = nodes.len(),
        jobs_before = before,
        jobs_after = jobs.len(),
        "excluded jobs by node"
    );
    jobs
}
