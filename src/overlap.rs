//! How much of a job's run time falls inside a query window.
use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use crate::*;

/// Relationship between a job interval `[start, end]` and a window `[mintime, maxtime]`.
///
/// Touching an edge of the window counts as being inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// `end < mintime`
    Before,
    /// `start > maxtime`
    After,
    /// `start < mintime <= end <= maxtime`
    StartsBefore,
    /// `mintime <= start <= maxtime < end`
    EndsAfter,
    /// `start < mintime` and `end > maxtime`
    Spans,
    /// `mintime <= start` and `end <= maxtime`
    Contained,
}

impl Relation {
    pub fn classify(
        start: NaiveDateTime,
        end: NaiveDateTime,
        mintime: NaiveDateTime,
        maxtime: NaiveDateTime,
    ) -> Option<Relation> {
        use Relation::*;
        if start > end || mintime > maxtime {
            return None;
        }
        let r = if start < mintime && end < mintime {
            Before
        } else if start > maxtime && end > maxtime {
            After
        } else if mintime <= start && end <= maxtime {
            // Checked before the partial cases so that ties at the edges resolve here.
            Contained
        } else if start < mintime && mintime <= end && end <= maxtime {
            StartsBefore
        } else if mintime <= start && start <= maxtime && end > maxtime {
            EndsAfter
        } else if start < mintime && end > maxtime {
            Spans
        } else {
            return None;
        };
        Some(r)
    }

    pub fn in_range(self) -> bool {
        !matches!(self, Relation::Before | Relation::After)
    }

    /// Length of the intersection of the job and the window.
    pub fn overlap(
        self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        mintime: NaiveDateTime,
        maxtime: NaiveDateTime,
    ) -> Duration {
        use Relation::*;
        match self {
            Before | After => Duration::zero(),
            StartsBefore => end - mintime,
            EndsAfter => maxtime - start,
            Spans => maxtime - mintime,
            Contained => end - start,
        }
    }
}

/// Whether `job` intersects `[mintime, maxtime]`, and by how much.
///
/// Jobs without a start or end time are never in range (logged at debug level).  An interval that fits none of the
/// [`Relation`] cases (e.g. a window that ends before it starts) is an error.
pub fn overlap(
    job: &AccountingRecord,
    mintime: NaiveDateTime,
    maxtime: NaiveDateTime,
) -> UsageResult<(bool, Duration)> {
    let (start, end) = match (job.start, job.end) {
        (Some(start), Some(end)) => (start, end),
        (None, _) => {
            debug!(job_id = %job.job_id, "job has no start time, skipping");
            return Ok((false, Duration::zero()));
        }
        (_, None) => {
            debug!(job_id = %job.job_id, state = %job.state, "job has no end time, skipping");
            return Ok((false, Duration::zero()));
        }
    };

    let relation = Relation::classify(start, end, mintime, maxtime).ok_or_else(|| {
        UsageError::UnhandledIntervalRelationship {
            job_id: job.job_id.clone(),
            start,
            end,
            mintime,
            maxtime,
        }
    })?;
    Ok((
        relation.in_range(),
        relation.overlap(start, end, mintime, maxtime),
    ))
}
