use regex::Regex;
use serde::{Deserialize, Serialize};

use std::fmt::Display;

pub use indexmap::IndexMap;

pub use anyhow::{anyhow, bail, Context, Result};
pub use std::result::Result as StdResult;

pub mod fieldname {
    pub const JOB_ID: &'static str = "JobID";
    pub const JOB_ID_RAW: &'static str = "JobIDRaw";
    pub const JOB_NAME: &'static str = "JobName";
    pub const USER: &'static str = "User";
    pub const NODE_LIST: &'static str = "NodeList";
    pub const ELAPSED_RAW: &'static str = "ElapsedRaw";
    pub const ALLOC_CPUS: &'static str = "AllocCPUS";
    pub const CPU_TIME_RAW: &'static str = "CPUTimeRAW";
    pub const MAX_RSS: &'static str = "MaxRSS";
    pub const STATE: &'static str = "State";
    pub const START: &'static str = "Start";
    pub const END: &'static str = "End";
    pub const REQ_TRES: &'static str = "ReqTRES";

    /// Columns every accounting dump must carry, besides the job id.
    pub const REQUIRED_FIELDS: &'static [&'static str] = &[
        JOB_NAME,
        USER,
        NODE_LIST,
        ELAPSED_RAW,
        ALLOC_CPUS,
        CPU_TIME_RAW,
        MAX_RSS,
        STATE,
        START,
        END,
        REQ_TRES,
    ];
}

#[derive(Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    BootFail,
    Cancelled,
    Completed,
    Deadline,
    Failed,
    NodeFail,
    OutOfMemory,
    Pending,
    Preempted,
    Running,
    Requeued,
    Resizing,
    Revoked,
    Suspended,
    Timeout,
}

static JOB_STATES: phf::Map<&'static str, JobState> = phf::phf_map! {
    "BOOT_FAIL" => JobState::BootFail,
    "CANCELLED" => JobState::Cancelled,
    "COMPLETED" => JobState::Completed,
    "DEADLINE" => JobState::Deadline,
    "FAILED" => JobState::Failed,
    "NODE_FAIL" => JobState::NodeFail,
    "OUT_OF_MEMORY" => JobState::OutOfMemory,
    "PENDING" => JobState::Pending,
    "PREEMPTED" => JobState::Preempted,
    "RUNNING" => JobState::Running,
    "REQUEUED" => JobState::Requeued,
    "RESIZING" => JobState::Resizing,
    "REVOKED" => JobState::Revoked,
    "SUSPENDED" => JobState::Suspended,
    "TIMEOUT" => JobState::Timeout,
};

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = JOB_STATES
            .entries()
            .find(|(_, s)| *s == self)
            .map(|(name, _)| *name)
            .unwrap_or("UNKNOWN");
        f.write_str(name)
    }
}

/// Parse a sacct state, returning the actor separately for `CANCELLED by <actor>`.
pub fn parse_job_state(s: &str) -> ParseResult<(JobState, Option<String>)> {
    let s = s.trim();
    if let Some(&state) = JOB_STATES.get(s) {
        return Ok((state, None));
    }

    if let Some(actor) = s.strip_prefix("CANCELLED by ") {
        return Ok((JobState::Cancelled, Some(actor.trim().to_string())));
    }
    Err(ParseError::JobState(s.to_string()))
}

pub fn parse_uint(s: &str) -> ParseResult<u64> {
    s.parse().map_err(|_| ParseError::Uint(s.to_string()))
}

pub fn parse_si_suffix(s: &str) -> ParseResult<u64> {
    let mut power = 0;
    let mut base = s;
    for (suffix, p) in [('K', 10), ('M', 20), ('G', 30), ('T', 40), ('P', 50)] {
        if let Some(b) = s.strip_suffix(|c: char| c.eq_ignore_ascii_case(&suffix)) {
            base = b;
            power = p;
            break;
        }
    }
    let base: f64 = base
        .parse()
        .map_err(|_| ParseError::Bytesize(s.to_string()))?;
    if base.is_sign_negative() || !base.is_finite() {
        return Err(ParseError::Bytesize(s.to_string()));
    }
    Ok((base * f64::powi(2.0, power)).round() as u64)
}

/// Byte sizes as printed by sacct, which may carry a trailing `n` (per node).
#[inline]
pub fn parse_bytesize(s: &str) -> ParseResult<u64> {
    parse_si_suffix(s.strip_suffix("n").unwrap_or(s))
}

/// Parse a duration in seconds.  Accepted formats are SEC, MIN:SEC, HRS:MIN:SEC,
/// DAYS-HRS:MIN:SEC and a number followed by one of the units `s`, `m`, `h` or `d`.
pub fn parse_duration(s: &str) -> ParseResult<u64> {
    lazy_static::lazy_static! {
        static ref CLOCK_FORMAT: Regex =
            Regex::new(r"^((((?P<days>\d+)\-)?(?P<hours>\d+):)?(?P<mins>\d+):)?(?P<secs>\d+)$")
                .unwrap();
        static ref UNIT_FORMAT: Regex =
            Regex::new(r"^(?P<amount>\d+(\.\d+)?)(?P<unit>[smhd])$").unwrap();
    }
    let make_error = || ParseError::Duration(s.to_string());

    if let Some(captures) = UNIT_FORMAT.captures(s) {
        let amount: f64 = captures["amount"].parse().map_err(|_| make_error())?;
        let scale = match &captures["unit"] {
            "s" => 1.,
            "m" => 60.,
            "h" => 3600.,
            _ => 86400.,
        };
        return Ok((amount * scale).round() as u64);
    }

    let captures = CLOCK_FORMAT.captures(s).ok_or_else(make_error)?;

    let parse_int = |s: &str| {
        let s = s.trim_start_matches('0');
        if s.is_empty() {
            Ok(0)
        } else {
            s.parse::<u64>().map_err(|_| make_error())
        }
    };

    let parse_optional_field = |n| {
        captures
            .name(n)
            .map(|s| parse_int(s.as_str()))
            .unwrap_or(Ok(0))
    };

    let days = parse_optional_field("days")?;
    let hrs = parse_optional_field("hours")?;
    let min = parse_optional_field("mins")?;
    let secs = parse_optional_field("secs")?;

    days.checked_mul(24)
        .and_then(|h| h.checked_add(hrs))
        .and_then(|h| h.checked_mul(60))
        .and_then(|m| m.checked_add(min))
        .and_then(|m| m.checked_mul(60))
        .and_then(|s| s.checked_add(secs))
        .ok_or_else(make_error)
}

mod error;
pub use error::*;

pub mod aggregate;
pub mod config;
pub mod ingest;
pub mod nodelist;
pub mod overlap;
pub mod record;
pub mod tres;

pub use aggregate::{
    aggregate_series, bucket_width, aggregate_totals, exclude_nodes, summarize_users, ResourceKind,
    UsageAggregate, UsageBucket, UserSummary, Window,
};
pub use config::ClusterProfile;
pub use ingest::{read_accounting_log, Coverage, Job, JobLog};
pub use nodelist::expand_nodelist;
pub use overlap::{overlap, Relation};
pub use record::{AccountingRecord, RawRecord};
pub use tres::{parse_req_tres, ResourceRequest};
