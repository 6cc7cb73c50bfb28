//! Grouping of accounting rows into jobs, and reading of whole accounting dumps.
use std::io::BufRead;

use chrono::NaiveDateTime;
use indexmap::map::Entry;
use serde::Serialize;
use tracing::info;

use crate::aggregate::ResourceKind;
use crate::record::Header;
use crate::*;

/// Kind of a child row, derived from the suffix of its job id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
    Step,
    Batch,
    Extern,
}

impl ChildKind {
    pub fn classify(suffix: &str) -> ChildKind {
        if suffix.contains("batch") {
            ChildKind::Batch
        } else if suffix.contains("extern") {
            ChildKind::Extern
        } else {
            ChildKind::Step
        }
    }
}

/// A job: its own accounting row plus the rows of its steps.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Job {
    #[serde(flatten)]
    pub record: AccountingRecord,
    pub user: String,
    pub req_tres: String,
    pub resources: ResourceRequest,
    pub steps: Vec<AccountingRecord>,
    pub batch: Vec<AccountingRecord>,
    pub externs: Vec<AccountingRecord>,
}

impl Job {
    /// Decode a parent row.  Parent rows are the only ones carrying `User` and `ReqTRES`, and
    /// both are required.
    pub fn from_raw(raw: &RawRecord) -> UsageResult<Job> {
        let record = AccountingRecord::from_raw(raw)?;
        for (field, value) in [(fieldname::USER, raw.user), (fieldname::REQ_TRES, raw.req_tres)] {
            if value.is_empty() {
                return Err(UsageError::MissingParentField {
                    job_id: record.job_id,
                    field,
                });
            }
        }
        let resources = tres::parse_req_tres(raw.req_tres)
            .map_err(|e| UsageError::invalid_record(&record.job_id, e))?;

        Ok(Job {
            record,
            user: raw.user.to_string(),
            req_tres: raw.req_tres.to_string(),
            resources,
            steps: vec![],
            batch: vec![],
            externs: vec![],
        })
    }

    pub fn gpu_time_raw(&self) -> u64 {
        self.resources.gpu_seconds(self.record.elapsed_raw)
    }

    /// Resource-seconds of the given kind over the whole life of the job.
    pub fn time_raw(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Cpu => self.record.cpu_time_raw,
            ResourceKind::Gpu => self.gpu_time_raw(),
        }
    }

    pub fn ran_on(&self, node: &str) -> bool {
        self.record.nodes.iter().any(|n| n == node)
    }

    fn adopt(&mut self, kind: ChildKind, child: AccountingRecord) {
        match kind {
            ChildKind::Step => self.steps.push(child),
            ChildKind::Batch => self.batch.push(child),
            ChildKind::Extern => self.externs.push(child),
        }
    }
}

/// Earliest start and latest end seen over the jobs of one dump.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub earliest_start: Option<NaiveDateTime>,
    pub latest_end: Option<NaiveDateTime>,
}

impl Coverage {
    pub fn observe(&mut self, record: &AccountingRecord) {
        if let Some(start) = record.start {
            if self.earliest_start.map_or(true, |t| start < t) {
                self.earliest_start = Some(start);
            }
        }
        if let Some(end) = record.end {
            if self.latest_end.map_or(true, |t| end > t) {
                self.latest_end = Some(end);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobLog {
    pub jobs: Vec<Job>,
    pub coverage: Coverage,
}

impl JobLog {
    /// Resource-seconds of the given kind summed over every job in the log.
    pub fn total_usage(&self, kind: ResourceKind) -> u64 {
        self.jobs.iter().map(|j| j.time_raw(kind)).sum()
    }
}

#[derive(Default, Clone, Debug)]
struct Group {
    parent: Option<Job>,
    children: Vec<(ChildKind, AccountingRecord)>,
}

/// Collects rows, in any order, and assembles them into jobs.
#[derive(Default, Clone, Debug)]
pub struct JobBuilder {
    groups: IndexMap<String, Group>,
}

impl JobBuilder {
    pub fn push(&mut self, raw: &RawRecord) -> UsageResult<()> {
        let base_id = raw.base_id();
        let group = match self.groups.entry(base_id.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(Group::default()),
        };

        match raw.suffix() {
            None => {
                if group.parent.is_some() {
                    return Err(UsageError::DuplicateParentRecord {
                        job_id: base_id.to_string(),
                    });
                }
                group.parent = Some(Job::from_raw(raw)?);
            }
            Some(suffix) => {
                let child = AccountingRecord::from_raw(raw)?;
                group.children.push((ChildKind::classify(suffix), child));
            }
        }
        Ok(())
    }

    /// Attach every child to its parent.  Jobs keep the order in which their id was first seen.
    pub fn finish(self) -> UsageResult<JobLog> {
        let mut coverage = Coverage::default();
        let mut jobs = Vec::with_capacity(self.groups.len());

        for (job_id, group) in self.groups {
            let mut job = group
                .parent
                .ok_or(UsageError::MissingParentRecord { job_id })?;
            for (kind, child) in group.children {
                job.adopt(kind, child);
            }
            coverage.observe(&job.record);
            jobs.push(job);
        }
        Ok(JobLog { jobs, coverage })
    }
}

/// Read a whole accounting dump: a header line followed by one row per line.
pub fn read_accounting_log(mut input: impl BufRead, delimiter: &str) -> UsageResult<JobLog> {
    let mut header_buf = String::new();
    if input.read_line(&mut header_buf)? == 0 || header_buf.trim().is_empty() {
        return Err(UsageError::MissingHeader);
    }
    let header = Header::parse(&header_buf, delimiter)?;

    let mut line_buf = String::new();
    let mut line_no = 2;
    let mut builder = JobBuilder::default();

    while input.read_line(&mut line_buf)? != 0 {
        if !line_buf.trim().is_empty() {
            let raw = header.split(&line_buf, delimiter, line_no)?;
            builder.push(&raw)?;
        }
        line_no += 1;
        line_buf.clear();
    }

    let log = builder.finish()?;
    info!(
        jobs = log.jobs.len(),
        earliest_start = ?log.coverage.earliest_start,
        latest_end = ?log.coverage.latest_end,
        "read accounting log"
    );
    Ok(log)
}
