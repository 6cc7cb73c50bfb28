use chrono::NaiveDateTime;
use thiserror::Error;

use crate::StdResult;

/// Errors raised while decoding a single field of an accounting row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unable to parse unsigned int ({0})")]
    Uint(String),
    #[error("unable to parse bytesize ({0})")]
    Bytesize(String),
    #[error("unable to parse duration ({0})")]
    Duration(String),
    #[error("unable to parse timestamp ({0})")]
    Timestamp(String),
    #[error("unable to parse job state ({0})")]
    JobState(String),
    #[error("unable to expand node list ({list}): {reason}")]
    NodeList { list: String, reason: &'static str },
    #[error("malformed resource descriptor entry ({0}), expected key=value")]
    MalformedResource(String),
    #[error("unknown memory unit in resource descriptor ({0}), expected one of K, M, G, T")]
    MalformedResourceUnit(String),
}

pub type ParseResult<T> = StdResult<T, ParseError>;

/// Fatal errors of an ingestion or aggregation pass.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("failed to read accounting log")]
    Io(#[from] std::io::Error),
    #[error("accounting log is empty, expected a header line")]
    MissingHeader,
    #[error("header is missing the {0} column")]
    MissingColumn(&'static str),
    #[error("line {line}: row has incorrect number of fields (try using a different delimiter)")]
    IncorrectNumberOfFields { line: usize },
    #[error("job {job_id}: {source}")]
    InvalidRecord {
        job_id: String,
        #[source]
        source: ParseError,
    },
    #[error(
        "job {job_id}: CPUTimeRAW={cpu_time_raw} does not match AllocCPUS*ElapsedRaw={alloc_cpus}*{elapsed_raw}"
    )]
    CpuTimeMismatch {
        job_id: String,
        cpu_time_raw: u64,
        alloc_cpus: u64,
        elapsed_raw: u64,
    },
    #[error("job {job_id}: start ({start}) is after end ({end})")]
    StartAfterEnd {
        job_id: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error("job {job_id}: no parent record (a row without a '.' suffix) in the log")]
    MissingParentRecord { job_id: String },
    #[error("job {job_id}: more than one parent record in the log")]
    DuplicateParentRecord { job_id: String },
    #[error("job {job_id}: parent record has an empty {field} field")]
    MissingParentField { job_id: String, field: &'static str },
    #[error(
        "job {job_id}: interval [{start}, {end}] has no defined relationship to window [{mintime}, {maxtime}]"
    )]
    UnhandledIntervalRelationship {
        job_id: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
        mintime: NaiveDateTime,
        maxtime: NaiveDateTime,
    },
    #[error("query window ends before it starts: {mintime} > {maxtime}")]
    InvalidWindow {
        mintime: NaiveDateTime,
        maxtime: NaiveDateTime,
    },
    #[error("bucket width must be positive, got {0} seconds")]
    InvalidBucketWidth(i64),
    #[error("bucket width is too large: {0} seconds")]
    BucketWidthOutOfRange(u64),
}

pub type UsageResult<T> = StdResult<T, UsageError>;

impl UsageError {
    pub(crate) fn invalid_record(job_id: &str, source: ParseError) -> Self {
        UsageError::InvalidRecord {
            job_id: job_id.to_string(),
            source,
        }
    }
}
