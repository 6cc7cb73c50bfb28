//! Parsing of single `sacct --parsable` rows into typed records.
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::debug;

use crate::*;

pub const TIMESTAMP_FORMAT: &'static str = "%Y-%m-%dT%H:%M:%S";

/// Values sacct prints in place of a timestamp it does not know.
const TIMESTAMP_SENTINELS: &'static [&'static str] = &["unknown", "none", ""];

pub fn parse_timestamp(s: &str) -> ParseResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|_| ParseError::Timestamp(s.to_string()))
}

pub fn parse_optional_timestamp(s: &str) -> ParseResult<Option<NaiveDateTime>> {
    if TIMESTAMP_SENTINELS
        .iter()
        .any(|sentinel| s.eq_ignore_ascii_case(sentinel))
    {
        return Ok(None);
    }
    parse_timestamp(s).map(Some)
}

/// Same tolerance as `numpy.isclose`.
fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

/// The columns of one accounting row, borrowed from the input line.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawRecord<'a> {
    pub job_id: &'a str,
    pub job_name: &'a str,
    pub user: &'a str,
    pub node_list: &'a str,
    pub elapsed_raw: &'a str,
    pub alloc_cpus: &'a str,
    pub cpu_time_raw: &'a str,
    pub max_rss: &'a str,
    pub state: &'a str,
    pub start: &'a str,
    pub end: &'a str,
    pub req_tres: &'a str,
}

impl<'a> RawRecord<'a> {
    /// Job id up to the first `.`, shared by a job and all its steps.
    pub fn base_id(&self) -> &'a str {
        self.job_id
            .split_once('.')
            .map_or(self.job_id, |(base, _)| base)
    }

    /// The part of the job id after the first `.`, e.g. `batch`, `extern` or `0`.
    pub fn suffix(&self) -> Option<&'a str> {
        self.job_id.split_once('.').map(|(_, suffix)| suffix)
    }
}

/// Column positions of the fields we use, as found in the header line.
#[derive(Clone, Debug)]
pub struct Header {
    job_id: usize,
    positions: [usize; fieldname::REQUIRED_FIELDS.len()],
    width: usize,
}

impl Header {
    pub fn parse(line: &str, delimiter: &str) -> UsageResult<Header> {
        let header: Vec<&str> = line.split(delimiter).map(|s| s.trim()).collect();
        let find = |name: &str| header.iter().position(|&f| f == name);

        let job_id = find(fieldname::JOB_ID)
            .or_else(|| find(fieldname::JOB_ID_RAW))
            .ok_or(UsageError::MissingColumn(fieldname::JOB_ID))?;

        let mut positions = [0; fieldname::REQUIRED_FIELDS.len()];
        for (p, &name) in positions.iter_mut().zip(fieldname::REQUIRED_FIELDS) {
            *p = find(name).ok_or(UsageError::MissingColumn(name))?;
        }

        Ok(Header {
            job_id,
            positions,
            width: header.len(),
        })
    }

    /// Split a body line into its columns.  `line_no` is only used for error reporting.
    pub fn split<'a>(
        &self,
        line: &'a str,
        delimiter: &str,
        line_no: usize,
    ) -> UsageResult<RawRecord<'a>> {
        let values: Vec<&str> = line.split(delimiter).map(|s| s.trim()).collect();
        // `sacct -p` ends every line with the delimiter, header included, so the widths agree
        // with or without it.
        if values.len() != self.width {
            return Err(UsageError::IncorrectNumberOfFields { line: line_no });
        }
        let [job_name, user, node_list, elapsed_raw, alloc_cpus, cpu_time_raw, max_rss, state, start, end, req_tres] =
            self.positions.map(|p| values[p]);

        Ok(RawRecord {
            job_id: values[self.job_id],
            job_name,
            user,
            node_list,
            elapsed_raw,
            alloc_cpus,
            cpu_time_raw,
            max_rss,
            state,
            start,
            end,
            req_tres,
        })
    }
}

/// One accounting row: a job, or one of its steps.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccountingRecord {
    pub job_id: String,
    pub job_name: String,
    pub nodes: Vec<String>,
    pub elapsed_raw: u64,
    pub alloc_cpus: u64,
    pub cpu_time_raw: u64,
    /// Peak resident set size in bytes
    pub max_rss: Option<u64>,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl AccountingRecord {
    /// Decode and validate a row.
    ///
    /// Fails if `CPUTimeRAW` is not `AllocCPUS * ElapsedRaw` or if the job ends before it
    /// starts.  The end time of a running job is never read.
    pub fn from_raw(raw: &RawRecord) -> UsageResult<AccountingRecord> {
        let job_id = raw.job_id;
        let invalid = |e| UsageError::invalid_record(job_id, e);

        let nodes = nodelist::expand_nodelist(raw.node_list).map_err(invalid)?;
        let elapsed_raw = parse_uint(raw.elapsed_raw).map_err(invalid)?;
        let alloc_cpus = parse_uint(raw.alloc_cpus).map_err(invalid)?;
        let cpu_time_raw = parse_uint(raw.cpu_time_raw).map_err(invalid)?;

        if !is_close(cpu_time_raw as f64, alloc_cpus.saturating_mul(elapsed_raw) as f64) {
            return Err(UsageError::CpuTimeMismatch {
                job_id: job_id.to_string(),
                cpu_time_raw,
                alloc_cpus,
                elapsed_raw,
            });
        }
        if elapsed_raw == 0 {
            debug!(job_id, "job has zero elapsed time");
        }

        let max_rss = match raw.max_rss {
            "" => None,
            s => Some(parse_bytesize(s).map_err(invalid)?),
        };

        let (state, cancelled_by) = parse_job_state(raw.state).map_err(invalid)?;
        let start = parse_optional_timestamp(raw.start).map_err(invalid)?;
        let end = match state {
            JobState::Running => None,
            _ => parse_optional_timestamp(raw.end).map_err(invalid)?,
        };

        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(UsageError::StartAfterEnd {
                    job_id: job_id.to_string(),
                    start,
                    end,
                });
            }
        }

        Ok(AccountingRecord {
            job_id: job_id.to_string(),
            job_name: raw.job_name.to_string(),
            nodes,
            elapsed_raw,
            alloc_cpus,
            cpu_time_raw,
            max_rss,
            state,
            cancelled_by,
            start,
            end,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn completed_row() -> RawRecord<'static> {
        RawRecord {
            job_id: "1001",
            job_name: "train",
            user: "maggie",
            node_list: "node[01-02]",
            elapsed_raw: "86400",
            alloc_cpus: "32",
            cpu_time_raw: "2764800",
            max_rss: "",
            state: "COMPLETED",
            start: "2024-11-01T08:00:00",
            end: "2024-11-02T08:00:00",
            req_tres: "billing=32,cpu=32,gres/gpu=1,mem=2063937M,node=2",
        }
    }

    #[test]
    fn parses_completed_row() {
        let r = AccountingRecord::from_raw(&completed_row()).unwrap();
        assert_eq!(r.job_id, "1001");
        assert_eq!(r.nodes, ["node01", "node02"]);
        assert_eq!(r.elapsed_raw, 86400);
        assert_eq!(r.cpu_time_raw, 32 * 86400);
        assert_eq!(r.state, JobState::Completed);
        assert_eq!(r.max_rss, None);
        assert_eq!(r.start, Some(parse_timestamp("2024-11-01T08:00:00").unwrap()));
        assert_eq!(r.end, Some(parse_timestamp("2024-11-02T08:00:00").unwrap()));
    }

    #[test]
    fn cpu_time_mismatch_is_fatal() {
        let raw = RawRecord {
            cpu_time_raw: "86400",
            ..completed_row()
        };
        match AccountingRecord::from_raw(&raw) {
            Err(UsageError::CpuTimeMismatch {
                job_id,
                cpu_time_raw,
                alloc_cpus,
                elapsed_raw,
            }) => {
                assert_eq!(job_id, "1001");
                assert_eq!(cpu_time_raw, 86400);
                assert_eq!(alloc_cpus, 32);
                assert_eq!(elapsed_raw, 86400);
            }
            other => panic!("expected CpuTimeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn start_after_end_is_fatal() {
        let raw = RawRecord {
            start: "2024-11-03T08:00:00",
            ..completed_row()
        };
        assert!(matches!(
            AccountingRecord::from_raw(&raw),
            Err(UsageError::StartAfterEnd { .. })
        ));
    }

    #[test]
    fn running_job_has_no_end() {
        let raw = RawRecord {
            state: "RUNNING",
            end: "2024-11-02T08:00:00",
            ..completed_row()
        };
        let r = AccountingRecord::from_raw(&raw).unwrap();
        assert_eq!(r.state, JobState::Running);
        assert_eq!(r.end, None);

        // Even a garbage end field is never looked at.
        let raw = RawRecord {
            state: "RUNNING",
            end: "Unknown",
            ..completed_row()
        };
        assert_eq!(AccountingRecord::from_raw(&raw).unwrap().end, None);
    }

    #[test]
    fn unknown_start_is_absent() {
        for sentinel in ["Unknown", "None", ""] {
            let raw = RawRecord {
                start: sentinel,
                ..completed_row()
            };
            let r = AccountingRecord::from_raw(&raw).unwrap();
            assert_eq!(r.start, None);
            assert!(r.end.is_some());
        }
    }

    #[test]
    fn cancelled_by_actor() {
        let raw = RawRecord {
            state: "CANCELLED by 50012",
            ..completed_row()
        };
        let r = AccountingRecord::from_raw(&raw).unwrap();
        assert_eq!(r.state, JobState::Cancelled);
        assert_eq!(r.cancelled_by.as_deref(), Some("50012"));
    }

    #[test]
    fn max_rss_is_bytes() {
        let raw = RawRecord {
            max_rss: "10M",
            ..completed_row()
        };
        let r = AccountingRecord::from_raw(&raw).unwrap();
        assert_eq!(r.max_rss, Some(10 * 1024 * 1024));
    }

    #[test]
    fn field_errors_name_the_job() {
        let raw = RawRecord {
            start: "2024-13-01T08:00:00",
            ..completed_row()
        };
        match AccountingRecord::from_raw(&raw) {
            Err(UsageError::InvalidRecord { job_id, source }) => {
                assert_eq!(job_id, "1001");
                assert_eq!(
                    source,
                    ParseError::Timestamp("2024-13-01T08:00:00".to_string())
                );
            }
            other => panic!("expected InvalidRecord, got {:?}", other),
        }

        let raw = RawRecord {
            state: "R",
            ..completed_row()
        };
        assert!(matches!(
            AccountingRecord::from_raw(&raw),
            Err(UsageError::InvalidRecord {
                source: ParseError::JobState(_),
                ..
            })
        ));
    }

    #[test]
    fn job_id_suffixes() {
        let raw = RawRecord {
            job_id: "1001.batch",
            ..completed_row()
        };
        assert_eq!(raw.base_id(), "1001");
        assert_eq!(raw.suffix(), Some("batch"));
        assert_eq!(completed_row().base_id(), "1001");
        assert_eq!(completed_row().suffix(), None);
    }

    #[test]
    fn header_locates_columns() {
        let header = Header::parse(
            "JobIDRaw|JobName|User|NodeList|ElapsedRaw|AllocCPUS|CPUTimeRAW|MaxRSS|State|Start|End|ReqTRES|",
            "|",
        )
        .unwrap();
        let raw = header
            .split(
                "7.0|python|||60|2|120|1K|COMPLETED|2024-01-01T00:00:00|2024-01-01T00:01:00||",
                "|",
                2,
            )
            .unwrap();
        assert_eq!(raw.job_id, "7.0");
        assert_eq!(raw.job_name, "python");
        assert_eq!(raw.cpu_time_raw, "120");
        assert_eq!(raw.max_rss, "1K");
        assert_eq!(raw.req_tres, "");

        assert!(matches!(
            header.split("7.0|python", "|", 3),
            Err(UsageError::IncorrectNumberOfFields { line: 3 })
        ));
        assert!(matches!(
            Header::parse("JobID|JobName|User", "|"),
            Err(UsageError::MissingColumn(fieldname::NODE_LIST))
        ));
        assert!(matches!(
            Header::parse("JobName|User", "|"),
            Err(UsageError::MissingColumn(fieldname::JOB_ID))
        ));
    }
}
