//! Decoding of the `ReqTRES` column, e.g. `billing=4,cpu=4,gres/gpu=1,mem=16G,node=1`.
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::*;

pub mod key {
    pub const BILLING: &'static str = "billing";
    pub const CPU: &'static str = "cpu";
    pub const GPU: &'static str = "gres/gpu";
    pub const MEM: &'static str = "mem";
    pub const NODE: &'static str = "node";
}

/// Resources requested by a job.  Entries absent from the descriptor are `None`, except for
/// GPUs which default to zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResourceRequest {
    pub billing: Option<u64>,
    pub cpus: Option<u64>,
    pub gpus: u64,
    pub mem_gb: Option<f64>,
    pub nodes: Option<u64>,
}

impl ResourceRequest {
    /// GPU-seconds consumed over `elapsed_raw` seconds.
    pub fn gpu_seconds(&self, elapsed_raw: u64) -> u64 {
        self.gpus * elapsed_raw
    }
}

/// Convert a memory amount with a mandatory K/M/G/T suffix to gigabytes.
pub fn parse_mem_gb(s: &str) -> ParseResult<f64> {
    lazy_static::lazy_static! {
        static ref MEM_FORMAT: Regex =
            Regex::new(r"^(?P<amount>\d+(\.\d+)?)(?P<unit>.*)$").unwrap();
    }
    let captures = MEM_FORMAT
        .captures(s)
        .ok_or_else(|| ParseError::MalformedResource(s.to_string()))?;
    let amount: f64 = captures["amount"]
        .parse()
        .map_err(|_| ParseError::MalformedResource(s.to_string()))?;

    let power = match &captures["unit"] {
        "K" => -2,
        "M" => -1,
        "G" => 0,
        "T" => 1,
        _ => return Err(ParseError::MalformedResourceUnit(s.to_string())),
    };
    Ok(amount * f64::powi(1024.0, power))
}

/// Parse a resource descriptor.  Keys outside the known vocabulary are skipped.
pub fn parse_req_tres(s: &str) -> ParseResult<ResourceRequest> {
    let mut req = ResourceRequest::default();

    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (k, v) = entry
            .split_once('=')
            .ok_or_else(|| ParseError::MalformedResource(entry.to_string()))?;
        match k {
            key::BILLING => req.billing = Some(parse_uint(v)?),
            key::CPU => req.cpus = Some(parse_uint(v)?),
            key::GPU => req.gpus = parse_uint(v)?,
            key::MEM => req.mem_gb = Some(parse_mem_gb(v)?),
            key::NODE => req.nodes = Some(parse_uint(v)?),
            _ => debug!(entry, "ignoring resource descriptor entry"),
        }
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-6, "{} != {}", a, b);
    }

    #[test]
    fn full_descriptor() {
        let req = parse_req_tres("billing=1,cpu=1,gres/gpu=2,mem=2063937M,node=1").unwrap();
        assert_eq!(req.billing, Some(1));
        assert_eq!(req.cpus, Some(1));
        assert_eq!(req.gpus, 2);
        assert_eq!(req.nodes, Some(1));
        assert_close(req.mem_gb.unwrap(), 2063937.0 / 1024.0);
        assert_eq!((req.mem_gb.unwrap() * 100.).round() / 100., 2015.56);
        assert_eq!(req.gpu_seconds(3600), 7200);
    }

    #[test]
    fn no_gpu_means_zero_gpu_seconds() {
        let req = parse_req_tres("billing=16,cpu=16,mem=64G,node=1").unwrap();
        assert_eq!(req.gpus, 0);
        assert_eq!(req.gpu_seconds(86400), 0);
        assert_close(req.mem_gb.unwrap(), 64.0);
    }

    #[test]
    fn memory_units() {
        assert_close(parse_mem_gb("1048576K").unwrap(), 1.0);
        assert_close(parse_mem_gb("512M").unwrap(), 0.5);
        assert_close(parse_mem_gb("2.5G").unwrap(), 2.5);
        assert_close(parse_mem_gb("2T").unwrap(), 2048.0);
        assert_eq!(
            parse_mem_gb("100"),
            Err(ParseError::MalformedResourceUnit("100".to_string()))
        );
        assert_eq!(
            parse_mem_gb("4P"),
            Err(ParseError::MalformedResourceUnit("4P".to_string()))
        );
        assert!(matches!(
            parse_req_tres("cpu=1,mem=10Q"),
            Err(ParseError::MalformedResourceUnit(_))
        ));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let req = parse_req_tres("cpu=8,gres/gpu:a100=2,energy=10,gres/gpu=2").unwrap();
        assert_eq!(req.cpus, Some(8));
        assert_eq!(req.gpus, 2);
        assert_eq!(req.mem_gb, None);
    }

    #[test]
    fn malformed_entries() {
        assert!(matches!(
            parse_req_tres("cpu"),
            Err(ParseError::MalformedResource(_))
        ));
        assert_eq!(
            parse_req_tres("cpu=four"),
            Err(ParseError::Uint("four".to_string()))
        );
        assert_eq!(parse_req_tres(""), Ok(ResourceRequest::default()));
    }
}
