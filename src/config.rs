use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregate::{ResourceKind, Window};
use crate::*;

pub const PROFILE_FILENAME: &str = "cluster.json";

pub fn config_directory() -> Result<PathBuf> {
    let mut p = dirs::config_dir().ok_or_else(|| anyhow!("unable to determine user config directory"))?;
    p.push("sacct-usage");
    Ok(p)
}

/// Size of the cluster, used to express usage as a share of what was available.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterProfile {
    pub nodes: u64,
    pub cpus_per_node: u64,
    #[serde(default)]
    pub gpus_per_node: u64,
}

impl ClusterProfile {
    /// Load the profile from `path`, or from `cluster.json` in the user config directory if no
    /// path is given.  A missing default profile is not an error.
    pub fn load(path: Option<&Path>) -> Result<Option<ClusterProfile>> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = config_directory()?.join(PROFILE_FILENAME);
                if !p.exists() {
                    debug!(path = ?p, "no cluster profile");
                    return Ok(None);
                }
                p
            }
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read cluster profile {:?}", &path))?;
        let profile: ClusterProfile = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse cluster profile {:?}", &path))?;
        debug!(?profile, path = ?path, "loaded cluster profile");
        Ok(Some(profile))
    }

    /// Same cluster with `n` nodes taken out of service.
    pub fn without_nodes(self, n: usize) -> ClusterProfile {
        ClusterProfile {
            nodes: self.nodes.saturating_sub(n as u64),
            ..self
        }
    }

    pub fn units_per_node(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Cpu => self.cpus_per_node,
            ResourceKind::Gpu => self.gpus_per_node,
        }
    }

    /// Resource-seconds of `kind` the whole cluster offers over `duration`.
    pub fn capacity_seconds(&self, kind: ResourceKind, duration: Duration) -> f64 {
        (self.nodes * self.units_per_node(kind)) as f64 * duration.num_seconds() as f64
    }

    /// `usage` as a percentage of the capacity of `window`, or `None` if the cluster has no
    /// capacity of this kind over it.
    pub fn percent_allocated(&self, kind: ResourceKind, window: &Window, usage: f64) -> Option<f64> {
        let capacity = self.capacity_seconds(kind, window.duration());
        if capacity > 0. {
            Some(100. * usage / capacity)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_timestamp;
    use std::io::Write;

    fn profile() -> ClusterProfile {
        ClusterProfile {
            nodes: 10,
            cpus_per_node: 32,
            gpus_per_node: 4,
        }
    }

    #[test]
    fn load_from_file() -> Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(br#"{"nodes": 10, "cpus_per_node": 32, "gpus_per_node": 4}"#)?;
        assert_eq!(ClusterProfile::load(Some(f.path()))?, Some(profile()));

        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(br#"{"nodes": 2, "cpus_per_node": 64}"#)?;
        let p = ClusterProfile::load(Some(f.path()))?.unwrap();
        assert_eq!(p.gpus_per_node, 0);
        Ok(())
    }

    #[test]
    fn bad_files() -> Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(br#"{"nodes": 10, "cores": 32}"#)?;
        assert!(ClusterProfile::load(Some(f.path())).is_err());

        let dir = tempfile::tempdir()?;
        assert!(ClusterProfile::load(Some(&dir.path().join("missing.json"))).is_err());
        Ok(())
    }

    #[test]
    fn capacity() {
        let p = profile();
        assert_eq!(p.capacity_seconds(ResourceKind::Cpu, Duration::hours(1)), 10. * 32. * 3600.);
        assert_eq!(p.capacity_seconds(ResourceKind::Gpu, Duration::hours(1)), 10. * 4. * 3600.);
        assert_eq!(p.without_nodes(3).nodes, 7);
        assert_eq!(p.without_nodes(30).nodes, 0);

        let w = Window::new(
            parse_timestamp("2024-11-01T00:00:00").unwrap(),
            parse_timestamp("2024-11-01T01:00:00").unwrap(),
        )
        .unwrap();
        let pct = p.percent_allocated(ResourceKind::Cpu, &w, 160. * 3600.).unwrap();
        assert!((pct - 50.).abs() < 1e-9);

        let no_gpus = ClusterProfile { gpus_per_node: 0, ..p };
        assert_eq!(no_gpus.percent_allocated(ResourceKind::Gpu, &w, 1.), None);
    }
}
