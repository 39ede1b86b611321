//! Bootstrap configuration.
//!
//! The bootstrap document is the static configuration the proxy starts from:
//! the initial cluster set, the optional local cluster, and the discovery
//! sources that feed dynamic updates afterwards.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{ClusterSpec, Error, Name};

/// A discovery config source: either a watched file on disk or the cluster
/// hosting the management server. Exactly one of `path` and `cluster` must be
/// set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigSource {
    /// Watch this path for atomically-replaced discovery documents.
    #[serde(default)]
    pub path: Option<String>,

    /// The name of the cluster that hosts the management server. Must name a
    /// primary (statically configured, non-EDS) cluster.
    #[serde(default)]
    pub cluster: Option<Name>,

    #[serde(default = "default_refresh_delay_ms")]
    pub refresh_delay_ms: u64,

    /// When set, a failed first update from this source holds the manager's
    /// initialized callback instead of firing it anyway. Off by default so an
    /// unreachable management server doesn't block startup.
    #[serde(default)]
    pub block_on_first_update: bool,
}

fn default_refresh_delay_ms() -> u64 {
    30_000
}

impl ConfigSource {
    pub fn validate(&self) -> Result<(), Error> {
        match (&self.path, &self.cluster) {
            (Some(_), Some(_)) => Err(Error::invalid_cluster(
                "config_source",
                "path and cluster are mutually exclusive",
            )),
            (None, None) => Err(Error::invalid_cluster(
                "config_source",
                "one of path or cluster is required",
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutlierConfig {
    #[serde(default)]
    pub event_log_path: Option<String>,
}

/// The top-level bootstrap document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,

    #[serde(default)]
    pub local_cluster_name: Option<Name>,

    #[serde(default)]
    pub cds_config: Option<ConfigSource>,

    #[serde(default)]
    pub sds_config: Option<ConfigSource>,

    #[serde(default)]
    pub outlier_detection: OutlierConfig,
}

impl Bootstrap {
    /// Parse a bootstrap document from JSON.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Check the bootstrap-level invariants: cluster names are pairwise
    /// unique, every cluster spec is self-consistent, and the local cluster
    /// name (if set) appears in the static list.
    pub fn validate(&self) -> Result<(), Error> {
        let mut names = HashSet::with_capacity(self.clusters.len());
        for cluster in &self.clusters {
            cluster.validate()?;
            if !names.insert(&cluster.name) {
                return Err(Error::DuplicateCluster {
                    name: cluster.name.to_string(),
                });
            }
        }

        if let Some(local) = &self.local_cluster_name {
            if !names.contains(local) {
                return Err(Error::MissingLocalCluster {
                    name: local.to_string(),
                });
            }
        }

        for source in [&self.cds_config, &self.sds_config].into_iter().flatten() {
            source.validate()?;
        }

        Ok(())
    }
}
