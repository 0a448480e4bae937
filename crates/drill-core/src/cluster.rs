//! Clusters taking part in a DR test.

use crate::config::{ClusterConfig, Config};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A target cluster: a logical name and the kubeconfig used to reach it.
///
/// Identity is the name. The kubeconfig is resolved into a live connection
/// only when needed, see [`crate::connection`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub kubeconfig: PathBuf,
}

impl Cluster {
    pub fn new(name: impl Into<String>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kubeconfig: kubeconfig.into(),
        }
    }
}

impl From<&ClusterConfig> for Cluster {
    fn from(config: &ClusterConfig) -> Self {
        Self::new(config.name.clone(), config.kubeconfigpath.clone())
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The hub and the two managed clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Env {
    pub hub: Cluster,
    pub c1: Cluster,
    pub c2: Cluster,
}

impl Env {
    pub fn new(config: &Config) -> Self {
        Self {
            hub: Cluster::from(&config.clusters.hub),
            c1: Cluster::from(&config.clusters.c1),
            c2: Cluster::from(&config.clusters.c2),
        }
    }

    /// All clusters, hub first.
    pub fn clusters(&self) -> Vec<Cluster> {
        vec![self.hub.clone(), self.c1.clone(), self.c2.clone()]
    }

    /// The managed clusters, primary first.
    pub fn managed(&self) -> [&Cluster; 2] {
        [&self.c1, &self.c2]
    }
}
