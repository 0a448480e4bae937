//! Configuration file for drill commands.
//!
//! The configuration describes the hub and managed clusters, the Git
//! repository holding the sample workloads, the DR policy and cluster set to
//! use, and the test cases to run. It is loaded from YAML:
//!
//! ```yaml
//! clusters:
//!   hub: {name: hub, kubeconfigpath: hub/config}
//!   c1: {name: primary, kubeconfigpath: primary/config}
//!   c2: {name: secondary, kubeconfigpath: secondary/config}
//! repo: {url: https://github.com/RamenDR/ocm-ramen-samples.git, branch: main}
//! drpolicy: dr-policy
//! clusterset: default
//! pvcspecs:
//! - {name: rbd, storageclassname: rook-ceph-block, accessmodes: ReadWriteOnce}
//! tests:
//! - {workload: deploy, deployer: appset, pvcspec: rbd}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Namespace holding the GitOps channel shared by all tests.
pub const CHANNEL_NAMESPACE: &str = "test-gitops";

/// Name of the GitOps channel shared by all tests.
pub const CHANNEL_NAME: &str = "drill-channel";

/// Prefix for every namespace created by tests.
pub const NAMESPACE_PREFIX: &str = "test-";

/// Default timeout for DR stages waiting on cluster state.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Errors from loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// The configuration parsed but is not usable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Cluster entry in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub kubeconfigpath: PathBuf,
}

/// The three clusters taking part in a DR test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustersConfig {
    pub hub: ClusterConfig,
    pub c1: ClusterConfig,
    pub c2: ClusterConfig,
}

/// Git repository with the sample workloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Storage flavour used by a test workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvcSpecConfig {
    pub name: String,
    pub storageclassname: String,
    pub accessmodes: String,
}

/// Workload deployed by a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    /// A busybox deployment writing to a PVC.
    Deploy,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workload::Deploy => write!(f, "deploy"),
        }
    }
}

/// How a test workload is delivered to the managed clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployer {
    /// ArgoCD ApplicationSet.
    Appset,
    /// OCM Subscription.
    Subscr,
    /// Discovered application, deployed directly on the managed cluster.
    Disapp,
}

impl fmt::Display for Deployer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deployer::Appset => write!(f, "appset"),
            Deployer::Subscr => write!(f, "subscr"),
            Deployer::Disapp => write!(f, "disapp"),
        }
    }
}

/// One test case: a workload, a deployer and a storage flavour.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestConfig {
    pub workload: Workload,
    pub deployer: Deployer,
    pub pvcspec: String,
}

impl TestConfig {
    /// Unique test name, e.g. "appset-deploy-rbd".
    pub fn name(&self) -> String {
        format!("{}-{}-{}", self.deployer, self.workload, self.pvcspec)
    }

    /// Namespace holding the test resources on the hub.
    pub fn namespace(&self) -> String {
        format!("{NAMESPACE_PREFIX}{}", self.name())
    }
}

/// Reference to the secret holding S3 credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

/// S3 store used by the DR operator for metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3ProfileConfig {
    pub name: String,
    pub bucket: String,
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub secretref: SecretRef,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// GitOps channel shared by all tests. Not user configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelConfig {
    pub name: String,
    pub namespace: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: CHANNEL_NAME.to_string(),
            namespace: CHANNEL_NAMESPACE.to_string(),
        }
    }
}

/// Top level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub clusters: ClustersConfig,
    pub repo: RepoConfig,
    pub drpolicy: String,
    pub clusterset: String,
    #[serde(default)]
    pub pvcspecs: Vec<PvcSpecConfig>,
    #[serde(default)]
    pub tests: Vec<TestConfig>,
    #[serde(default)]
    pub s3profiles: Vec<S3ProfileConfig>,
    /// Seconds to wait for a DR stage to reach its expected state.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(skip_deserializing)]
    pub channel: ChannelConfig,
}

impl Config {
    /// Loads the configuration from a YAML file.
    ///
    /// Relative kubeconfig paths are resolved against the directory holding
    /// the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }

        Ok(config)
    }

    /// Parses configuration from a YAML string.
    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for cluster in [
            &mut self.clusters.hub,
            &mut self.clusters.c1,
            &mut self.clusters.c2,
        ] {
            if cluster.kubeconfigpath.is_relative() {
                cluster.kubeconfigpath = base.join(&cluster.kubeconfigpath);
            }
        }
    }

    /// Checks the configuration is usable for running tests.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let clusters = [
            ("hub", &self.clusters.hub),
            ("c1", &self.clusters.c1),
            ("c2", &self.clusters.c2),
        ];

        let mut names = HashSet::new();
        for (key, cluster) in clusters {
            if cluster.name.is_empty() {
                return Err(ConfigError::Invalid(format!("cluster {key:?} has no name")));
            }
            if cluster.kubeconfigpath.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "cluster {key:?} has no kubeconfigpath"
                )));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate cluster name {:?}",
                    cluster.name
                )));
            }
        }

        if self.drpolicy.is_empty() {
            return Err(ConfigError::Invalid("drpolicy is empty".to_string()));
        }
        if self.clusterset.is_empty() {
            return Err(ConfigError::Invalid("clusterset is empty".to_string()));
        }

        let specs = self.pvcspecs_map();
        if specs.len() != self.pvcspecs.len() {
            return Err(ConfigError::Invalid("duplicate pvcspec names".to_string()));
        }

        if self.tests.is_empty() {
            return Err(ConfigError::Invalid("no tests configured".to_string()));
        }

        let mut seen = HashSet::new();
        for test in &self.tests {
            if !specs.contains_key(test.pvcspec.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "test {:?} uses unknown pvcspec {:?}",
                    test.name(),
                    test.pvcspec
                )));
            }
            if !seen.insert(test.name()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate test {:?}",
                    test.name()
                )));
            }
        }

        Ok(())
    }

    /// Maps pvcspec name to pvcspec.
    pub fn pvcspecs_map(&self) -> HashMap<&str, &PvcSpecConfig> {
        self.pvcspecs.iter().map(|s| (s.name.as_str(), s)).collect()
    }

    /// Timeout for DR stages waiting on cluster state.
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r"
clusters:
  hub: {name: hub, kubeconfigpath: hub/config}
  c1: {name: dr1, kubeconfigpath: dr1/config}
  c2: {name: dr2, kubeconfigpath: /abs/dr2/config}
repo:
  url: https://github.com/RamenDR/ocm-ramen-samples.git
drpolicy: dr-policy
clusterset: default
pvcspecs:
- {name: rbd, storageclassname: rook-ceph-block, accessmodes: ReadWriteOnce}
- {name: cephfs, storageclassname: rook-cephfs-fs1, accessmodes: ReadWriteMany}
tests:
- {workload: deploy, deployer: appset, pvcspec: rbd}
- {workload: deploy, deployer: subscr, pvcspec: cephfs}
";

    #[test]
    fn test_parse_valid_config() {
        let config = Config::parse(VALID).unwrap();
        assert_eq!(config.clusters.c1.name, "dr1");
        assert_eq!(config.repo.branch, "main");
        assert_eq!(config.tests.len(), 2);
        assert_eq!(config.tests[1].deployer, Deployer::Subscr);
        assert_eq!(config.channel.namespace, CHANNEL_NAMESPACE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_test_name_and_namespace() {
        let test = TestConfig {
            workload: Workload::Deploy,
            deployer: Deployer::Appset,
            pvcspec: "rbd".to_string(),
        };
        assert_eq!(test.name(), "appset-deploy-rbd");
        assert_eq!(test.namespace(), "test-appset-deploy-rbd");
    }

    #[test]
    fn test_unknown_pvcspec_rejected() {
        let mut config = Config::parse(VALID).unwrap();
        config.tests[0].pvcspec = "nfs".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown pvcspec"));
    }

    #[test]
    fn test_duplicate_cluster_name_rejected() {
        let mut config = Config::parse(VALID).unwrap();
        config.clusters.c2.name = "dr1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_tests_rejected() {
        let mut config = Config::parse(VALID).unwrap();
        config.tests.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_test_rejected() {
        let mut config = Config::parse(VALID).unwrap();
        let first = config.tests[0].clone();
        config.tests.push(first);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_deployer_fails_to_parse() {
        let yaml = VALID.replace("deployer: appset", "deployer: helm");
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn test_load_resolves_relative_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drill.yaml");
        std::fs::write(&path, VALID).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.clusters.hub.kubeconfigpath, dir.path().join("hub/config"));
        assert_eq!(
            config.clusters.c2.kubeconfigpath,
            PathBuf::from("/abs/dr2/config")
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/drill.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_stage_timeout_default() {
        let mut config = Config::parse(VALID).unwrap();
        assert_eq!(config.stage_timeout(), Duration::from_secs(600));
        config.timeout = Some(30);
        assert_eq!(config.stage_timeout(), Duration::from_secs(30));
    }
}
