//! Sample configuration file.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

/// Errors creating a sample configuration file.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("configuration file {0:?} already exists")]
    Exists(String),

    #[error("failed to create {path:?}: {source}")]
    Create { path: String, source: io::Error },
}

/// Values substituted into the sample configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub command_name: String,
    pub hub_kubeconfig: String,
    pub primary_kubeconfig: String,
    pub secondary_kubeconfig: String,
}

impl Sample {
    /// Sample using the default kubeconfig layout.
    pub fn new(command_name: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            hub_kubeconfig: "hub/config".to_string(),
            primary_kubeconfig: "primary/config".to_string(),
            secondary_kubeconfig: "secondary/config".to_string(),
        }
    }

    /// Renders the sample configuration document.
    pub fn render(&self) -> String {
        format!(
            r#"## {command} configuration file

## Clusters configuration.
# - Modify clusters "kubeconfigpath" and "name" to match your hub and managed
#   clusters names and path to the kubeconfig file.
clusters:
  hub:
    name: hub
    kubeconfigpath: {hub}
  c1:
    name: primary
    kubeconfigpath: {primary}
  c2:
    name: secondary
    kubeconfigpath: {secondary}

## Git repository for test command.
# - Modify "url" to use your own Git repository.
# - Modify "branch" to test a different branch.
repo:
  url: https://github.com/RamenDR/ocm-ramen-samples.git
  branch: main

## DRPolicy for test command.
# - Modify to match actual DRPolicy in the hub cluster.
drpolicy: dr-policy

## ClusterSet for test command.
# - Modify to match your Open Cluster Management configuration.
clusterset: default

## PVC specifications for test command.
# - Modify items "storageclassname" to match the actual storage classes in the
#   managed clusters.
# - Add new items for testing more storage types.
pvcspecs:
- name: rbd
  storageclassname: rook-ceph-block
  accessmodes: ReadWriteOnce
- name: cephfs
  storageclassname: rook-cephfs-fs1
  accessmodes: ReadWriteMany

## Tests cases for test command.
# - Modify the test for your preferred workload or deployment type.
# - Add new tests for testing more combinations in parallel.
# - Available workloads: deploy
# - Available deployers: appset, subscr, disapp
tests:
- workload: deploy
  deployer: appset
  pvcspec: rbd

## S3 profiles checked by the validate command.
# - Modify to match the S3 stores configured for the DR operator.
s3profiles: []
"#,
            command = self.command_name,
            hub = self.hub_kubeconfig,
            primary = self.primary_kubeconfig,
            secondary = self.secondary_kubeconfig,
        )
    }
}

/// Writes the sample to `path`, refusing to overwrite an existing file.
pub fn create_sample(path: &Path, sample: &Sample) -> Result<(), SampleError> {
    let display = path.display().to_string();
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|source| {
        if source.kind() == io::ErrorKind::AlreadyExists {
            SampleError::Exists(display.clone())
        } else {
            SampleError::Create {
                path: display.clone(),
                source,
            }
        }
    })?;

    file.write_all(sample.render().as_bytes())
        .map_err(|source| SampleError::Create {
            path: display,
            source,
        })
}
