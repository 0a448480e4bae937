//! Validation of the DR environment.
//!
//! [`Validation`] is the capability used by commands to inspect clusters.
//! [`Backend`] talks to real clusters; [`Mock`] is a deterministic stand-in
//! for exercising commands without clusters. Commands hold an
//! `Arc<dyn Validation>` and do not know which one they use.

mod backend;
mod mock;

pub use backend::{Backend, Distribution};
pub use mock::{ACCESS_KEY, Mock, SECRET_KEY};

use crate::cluster::{Cluster, Env};
use crate::connection::ConnectionError;
use crate::gather::{GatherOptions, GatherResult};
use crate::s3::{Profile, S3Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors found while validating the environment.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("kubernetes request failed: {0}")]
    Kube(#[from] kube::Error),

    /// Clusters run different distributions.
    #[error("inconsistent cluster distributions: {0}")]
    InconsistentDistribution(String),

    /// A managed cluster is not part of the configured cluster set.
    #[error("cluster {cluster:?} is not in clusterset {clusterset:?}")]
    NotInClusterSet { cluster: String, clusterset: String },

    /// A required object does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("{0}")]
    Invalid(String),
}

/// Operations used to validate clusters and DR objects.
#[async_trait]
pub trait Validation: Send + Sync {
    /// Validates the environment. Must be called once before the other
    /// operations. Returns the first failing check.
    async fn validate(&self, env: &Env) -> Result<(), ValidationError>;

    /// Inspects the application DRPC and returns the application namespaces
    /// on the hub and managed clusters.
    async fn application_namespaces(
        &self,
        env: &Env,
        drpc_name: &str,
        drpc_namespace: &str,
    ) -> Result<Vec<String>, ValidationError>;

    /// Gathers namespaces from clusters, one result per cluster.
    fn gather(&self, clusters: &[Cluster], options: &GatherOptions)
    -> mpsc::Receiver<GatherResult>;

    /// Gets a secret from a cluster.
    async fn get_secret(
        &self,
        cluster: &Cluster,
        name: &str,
        namespace: &str,
    ) -> Result<Secret, ValidationError>;

    /// Gathers objects under `prefixes` from S3 profiles, one result per
    /// profile.
    fn gather_s3(
        &self,
        profiles: &[Profile],
        prefixes: &[String],
        output_dir: &Path,
    ) -> mpsc::Receiver<S3Result>;

    /// Checks S3 profiles are accessible, one result per profile.
    fn check_s3(&self, profiles: &[Profile]) -> mpsc::Receiver<S3Result>;
}
