//! Validation with real clusters.

use super::{Validation, ValidationError};
use crate::cluster::{Cluster, Env};
use crate::config::Config;
use crate::connection;
use crate::gather::{self, Collector, GatherOptions, GatherResult, KubeCollector};
use crate::resources::{self, CLUSTERSET_LABEL, OPENSHIFT_CONFIG_GROUP};
use crate::s3::{self, Profile, S3Result};
use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Kubernetes distribution running on a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Kubernetes,
    OpenShift,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Kubernetes => write!(f, "k8s"),
            Distribution::OpenShift => write!(f, "ocp"),
        }
    }
}

/// Performs validation with real clusters.
pub struct Backend {
    clusterset: String,
    collector: Arc<dyn Collector>,
}

impl Backend {
    pub fn new(config: &Config) -> Self {
        Self {
            clusterset: config.clusterset.clone(),
            collector: Arc::new(KubeCollector),
        }
    }

    async fn detect_distribution(cluster: &Cluster) -> Result<Distribution, ValidationError> {
        let client = connection::connect(cluster).await?;
        let groups = client.list_api_groups().await?;
        let distribution = if groups.groups.iter().any(|g| g.name == OPENSHIFT_CONFIG_GROUP) {
            Distribution::OpenShift
        } else {
            Distribution::Kubernetes
        };
        debug!(cluster = %cluster.name, "Detected distribution {}", distribution);
        Ok(distribution)
    }

    /// All clusters must run the same distribution.
    async fn detect_distro(&self, env: &Env) -> Result<Distribution, ValidationError> {
        let clusters = env.clusters();
        let detected = join_all(clusters.iter().map(Self::detect_distribution)).await;

        let mut found: Vec<(String, Distribution)> = Vec::new();
        for (cluster, result) in clusters.iter().zip(detected) {
            found.push((cluster.name.clone(), result?));
        }

        let distribution = consistent_distribution(&found)?;
        info!("Detected distribution {}", distribution);
        Ok(distribution)
    }

    /// The cluster set must exist on the hub and contain both managed
    /// clusters.
    async fn validate_clusterset(&self, env: &Env) -> Result<(), ValidationError> {
        let client = connection::connect(&env.hub).await?;

        let sets: Api<DynamicObject> =
            Api::all_with(client.clone(), &resources::managed_cluster_set());
        if sets.get_opt(&self.clusterset).await?.is_none() {
            return Err(ValidationError::NotFound {
                kind: "ManagedClusterSet".to_string(),
                name: self.clusterset.clone(),
            });
        }

        let clusters: Api<DynamicObject> = Api::all_with(client, &resources::managed_cluster());
        for cluster in env.managed() {
            let managed = clusters.get_opt(&cluster.name).await?.ok_or_else(|| {
                ValidationError::NotFound {
                    kind: "ManagedCluster".to_string(),
                    name: cluster.name.clone(),
                }
            })?;
            let label = managed
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(CLUSTERSET_LABEL));
            if label != Some(&self.clusterset) {
                return Err(ValidationError::NotInClusterSet {
                    cluster: cluster.name.clone(),
                    clusterset: self.clusterset.clone(),
                });
            }
        }

        info!("Validated clusterset {:?}", self.clusterset);
        Ok(())
    }
}

/// Returns the distribution shared by all clusters.
fn consistent_distribution(
    found: &[(String, Distribution)],
) -> Result<Distribution, ValidationError> {
    let Some((_, first)) = found.first() else {
        return Err(ValidationError::Invalid("no clusters".to_string()));
    };
    if found.iter().any(|(_, d)| d != first) {
        let details = found
            .iter()
            .map(|(name, d)| format!("{name}={d}"))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(ValidationError::InconsistentDistribution(details));
    }
    Ok(*first)
}

#[async_trait]
impl Validation for Backend {
    async fn validate(&self, env: &Env) -> Result<(), ValidationError> {
        self.detect_distro(env).await?;
        self.validate_clusterset(env).await
    }

    async fn application_namespaces(
        &self,
        env: &Env,
        drpc_name: &str,
        drpc_namespace: &str,
    ) -> Result<Vec<String>, ValidationError> {
        let client = connection::connect(&env.hub).await?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(client, drpc_namespace, &resources::drpc());
        let drpc = api.get(drpc_name).await?;
        Ok(resources::application_namespaces(&drpc))
    }

    fn gather(
        &self,
        clusters: &[Cluster],
        options: &GatherOptions,
    ) -> mpsc::Receiver<GatherResult> {
        gather::gather(Arc::clone(&self.collector), clusters, options)
    }

    async fn get_secret(
        &self,
        cluster: &Cluster,
        name: &str,
        namespace: &str,
    ) -> Result<Secret, ValidationError> {
        let client = connection::connect(cluster).await?;
        let secrets: Api<Secret> = Api::namespaced(client, namespace);
        Ok(secrets.get(name).await?)
    }

    fn gather_s3(
        &self,
        profiles: &[Profile],
        prefixes: &[String],
        output_dir: &Path,
    ) -> mpsc::Receiver<S3Result> {
        s3::gather_profiles(profiles, prefixes, output_dir)
    }

    fn check_s3(&self, profiles: &[Profile]) -> mpsc::Receiver<S3Result> {
        s3::check_profiles(profiles)
    }
}
