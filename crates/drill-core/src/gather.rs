//! Gathering diagnostic data from clusters.
//!
//! [`gather`] collects namespaced resources from every cluster in parallel.
//! Each cluster writes to its own directory (`<output_dir>/<cluster>/`) and
//! reports exactly one [`GatherResult`] on the returned channel. A cluster
//! that cannot be reached or collected reports its error without affecting
//! the others; the caller decides how severe a failed gather is.
//!
//! The channel holds one slot per cluster and closes after every cluster has
//! reported, so consumers can drain it with `recv()` until `None`. A cluster
//! whose task panics still reports, with [`GatherError::Aborted`].

use crate::cluster::Cluster;
use crate::connection::{self, ConnectionError};
use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::{Discovery, Scope, verbs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span};

/// Errors gathering data from one cluster.
#[derive(Debug, Error)]
pub enum GatherError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("kubernetes request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to write gathered data: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize resource: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("gather task failed: {0}")]
    Aborted(String),
}

/// Outcome of gathering one cluster.
#[derive(Debug)]
pub struct GatherResult {
    /// Cluster name.
    pub name: String,
    /// Set if gathering this cluster failed.
    pub err: Option<GatherError>,
}

/// What to gather and where to store it.
#[derive(Debug, Clone, Default)]
pub struct GatherOptions {
    pub namespaces: Vec<String>,
    pub output_dir: PathBuf,
}

/// Collects resources from one cluster into a directory.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Collects `namespaces` from `cluster` into `dir`, returning the number
    /// of resources stored.
    async fn collect(
        &self,
        cluster: &Cluster,
        namespaces: &[String],
        dir: &Path,
    ) -> Result<usize, GatherError>;
}

/// Gathers data from all clusters in parallel.
///
/// Must be called from within a Tokio runtime.
pub fn gather(
    collector: Arc<dyn Collector>,
    clusters: &[Cluster],
    options: &GatherOptions,
) -> mpsc::Receiver<GatherResult> {
    info!(
        "Gather namespaces {:?} from {} clusters",
        options.namespaces,
        clusters.len()
    );

    let (tx, rx) = mpsc::channel(clusters.len().max(1));
    for cluster in clusters {
        let tx = tx.clone();
        let collector = Arc::clone(&collector);
        let cluster = cluster.clone();
        let namespaces = options.namespaces.clone();
        let dir = options.output_dir.join(&cluster.name);
        let span = info_span!("gather", cluster = %cluster.name);
        let name = cluster.name.clone();

        let task = tokio::spawn(
            async move {
                let start = Instant::now();
                match collector.collect(&cluster, &namespaces, &dir).await {
                    Ok(count) => {
                        info!(
                            "Gathered {} resources from cluster {:?} in {:.2} seconds",
                            count,
                            cluster.name,
                            start.elapsed().as_secs_f64()
                        );
                        None
                    }
                    Err(err) => {
                        error!("Failed to gather data from cluster {:?}: {}", cluster.name, err);
                        Some(err)
                    }
                }
            }
            .instrument(span),
        );

        tokio::spawn(async move {
            let err = task.await.unwrap_or_else(|err| {
                error!(cluster = %name, "Gather task failed: {}", err);
                Some(GatherError::Aborted(err.to_string()))
            });
            // One slot per cluster, so this never waits.
            let _ = tx.send(GatherResult { name, err }).await;
        });
    }

    rx
}

/// Collects namespaced resources through the Kubernetes API.
///
/// Secrets are never collected. Resources the cluster refuses to list
/// (forbidden or not found) are skipped; any other error fails the cluster.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeCollector;

#[async_trait]
impl Collector for KubeCollector {
    async fn collect(
        &self,
        cluster: &Cluster,
        namespaces: &[String],
        dir: &Path,
    ) -> Result<usize, GatherError> {
        let client = connection::connect(cluster).await?;
        let discovery = Discovery::new(client.clone()).run().await?;

        let mut count = 0;
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                if caps.scope != Scope::Namespaced
                    || !caps.supports_operation(verbs::LIST)
                    || resource.plural == "secrets"
                {
                    continue;
                }

                let group_dir = if resource.group.is_empty() {
                    "core"
                } else {
                    resource.group.as_str()
                };

                for namespace in namespaces {
                    let api: Api<DynamicObject> =
                        Api::namespaced_with(client.clone(), namespace, &resource);
                    let list = match api.list(&ListParams::default()).await {
                        Ok(list) => list,
                        Err(err) if is_skippable(&err) => {
                            debug!("Skipping {}/{}: {}", namespace, resource.plural, err);
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    };
                    if list.items.is_empty() {
                        continue;
                    }

                    let resource_dir = dir
                        .join("namespaces")
                        .join(namespace)
                        .join(group_dir)
                        .join(&resource.plural);
                    tokio::fs::create_dir_all(&resource_dir).await?;

                    for item in list.items {
                        let name = item.metadata.name.clone().unwrap_or_default();
                        let yaml = serde_yaml::to_string(&item)?;
                        tokio::fs::write(resource_dir.join(format!("{name}.yaml")), yaml)
                            .await?;
                        count += 1;
                    }
                }
            }
        }

        Ok(count)
    }
}

fn is_skippable(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 403 || response.code == 404)
}

/// Drains a result channel into a vector.
pub async fn collect_results<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    results
}
