//! Resolving a cluster into a live Kubernetes connection.
//!
//! Some distributions emit kubeconfig files with long or generic context
//! names (e.g. "system:admin/https://api-cluster-example-com:6443", or simply
//! "admin" in every cluster's file). Before use, the current context is
//! renamed to the cluster's logical name so that every connection, log line
//! and gathered directory refers to the cluster by the same name. The rename
//! happens in memory; the file on disk is never modified.

use crate::cluster::Cluster;
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Errors resolving a cluster connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The kubeconfig file is missing or malformed.
    #[error("failed to load kubeconfig {path}: {source}")]
    Load {
        path: PathBuf,
        source: KubeconfigError,
    },

    /// The kubeconfig has no usable current context.
    #[error("kubeconfig {path} has no context {context:?}")]
    MissingContext { path: PathBuf, context: String },

    /// The kubeconfig could not be turned into a client configuration.
    #[error("invalid kubeconfig {path}: {source}")]
    Config {
        path: PathBuf,
        source: KubeconfigError,
    },

    /// The client could not be created.
    #[error("failed to create client for cluster {cluster:?}: {source}")]
    Client { cluster: String, source: kube::Error },
}

/// Errors renaming a kubeconfig context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenameError {
    /// The current context names no context entry.
    #[error("no context {0:?}")]
    MissingContext(String),
}

/// Renames the current context to `name`.
///
/// Returns true if the kubeconfig was modified. Calling it again on the
/// result is a no-op. A stale entry already named `name` is replaced, so the
/// result never holds duplicate contexts.
pub fn rename_context(kubeconfig: &mut Kubeconfig, name: &str) -> Result<bool, RenameError> {
    let current = kubeconfig.current_context.clone().unwrap_or_default();
    if current == name {
        return Ok(false);
    }

    if !kubeconfig.contexts.iter().any(|c| c.name == current) {
        return Err(RenameError::MissingContext(current));
    }

    kubeconfig.contexts.retain(|c| c.name != name);
    for context in &mut kubeconfig.contexts {
        if context.name == current {
            context.name = name.to_string();
        }
    }
    kubeconfig.current_context = Some(name.to_string());

    Ok(true)
}

/// Loads the cluster's kubeconfig with the current context renamed to the
/// cluster name.
pub fn load_kubeconfig(cluster: &Cluster) -> Result<Kubeconfig, ConnectionError> {
    let mut kubeconfig =
        Kubeconfig::read_from(&cluster.kubeconfig).map_err(|source| ConnectionError::Load {
            path: cluster.kubeconfig.clone(),
            source,
        })?;

    let current = kubeconfig.current_context.clone().unwrap_or_default();
    match rename_context(&mut kubeconfig, &cluster.name) {
        Ok(true) => info!(
            cluster = %cluster.name,
            "Renamed context {:?} to {:?}", current, cluster.name
        ),
        Ok(false) => debug!(cluster = %cluster.name, "Context already matches cluster name"),
        Err(RenameError::MissingContext(context)) => {
            return Err(ConnectionError::MissingContext {
                path: cluster.kubeconfig.clone(),
                context,
            });
        }
    }

    Ok(kubeconfig)
}

/// Builds the client configuration for a cluster.
pub async fn rest_config(cluster: &Cluster) -> Result<Config, ConnectionError> {
    let kubeconfig = load_kubeconfig(cluster)?;
    let options = KubeConfigOptions {
        context: Some(cluster.name.clone()),
        ..Default::default()
    };

    Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|source| ConnectionError::Config {
            path: cluster.kubeconfig.clone(),
            source,
        })
}

/// Connects to a cluster.
pub async fn connect(cluster: &Cluster) -> Result<Client, ConnectionError> {
    let config = rest_config(cluster).await?;
    Client::try_from(config).map_err(|source| ConnectionError::Client {
        cluster: cluster.name.clone(),
        source,
    })
}
