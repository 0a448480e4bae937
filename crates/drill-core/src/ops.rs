//! DR operations against the hub cluster.
//!
//! Every operation creates, patches or deletes objects on the hub and, when
//! the DR operator has work to do, polls until the expected state is reached
//! or the stage timeout expires. A timeout fails the stage; nothing is
//! retried.

use crate::cluster::Cluster;
use crate::config::{ChannelConfig, Config, Deployer, RepoConfig, TestConfig};
use crate::connection;
use crate::flow::{DrError, DrOperations};
use crate::resources;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

const PHASE_DEPLOYED: &str = "Deployed";
const PHASE_FAILED_OVER: &str = "FailedOver";
const PHASE_RELOCATED: &str = "Relocated";

/// DR operations using the hub Kubernetes API.
pub struct KubeOperations {
    hub: Cluster,
    primary: String,
    secondary: String,
    drpolicy: String,
    clusterset: String,
    repo: RepoConfig,
    channel: ChannelConfig,
    timeout: Duration,
    poll_interval: Duration,
}

impl KubeOperations {
    pub fn new(config: &Config) -> Self {
        Self {
            hub: Cluster::from(&config.clusters.hub),
            primary: config.clusters.c1.name.clone(),
            secondary: config.clusters.c2.name.clone(),
            drpolicy: config.drpolicy.clone(),
            clusterset: config.clusterset.clone(),
            repo: config.repo.clone(),
            channel: config.channel.clone(),
            timeout: config.stage_timeout(),
            poll_interval: POLL_INTERVAL,
        }
    }

    async fn client(&self) -> Result<Client, DrError> {
        Ok(connection::connect(&self.hub).await?)
    }

    /// Polls `name` until `done` accepts it.
    async fn wait_until<K, F>(
        &self,
        api: &Api<K>,
        name: &str,
        what: &str,
        done: F,
    ) -> Result<(), DrError>
    where
        K: Clone + DeserializeOwned + Debug,
        F: Fn(Option<&K>) -> bool,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        loop {
            let object = api.get_opt(name).await?;
            if done(object.as_ref()) {
                debug!(
                    "Finished waiting for {} in {:.2} seconds",
                    what,
                    start.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DrError::Timeout {
                    timeout: self.timeout,
                    what: what.to_string(),
                });
            }
            debug!("Waiting for {}", what);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_phase(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        phase: &str,
    ) -> Result<(), DrError> {
        let what = format!("drpc {name:?} phase {phase:?}");
        self.wait_until(api, name, &what, |drpc| {
            drpc.and_then(resources::drpc_phase) == Some(phase)
        })
        .await
    }

    async fn wait_for_deleted<K>(&self, api: &Api<K>, name: &str, what: &str) -> Result<(), DrError>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        self.wait_until(api, name, &format!("{what} deletion"), |object| object.is_none())
            .await
    }

    fn drpc_api(client: Client, test: &TestConfig) -> Api<DynamicObject> {
        Api::namespaced_with(client, &test.namespace(), &resources::drpc())
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

async fn create_if_missing<K>(api: &Api<K>, object: &K, what: &str) -> Result<(), DrError>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => {
            debug!("Created {}", what);
            Ok(())
        }
        Err(err) if is_status(&err, 409) => {
            debug!("{} already exists", what);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn delete_if_exists<K>(api: &Api<K>, name: &str, what: &str) -> Result<(), DrError>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!("Deleted {}", what);
            Ok(())
        }
        Err(err) if is_status(&err, 404) => {
            debug!("{} not found", what);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn namespace_object(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

fn placement_name(test: &TestConfig) -> String {
    format!("{}-placement", test.name())
}

fn drpc_name(test: &TestConfig) -> String {
    format!("{}-drpc", test.name())
}

fn channel_object(channel: &ChannelConfig, repo: &RepoConfig) -> DynamicObject {
    DynamicObject::new(&channel.name, &resources::channel())
        .within(&channel.namespace)
        .data(json!({
            "spec": {
                "type": "Git",
                "pathname": repo.url,
            }
        }))
}

fn cluster_set_binding_object(namespace: &str, clusterset: &str) -> DynamicObject {
    DynamicObject::new(clusterset, &resources::managed_cluster_set_binding())
        .within(namespace)
        .data(json!({"spec": {"clusterSet": clusterset}}))
}

/// Placement selecting the primary cluster from the cluster set.
fn placement_object(test: &TestConfig, clusterset: &str, primary: &str) -> DynamicObject {
    DynamicObject::new(&placement_name(test), &resources::placement())
        .within(&test.namespace())
        .data(json!({
            "spec": {
                "clusterSets": [clusterset],
                "numberOfClusters": 1,
                "predicates": [{
                    "requiredClusterSelector": {
                        "labelSelector": {
                            "matchExpressions": [{
                                "key": "name",
                                "operator": "In",
                                "values": [primary],
                            }]
                        }
                    }
                }]
            }
        }))
}

fn drpc_object(test: &TestConfig, drpolicy: &str, primary: &str) -> DynamicObject {
    let spec = json!({
        "drPolicyRef": {"name": drpolicy},
        "placementRef": {"kind": "Placement", "name": placement_name(test)},
        "preferredCluster": primary,
        "pvcSelector": {"matchLabels": {"appname": test.workload.to_string()}},
    });
    DynamicObject::new(&drpc_name(test), &resources::drpc())
        .within(&test.namespace())
        .data(json!({"spec": spec}))
}

fn unsupported(test: &TestConfig, operation: &str) -> DrError {
    DrError::Unsupported(format!("{operation} is not supported for deployer {}", test.deployer))
}

#[async_trait]
impl DrOperations for KubeOperations {
    async fn ensure_channel(&self) -> Result<(), DrError> {
        let client = self.client().await?;
        let namespaces: Api<Namespace> = Api::all(client.clone());
        create_if_missing(
            &namespaces,
            &namespace_object(&self.channel.namespace),
            &format!("namespace {:?}", self.channel.namespace),
        )
        .await?;

        let channels: Api<DynamicObject> =
            Api::namespaced_with(client, &self.channel.namespace, &resources::channel());
        create_if_missing(
            &channels,
            &channel_object(&self.channel, &self.repo),
            &format!("channel {:?}", self.channel.name),
        )
        .await?;

        info!("Created channel {:?} for {}", self.channel.name, self.repo.url);
        Ok(())
    }

    async fn ensure_channel_deleted(&self) -> Result<(), DrError> {
        let client = self.client().await?;
        let channels: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &self.channel.namespace, &resources::channel());
        delete_if_exists(&channels, &self.channel.name, "channel").await?;

        let namespaces: Api<Namespace> = Api::all(client);
        delete_if_exists(&namespaces, &self.channel.namespace, "channel namespace").await?;
        self.wait_for_deleted(&namespaces, &self.channel.namespace, "channel namespace")
            .await?;

        info!("Deleted channel {:?}", self.channel.name);
        Ok(())
    }

    async fn deploy(&self, test: &TestConfig) -> Result<(), DrError> {
        if test.deployer == Deployer::Disapp {
            return Err(unsupported(test, "deploy"));
        }
        let namespace = test.namespace();
        let client = self.client().await?;

        let namespaces: Api<Namespace> = Api::all(client.clone());
        create_if_missing(
            &namespaces,
            &namespace_object(&namespace),
            &format!("namespace {namespace:?}"),
        )
        .await?;

        let bindings: Api<DynamicObject> = Api::namespaced_with(
            client.clone(),
            &namespace,
            &resources::managed_cluster_set_binding(),
        );
        create_if_missing(
            &bindings,
            &cluster_set_binding_object(&namespace, &self.clusterset),
            "clusterset binding",
        )
        .await?;

        let placements: Api<DynamicObject> =
            Api::namespaced_with(client, &namespace, &resources::placement());
        create_if_missing(
            &placements,
            &placement_object(test, &self.clusterset, &self.primary),
            "placement",
        )
        .await
    }

    async fn protect(&self, test: &TestConfig) -> Result<(), DrError> {
        let name = drpc_name(test);
        let api = Self::drpc_api(self.client().await?, test);
        create_if_missing(&api, &drpc_object(test, &self.drpolicy, &self.primary), "drpc").await?;
        self.wait_for_phase(&api, &name, PHASE_DEPLOYED).await
    }

    async fn failover(&self, test: &TestConfig) -> Result<(), DrError> {
        let name = drpc_name(test);
        let api = Self::drpc_api(self.client().await?, test);
        let patch = json!({"spec": {"action": "Failover", "failoverCluster": self.secondary}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        self.wait_for_phase(&api, &name, PHASE_FAILED_OVER).await
    }

    async fn relocate(&self, test: &TestConfig) -> Result<(), DrError> {
        let name = drpc_name(test);
        let api = Self::drpc_api(self.client().await?, test);
        let patch = json!({"spec": {"action": "Relocate", "preferredCluster": self.primary}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        self.wait_for_phase(&api, &name, PHASE_RELOCATED).await
    }

    async fn unprotect(&self, test: &TestConfig) -> Result<(), DrError> {
        let name = drpc_name(test);
        let api = Self::drpc_api(self.client().await?, test);
        delete_if_exists(&api, &name, "drpc").await?;
        self.wait_for_deleted(&api, &name, "drpc").await
    }

    async fn undeploy(&self, test: &TestConfig) -> Result<(), DrError> {
        if test.deployer == Deployer::Disapp {
            return Err(unsupported(test, "undeploy"));
        }
        let namespace = test.namespace();
        let client = self.client().await?;

        let placements: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &namespace, &resources::placement());
        delete_if_exists(&placements, &placement_name(test), "placement").await?;

        let namespaces: Api<Namespace> = Api::all(client);
        delete_if_exists(&namespaces, &namespace, "namespace").await?;
        self.wait_for_deleted(&namespaces, &namespace, "namespace").await
    }
}
