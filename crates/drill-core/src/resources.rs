//! Custom resources used by the DR operator and Open Cluster Management.
//!
//! These resources have no generated Rust types, so they are accessed as
//! [`DynamicObject`]s described by an [`ApiResource`].

use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};
use std::collections::BTreeSet;

/// Label marking a managed cluster's cluster set.
pub const CLUSTERSET_LABEL: &str = "cluster.open-cluster-management.io/clusterset";

/// API group present only on OpenShift clusters.
pub const OPENSHIFT_CONFIG_GROUP: &str = "config.openshift.io";

fn resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
}

/// DR placement control, the hub object protecting one application.
pub fn drpc() -> ApiResource {
    resource(
        "ramendr.openshift.io",
        "v1alpha1",
        "DRPlacementControl",
        "drplacementcontrols",
    )
}

/// Placement selecting the cluster running an application.
pub fn placement() -> ApiResource {
    resource(
        "cluster.open-cluster-management.io",
        "v1beta1",
        "Placement",
        "placements",
    )
}

/// Cluster scoped set of managed clusters.
pub fn managed_cluster_set() -> ApiResource {
    resource(
        "cluster.open-cluster-management.io",
        "v1beta2",
        "ManagedClusterSet",
        "managedclustersets",
    )
}

/// Binds a cluster set to a namespace so placements there can use it.
pub fn managed_cluster_set_binding() -> ApiResource {
    resource(
        "cluster.open-cluster-management.io",
        "v1beta2",
        "ManagedClusterSetBinding",
        "managedclustersetbindings",
    )
}

/// Managed cluster registered on the hub.
pub fn managed_cluster() -> ApiResource {
    resource(
        "cluster.open-cluster-management.io",
        "v1",
        "ManagedCluster",
        "managedclusters",
    )
}

/// GitOps channel delivering applications from a Git repository.
pub fn channel() -> ApiResource {
    resource(
        "apps.open-cluster-management.io",
        "v1",
        "Channel",
        "channels",
    )
}

/// Namespaces of the application protected by a DRPC.
///
/// The DRPC namespace holds the application on the hub. Discovered
/// applications also list the namespaces protected on the managed clusters.
/// The result is sorted and free of duplicates.
pub fn application_namespaces(drpc: &DynamicObject) -> Vec<String> {
    let mut namespaces = BTreeSet::new();
    if let Some(namespace) = &drpc.metadata.namespace {
        namespaces.insert(namespace.clone());
    }
    if let Some(protected) = drpc.data["spec"]["protectedNamespaces"].as_array() {
        namespaces.extend(
            protected
                .iter()
                .filter_map(|ns| ns.as_str())
                .map(str::to_string),
        );
    }
    namespaces.into_iter().collect()
}

/// The DRPC phase, e.g. "Deployed", "FailedOver", "Relocated".
pub fn drpc_phase(drpc: &DynamicObject) -> Option<&str> {
    drpc.data["status"]["phase"].as_str()
}
