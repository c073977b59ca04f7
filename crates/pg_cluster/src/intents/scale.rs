//! Replica scale-out and scale-down intents.

use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::v1::{
    ClusterState, PgCluster, PgReplica, PgReplicaSpec, PgTask, StorageSpec, TaskPayload,
    LABEL_CLUSTER,
};
use crate::config::OperatorConfig;
use crate::strategies::v1::parse_node_label;
use crate::util::errors::{Error, Result, StdError};
use crate::validation::ValidationError;

use super::{build_task, default_namespace, get_cluster, submit_task, validate_resource_name};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ScaleRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_replica_count")]
    pub replica_count: i32,
    /// Overrides the cluster's replica storage for the new replicas
    #[serde(default)]
    pub storage: Option<StorageSpec>,
    /// `key=value` node selector for the new replicas
    #[serde(default)]
    pub node_label: Option<String>,
}

fn default_replica_count() -> i32 {
    1
}

#[derive(Serialize, Debug, Clone)]
pub struct ScaleResponse {
    pub cluster: String,
    pub replicas: Vec<String>,
}

/// Creates `replica_count` replica records for a cluster. Validation runs
/// in full before the first record is written; the batch itself aborts on
/// the first create error, leaving the already-created records to converge.
pub async fn scale_cluster(
    client: &Client,
    config: &OperatorConfig,
    name: &str,
    req: ScaleRequest,
) -> Result<ScaleResponse> {
    validate_resource_name(name)?;
    let cluster = get_cluster(client, &req.namespace, name).await?;
    ensure_cluster_running(&cluster)?;

    if req.replica_count < 1 {
        return Err(ValidationError::InvalidReplicaCount { value: req.replica_count }.into());
    }
    if let Some(storage_name) = req.storage.as_ref().and_then(|s| s.name.as_deref()) {
        if config.storage_config(storage_name).is_none() {
            return Err(ValidationError::UnknownStorageConfig {
                name: storage_name.to_string(),
                role: "replica storage".to_string(),
            }
            .into());
        }
    }
    if let Some(label) = req.node_label.as_deref() {
        if parse_node_label(label).is_none() {
            return Err(Error::StdError(StdError::InvalidArgument(format!(
                "node label {label:?} is not of the form key=value"
            ))));
        }
    }

    let replicas: Api<PgReplica> = Api::namespaced(client.clone(), &req.namespace);
    let mut created = Vec::with_capacity(req.replica_count as usize);

    for _ in 0..req.replica_count {
        let replica_name = format!("{name}-{}", random_suffix());
        let mut replica = PgReplica::new(
            &replica_name,
            PgReplicaSpec {
                cluster: name.to_string(),
                storage: req.storage.clone(),
                node_label: req.node_label.clone(),
            },
        );
        replica
            .labels_mut()
            .insert(LABEL_CLUSTER.to_string(), name.to_string());

        replicas
            .create(&PostParams::default(), &replica)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        created.push(replica_name);
    }

    info!("Scaled cluster '{}' by {} replicas", name, created.len());
    Ok(ScaleResponse { cluster: name.to_string(), replicas: created })
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ScaleDownRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name of the replica record to remove
    pub replica: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ScaleDownResponse {
    pub replica: String,
    /// Data removal task for the retired replica
    pub task: String,
}

/// Removes one replica: queues the data-removal task, then deletes the
/// record so the controller tears the instance down.
pub async fn scale_down(
    client: &Client,
    name: &str,
    req: ScaleDownRequest,
) -> Result<ScaleDownResponse> {
    let cluster = get_cluster(client, &req.namespace, name).await?;
    ensure_cluster_running(&cluster)?;

    let replicas: Api<PgReplica> = Api::namespaced(client.clone(), &req.namespace);
    let replica = replicas
        .get_opt(&req.replica)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?
        .ok_or_else(|| {
            Error::StdError(StdError::NotFound { kind: "pgreplica", name: req.replica.clone() })
        })?;

    if replica.spec.cluster != name {
        return Err(Error::StdError(StdError::InvalidArgument(format!(
            "replica {} belongs to cluster {}, not {}",
            req.replica, replica.spec.cluster, name
        ))));
    }

    let tasks: Api<PgTask> = Api::namespaced(client.clone(), &req.namespace);
    let task = build_task(
        &format!("{}-rmdata", req.replica),
        name,
        TaskPayload::DeleteData {
            cluster: name.to_string(),
            replica: Some(req.replica.clone()),
            delete_data: true,
            delete_backups: false,
            is_replica: true,
            is_backup: false,
        },
        None,
        None,
    );
    let task = submit_task(&tasks, &task).await?;

    replicas
        .delete(&req.replica, &DeleteParams::default())
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

    info!("Scaled down replica '{}' of cluster '{}'", req.replica, name);
    Ok(ScaleDownResponse { replica: req.replica, task })
}

fn ensure_cluster_running(cluster: &PgCluster) -> Result<()> {
    let state = cluster.status.as_ref().and_then(|s| s.state);
    if cluster.spec.shutdown || state == Some(ClusterState::Shutdown) {
        return Err(Error::StdError(StdError::InvalidArgument(format!(
            "cluster {} is shutdown",
            cluster.name_any()
        ))));
    }
    Ok(())
}

/// Four lowercase letters, enough to keep sibling replicas distinct.
fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..4).map(|_| char::from(b'a' + rng.gen_range(0..26))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::{PgClusterSpec, PgClusterStatus};

    #[test]
    fn suffixes_are_four_lowercase_letters() {
        for _ in 0..50 {
            let suffix = random_suffix();
            assert_eq!(suffix.len(), 4);
            assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn shutdown_clusters_reject_scale_operations() {
        let mut cluster = PgCluster::new("hippo", PgClusterSpec::default());
        assert!(ensure_cluster_running(&cluster).is_ok());

        cluster.spec.shutdown = true;
        assert!(ensure_cluster_running(&cluster).is_err());

        cluster.spec.shutdown = false;
        cluster.status = Some(PgClusterStatus {
            state: Some(ClusterState::Shutdown),
            ..Default::default()
        });
        assert!(ensure_cluster_running(&cluster).is_err());
    }
}
