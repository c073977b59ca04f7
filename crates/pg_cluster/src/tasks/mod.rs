//! Task handlers. The task controller accepts a PgTask, marks it
//! Submitted, and hands the typed payload to `dispatch`, which runs the
//! matching handler to completion. Every handler is idempotent: redelivered
//! events land on already-exists branches.

pub mod jobs;
pub mod pgadmin;
pub mod policies;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::v1::{
    ClusterState, PgCluster, PgTask, StorageSpec, TaskPayload, LABEL_CLUSTER,
    LABEL_OPERATOR_VERSION, LABEL_WORKFLOW_ID,
};
use crate::config::{OperatorConfig, OPERATOR_VERSION};
use crate::util::cluster_status::ClusterStatusManager;
use crate::util::errors::{Error, Result, StdError};
use crate::workflow::{self, Milestone, WorkflowId};

use jobs::RmdataParams;

/// Runs the handler for a task's payload. The caller owns the status
/// transitions around this call.
pub async fn dispatch(client: &Client, config: &OperatorConfig, task: &PgTask) -> Result<()> {
    let namespace = namespace_of(task)?;
    let name = task.name_any();
    let oref = task_owner_ref(task);

    match &task.spec.payload {
        TaskPayload::DeleteData {
            cluster,
            replica,
            delete_data,
            delete_backups,
            is_replica,
            is_backup,
        } => {
            let params = RmdataParams {
                cluster,
                replica: replica.as_deref(),
                remove_data: *delete_data,
                remove_backups: *delete_backups,
                is_replica: *is_replica,
                is_backup: *is_backup,
                task_type: task.spec.payload.task_type(),
            };
            let job = jobs::create_desired_rmdata_job(config, &namespace, &name, &params, &oref);
            jobs::submit(client, &namespace, &job).await
        }
        TaskPayload::DeleteBackups { cluster } => {
            let params = RmdataParams {
                cluster,
                replica: None,
                remove_data: false,
                remove_backups: true,
                is_replica: false,
                is_backup: true,
                task_type: task.spec.payload.task_type(),
            };
            let job = jobs::create_desired_rmdata_job(config, &namespace, &name, &params, &oref);
            jobs::submit(client, &namespace, &job).await
        }
        TaskPayload::Upgrade { cluster, image_tag, .. } => {
            handle_upgrade(client, &namespace, cluster, image_tag, task).await
        }
        TaskPayload::AddPolicies { cluster, policies } => {
            policies::apply_policies(client, &namespace, cluster, policies).await
        }
        TaskPayload::PgadminAdd { cluster } => {
            let target = get_cluster(client, &namespace, cluster).await?;
            pgadmin::add(client, config, &target).await
        }
        TaskPayload::PgadminDelete { cluster } => {
            pgadmin::remove(client, &namespace, cluster).await
        }
        TaskPayload::WorkflowMarker { kind, .. } => {
            // markers are progress records, not work
            debug!("Workflow marker '{}' ({kind}) requires no processing", name);
            Ok(())
        }
        TaskPayload::Dump { cluster } => {
            let dump_pvc = match &task.spec.storage {
                Some(storage) => {
                    ensure_dump_pvc(client, &namespace, &name, cluster, storage).await?;
                    Some(name.as_str())
                }
                None => None,
            };
            let job =
                jobs::create_desired_dump_job(config, &namespace, &name, cluster, dump_pvc, &oref);
            jobs::submit(client, &namespace, &job).await
        }
        TaskPayload::Restore { cluster, backup_path, pitr_target } => {
            let target = get_cluster(client, &namespace, cluster).await?;
            ClusterStatusManager::new(client, &target)?
                .update_state(ClusterState::Restoring, "restore in progress")
                .await?;
            let job = jobs::create_desired_restore_job(
                config,
                &namespace,
                &name,
                cluster,
                backup_path.as_deref(),
                pitr_target.as_deref(),
                &oref,
            );
            jobs::submit(client, &namespace, &job).await
        }
    }
}

/// Minor-version upgrade: move the cluster record onto the new image tag
/// and refresh its operator-version label. The provisioning strategy rolls
/// the deployments on the next reconcile.
async fn handle_upgrade(
    client: &Client,
    namespace: &str,
    cluster: &str,
    image_tag: &str,
    task: &PgTask,
) -> Result<()> {
    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), namespace);
    let current = get_cluster(client, namespace, cluster).await?;

    if current.spec.postgres_image_tag == image_tag {
        info!("Cluster '{}' already runs image tag '{}'", cluster, image_tag);
    } else {
        let patch = Patch::Merge(json!({
            "metadata": {
                "resourceVersion": current.resource_version(),
                "labels": { LABEL_OPERATOR_VERSION: OPERATOR_VERSION },
            },
            "spec": { "postgres_image_tag": image_tag },
        }));
        match clusters.patch(cluster, &PatchParams::default(), &patch).await {
            Ok(_) => info!("Moved cluster '{}' to image tag '{}'", cluster, image_tag),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                return Err(Error::StdError(StdError::WriteConflict {
                    name: cluster.to_string(),
                }));
            }
            Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
        }
    }

    // milestone write failures never fail the upgrade itself
    if let Some(id) = workflow_id_of(task) {
        let tasks: Api<PgTask> = Api::namespaced(client.clone(), namespace);
        if let Err(e) = workflow::advance(&tasks, &id, Milestone::Completed).await {
            warn!("failed to advance upgrade workflow {id}: {e}");
        }
    }

    Ok(())
}

async fn ensure_dump_pvc(
    client: &Client,
    namespace: &str,
    name: &str,
    cluster: &str,
    storage: &StorageSpec,
) -> Result<()> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    match pvcs.get(name).await {
        Ok(_) => return Ok(()),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {}
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    let desired = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(LABEL_CLUSTER.to_string(), cluster.to_string())])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![storage.access_mode.clone()]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    info!("Creating PersistentVolumeClaim '{}'", name);
    pvcs.create(&PostParams::default(), &desired)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
    Ok(())
}

async fn get_cluster(client: &Client, namespace: &str, name: &str) -> Result<PgCluster> {
    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), namespace);
    match clusters.get(name).await {
        Ok(cluster) => Ok(cluster),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            Err(Error::StdError(StdError::NotFound { kind: "pgcluster", name: name.to_string() }))
        }
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}

pub fn workflow_id_of(task: &PgTask) -> Option<WorkflowId> {
    task.labels().get(LABEL_WORKFLOW_ID).cloned().map(WorkflowId::from)
}

fn namespace_of(task: &PgTask) -> Result<String> {
    task.namespace().ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing(format!(
            "pgtask {} has no namespace",
            task.name_any()
        )))
    })
}

fn task_owner_ref(task: &PgTask) -> OwnerReference {
    task.controller_owner_ref(&()).unwrap_or_else(|| OwnerReference {
        api_version: PgTask::api_version(&()).into_owned(),
        kind: PgTask::kind(&()).into_owned(),
        controller: Some(true),
        name: task.name_any(),
        uid: task.uid().unwrap_or_default(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::PgTaskSpec;

    #[test]
    fn workflow_id_comes_from_the_task_label() {
        let mut task = PgTask::new(
            "hippo-upgrade",
            PgTaskSpec {
                cluster: Some("hippo".to_string()),
                payload: TaskPayload::Upgrade {
                    cluster: "hippo".to_string(),
                    image_tag: "rocky8-16.5-1.2.0".to_string(),
                    operator_version: OPERATOR_VERSION.to_string(),
                    user: None,
                },
                storage: None,
            },
        );
        assert!(workflow_id_of(&task).is_none());

        task.metadata.labels = Some(BTreeMap::from([(
            LABEL_WORKFLOW_ID.to_string(),
            "2f4f6d3e-aaaa-bbbb-cccc-000000000000".to_string(),
        )]));
        let id = workflow_id_of(&task).unwrap();
        assert_eq!(id.as_str(), "2f4f6d3e-aaaa-bbbb-cccc-000000000000");
    }

    #[test]
    fn fallback_owner_reference_points_at_the_task() {
        let task = PgTask::new(
            "hippo-dump",
            PgTaskSpec {
                cluster: Some("hippo".to_string()),
                payload: TaskPayload::Dump { cluster: "hippo".to_string() },
                storage: None,
            },
        );
        let oref = task_owner_ref(&task);
        assert_eq!(oref.kind, "PgTask");
        assert_eq!(oref.name, "hippo-dump");
        assert_eq!(oref.controller, Some(true));
    }
}
