//! Point-in-time restore intent. The restore job rewrites the primary data
//! volume, so the task handler parks the cluster in Restoring first and the
//! cluster controller brings it back up once the job reports.

use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::api::v1::{PgCluster, PgTask, TaskPayload, WorkflowKind, LABEL_WORKFLOW_ID};
use crate::util::errors::{Error, Result, StdError};
use crate::workflow::{self, WorkflowId};

use super::{build_task, default_namespace, get_cluster, submit_task};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RestoreRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Backup set to restore; latest when omitted
    #[serde(default)]
    pub backup_path: Option<String>,
    /// Point-in-time recovery target, e.g. `2026-08-01 10:00:00+00`
    #[serde(default)]
    pub pitr_target: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RestoreResponse {
    pub cluster: String,
    pub task: String,
    pub workflow_id: String,
}

pub async fn restore_cluster(
    client: &Client,
    name: &str,
    req: &RestoreRequest,
) -> Result<RestoreResponse> {
    let cluster = get_cluster(client, &req.namespace, name).await?;

    if cluster.spec.shutdown {
        return Err(Error::StdError(StdError::InvalidArgument(format!(
            "cluster {name} is shutdown"
        ))));
    }
    if cluster.spec.standby {
        return Err(Error::StdError(StdError::InvalidArgument(format!(
            "cluster {name} is a standby and follows its primary's repository"
        ))));
    }

    let tasks: Api<PgTask> = Api::namespaced(client.clone(), &req.namespace);
    let workflow_id =
        workflow::begin(&tasks, name, WorkflowKind::Restore, req.user.as_deref()).await?;

    // rebind the cluster to the restore workflow so the controller stamps
    // its milestones on the right marker
    relabel_workflow(client, &req.namespace, &cluster, &workflow_id).await?;

    let task = build_task(
        &format!("{name}-restore"),
        name,
        TaskPayload::Restore {
            cluster: name.to_string(),
            backup_path: req.backup_path.clone(),
            pitr_target: req.pitr_target.clone(),
        },
        Some(&workflow_id),
        req.user.as_deref(),
    );
    let task = submit_task(&tasks, &task).await?;

    info!("Queued restore of cluster '{}'", name);
    Ok(RestoreResponse {
        cluster: name.to_string(),
        task,
        workflow_id: workflow_id.to_string(),
    })
}

async fn relabel_workflow(
    client: &Client,
    namespace: &str,
    cluster: &PgCluster,
    workflow_id: &WorkflowId,
) -> Result<()> {
    let name = cluster.name_any();
    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), namespace);

    let patch = Patch::Merge(json!({
        "metadata": {
            "resourceVersion": cluster.resource_version(),
            "labels": { LABEL_WORKFLOW_ID: workflow_id.as_str() },
        }
    }));

    match clusters.patch(&name, &PatchParams::default(), &patch).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
            Err(Error::StdError(StdError::WriteConflict { name }))
        }
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}
