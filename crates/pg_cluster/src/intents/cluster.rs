//! Create, show and delete intents for clusters.

use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::v1::{
    PgCluster, PgClusterSpec, PgReplica, PgTask, TaskPayload, WorkflowKind, LABEL_CLUSTER,
    LABEL_OPERATOR_VERSION, LABEL_USER, LABEL_WORKFLOW_ID,
};
use crate::config::{OperatorConfig, OPERATOR_VERSION};
use crate::util::errors::{Error, Result, StdError};
use crate::validation::validate_cluster_create;
use crate::workflow;

use super::{build_task, default_namespace, get_cluster, submit_task, validate_resource_name};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CreateClusterRequest {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub user: Option<String>,
    /// Omitted fields take their schema defaults; an omitted spec is an
    /// all-defaults cluster.
    #[serde(default)]
    pub spec: Option<PgClusterSpec>,
}

#[derive(Serialize, Debug, Clone)]
pub struct CreateClusterResponse {
    pub name: String,
    pub workflow_id: String,
}

/// Admits and records a new cluster. The returned workflow id is the
/// progress handle: its marker accumulates milestones as the controllers
/// bring the cluster up.
pub async fn create_cluster(
    client: &Client,
    config: &OperatorConfig,
    req: CreateClusterRequest,
) -> Result<CreateClusterResponse> {
    validate_resource_name(&req.name)?;

    let spec: PgClusterSpec = match req.spec {
        Some(spec) => spec,
        None => serde_json::from_value(serde_json::Value::Object(Default::default()))
            .map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))?,
    };

    validate_cluster_create(client, &req.namespace, config, &spec).await?;

    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), &req.namespace);
    if clusters
        .get_opt(&req.name)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?
        .is_some()
    {
        return Err(Error::StdError(StdError::AlreadyExists {
            kind: "pgcluster",
            name: req.name,
        }));
    }

    let tasks: Api<PgTask> = Api::namespaced(client.clone(), &req.namespace);
    let workflow_id =
        workflow::begin(&tasks, &req.name, WorkflowKind::CreateCluster, req.user.as_deref())
            .await?;

    let mut cluster = PgCluster::new(&req.name, spec);
    let labels = cluster.labels_mut();
    labels.insert(LABEL_CLUSTER.to_string(), req.name.clone());
    labels.insert(LABEL_WORKFLOW_ID.to_string(), workflow_id.as_str().to_string());
    labels.insert(LABEL_OPERATOR_VERSION.to_string(), OPERATOR_VERSION.to_string());
    if let Some(user) = &req.user {
        labels.insert(LABEL_USER.to_string(), user.clone());
    }

    match clusters.create(&PostParams::default(), &cluster).await {
        Ok(_) => {}
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
            return Err(Error::StdError(StdError::AlreadyExists {
                kind: "pgcluster",
                name: req.name,
            }));
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    info!("Created cluster '{}' in namespace '{}'", req.name, req.namespace);
    Ok(CreateClusterResponse { name: req.name, workflow_id: workflow_id.to_string() })
}

#[derive(Serialize, Debug)]
pub struct ShowClusterResponse {
    pub cluster: PgCluster,
    pub replicas: Vec<PgReplica>,
    pub tasks: Vec<PgTask>,
}

/// The cluster record together with everything labelled as belonging to it.
pub async fn show_cluster(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<ShowClusterResponse> {
    let cluster = get_cluster(client, namespace, name).await?;

    let selector = format!("{LABEL_CLUSTER}={name}");
    let params = ListParams::default().labels(&selector);

    let replicas: Api<PgReplica> = Api::namespaced(client.clone(), namespace);
    let replicas = replicas
        .list(&params)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?
        .items;

    let tasks: Api<PgTask> = Api::namespaced(client.clone(), namespace);
    let tasks = tasks
        .list(&params)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?
        .items;

    Ok(ShowClusterResponse { cluster, replicas, tasks })
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DeleteClusterRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Also remove the data volumes
    #[serde(default)]
    pub delete_data: bool,
    /// Also remove the backup repository
    #[serde(default)]
    pub delete_backups: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct DeleteClusterResponse {
    pub name: String,
    /// Removal tasks created ahead of the record deletion
    pub tasks: Vec<String>,
}

/// Deletes a cluster record, optionally queueing data and backup removal
/// first. Without the removal flags the volumes stay behind, which is how
/// a cluster is parked rather than destroyed.
pub async fn delete_cluster(
    client: &Client,
    name: &str,
    req: DeleteClusterRequest,
) -> Result<DeleteClusterResponse> {
    get_cluster(client, &req.namespace, name).await?;

    let tasks: Api<PgTask> = Api::namespaced(client.clone(), &req.namespace);
    let mut created = Vec::new();

    if req.delete_data {
        // one rmdata job removes the data and, when asked, the backups too
        let task = build_task(
            &format!("{name}-rmdata"),
            name,
            TaskPayload::DeleteData {
                cluster: name.to_string(),
                replica: None,
                delete_data: true,
                delete_backups: req.delete_backups,
                is_replica: false,
                is_backup: false,
            },
            None,
            None,
        );
        created.push(submit_task(&tasks, &task).await?);
    } else if req.delete_backups {
        let task = build_task(
            &format!("{name}-delete-backups"),
            name,
            TaskPayload::DeleteBackups { cluster: name.to_string() },
            None,
            None,
        );
        created.push(submit_task(&tasks, &task).await?);
    }

    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), &req.namespace);
    clusters
        .delete(name, &DeleteParams::default())
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

    info!("Deleted cluster '{}' in namespace '{}'", name, req.namespace);
    Ok(DeleteClusterResponse { name: name.to_string(), tasks: created })
}
