//! Request-time operations behind the query surface. Each intent validates
//! fully before its first write, so a rejection leaves no partial effect;
//! once writes begin, recovery is the controllers' job.

pub mod backups;
pub mod cluster;
pub mod df;
pub mod pgadmin;
pub mod restore;
pub mod scale;
pub mod upgrade;

use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::api::v1::{
    PgCluster, PgTask, PgTaskSpec, TaskPayload, LABEL_CLUSTER, LABEL_RMDATA, LABEL_TASK_TYPE,
    LABEL_TRUE, LABEL_USER, LABEL_WORKFLOW_ID,
};
use crate::util::errors::{Error, Result, StdError};
use crate::util::task_status;
use crate::workflow::WorkflowId;

/// Longest generated name appends `-backrest-shared-repo` (21 chars) and
/// object names cap at 63.
const MAX_NAME_LEN: usize = 42;

static RESOURCE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z]([-a-z0-9]*[a-z0-9])?$").unwrap());

pub(crate) fn default_namespace() -> String {
    "default".to_string()
}

/// Admission for caller-chosen resource names. `all` is reserved as the
/// every-cluster selector in batch requests.
pub(crate) fn validate_resource_name(name: &str) -> Result<()> {
    if name == "all" {
        return Err(Error::StdError(StdError::InvalidArgument(
            "\"all\" is a reserved name".to_string(),
        )));
    }
    if name.len() > MAX_NAME_LEN || !RESOURCE_NAME.is_match(name) {
        return Err(Error::StdError(StdError::InvalidArgument(format!(
            "{name:?} is not a valid resource name: up to {MAX_NAME_LEN} lowercase \
             alphanumeric characters or hyphens, starting with a letter"
        ))));
    }
    Ok(())
}

pub(crate) async fn get_cluster(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<PgCluster> {
    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), namespace);
    match clusters.get(name).await {
        Ok(cluster) => Ok(cluster),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => Err(Error::StdError(
            StdError::NotFound { kind: "pgcluster", name: name.to_string() },
        )),
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}

/// Builds a task carrying the identity labels every intent stamps.
pub(crate) fn build_task(
    name: &str,
    cluster: &str,
    payload: TaskPayload,
    workflow: Option<&WorkflowId>,
    user: Option<&str>,
) -> PgTask {
    let task_type = payload.task_type();
    let is_rmdata = matches!(payload, TaskPayload::DeleteData { .. });
    let mut task = PgTask::new(
        name,
        PgTaskSpec { cluster: Some(cluster.to_string()), payload, storage: None },
    );
    let labels = task.labels_mut();
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    labels.insert(LABEL_TASK_TYPE.to_string(), task_type.to_string());
    if is_rmdata {
        labels.insert(LABEL_RMDATA.to_string(), LABEL_TRUE.to_string());
    }
    if let Some(workflow) = workflow {
        labels.insert(LABEL_WORKFLOW_ID.to_string(), workflow.as_str().to_string());
    }
    if let Some(user) = user {
        labels.insert(LABEL_USER.to_string(), user.to_string());
    }
    task
}

/// At-most-one-in-flight gate shared by every task-creating intent: a live
/// task under the same name rejects the request naming the blocker, a
/// completed one is superseded.
pub(crate) async fn submit_task(tasks: &Api<PgTask>, desired: &PgTask) -> Result<String> {
    let name = desired.name_any();

    match tasks
        .get_opt(&name)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?
    {
        Some(existing) if task_status::blocks_creation(&existing) => {
            return Err(Error::StdError(StdError::TaskInFlight { task: name }));
        }
        Some(_) => {
            debug!("superseding completed task {name}");
            tasks
                .delete(&name, &DeleteParams::default())
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        }
        None => {}
    }

    tasks
        .create(&PostParams::default(), desired)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
    Ok(name)
}

/// Per-target outcome of a continue-and-collect batch operation.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub cluster: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    pub(crate) fn ok(cluster: &str, task: String) -> Self {
        Self { cluster: cluster.to_string(), task: Some(task), error: None }
    }

    pub(crate) fn failed(cluster: &str, error: &Error) -> Self {
        Self { cluster: cluster.to_string(), task: None, error: Some(error.to_string()) }
    }
}
