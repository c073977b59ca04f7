//! Progress markers for multi-step operations.
//!
//! A workflow is one logical operation (create, upgrade, restore) that
//! several controllers contribute to. Its marker is a task record holding a
//! map of milestone timestamps; the workflow id label on the marker is the
//! join key every participating resource carries.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use chrono::{SecondsFormat, Utc};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::v1::{
    PgTask, PgTaskSpec, TaskPayload, WorkflowKind, LABEL_CLUSTER, LABEL_USER, LABEL_WORKFLOW_ID,
};
use crate::util::errors::{Error, Result, StdError};
use crate::util::task_status;

pub static WORKFLOW_FIELD_MANAGER: &str = "pg-workflow-coordinator";

/// Identifier of one multi-step operation, shared by every resource the
/// operation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn generate() -> Self {
        WorkflowId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkflowId {
    fn from(raw: String) -> Self {
        WorkflowId(raw)
    }
}

/// The steps a workflow can report, stamped as they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Submitted,
    PrimaryCreated,
    ClusterCreated,
    RestorePrimaryCreated,
    Completed,
}

impl Milestone {
    pub fn key(self) -> &'static str {
        match self {
            Milestone::Submitted => "submitted",
            Milestone::PrimaryCreated => "primary-created",
            Milestone::ClusterCreated => "cluster-created",
            Milestone::RestorePrimaryCreated => "restore-primary-created",
            Milestone::Completed => "completed",
        }
    }
}

/// Builds the marker task for a new workflow. The marker is named
/// `<cluster>-<kind slug>`, so a cluster runs at most one workflow of a
/// kind at a time, and it starts out with `submitted` as its only
/// milestone.
pub fn new_marker(cluster: &str, kind: WorkflowKind, user: Option<&str>) -> (WorkflowId, PgTask) {
    let id = WorkflowId::generate();
    let mut milestones = BTreeMap::new();
    milestones.insert(Milestone::Submitted.key().to_string(), timestamp());

    let mut task = PgTask::new(
        &format!("{cluster}-{}", kind.slug()),
        PgTaskSpec {
            cluster: Some(cluster.to_string()),
            payload: TaskPayload::WorkflowMarker { kind, milestones },
            storage: None,
        },
    );
    let labels = task.labels_mut();
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    labels.insert(LABEL_WORKFLOW_ID.to_string(), id.as_str().to_string());
    if let Some(user) = user {
        labels.insert(LABEL_USER.to_string(), user.to_string());
    }

    (id, task)
}

/// Creates the marker for a new workflow and returns its id.
///
/// A completed marker from an earlier run of the same kind is superseded;
/// one that is still in flight blocks the new workflow.
pub async fn begin(
    tasks: &Api<PgTask>,
    cluster: &str,
    kind: WorkflowKind,
    user: Option<&str>,
) -> Result<WorkflowId> {
    let (id, marker) = new_marker(cluster, kind, user);
    let name = marker.name_any();

    match tasks
        .get_opt(&name)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?
    {
        Some(existing) if task_status::blocks_creation(&existing) => {
            return Err(Error::StdError(StdError::TaskInFlight { task: name }));
        }
        Some(_) => {
            debug!(%cluster, marker = %name, "superseding completed workflow marker");
            tasks
                .delete(&name, &DeleteParams::default())
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        }
        None => {}
    }

    tasks
        .create(&PostParams::default(), &marker)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
    info!(%cluster, workflow = %id, kind = %kind, "workflow started");
    Ok(id)
}

/// Stamps `milestone` on the workflow marker.
///
/// The marker is looked up by its id label and anything but exactly one
/// match means the record was lost or duplicated, so the workflow cannot be
/// trusted. Stamping is idempotent: a milestone that is already present
/// keeps its original timestamp. The write carries the marker's resource
/// version, so a concurrent writer surfaces as a conflict instead of being
/// silently overwritten.
pub async fn advance(tasks: &Api<PgTask>, id: &WorkflowId, milestone: Milestone) -> Result<()> {
    let params = ListParams::default().labels(&format!("{LABEL_WORKFLOW_ID}={id}"));
    let found = tasks
        .list(&params)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

    let marker = single_marker(found.items).map_err(|found| {
        Error::StdError(StdError::WorkflowIntegrity { id: id.to_string(), found })
    })?;
    let name = marker.name_any();

    let (kind, mut milestones) = match &marker.spec.payload {
        TaskPayload::WorkflowMarker { kind, milestones } => (*kind, milestones.clone()),
        _ => {
            return Err(Error::StdError(StdError::WorkflowIntegrity {
                id: id.to_string(),
                found: 0,
            }))
        }
    };

    if milestones.contains_key(milestone.key()) {
        debug!(workflow = %id, milestone = milestone.key(), "milestone already stamped");
        return Ok(());
    }
    milestones.insert(milestone.key().to_string(), timestamp());

    let spec = PgTaskSpec {
        cluster: marker.spec.cluster.clone(),
        payload: TaskPayload::WorkflowMarker { kind, milestones },
        storage: marker.spec.storage.clone(),
    };
    let patch = json!({
        "apiVersion": "postgres.solidbase.dev/v1",
        "kind": "PgTask",
        "metadata": {
            "name": name,
            "resourceVersion": marker.resource_version(),
        },
        "spec": spec,
    });

    match tasks
        .patch(&name, &PatchParams::apply(WORKFLOW_FIELD_MANAGER), &Patch::Apply(&patch))
        .await
    {
        Ok(_) => {
            info!(workflow = %id, milestone = milestone.key(), "workflow advanced");
            Ok(())
        }
        Err(kube::Error::Api(err)) if err.code == 409 => {
            Err(Error::StdError(StdError::WriteConflict { name }))
        }
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}

/// Exactly one marker task must carry a given workflow id. Labelled tasks
/// that are not markers do not count.
fn single_marker(items: Vec<PgTask>) -> Result<PgTask, usize> {
    let mut markers: Vec<PgTask> = items
        .into_iter()
        .filter(|t| matches!(t.spec.payload, TaskPayload::WorkflowMarker { .. }))
        .collect();
    if markers.len() == 1 {
        Ok(markers.remove(0))
    } else {
        Err(markers.len())
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_markers_carry_exactly_the_submitted_milestone() {
        let (id, marker) = new_marker("hippo", WorkflowKind::CreateCluster, Some("admin"));

        assert_eq!(marker.name_any(), "hippo-createcluster");
        assert!(Uuid::parse_str(id.as_str()).is_ok());

        let labels = marker.labels();
        assert_eq!(labels.get(LABEL_CLUSTER).map(String::as_str), Some("hippo"));
        assert_eq!(labels.get(LABEL_WORKFLOW_ID).map(String::as_str), Some(id.as_str()));
        assert_eq!(labels.get(LABEL_USER).map(String::as_str), Some("admin"));

        match &marker.spec.payload {
            TaskPayload::WorkflowMarker { kind, milestones } => {
                assert_eq!(*kind, WorkflowKind::CreateCluster);
                assert_eq!(milestones.len(), 1);
                assert!(milestones.contains_key(Milestone::Submitted.key()));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn workflow_ids_are_unique() {
        let (a, _) = new_marker("hippo", WorkflowKind::Upgrade, None);
        let (b, _) = new_marker("hippo", WorkflowKind::Upgrade, None);
        assert_ne!(a, b);
    }

    fn marker_task(name: &str) -> PgTask {
        PgTask::new(
            name,
            PgTaskSpec {
                cluster: Some("hippo".to_string()),
                payload: TaskPayload::WorkflowMarker {
                    kind: WorkflowKind::CreateCluster,
                    milestones: BTreeMap::new(),
                },
                storage: None,
            },
        )
    }

    fn plain_task(name: &str) -> PgTask {
        PgTask::new(
            name,
            PgTaskSpec {
                cluster: Some("hippo".to_string()),
                payload: TaskPayload::DeleteBackups { cluster: "hippo".to_string() },
                storage: None,
            },
        )
    }

    #[test]
    fn one_marker_is_required() {
        assert_eq!(single_marker(vec![]).unwrap_err(), 0);
        assert_eq!(
            single_marker(vec![marker_task("a"), marker_task("b")]).unwrap_err(),
            2
        );

        let found = single_marker(vec![marker_task("a")]).unwrap();
        assert_eq!(found.name_any(), "a");
    }

    #[test]
    fn non_marker_tasks_do_not_count() {
        let found = single_marker(vec![plain_task("x"), marker_task("a")]).unwrap();
        assert_eq!(found.name_any(), "a");

        assert_eq!(single_marker(vec![plain_task("x")]).unwrap_err(), 0);
    }

    #[test]
    fn milestone_keys_are_stable() {
        let keys: Vec<&str> = [
            Milestone::Submitted,
            Milestone::PrimaryCreated,
            Milestone::ClusterCreated,
            Milestone::RestorePrimaryCreated,
            Milestone::Completed,
        ]
        .into_iter()
        .map(Milestone::key)
        .collect();
        assert_eq!(
            keys,
            vec![
                "submitted",
                "primary-created",
                "cluster-created",
                "restore-primary-created",
                "completed"
            ]
        );
    }
}
