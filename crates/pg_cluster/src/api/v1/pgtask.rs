use core::fmt;
use std::collections::BTreeMap;
use std::fmt::Display;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::StorageSpec;

/// Kind of multi-step operation a workflow marker tracks.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    CreateCluster,
    Upgrade,
    Restore,
}

impl WorkflowKind {
    /// Suffix of the marker task name, `<cluster>-<slug>`
    pub fn slug(self) -> &'static str {
        match self {
            WorkflowKind::CreateCluster => "createcluster",
            WorkflowKind::Upgrade => "upgrade-workflow",
            WorkflowKind::Restore => "restore-workflow",
        }
    }
}

impl Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// The typed payload of a PgTask. The serde tag doubles as the task-type
/// discriminator used in labels and metrics, so every handler receives a
/// statically known shape while storage keeps one generic record kind.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaskPayload {
    DeleteData {
        cluster: String,
        #[serde(default)]
        replica: Option<String>,
        #[serde(default)]
        delete_data: bool,
        #[serde(default)]
        delete_backups: bool,
        #[serde(default)]
        is_replica: bool,
        #[serde(default)]
        is_backup: bool,
    },
    DeleteBackups {
        cluster: String,
    },
    Upgrade {
        cluster: String,
        image_tag: String,
        operator_version: String,
        #[serde(default)]
        user: Option<String>,
    },
    AddPolicies {
        cluster: String,
        policies: Vec<String>,
    },
    PgadminAdd {
        cluster: String,
    },
    PgadminDelete {
        cluster: String,
    },
    /// Progress record for one logical multi-step operation; carries
    /// milestone timestamps rather than work of its own
    WorkflowMarker {
        kind: WorkflowKind,
        #[serde(default)]
        milestones: BTreeMap<String, String>,
    },
    Dump {
        cluster: String,
    },
    Restore {
        cluster: String,
        #[serde(default)]
        backup_path: Option<String>,
        #[serde(default)]
        pitr_target: Option<String>,
    },
}

impl TaskPayload {
    /// Stable discriminator, identical to the serde tag
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskPayload::DeleteData { .. } => "delete-data",
            TaskPayload::DeleteBackups { .. } => "delete-backups",
            TaskPayload::Upgrade { .. } => "upgrade",
            TaskPayload::AddPolicies { .. } => "add-policies",
            TaskPayload::PgadminAdd { .. } => "pgadmin-add",
            TaskPayload::PgadminDelete { .. } => "pgadmin-delete",
            TaskPayload::WorkflowMarker { .. } => "workflow-marker",
            TaskPayload::Dump { .. } => "dump",
            TaskPayload::Restore { .. } => "restore",
        }
    }

    /// Cluster the task operates on, when it targets exactly one
    pub fn cluster(&self) -> Option<&str> {
        match self {
            TaskPayload::DeleteData { cluster, .. }
            | TaskPayload::DeleteBackups { cluster }
            | TaskPayload::Upgrade { cluster, .. }
            | TaskPayload::AddPolicies { cluster, .. }
            | TaskPayload::PgadminAdd { cluster }
            | TaskPayload::PgadminDelete { cluster }
            | TaskPayload::Dump { cluster }
            | TaskPayload::Restore { cluster, .. } => Some(cluster),
            TaskPayload::WorkflowMarker { .. } => None,
        }
    }
}

/// Status vocabulary of a task record. `Requested` at creation; `Submitted`
/// once the dispatcher has accepted the record; terminal states are
/// `Completed` and `Failed`. A failed task is never retried implicitly.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TaskState {
    #[default]
    Requested,
    Submitted,
    Completed,
    Failed,
}

impl Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskState::Requested => write!(f, "Requested"),
            TaskState::Submitted => write!(f, "Submitted"),
            TaskState::Completed => write!(f, "Completed"),
            TaskState::Failed => write!(f, "Failed"),
        }
    }
}

/// The generic unit of work. `metadata.name` is the at-most-one-in-flight
/// key: a second task of the same name is rejected while the first is not
/// yet completed.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "PgTask", group = "postgres.solidbase.dev", version = "v1", namespaced)]
#[kube(status = "PgTaskStatus", shortname = "pgt")]
pub struct PgTaskSpec {
    /// Owning cluster; unset only for records that target no single cluster
    #[serde(default)]
    pub cluster: Option<String>,
    pub payload: TaskPayload,
    /// Set when the task itself provisions storage (dump tasks)
    #[serde(default)]
    pub storage: Option<StorageSpec>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct PgTaskStatus {
    #[serde(default)]
    pub state: TaskState,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    #[test]
    fn payload_tag_matches_task_type() {
        let payload = TaskPayload::DeleteData {
            cluster: "alpha".to_string(),
            replica: Some("alpha-jfjk".to_string()),
            delete_data: true,
            delete_backups: false,
            is_replica: true,
            is_backup: false,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], payload.task_type());
        assert_json_include!(
            actual: value,
            expected: json!({
                "type": "delete-data",
                "cluster": "alpha",
                "replica": "alpha-jfjk",
                "delete_data": true,
            })
        );
    }

    #[test]
    fn workflow_marker_round_trips_milestones() {
        let raw = json!({
            "type": "workflow-marker",
            "kind": "create-cluster",
            "milestones": { "submitted": "2025-06-01T10:00:00Z" }
        });
        let payload: TaskPayload = serde_json::from_value(raw).unwrap();
        match &payload {
            TaskPayload::WorkflowMarker { kind, milestones } => {
                assert_eq!(*kind, WorkflowKind::CreateCluster);
                assert_eq!(milestones.len(), 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(payload.task_type(), "workflow-marker");
        assert_eq!(payload.cluster(), None);
    }

    #[test]
    fn default_task_state_is_requested() {
        let status = PgTaskStatus::default();
        assert_eq!(status.state, TaskState::Requested);
    }
}
