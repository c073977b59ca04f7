use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::info;

use crate::api::v1::{PgTask, TaskState};
use crate::util::errors::{Error, Result, StdError};

// Field manager for status updates
pub const TASK_STATUS_FIELD_MANAGER: &str = "pg-task-status-manager";

/// Returns true when an existing task blocks creating a replacement with the
/// same name. Only a Completed task may be superseded; a Failed one stays
/// until an operator inspects and deletes it.
pub fn blocks_creation(existing: &PgTask) -> bool {
    existing
        .status
        .as_ref()
        .map_or(true, |s| s.state != TaskState::Completed)
}

/// Returns true when the dispatcher already drove this task to a terminal
/// state and a redelivered event can be dropped.
pub fn is_terminal(task: &PgTask) -> bool {
    matches!(
        task.status.as_ref().map(|s| s.state),
        Some(TaskState::Completed | TaskState::Failed)
    )
}

/// Writes PgTask status updates, conditioned on the resource version seen at
/// read time. A concurrent writer surfaces as `WriteConflict`.
pub struct TaskStatusManager {
    api: Api<PgTask>,
    name: String,
    namespace: String,
}

impl TaskStatusManager {
    pub fn new(client: &kube::Client, task: &PgTask) -> Result<Self> {
        let namespace = task.namespace().ok_or_else(|| {
            Error::StdError(StdError::MetadataMissing(format!(
                "pgtask {} has no namespace",
                task.name_any()
            )))
        })?;
        Ok(Self {
            api: Api::namespaced(client.clone(), &namespace),
            name: task.name_any(),
            namespace,
        })
    }

    pub async fn update_state(&self, state: TaskState, message: &str) -> Result<()> {
        let current = self
            .api
            .get(&self.name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        let patch = Patch::Apply(json!({
            "apiVersion": "postgres.solidbase.dev/v1",
            "kind": "PgTask",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "resourceVersion": current.resource_version(),
            },
            "status": {
                "state": state,
                "message": message,
            }
        }));

        let patch_params = PatchParams::apply(TASK_STATUS_FIELD_MANAGER);

        match self.api.patch_status(&self.name, &patch_params, &patch).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 409 => {
                return Err(Error::StdError(StdError::WriteConflict {
                    name: self.name.clone(),
                }));
            }
            Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
        }

        info!("Updated task {} state to {:?}", self.name, state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::{PgTaskSpec, PgTaskStatus, TaskPayload};

    fn task_with_state(state: Option<TaskState>) -> PgTask {
        let mut task = PgTask::new(
            "acid-rmdata",
            PgTaskSpec {
                cluster: Some("acid".to_string()),
                payload: TaskPayload::DeleteBackups {
                    cluster: "acid".to_string(),
                },
                storage: None,
            },
        );
        task.status = state.map(|state| PgTaskStatus { state, message: None });
        task
    }

    #[test]
    fn unprocessed_task_blocks_creation() {
        assert!(blocks_creation(&task_with_state(None)));
        assert!(blocks_creation(&task_with_state(Some(TaskState::Requested))));
        assert!(blocks_creation(&task_with_state(Some(TaskState::Submitted))));
    }

    #[test]
    fn failed_task_blocks_creation_until_deleted() {
        let failed = task_with_state(Some(TaskState::Failed));
        assert!(blocks_creation(&failed));
        assert!(is_terminal(&failed));
    }

    #[test]
    fn completed_task_may_be_superseded() {
        let completed = task_with_state(Some(TaskState::Completed));
        assert!(!blocks_creation(&completed));
        assert!(is_terminal(&completed));
    }

    #[test]
    fn in_flight_task_is_not_terminal() {
        assert!(!is_terminal(&task_with_state(None)));
        assert!(!is_terminal(&task_with_state(Some(TaskState::Submitted))));
    }
}
