use std::fmt;

use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::info;

use crate::api::v1::{ClusterState, PgCluster};
use crate::util::errors::{Error, Result, StdError};
use crate::util::status::{new_condition, set_status_condition};

// Constants for condition types
pub const SPEC_VALID_CONDITION: &str = "SpecValid";
pub const PROVISIONED_CONDITION: &str = "Provisioned";

// Field manager for status updates
pub const STATUS_FIELD_MANAGER: &str = "pg-cluster-status-manager";

// Status reasons for conditions
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReason {
    SpecAccepted,
    SpecRejected,
    InProgress,
    Completed,
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusReason::SpecAccepted => write!(f, "SpecAccepted"),
            StatusReason::SpecRejected => write!(f, "SpecRejected"),
            StatusReason::InProgress => write!(f, "InProgress"),
            StatusReason::Completed => write!(f, "Completed"),
        }
    }
}

/// Writes PgCluster status updates.
///
/// Every write re-reads the object and patches conditioned on the resource
/// version seen at read time, so a concurrent writer surfaces as
/// `WriteConflict` instead of silently losing an update. Callers retry on
/// their next reconcile.
pub struct ClusterStatusManager {
    api: Api<PgCluster>,
    name: String,
    namespace: String,
}

impl ClusterStatusManager {
    pub fn new(client: &kube::Client, cluster: &PgCluster) -> Result<Self> {
        let namespace = cluster.namespace().ok_or_else(|| {
            Error::StdError(StdError::MetadataMissing(format!(
                "pgcluster {} has no namespace",
                cluster.name_any()
            )))
        })?;
        Ok(Self {
            api: Api::namespaced(client.clone(), &namespace),
            name: cluster.name_any(),
            namespace,
        })
    }

    /// Moves the observed lifecycle state, preserving existing conditions.
    pub async fn update_state(&self, state: ClusterState, message: &str) -> Result<()> {
        let current = self
            .api
            .get(&self.name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        let conditions = current
            .status
            .as_ref()
            .map_or_else(Vec::new, |s| s.conditions.clone());

        let status = json!({
            "conditions": conditions,
            "state": state,
            "message": message,
        });
        self.patch_status_guarded(&current, status).await?;

        info!("Updated cluster {} state to {}", self.name, state);
        Ok(())
    }

    /// Sets the spec validation condition
    pub async fn set_spec_valid(&self, valid: bool, detail: &str) -> Result<()> {
        let (status, reason) = if valid {
            ("True", StatusReason::SpecAccepted)
        } else {
            ("False", StatusReason::SpecRejected)
        };

        self.set_condition(SPEC_VALID_CONDITION, status, reason, detail).await
    }

    /// Sets the provisioned condition
    pub async fn set_provisioned(&self, provisioned: bool) -> Result<()> {
        let (status, reason, message) = if provisioned {
            ("True", StatusReason::Completed, "cluster resources are in place")
        } else {
            ("False", StatusReason::InProgress, "cluster resources are being created")
        };

        self.set_condition(PROVISIONED_CONDITION, status, reason, message).await
    }

    /// Helper method to set a condition
    async fn set_condition(
        &self,
        condition_type: &str,
        status: &str,
        reason: StatusReason,
        message: &str,
    ) -> Result<()> {
        let current = self
            .api
            .get(&self.name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        let current_conditions = current
            .status
            .as_ref()
            .map_or_else(Vec::new, |s| s.conditions.clone());

        let condition = new_condition(
            condition_type,
            status,
            &reason.to_string(),
            message,
            current.metadata.generation,
        );

        let (conditions, changed) = set_status_condition(&current_conditions, condition);
        if !changed {
            return Ok(());
        }

        // Preserve the lifecycle state alongside the merged conditions
        let state = current.status.as_ref().and_then(|s| s.state);
        let message = current.status.as_ref().and_then(|s| s.message.clone());

        let status_body = json!({
            "conditions": conditions,
            "state": state,
            "message": message,
        });
        self.patch_status_guarded(&current, status_body).await?;

        info!("Updated cluster {} condition {} to {}", self.name, condition_type, status);
        Ok(())
    }

    async fn patch_status_guarded(&self, current: &PgCluster, status: serde_json::Value) -> Result<()> {
        let patch = Patch::Apply(json!({
            "apiVersion": "postgres.solidbase.dev/v1",
            "kind": "PgCluster",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "resourceVersion": current.resource_version(),
            },
            "status": status,
        }));

        let patch_params = PatchParams::apply(STATUS_FIELD_MANAGER);

        match self.api.patch_status(&self.name, &patch_params, &patch).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => Err(Error::StdError(StdError::WriteConflict {
                name: self.name.clone(),
            })),
            Err(e) => Err(Error::StdError(StdError::KubeError(e))),
        }
    }
}
