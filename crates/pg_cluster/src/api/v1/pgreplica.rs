use core::fmt;
use std::fmt::Display;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::StorageSpec;

pub static PG_REPLICA_FINALIZER: &str = "pg-replica.postgres.solidbase.dev";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ReplicaState {
    Created,
    Processed,
}

impl Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReplicaState::Created => write!(f, "Created"),
            ReplicaState::Processed => write!(f, "Processed"),
        }
    }
}

/// One additional read instance of a PgCluster. Created in a batch on scale
/// up; removed through a delete-data task on scale down.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "PgReplica", group = "postgres.solidbase.dev", version = "v1", namespaced)]
#[kube(status = "PgReplicaStatus", shortname = "pgr")]
pub struct PgReplicaSpec {
    pub cluster: String,
    /// Overrides the cluster's replica storage when set
    #[serde(default)]
    pub storage: Option<StorageSpec>,
    /// Node selector in `key=value` form, pinning this replica to a node
    #[serde(default)]
    pub node_label: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct PgReplicaStatus {
    pub state: Option<ReplicaState>,
    pub message: Option<String>,
}
