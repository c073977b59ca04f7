use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod pgcluster;
pub mod pgreplica;
pub mod pgtask;

pub use pgcluster::{
    BackrestRepoSpec, ClusterState, DataSourceSpec, GcsRepoConfig, PgCluster, PgClusterSpec,
    PgClusterStatus, RepoStorageType, ResourceRequirementsSpec, S3RepoConfig, ServiceKind,
    StrategyVersion, TablespaceSpec, TlsSpec, PG_CLUSTER_FINALIZER,
};
pub use pgreplica::{PgReplica, PgReplicaSpec, PgReplicaStatus, ReplicaState, PG_REPLICA_FINALIZER};
pub use pgtask::{PgTask, PgTaskSpec, PgTaskStatus, TaskPayload, TaskState, WorkflowKind};

/// Label taxonomy shared by every resource this operator manages. The same
/// keys serve identity (who owns what) and selection (what the dispatcher
/// and the disk-usage aggregator list by).
pub static LABEL_CLUSTER: &str = "postgres.solidbase.dev/cluster";
pub static LABEL_WORKFLOW_ID: &str = "postgres.solidbase.dev/workflow-id";
pub static LABEL_TASK_TYPE: &str = "postgres.solidbase.dev/task-type";
pub static LABEL_USER: &str = "postgres.solidbase.dev/user";
pub static LABEL_OPERATOR_VERSION: &str = "postgres.solidbase.dev/operator-version";
pub static LABEL_RMDATA: &str = "postgres.solidbase.dev/rmdata";

/// Pod-facing labels, stamped by the provisioning strategy and consumed by
/// the disk-usage aggregator.
pub static LABEL_ROLE: &str = "postgres.solidbase.dev/role";
pub static LABEL_BACKREST_REPO: &str = "postgres.solidbase.dev/backrest-repo";
pub static LABEL_BOOTSTRAP: &str = "postgres.solidbase.dev/bootstrap";
pub static LABEL_DEPLOYMENT_NAME: &str = "postgres.solidbase.dev/deployment-name";

pub static ROLE_PRIMARY: &str = "primary";
pub static ROLE_REPLICA: &str = "replica";
pub static LABEL_TRUE: &str = "true";

pub static ANNOTATION_POLICIES: &str = "postgres.solidbase.dev/policies";

/// Annotations a backup-repository credential secret must carry when the
/// repository includes an s3 storage type.
pub static ANNOTATION_S3_BUCKET: &str = "postgres.solidbase.dev/s3-bucket";
pub static ANNOTATION_S3_ENDPOINT: &str = "postgres.solidbase.dev/s3-endpoint";
pub static ANNOTATION_S3_REGION: &str = "postgres.solidbase.dev/s3-region";

/// Data keys for the s3 credential material in the repository secret.
pub static SECRET_KEY_S3_KEY: &str = "aws-s3-key";
pub static SECRET_KEY_S3_KEY_SECRET: &str = "aws-s3-key-secret";

/// The PVC backing a cluster's pgBackRest repository.
pub fn backrest_repo_pvc_name(cluster: &str) -> String {
    format!("{cluster}-pgbr-repo")
}

/// The secret holding a cluster's pgBackRest repository credentials.
pub fn backrest_repo_secret_name(cluster: &str) -> String {
    format!("{cluster}-backrest-repo-config")
}

/// Storage shape for a persistent volume claim. `name` refers to a named
/// storage configuration in operator policy; set fields override the
/// configuration they draw defaults from.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct StorageSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default = "default_access_mode")]
    pub access_mode: String,
    #[serde(default = "default_storage_size")]
    pub size: String,
}

fn default_access_mode() -> String {
    "ReadWriteOnce".to_string()
}
fn default_storage_size() -> String {
    "1Gi".to_string()
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            name: None,
            storage_class: None,
            access_mode: default_access_mode(),
            size: default_storage_size(),
        }
    }
}

pub fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    }))
    .unwrap()
}
