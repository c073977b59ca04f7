use core::fmt;
use std::fmt::Display;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::{conditions_schema, StorageSpec};

pub static PG_CLUSTER_FINALIZER: &str = "pg-cluster.postgres.solidbase.dev";

/// Provisioning strategy discriminator. Every PgCluster selects the concrete
/// implementation that provisions it; absent means "1". Values outside the
/// known set deserialize to `Unknown`, which dispatch rejects explicitly.
#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum StrategyVersion {
    #[default]
    #[serde(rename = "1")]
    V1,
    #[serde(other)]
    Unknown,
}

impl Display for StrategyVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StrategyVersion::V1 => write!(f, "1"),
            StrategyVersion::Unknown => write!(f, "unknown"),
        }
    }
}

/// pgBackRest repository storage backend. `local` is accepted as a spelling
/// of `posix` on input; `s3` and `gcs` are mutually exclusive per cluster.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RepoStorageType {
    Posix,
    S3,
    Gcs,
}

impl RepoStorageType {
    pub fn from_name(name: &str) -> Option<RepoStorageType> {
        match name {
            "posix" | "local" => Some(RepoStorageType::Posix),
            "s3" => Some(RepoStorageType::S3),
            "gcs" => Some(RepoStorageType::Gcs),
            _ => None,
        }
    }

    pub fn is_remote(self) -> bool {
        matches!(self, RepoStorageType::S3 | RepoStorageType::Gcs)
    }
}

impl Display for RepoStorageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RepoStorageType::Posix => write!(f, "posix"),
            RepoStorageType::S3 => write!(f, "s3"),
            RepoStorageType::Gcs => write!(f, "gcs"),
        }
    }
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum ServiceKind {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceKind::ClusterIP => write!(f, "ClusterIP"),
            ServiceKind::NodePort => write!(f, "NodePort"),
            ServiceKind::LoadBalancer => write!(f, "LoadBalancer"),
        }
    }
}

/// Observed lifecycle state of a PgCluster. This is the single source of
/// truth the cross-resource validators consult (standby transitions, data
/// source admission).
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClusterState {
    Created,
    Processed,
    Initialized,
    Bootstrapping,
    Bootstrapped,
    Restoring,
    Shutdown,
}

impl Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClusterState::Created => write!(f, "Created"),
            ClusterState::Processed => write!(f, "Processed"),
            ClusterState::Initialized => write!(f, "Initialized"),
            ClusterState::Bootstrapping => write!(f, "Bootstrapping"),
            ClusterState::Bootstrapped => write!(f, "Bootstrapped"),
            ClusterState::Restoring => write!(f, "Restoring"),
            ClusterState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// TLS secret references. `server_secret` follows the kubernetes.io/tls
/// format (tls.crt / tls.key); `ca_secret` must contain at least ca.crt.
/// The replication secret enables certificate auth between replicas and
/// must be signed by the same CA.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TlsSpec {
    #[serde(default)]
    pub server_secret: String,
    #[serde(default)]
    pub ca_secret: String,
    #[serde(default)]
    pub replication_secret: Option<String>,
}

impl TlsSpec {
    pub fn is_enabled(&self) -> bool {
        !self.server_secret.is_empty() && !self.ca_secret.is_empty()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct S3RepoConfig {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct GcsRepoConfig {
    #[serde(default)]
    pub bucket: String,
    /// Credential type, `service` or `token`
    #[serde(default = "default_gcs_key_type")]
    pub key_type: String,
}

fn default_gcs_key_type() -> String {
    "service".to_string()
}

impl Default for GcsRepoConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            key_type: default_gcs_key_type(),
        }
    }
}

/// pgBackRest repository configuration. `storage_types` holds the raw
/// requested names; validation normalizes and type-checks them before any
/// task is admitted.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BackrestRepoSpec {
    #[serde(default)]
    pub storage_types: Vec<String>,
    #[serde(default)]
    pub repo_path: String,
    #[serde(default)]
    pub s3: Option<S3RepoConfig>,
    #[serde(default)]
    pub gcs: Option<GcsRepoConfig>,
}

/// Bootstrap-from-existing-backup source.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DataSourceSpec {
    /// Cluster whose pgBackRest repository seeds this cluster
    #[serde(default)]
    pub restore_from: String,
    /// Extra pgBackRest restore options, e.g. `--repo-type=s3`
    #[serde(default)]
    pub restore_opts: String,
}

/// Container resource request/limit pairs, as quantity strings. Empty means
/// "use the operator policy default" for requests and "unset" for limits.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceRequirementsSpec {
    #[serde(default)]
    pub cpu_request: String,
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub memory_request: String,
    #[serde(default)]
    pub memory_limit: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TablespaceSpec {
    pub name: String,
    #[serde(default)]
    pub storage: StorageSpec,
}

/// Generate the Kubernetes wrapper struct `PgCluster` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "PgCluster", group = "postgres.solidbase.dev", version = "v1", namespaced)]
#[kube(status = "PgClusterStatus", shortname = "pgc")]
pub struct PgClusterSpec {
    /// Database image tag, `<flavor>-<pg major.minor[.patch]>-<build>`
    #[serde(default = "default_postgres_image_tag")]
    pub postgres_image_tag: String,
    #[serde(default)]
    pub strategy: StrategyVersion,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub service_type: ServiceKind,

    #[serde(default)]
    pub primary_storage: StorageSpec,
    #[serde(default)]
    pub replica_storage: Option<StorageSpec>,
    #[serde(default)]
    pub wal_storage: Option<StorageSpec>,
    #[serde(default)]
    pub backrest_storage: StorageSpec,
    #[serde(default)]
    pub tablespaces: Vec<TablespaceSpec>,
    #[serde(default)]
    pub pgadmin_storage: Option<StorageSpec>,

    #[serde(default)]
    pub resources: ResourceRequirementsSpec,
    #[serde(default)]
    pub backrest_resources: ResourceRequirementsSpec,

    #[serde(default)]
    pub tls: Option<TlsSpec>,
    /// Reject plain connections; requires `tls`
    #[serde(default)]
    pub tls_only: bool,

    #[serde(default)]
    pub backrest_repo: BackrestRepoSpec,

    /// Replicate from the remote backup repository instead of accepting writes
    #[serde(default)]
    pub standby: bool,

    /// Scale the runtime down to nothing while keeping every volume. The
    /// only route into the Shutdown state, and the precondition for
    /// enabling standby mode.
    #[serde(default)]
    pub shutdown: bool,

    #[serde(default)]
    pub data_source: Option<DataSourceSpec>,
}

fn default_postgres_image_tag() -> String {
    "rocky8-16.4-1.2.0".to_string()
}

/// The status object of `PgCluster`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct PgClusterStatus {
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    pub state: Option<ClusterState>,
    pub message: Option<String>,
}
