//! Admission pipeline run synchronously before any cluster or task mutation.
//!
//! The pipeline is ordered and the first failing check aborts the whole
//! request with no partial effect. Pure policy checks live in the submodules
//! and are unit-tested exhaustively; the async entry points add the
//! cross-resource lookups. The validating webhook runs the pure pipeline.

pub mod datasource;
pub mod quantity;
pub mod standby;
pub mod storage;
pub mod tls;
pub mod upgrade;

use thiserror::Error;

use crate::api::v1::{PgCluster, PgClusterSpec};
use crate::config::OperatorConfig;
use crate::util::errors::Result;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid quantity {value:?}: {reason}")]
    InvalidQuantity { value: String, reason: String },

    #[error("limit {limit} is lower than the request {request}; the limit must be greater than or equal to the request")]
    LimitBelowRequest { request: String, limit: String },

    #[error("storage configuration {name:?} referenced by {role} was not found in operator policy")]
    UnknownStorageConfig { name: String, role: String },

    #[error("invalid pgBackRest storage type {name:?}; allowed values are \"posix\", \"local\", \"s3\" and \"gcs\"")]
    UnknownStorageType { name: String },

    #[error("pgBackRest storage types s3 and gcs cannot both be selected for one cluster")]
    StorageTypesMutuallyExclusive,

    #[error("AWS S3 configuration is missing; the S3 bucket, endpoint and region must be provided to use the s3 storage type")]
    MissingS3Config,

    #[error("a GCS bucket must be provided to use the gcs storage type")]
    MissingGcsConfig,

    #[error("invalid GCS key type {value:?}; allowed values are \"service\" and \"token\"")]
    InvalidGcsKeyType { value: String },

    #[error("both the TLS secret and CA secret must be set to enable TLS for PostgreSQL")]
    TlsPairIncomplete,

    #[error("TLS-only clusters require both a TLS secret and a CA secret")]
    TlsOnlyWithoutSecrets,

    #[error("both the TLS secret and CA secret must be set to enable certificate-based authentication for replication")]
    ReplicationTlsWithoutSecrets,

    #[error("secret {name:?} was not found")]
    SecretNotFound { name: String },

    #[error("a remote pgBackRest storage type (s3 or gcs) must be selected to create a standby cluster")]
    StandbyRequiresRemoteRepo,

    #[error("a pgBackRest repository path must be specified when creating a standby cluster")]
    StandbyRequiresRepoPath,

    #[error("standby can only be enabled on a shutdown cluster; current state is {state}")]
    StandbyRequiresShutdown { state: String },

    #[error("a cluster to restore from must be specified when providing restore options")]
    RestoreOptsWithoutSource,

    #[error("unable to find PVC {pvc} for cluster {cluster}; cannot restore from the specified data source")]
    DataSourcePvcMissing { pvc: String, cluster: String },

    #[error("unable to find secret {secret} for cluster {cluster}; cannot restore from the specified data source")]
    DataSourceSecretMissing { secret: String, cluster: String },

    #[error("secret {secret} is missing the S3 configuration required to restore from an S3 repository")]
    DataSourceSecretIncomplete { secret: String },

    #[error("unable to restore from cluster {cluster} because it is shutdown")]
    DataSourceShutdown { cluster: String },

    #[error("cluster {cluster} is currently bootstrapping from {source_cluster}; try again once it completes")]
    DataSourceBusy { cluster: String, source_cluster: String },

    #[error("replica count must be at least 1, got {value}")]
    InvalidReplicaCount { value: i32 },

    #[error("operator version {version:?} does not satisfy the upgrade policy (major must equal {required_major}, minor at least {minimum_minor})")]
    UnsupportedOperatorVersion {
        version: String,
        required_major: u32,
        minimum_minor: u32,
    },

    #[error("cannot upgrade from image tag {from:?} to {to:?}")]
    UpgradeTagRejected { from: String, to: String },
}

/// Policy-only admission for a cluster spec, in enforcement order. This is
/// exactly what the validating webhook runs.
pub fn validate_cluster_spec(
    config: &OperatorConfig,
    spec: &PgClusterSpec,
) -> Result<(), ValidationError> {
    quantity::validate_cluster_quantities(config, spec)?;
    storage::validate_storage_references(config, spec)?;
    let repo_types = storage::validate_backrest_repo(config, &spec.backrest_repo)?;
    tls::validate_tls_spec(spec)?;
    if spec.standby {
        standby::validate_standby_create(&repo_types, &spec.backrest_repo.repo_path)?;
    }
    datasource::validate_data_source_shape(spec)?;
    Ok(())
}

/// Full admission for cluster create: the policy checks plus the
/// cross-resource lookups (TLS secret existence, data source readiness).
pub async fn validate_cluster_create(
    client: &kube::Client,
    namespace: &str,
    config: &OperatorConfig,
    spec: &PgClusterSpec,
) -> Result<()> {
    validate_cluster_spec(config, spec)?;
    if let Some(tls) = &spec.tls {
        tls::ensure_tls_secrets(client, namespace, tls).await?;
    }
    if let Some(source) = &spec.data_source {
        datasource::validate_data_source(client, namespace, source).await?;
    }
    Ok(())
}

/// Update admission: the policy checks plus the standby transition gate.
pub fn validate_cluster_update(
    config: &OperatorConfig,
    old: &PgCluster,
    new_spec: &PgClusterSpec,
) -> Result<(), ValidationError> {
    validate_cluster_spec(config, new_spec)?;
    standby::validate_standby_transition(
        old.spec.standby,
        new_spec.standby,
        old.status.as_ref().and_then(|s| s.state),
    )?;
    Ok(())
}
