//! Provisioning strategies.
//!
//! A strategy turns a cluster record into the Kubernetes resources that run
//! it. The strategy version lives in the cluster spec, so clusters keep the
//! layout they were provisioned with even after a newer strategy ships.

pub mod v1;

use async_trait::async_trait;
use kube::Client;

use crate::api::v1::{PgCluster, PgReplica, StrategyVersion};
use crate::config::OperatorConfig;
use crate::util::errors::{Result, StdError};

#[async_trait]
pub trait ClusterStrategy: std::fmt::Debug + Send + Sync {
    /// Creates the cluster's data volumes without starting any instance.
    /// Bootstrap restores write into these before postgres first runs.
    async fn prepare_volumes(
        &self,
        client: &Client,
        config: &OperatorConfig,
        cluster: &PgCluster,
    ) -> Result<()>;

    /// Creates or updates everything a cluster needs to run: volumes, the
    /// primary deployment, the backup repository and their services.
    async fn provision(
        &self,
        client: &Client,
        config: &OperatorConfig,
        cluster: &PgCluster,
    ) -> Result<()>;

    /// Removes the cluster's runtime resources. Data volumes stay behind
    /// for the delete-data task to judge.
    async fn deprovision(&self, client: &Client, cluster: &PgCluster) -> Result<()>;

    async fn provision_replica(
        &self,
        client: &Client,
        config: &OperatorConfig,
        cluster: &PgCluster,
        replica: &PgReplica,
    ) -> Result<()>;

    async fn deprovision_replica(&self, client: &Client, replica: &PgReplica) -> Result<()>;
}

static V1: v1::CoreStrategy = v1::CoreStrategy;

/// Resolves the strategy a cluster selects. Unknown versions are rejected
/// here, before any resource is touched.
pub fn for_version(version: StrategyVersion) -> Result<&'static dyn ClusterStrategy, StdError> {
    match version {
        StrategyVersion::V1 => Ok(&V1),
        StrategyVersion::Unknown => Err(StdError::UnknownStrategy(version.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_one_resolves() {
        assert!(for_version(StrategyVersion::V1).is_ok());
        assert!(for_version(StrategyVersion::default()).is_ok());
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let err = for_version(StrategyVersion::Unknown).unwrap_err();
        assert!(matches!(err, StdError::UnknownStrategy(_)));
    }

    #[test]
    fn unrecognized_spec_values_deserialize_to_unknown() {
        let version: StrategyVersion = serde_json::from_str("\"9000\"").unwrap();
        assert_eq!(version, StrategyVersion::Unknown);
        assert!(for_version(version).is_err());
    }
}
