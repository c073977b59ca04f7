//! Disk usage intent: selects clusters and runs the aggregator against the
//! live pods.

use std::sync::Arc;

use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::v1::PgCluster;
use crate::config::OperatorConfig;
use crate::df::{self, DfTarget, DfVolumeReport, KubeProbe};
use crate::util::errors::{Error, Result, StdError};

/// Measures disk usage across every cluster in the namespace, or across the
/// clusters matching `selector` when one is given. Shutdown clusters have no
/// running pods and contribute nothing.
pub async fn disk_usage(
    client: &Client,
    config: &OperatorConfig,
    namespace: &str,
    selector: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Vec<DfVolumeReport>> {
    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), namespace);
    let mut params = ListParams::default();
    if let Some(selector) = selector {
        params = params.labels(selector);
    }
    let listed = clusters
        .list(&params)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

    let targets: Vec<DfTarget> = listed
        .iter()
        .map(|cluster| DfTarget {
            namespace: namespace.to_string(),
            name: cluster.name_any(),
        })
        .collect();
    debug!("measuring disk usage across {} clusters", targets.len());

    let probe = Arc::new(KubeProbe::new(client.clone()));
    df::aggregate(targets, probe, config.df_concurrency, cancel)
        .await
        .map_err(Error::StdError)
}
