//! Minor-version upgrade intents. The task handler moves the cluster record
//! onto the new image tag; the provisioning strategy rolls the deployments.

use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::v1::{PgTask, TaskPayload, WorkflowKind, LABEL_OPERATOR_VERSION};
use crate::config::{OperatorConfig, OPERATOR_VERSION};
use crate::util::errors::Result;
use crate::validation::upgrade::{validate_operator_version, validate_upgrade_tag};
use crate::workflow;

use super::{build_task, default_namespace, get_cluster, submit_task};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UpgradeRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Image tag to move the cluster onto
    pub image_tag: String,
    /// Skip the version compatibility checks
    #[serde(default)]
    pub ignore_validation: bool,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct UpgradeResponse {
    pub cluster: String,
    pub task: String,
    pub workflow_id: String,
}

/// Admits and queues an upgrade for one cluster.
///
/// The cluster's recorded operator version gates the request: a cluster
/// this operator version has not reconciled (missing or older label) is
/// rejected until it catches up, unless the caller opts out.
pub async fn upgrade_cluster(
    client: &Client,
    config: &OperatorConfig,
    name: &str,
    req: &UpgradeRequest,
) -> Result<UpgradeResponse> {
    let cluster = get_cluster(client, &req.namespace, name).await?;

    if !req.ignore_validation {
        let recorded = cluster
            .labels()
            .get(LABEL_OPERATOR_VERSION)
            .map(String::as_str)
            .unwrap_or("");
        validate_operator_version(&config.upgrade, recorded)?;
        validate_upgrade_tag(&cluster.spec.postgres_image_tag, &req.image_tag)?;
    }

    let tasks: Api<PgTask> = Api::namespaced(client.clone(), &req.namespace);
    let workflow_id =
        workflow::begin(&tasks, name, WorkflowKind::Upgrade, req.user.as_deref()).await?;

    let task = build_task(
        &format!("{name}-upgrade"),
        name,
        TaskPayload::Upgrade {
            cluster: name.to_string(),
            image_tag: req.image_tag.clone(),
            operator_version: OPERATOR_VERSION.to_string(),
            user: req.user.clone(),
        },
        Some(&workflow_id),
        req.user.as_deref(),
    );
    let task = submit_task(&tasks, &task).await?;

    info!("Queued upgrade of cluster '{}' to '{}'", name, req.image_tag);
    Ok(UpgradeResponse {
        cluster: name.to_string(),
        task,
        workflow_id: workflow_id.to_string(),
    })
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UpgradeBatchRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub clusters: Vec<String>,
    pub image_tag: String,
    #[serde(default)]
    pub ignore_validation: bool,
    #[serde(default)]
    pub user: Option<String>,
}

/// Queues the upgrade for every named cluster, aborting on the first
/// failure. Clusters earlier in the list keep their queued tasks; the
/// caller re-submits the remainder once the failure is resolved.
pub async fn upgrade_clusters(
    client: &Client,
    config: &OperatorConfig,
    req: &UpgradeBatchRequest,
) -> Result<Vec<UpgradeResponse>> {
    let single = UpgradeRequest {
        namespace: req.namespace.clone(),
        image_tag: req.image_tag.clone(),
        ignore_validation: req.ignore_validation,
        user: req.user.clone(),
    };

    let mut results = Vec::with_capacity(req.clusters.len());
    for cluster in &req.clusters {
        results.push(upgrade_cluster(client, config, cluster, &single).await?);
    }
    Ok(results)
}
