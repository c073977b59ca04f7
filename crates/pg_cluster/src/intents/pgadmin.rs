//! pgAdmin attach/detach intents. Both fan out over the named clusters and
//! collect per-item outcomes instead of aborting on the first failure.

use kube::{Api, Client};
use serde::{Deserialize, Serialize};

use crate::api::v1::{PgTask, TaskPayload};
use crate::util::errors::Result;

use super::{build_task, default_namespace, get_cluster, submit_task, BatchResult};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PgadminRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub clusters: Vec<String>,
}

/// Queues a pgAdmin deployment task for every named cluster.
pub async fn pgadmin_add(client: &Client, req: &PgadminRequest) -> Result<Vec<BatchResult>> {
    let tasks: Api<PgTask> = Api::namespaced(client.clone(), &req.namespace);

    let mut results = Vec::with_capacity(req.clusters.len());
    for cluster in &req.clusters {
        let outcome = add_one(client, &tasks, &req.namespace, cluster).await;
        results.push(match outcome {
            Ok(task) => BatchResult::ok(cluster, task),
            Err(e) => BatchResult::failed(cluster, &e),
        });
    }
    Ok(results)
}

async fn add_one(
    client: &Client,
    tasks: &Api<PgTask>,
    namespace: &str,
    cluster: &str,
) -> Result<String> {
    // the handler reads the cluster record, so reject a missing target here
    get_cluster(client, namespace, cluster).await?;

    let task = build_task(
        &format!("{cluster}-pgadmin-add"),
        cluster,
        TaskPayload::PgadminAdd { cluster: cluster.to_string() },
        None,
        None,
    );
    submit_task(tasks, &task).await
}

/// Queues a pgAdmin removal task for every named cluster. The cluster
/// record is not required to still exist: removal works off labels.
pub async fn pgadmin_remove(client: &Client, req: &PgadminRequest) -> Result<Vec<BatchResult>> {
    let tasks: Api<PgTask> = Api::namespaced(client.clone(), &req.namespace);

    let mut results = Vec::with_capacity(req.clusters.len());
    for cluster in &req.clusters {
        let task = build_task(
            &format!("{cluster}-pgadmin-delete"),
            cluster,
            TaskPayload::PgadminDelete { cluster: cluster.to_string() },
            None,
            None,
        );
        results.push(match submit_task(&tasks, &task).await {
            Ok(task) => BatchResult::ok(cluster, task),
            Err(e) => BatchResult::failed(cluster, &e),
        });
    }
    Ok(results)
}
