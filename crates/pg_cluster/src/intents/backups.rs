//! Backup repository removal, batched over clusters with per-item outcomes.

use kube::{Api, Client};
use serde::{Deserialize, Serialize};

use crate::api::v1::{PgTask, TaskPayload};
use crate::util::errors::Result;

use super::{build_task, default_namespace, submit_task, BatchResult};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DeleteBackupsRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub clusters: Vec<String>,
}

/// Queues a backup-removal task per cluster. A missing cluster record is
/// not an error: backups routinely outlive the cluster they came from, and
/// removing them afterwards is the point of this operation.
pub async fn delete_backups(
    client: &Client,
    req: &DeleteBackupsRequest,
) -> Result<Vec<BatchResult>> {
    let tasks: Api<PgTask> = Api::namespaced(client.clone(), &req.namespace);

    let mut results = Vec::with_capacity(req.clusters.len());
    for cluster in &req.clusters {
        let task = build_task(
            &format!("{cluster}-delete-backups"),
            cluster,
            TaskPayload::DeleteBackups { cluster: cluster.to_string() },
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
