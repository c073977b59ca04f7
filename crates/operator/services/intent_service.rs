use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;

use pg_cluster::config::OperatorConfig;
use pg_cluster::df::DfVolumeReport;
use pg_cluster::intents::backups::DeleteBackupsRequest;
use pg_cluster::intents::cluster::{
    CreateClusterRequest, CreateClusterResponse, DeleteClusterRequest, DeleteClusterResponse,
    ShowClusterResponse,
};
use pg_cluster::intents::pgadmin::PgadminRequest;
use pg_cluster::intents::restore::{RestoreRequest, RestoreResponse};
use pg_cluster::intents::scale::{ScaleDownRequest, ScaleDownResponse, ScaleRequest, ScaleResponse};
use pg_cluster::intents::upgrade::{UpgradeBatchRequest, UpgradeRequest, UpgradeResponse};
use pg_cluster::intents::{self, BatchResult};
use pg_cluster::util::errors::Result;

/// Service binding the HTTP routes to the intent layer
pub struct IntentService {
    client: Client,
    config: Arc<OperatorConfig>,
}

impl IntentService {
    pub fn new(client: Client, config: Arc<OperatorConfig>) -> Self {
        Self { client, config }
    }

    pub async fn create_cluster(&self, req: CreateClusterRequest) -> Result<CreateClusterResponse> {
        intents::cluster::create_cluster(&self.client, &self.config, req).await
    }

    pub async fn show_cluster(&self, namespace: &str, name: &str) -> Result<ShowClusterResponse> {
        intents::cluster::show_cluster(&self.client, namespace, name).await
    }

    pub async fn delete_cluster(
        &self,
        name: &str,
        req: DeleteClusterRequest,
    ) -> Result<DeleteClusterResponse> {
        intents::cluster::delete_cluster(&self.client, name, req).await
    }

    pub async fn scale_cluster(&self, name: &str, req: ScaleRequest) -> Result<ScaleResponse> {
        intents::scale::scale_cluster(&self.client, &self.config, name, req).await
    }

    pub async fn scale_down(&self, name: &str, req: ScaleDownRequest) -> Result<ScaleDownResponse> {
        intents::scale::scale_down(&self.client, name, req).await
    }

    pub async fn upgrade_cluster(&self, name: &str, req: &UpgradeRequest) -> Result<UpgradeResponse> {
        intents::upgrade::upgrade_cluster(&self.client, &self.config, name, req).await
    }

    pub async fn upgrade_clusters(&self, req: &UpgradeBatchRequest) -> Result<Vec<UpgradeResponse>> {
        intents::upgrade::upgrade_clusters(&self.client, &self.config, req).await
    }

    pub async fn restore_cluster(&self, name: &str, req: &RestoreRequest) -> Result<RestoreResponse> {
        intents::restore::restore_cluster(&self.client, name, req).await
    }

    pub async fn pgadmin_add(&self, req: &PgadminRequest) -> Result<Vec<BatchResult>> {
        intents::pgadmin::pgadmin_add(&self.client, req).await
    }

    pub async fn pgadmin_remove(&self, req: &PgadminRequest) -> Result<Vec<BatchResult>> {
        intents::pgadmin::pgadmin_remove(&self.client, req).await
    }

    pub async fn delete_backups(&self, req: &DeleteBackupsRequest) -> Result<Vec<BatchResult>> {
        intents::backups::delete_backups(&self.client, req).await
    }

    pub async fn disk_usage(
        &self,
        namespace: &str,
        selector: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DfVolumeReport>> {
        intents::df::disk_usage(&self.client, &self.config, namespace, selector, cancel).await
    }
}
