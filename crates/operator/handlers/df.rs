use std::sync::Arc;

use actix_web::web::{Data, Query};
use actix_web::{get, HttpResponse};
use kube::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use pg_cluster::config::OperatorConfig;
use pg_cluster::controllers::cluster_controller::State;
use pg_cluster::util::errors::{Error, StdError};

use crate::services::intent_service::IntentService;

#[derive(Deserialize)]
pub struct DfParams {
    namespace: Option<String>,
    /// Label selector narrowing which clusters are measured
    selector: Option<String>,
}

/// Synchronous disk usage aggregation over the selected clusters
#[get("/df")]
pub async fn df(
    state: Data<State>,
    config: Data<Arc<OperatorConfig>>,
    shutdown: Data<CancellationToken>,
    params: Query<DfParams>,
) -> Result<HttpResponse, Error> {
    let client = Client::try_default()
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
    let service = IntentService::new(client, config.get_ref().clone());

    let _timer = state.df_timer();
    let reports = service
        .disk_usage(
            params.namespace.as_deref().unwrap_or("default"),
            params.selector.as_deref(),
            shutdown.get_ref(),
        )
        .await?;
    Ok(HttpResponse::Ok().json(reports))
}
