use std::sync::Arc;

use actix_web::web::{Data, Json, Path, Query};
use actix_web::{delete, get, post, HttpResponse};
use kube::Client;
use serde::Deserialize;

use pg_cluster::config::OperatorConfig;
use pg_cluster::intents::backups::DeleteBackupsRequest;
use pg_cluster::intents::cluster::{CreateClusterRequest, DeleteClusterRequest};
use pg_cluster::intents::pgadmin::PgadminRequest;
use pg_cluster::intents::restore::RestoreRequest;
use pg_cluster::intents::scale::{ScaleDownRequest, ScaleRequest};
use pg_cluster::intents::upgrade::{UpgradeBatchRequest, UpgradeRequest};
use pg_cluster::util::errors::{Error, StdError};

use crate::services::intent_service::IntentService;

#[derive(Deserialize)]
pub struct NamespaceParam {
    namespace: Option<String>,
}

impl NamespaceParam {
    fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }
}

/// Every request gets its own client; errors bubble through `ResponseError`
async fn service(config: &Data<Arc<OperatorConfig>>) -> Result<IntentService, Error> {
    let client = Client::try_default()
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
    Ok(IntentService::new(client, config.get_ref().clone()))
}

#[post("/clusters")]
pub async fn create_cluster(
    config: Data<Arc<OperatorConfig>>,
    req: Json<CreateClusterRequest>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.create_cluster(req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[get("/clusters/{name}")]
pub async fn show_cluster(
    config: Data<Arc<OperatorConfig>>,
    name: Path<String>,
    params: Query<NamespaceParam>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.show_cluster(params.namespace(), &name).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[delete("/clusters/{name}")]
pub async fn delete_cluster(
    config: Data<Arc<OperatorConfig>>,
    name: Path<String>,
    params: Query<DeleteClusterRequest>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.delete_cluster(&name, params.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/clusters/{name}/scale")]
pub async fn scale_cluster(
    config: Data<Arc<OperatorConfig>>,
    name: Path<String>,
    req: Json<ScaleRequest>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.scale_cluster(&name, req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/clusters/{name}/scaledown")]
pub async fn scale_down(
    config: Data<Arc<OperatorConfig>>,
    name: Path<String>,
    req: Json<ScaleDownRequest>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.scale_down(&name, req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/clusters/{name}/upgrade")]
pub async fn upgrade_cluster(
    config: Data<Arc<OperatorConfig>>,
    name: Path<String>,
    req: Json<UpgradeRequest>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.upgrade_cluster(&name, &req).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/upgrades")]
pub async fn upgrade_clusters(
    config: Data<Arc<OperatorConfig>>,
    req: Json<UpgradeBatchRequest>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.upgrade_clusters(&req).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/clusters/{name}/restore")]
pub async fn restore_cluster(
    config: Data<Arc<OperatorConfig>>,
    name: Path<String>,
    req: Json<RestoreRequest>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.restore_cluster(&name, &req).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/clusters/{name}/pgadmin")]
pub async fn pgadmin_add(
    config: Data<Arc<OperatorConfig>>,
    name: Path<String>,
    params: Query<NamespaceParam>,
) -> Result<HttpResponse, Error> {
    let req = PgadminRequest {
        namespace: params.namespace().to_string(),
        clusters: vec![name.into_inner()],
    };
    let response = service(&config).await?.pgadmin_add(&req).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[delete("/clusters/{name}/pgadmin")]
pub async fn pgadmin_remove(
    config: Data<Arc<OperatorConfig>>,
    name: Path<String>,
    params: Query<NamespaceParam>,
) -> Result<HttpResponse, Error> {
    let req = PgadminRequest {
        namespace: params.namespace().to_string(),
        clusters: vec![name.into_inner()],
    };
    let response = service(&config).await?.pgadmin_remove(&req).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[delete("/backups")]
pub async fn delete_backups(
    config: Data<Arc<OperatorConfig>>,
    req: Json<DeleteBackupsRequest>,
) -> Result<HttpResponse, Error> {
    let response = service(&config).await?.delete_backups(&req).await?;
    Ok(HttpResponse::Ok().json(response))
}
