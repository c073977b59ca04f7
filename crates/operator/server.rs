use std::sync::Arc;

use actix_web::{middleware, web::Data, App, HttpServer};
use anyhow::Result;
use pg_cluster::config::OperatorConfig;
use tokio_util::sync::CancellationToken;

use crate::handlers::{clusters, df, health, metrics};

/// Configure and start the HTTP server
pub async fn start_server(
    cluster_state: pg_cluster::controllers::cluster_controller::State,
    config: Arc<OperatorConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(cluster_state.clone()))
            .app_data(Data::new(config.clone()))
            .app_data(Data::new(shutdown.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health::index)
            .service(health::health)
            .service(metrics::metrics)
            .service(clusters::create_cluster)
            .service(clusters::show_cluster)
            .service(clusters::delete_cluster)
            .service(clusters::scale_cluster)
            .service(clusters::scale_down)
            .service(clusters::upgrade_cluster)
            .service(clusters::upgrade_clusters)
            .service(clusters::restore_cluster)
            .service(clusters::pgadmin_add)
            .service(clusters::pgadmin_remove)
            .service(clusters::delete_backups)
            .service(df::df)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5);

    server.run().await?;
    Ok(())
}
