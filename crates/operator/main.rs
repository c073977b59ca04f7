use std::sync::Arc;

use pg_cluster::config::OperatorConfig;
use pg_cluster::controllers;
use pg_cluster::util::telemetry;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod handlers;
mod server;
mod services;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let config = Arc::new(OperatorConfig::load()?);
    let shutdown = CancellationToken::new();

    // Initiatilize Kubernetes controller state
    let state = controllers::cluster_controller::State::new(config.clone(), shutdown.clone());
    let replica_state = controllers::replica_controller::State::new(config.clone(), shutdown.clone());
    let task_state = controllers::task_controller::State::new(config.clone(), shutdown.clone());
    let pg_cluster_controller = controllers::cluster_controller::run(state.clone());
    let pg_replica_controller = controllers::replica_controller::run(replica_state.clone());
    let pg_task_controller = controllers::task_controller::run(task_state.clone());

    // Ctrl-C drains the controllers through the shared token
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.cancel();
        }
    });

    // Start web server; all runtimes implement graceful shutdown, so poll until all are done
    let server = server::start_server(state.clone(), config, shutdown);
    tokio::join!(
        pg_cluster_controller,
        pg_replica_controller,
        pg_task_controller,
        server
    )
    .3?;
    Ok(())
}
