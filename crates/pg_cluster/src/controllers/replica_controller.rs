use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        watcher::{self, Config},
    },
    Resource,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::api::v1::{
    ClusterState, PgCluster, PgReplica, ReplicaState, StrategyVersion, PG_REPLICA_FINALIZER,
};
use crate::config::OperatorConfig;
use crate::strategies;
use crate::util::errors::{Error, ErrorWithRequeue, Result, StdError};
use crate::util::{errors, metrics, telemetry};

pub const FIELD_MANAGER: &str = "pg-replica-controller";

impl PgReplica {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, errors::Error> {
        match self.deploy(ctx).await {
            Err(errors::Error::ErrorWithRequeue(error)) => Ok(Action::requeue(error.duration)),
            other => other,
        }
    }

    async fn deploy(&self, ctx: Arc<Context>) -> Result<Action> {
        let client = ctx.client.clone();
        let namespace = self.namespace().unwrap(); // PgReplica is namespace scoped
        let name = self.name_any();

        let Some(state) = self.status.as_ref().and_then(|s| s.state) else {
            self.set_state(&client, ReplicaState::Created, "replica record accepted").await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        };

        // The owning cluster carries the strategy and the storage defaults,
        // so nothing proceeds until it exists.
        let clusters: Api<PgCluster> = Api::namespaced(client.clone(), &namespace);
        let cluster = clusters
            .get_opt(&self.spec.cluster)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        let Some(cluster) = cluster else {
            info!(
                "replica {}/{} waits for cluster {}",
                namespace, name, self.spec.cluster
            );
            return Err(Error::ErrorWithRequeue(ErrorWithRequeue::new(
                StdError::NotFound {
                    kind: "pgcluster",
                    name: self.spec.cluster.clone(),
                },
                Duration::from_secs(30),
            )));
        };

        // A shutdown cluster has its deployments scaled away; creating a
        // replica deployment now would resurrect half the cluster.
        let cluster_state = cluster.status.as_ref().and_then(|s| s.state);
        if cluster.spec.shutdown || cluster_state == Some(ClusterState::Shutdown) {
            info!(
                "replica {}/{} held back: cluster {} is shutdown",
                namespace, name, self.spec.cluster
            );
            return Ok(Action::await_change());
        }

        let strategy = match strategies::for_version(cluster.spec.strategy.clone()) {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!("replica {}/{} has no usable strategy: {}", namespace, name, e);
                return Ok(Action::await_change());
            }
        };

        strategy
            .provision_replica(&client, &ctx.config, &cluster, self)
            .await?;

        if state != ReplicaState::Processed {
            self.set_state(&client, ReplicaState::Processed, "replica deployed").await?;
        }
        Ok(Action::requeue(Duration::from_secs(5 * 60)))
    }

    async fn set_state(&self, client: &Client, state: ReplicaState, message: &str) -> Result<()> {
        let namespace = self.namespace().unwrap();
        let name = self.name_any();
        let replicas: Api<PgReplica> = Api::namespaced(client.clone(), &namespace);

        let current = replicas
            .get(&name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        let patch = Patch::Apply(json!({
            "apiVersion": "postgres.solidbase.dev/v1",
            "kind": "PgReplica",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "resourceVersion": current.resource_version(),
            },
            "status": {
                "state": state,
                "message": message,
            },
        }));

        match replicas
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &patch)
            .await
        {
            Ok(_) => {
                info!("Updated replica {} state to {}", name, state);
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                Err(Error::StdError(StdError::WriteConflict { name }))
            }
            Err(e) => Err(Error::StdError(StdError::KubeError(e))),
        }
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>, oref: &ObjectReference) -> Result<Action> {
        let name = self.name_any();

        // the owning cluster may already be gone, so cleanup runs through
        // the default strategy instead of reading the cluster's
        strategies::for_version(StrategyVersion::default())
            .map_err(Error::StdError)?
            .deprovision_replica(&ctx.client, self)
            .await?;

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!("Delete `{name}`")),
                    action: "Deleting".into(),
                    secondary: None,
                },
                oref,
            )
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        Ok(Action::await_change())
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Metrics handles, registered on the registry above
    metrics: metrics::Metrics,
    /// Operator policy, loaded once at startup
    config: Arc<OperatorConfig>,
    /// Shutdown signal shared by every controller
    shutdown: CancellationToken,
}

impl Default for State {
    fn default() -> Self {
        let registry = prometheus::Registry::default();
        let metrics = metrics::Metrics::default().register(&registry).unwrap();
        Self {
            diagnostics: Default::default(),
            registry,
            metrics,
            config: Default::default(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(config: Arc<OperatorConfig>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            shutdown,
            ..Default::default()
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.child_token(),
        })
    }
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: metrics::Metrics,
    /// Operator policy
    pub config: Arc<OperatorConfig>,
    /// Cancelled when the operator is shutting down
    pub shutdown: CancellationToken,
}

#[instrument(skip(ctx, replica), fields(trace_id))]
pub async fn reconcile(replica: Arc<PgReplica>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure("replica");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = replica.namespace().unwrap(); // PgReplica is namespace scoped
    let replicas: Api<PgReplica> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling PgReplica \"{}\" in {}", replica.name_any(), ns);
    finalizer(&replicas, PG_REPLICA_FINALIZER, replica.clone(), |event| async {
        match event {
            Finalizer::Apply(replica) => replica.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(replica) => {
                replica.cleanup(ctx.clone(), &replica.object_ref(&())).await
            }
        }
    })
    .await
    .map_err(|e| {
        error!("Failed to reconcile PgReplica: {}", e);
        Error::StdError(StdError::FinalizerError(Box::new(e)))
    })
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "pg-replica-controller".into(),
        }
    }
}
impl Diagnostics {
    pub(crate) fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

fn error_policy(replica: Arc<PgReplica>, error: &errors::Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_replica_failure(&replica, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let replicas = Api::<PgReplica>::all(client.clone());
    if let Err(e) = replicas.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let shutdown = state.shutdown.clone();
    Controller::new(replicas, Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
