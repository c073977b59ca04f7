use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::{
    api::{Api, ListParams, ResourceExt},
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
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::api::v1::{
    ClusterState, DataSourceSpec, PgCluster, PgTask, LABEL_WORKFLOW_ID, PG_CLUSTER_FINALIZER,
};
use crate::config::OperatorConfig;
use crate::strategies::{self, ClusterStrategy};
use crate::tasks::jobs;
use crate::util::cluster_status::ClusterStatusManager;
use crate::util::errors::{Error, Result, StdError};
use crate::util::{errors, metrics, telemetry};
use crate::validation::validate_cluster_spec;
use crate::workflow::{self, Milestone, WorkflowId};

/// How often a healthy cluster is re-examined for drift.
const RESYNC: Duration = Duration::from_secs(5 * 60);

impl PgCluster {
    // Reconcile (for non-finalizer related changes)
    pub async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, errors::Error> {
        match self.drive_lifecycle(&ctx).await {
            // A concurrent status writer (a task handler moving the cluster
            // into Restoring) won the CAS; the next pass reads fresh state.
            Err(Error::StdError(StdError::WriteConflict { name })) => {
                debug!("status write on {} conflicted; retrying shortly", name);
                Ok(Action::requeue(Duration::from_secs(2)))
            }
            Err(Error::ErrorWithRequeue(e)) => {
                warn!("reconcile of {} requeued: {}", self.name_any(), e);
                Ok(Action::requeue(e.duration))
            }
            other => other,
        }
    }

    async fn drive_lifecycle(&self, ctx: &Context) -> Result<Action> {
        let client = ctx.client.clone();
        let namespace = self.namespace().unwrap(); // PgCluster is namespace scoped
        let name = self.name_any();

        let status_manager = ClusterStatusManager::new(&client, self)?;

        // First sight of the record: stamp the initial state and come back
        // with a status to drive from.
        let Some(state) = self.status.as_ref().and_then(|s| s.state) else {
            status_manager
                .update_state(ClusterState::Created, "cluster record accepted")
                .await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        };

        if let Err(e) = validate_cluster_spec(&ctx.config, &self.spec) {
            warn!("cluster {}/{} rejected: {}", namespace, name, e);
            status_manager.set_spec_valid(false, &e.to_string()).await?;
            return Ok(Action::await_change());
        }

        let strategy = match strategies::for_version(self.spec.strategy.clone()) {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!("cluster {}/{} selects no usable strategy: {}", namespace, name, e);
                status_manager.set_spec_valid(false, &e.to_string()).await?;
                return Ok(Action::await_change());
            }
        };
        status_manager.set_spec_valid(true, "spec accepted").await?;

        // Shutdown tears the runtime down but keeps every volume; clearing
        // the flag again is handled by the Shutdown arm below.
        if self.spec.shutdown {
            if state != ClusterState::Shutdown {
                info!("Scaling cluster {}/{} down to zero", namespace, name);
                strategy.deprovision(&client, self).await?;
                status_manager.set_provisioned(false).await?;
                status_manager
                    .update_state(ClusterState::Shutdown, "cluster is shutdown")
                    .await?;
            }
            return Ok(Action::await_change());
        }

        match state {
            ClusterState::Created => {
                if let Some(source) = &self.spec.data_source {
                    self.start_bootstrap(ctx, strategy, source).await?;
                    status_manager
                        .update_state(
                            ClusterState::Bootstrapping,
                            &format!("restoring from {}", source.restore_from),
                        )
                        .await?;
                    return Ok(Action::requeue(Duration::from_secs(15)));
                }

                strategy.provision(&client, &ctx.config, self).await?;
                status_manager.set_provisioned(true).await?;
                status_manager
                    .update_state(ClusterState::Processed, "cluster resources are in place")
                    .await?;
                self.advance_workflow(&client, &namespace, Milestone::PrimaryCreated).await;
                self.advance_workflow(&client, &namespace, Milestone::ClusterCreated).await;
                Ok(Action::requeue(Duration::from_secs(5)))
            }

            ClusterState::Bootstrapping => {
                let job_name = jobs::bootstrap_job_name(&name);
                match self.get_job(&client, &namespace, &job_name).await? {
                    Some(job) if jobs::job_succeeded(&job) => {
                        status_manager
                            .update_state(ClusterState::Bootstrapped, "bootstrap restore complete")
                            .await?;
                        Ok(Action::requeue(Duration::from_secs(1)))
                    }
                    Some(job) if jobs::job_failed(&job) => {
                        warn!("bootstrap of cluster {}/{} failed", namespace, name);
                        status_manager
                            .update_state(
                                ClusterState::Bootstrapping,
                                &format!("bootstrap job {job_name} failed; inspect its pods"),
                            )
                            .await?;
                        Ok(Action::await_change())
                    }
                    Some(_) => Ok(Action::requeue(Duration::from_secs(15))),
                    None => {
                        // the job vanished before reporting; submit it again
                        if let Some(source) = &self.spec.data_source {
                            self.start_bootstrap(ctx, strategy, source).await?;
                        }
                        Ok(Action::requeue(Duration::from_secs(15)))
                    }
                }
            }

            ClusterState::Bootstrapped => {
                strategy.provision(&client, &ctx.config, self).await?;
                status_manager.set_provisioned(true).await?;
                status_manager
                    .update_state(ClusterState::Processed, "cluster resources are in place")
                    .await?;
                self.advance_workflow(&client, &namespace, Milestone::PrimaryCreated).await;
                self.advance_workflow(&client, &namespace, Milestone::ClusterCreated).await;
                Ok(Action::requeue(Duration::from_secs(5)))
            }

            ClusterState::Processed => {
                if self.primary_ready(&client, &namespace, &name).await? {
                    status_manager
                        .update_state(ClusterState::Initialized, "cluster is initialized")
                        .await?;
                    self.advance_workflow(&client, &namespace, Milestone::Completed).await;
                    Ok(Action::requeue(RESYNC))
                } else {
                    Ok(Action::requeue(Duration::from_secs(15)))
                }
            }

            ClusterState::Initialized => {
                // converge the runtime back onto the record
                strategy.provision(&client, &ctx.config, self).await?;
                Ok(Action::requeue(RESYNC))
            }

            ClusterState::Restoring => {
                let job_name = format!("{name}-restore");
                match self.get_job(&client, &namespace, &job_name).await? {
                    Some(job) if jobs::job_succeeded(&job) => {
                        strategy.provision(&client, &ctx.config, self).await?;
                        status_manager
                            .update_state(ClusterState::Processed, "restore complete; cluster resources are in place")
                            .await?;
                        self.advance_workflow(&client, &namespace, Milestone::RestorePrimaryCreated)
                            .await;
                        Ok(Action::requeue(Duration::from_secs(5)))
                    }
                    Some(job) if jobs::job_failed(&job) => {
                        warn!("restore of cluster {}/{} failed", namespace, name);
                        status_manager
                            .update_state(
                                ClusterState::Restoring,
                                &format!("restore job {job_name} failed; inspect its pods"),
                            )
                            .await?;
                        Ok(Action::await_change())
                    }
                    _ => Ok(Action::requeue(Duration::from_secs(15))),
                }
            }

            ClusterState::Shutdown => {
                // spec.shutdown was cleared: bring the runtime back up on
                // the volumes that stayed behind
                info!("Scaling cluster {}/{} back up", namespace, name);
                strategy.provision(&client, &ctx.config, self).await?;
                status_manager.set_provisioned(true).await?;
                status_manager
                    .update_state(ClusterState::Processed, "cluster resources are in place")
                    .await?;
                Ok(Action::requeue(Duration::from_secs(5)))
            }
        }
    }

    /// Creates the data volumes and submits the restore job that seeds them
    /// from another cluster's backup repository. The instance deployments
    /// wait until the job reports success.
    async fn start_bootstrap(
        &self,
        ctx: &Context,
        strategy: &dyn ClusterStrategy,
        source: &DataSourceSpec,
    ) -> Result<()> {
        let namespace = self.namespace().unwrap();

        strategy.prepare_volumes(&ctx.client, &ctx.config, self).await?;

        let oref = self.controller_owner_ref(&()).unwrap_or_default();
        let job = jobs::create_desired_bootstrap_job(
            &ctx.config,
            &namespace,
            self,
            &source.restore_from,
            &source.restore_opts,
            &oref,
        );
        jobs::submit(&ctx.client, &namespace, &job).await
    }

    async fn get_job(&self, client: &Client, namespace: &str, name: &str) -> Result<Option<Job>> {
        let jobs_api: Api<Job> = Api::namespaced(client.clone(), namespace);
        jobs_api
            .get_opt(name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))
    }

    async fn primary_ready(&self, client: &Client, namespace: &str, name: &str) -> Result<bool> {
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        let Some(deployment) = deployments
            .get_opt(name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?
        else {
            return Ok(false);
        };
        Ok(deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0)
            >= 1)
    }

    /// Stamps a milestone on the workflow this cluster carries the label of.
    /// Milestone write failures never fail the lifecycle operation itself.
    async fn advance_workflow(&self, client: &Client, namespace: &str, milestone: Milestone) {
        let Some(id) = self.labels().get(LABEL_WORKFLOW_ID).cloned().map(WorkflowId::from) else {
            return;
        };
        let tasks: Api<PgTask> = Api::namespaced(client.clone(), namespace);
        if let Err(e) = workflow::advance(&tasks, &id, milestone).await {
            warn!("failed to advance workflow {}: {}", id, e);
        }
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>, oref: &ObjectReference) -> Result<Action> {
        let name = self.name_any();

        match strategies::for_version(self.spec.strategy.clone()) {
            Ok(strategy) => strategy.deprovision(&ctx.client, self).await?,
            // deletion must not wedge on a bad strategy value
            Err(e) => warn!("skipping deprovision of {}: {}", name, e),
        }

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

    /// Starts a timer that records into the aggregation histogram on drop
    pub fn df_timer(&self) -> metrics::DfMeasurer {
        self.metrics.measure_df()
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

#[instrument(skip(ctx, cluster), fields(trace_id))]
pub async fn reconcile(cluster: Arc<PgCluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure("cluster");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = cluster.namespace().unwrap(); // PgCluster is namespace scoped
    let clusters: Api<PgCluster> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling PgCluster \"{}\" in {}", cluster.name_any(), ns);
    finalizer(&clusters, PG_CLUSTER_FINALIZER, cluster.clone(), |event| async {
        match event {
            Finalizer::Apply(cluster) => cluster.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(cluster) => {
                cluster.cleanup(ctx.clone(), &cluster.object_ref(&())).await
            }
        }
    })
    .await
    .map_err(|e| {
        error!("Failed to reconcile PgCluster: {}", e);
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
            reporter: "pg-cluster-controller".into(),
        }
    }
}
impl Diagnostics {
    pub(crate) fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

fn error_policy(cluster: Arc<PgCluster>, error: &errors::Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_cluster_failure(&cluster, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let clusters = Api::<PgCluster>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let shutdown = state.shutdown.clone();
    Controller::new(clusters, Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Job>::all(client.clone()), watcher::Config::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
