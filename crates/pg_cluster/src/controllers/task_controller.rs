use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        watcher::{self, Config},
    },
    Resource,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::api::v1::{PgTask, TaskPayload, TaskState};
use crate::config::OperatorConfig;
use crate::tasks::{self, jobs};
use crate::util::errors::{Error, Result, StdError};
use crate::util::task_status::{self, TaskStatusManager};
use crate::util::{errors, metrics, telemetry};

/// Payloads whose handler submits a batch job named after the task. The
/// task only completes once that job reports, so the controller keeps
/// polling instead of marking it done at dispatch.
fn job_backed(payload: &TaskPayload) -> bool {
    matches!(
        payload,
        TaskPayload::DeleteData { .. }
            | TaskPayload::DeleteBackups { .. }
            | TaskPayload::Dump { .. }
            | TaskPayload::Restore { .. }
    )
}

impl PgTask {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, errors::Error> {
        match self.process(&ctx).await {
            // Another writer moved this task first; re-read and retry.
            Err(Error::StdError(StdError::WriteConflict { name })) => {
                debug!("status write on {} conflicted; retrying shortly", name);
                Ok(Action::requeue(Duration::from_secs(2)))
            }
            other => other,
        }
    }

    async fn process(&self, ctx: &Context) -> Result<Action> {
        let name = self.name_any();
        let status_manager = TaskStatusManager::new(&ctx.client, self)?;

        if task_status::is_terminal(self) {
            return Ok(Action::await_change());
        }

        let state = self.status.as_ref().map(|s| s.state).unwrap_or_default();
        if state == TaskState::Requested {
            status_manager
                .update_state(TaskState::Submitted, "task accepted")
                .await?;
        }

        // Handlers are idempotent, so a task found in Submitted after a
        // restart is simply dispatched again.
        if let Err(e) = tasks::dispatch(&ctx.client, &ctx.config, self).await {
            if let Error::StdError(StdError::WriteConflict { name: conflicted }) = &e {
                debug!("dispatch of {} lost a status race on {}; retrying", name, conflicted);
                return Ok(Action::requeue(Duration::from_secs(5)));
            }
            error!("task {} failed: {}", name, e);
            ctx.metrics.task_handler_failure(self.spec.payload.task_type(), &e);
            self.publish_failure(ctx, &e).await;
            status_manager
                .update_state(TaskState::Failed, &format!("{e}"))
                .await?;
            return Ok(Action::await_change());
        }

        if !job_backed(&self.spec.payload) {
            status_manager
                .update_state(
                    TaskState::Completed,
                    &format!("Successfully processed pgtask {name}"),
                )
                .await?;
            return Ok(Action::await_change());
        }

        let namespace = self.namespace().unwrap(); // PgTask is namespace scoped
        let jobs_api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
        let job = jobs_api
            .get_opt(&name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        match job {
            Some(job) if jobs::job_succeeded(&job) => {
                status_manager
                    .update_state(
                        TaskState::Completed,
                        &format!("Successfully processed pgtask {name}"),
                    )
                    .await?;
                Ok(Action::await_change())
            }
            Some(job) if jobs::job_failed(&job) => {
                warn!("job backing task {}/{} failed", namespace, name);
                status_manager
                    .update_state(
                        TaskState::Failed,
                        &format!("job {name} failed; inspect its pods"),
                    )
                    .await?;
                Ok(Action::await_change())
            }
            _ => Ok(Action::requeue(Duration::from_secs(15))),
        }
    }

    /// Failure events never fail the reconcile that raised them.
    async fn publish_failure(&self, ctx: &Context, error: &errors::Error) {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        let event = Event {
            type_: EventType::Warning,
            reason: "ProcessingFailed".into(),
            note: Some(format!("{error}")),
            action: "Processing".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &self.object_ref(&())).await {
            warn!("failed to publish failure event for {}: {}", self.name_any(), e);
        }
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

#[instrument(skip(ctx, task), fields(trace_id))]
pub async fn reconcile(task: Arc<PgTask>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure("task");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = task.namespace().unwrap(); // PgTask is namespace scoped

    // Tasks carry no finalizer: their jobs are owned by the task record
    // and collected with it, and fixed-name tasks must be recreatable the
    // moment a delete returns.
    if task.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    info!("Reconciling PgTask \"{}\" in {}", task.name_any(), ns);
    task.reconcile(ctx).await
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
            reporter: "pg-task-controller".into(),
        }
    }
}
impl Diagnostics {
    pub(crate) fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

fn error_policy(task: Arc<PgTask>, error: &errors::Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_task_failure(&task, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let pgtasks = Api::<PgTask>::all(client.clone());
    if let Err(e) = pgtasks.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let shutdown = state.shutdown.clone();
    Controller::new(pgtasks, Config::default().any_semantic())
        .owns(Api::<Job>::all(client.clone()), watcher::Config::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
