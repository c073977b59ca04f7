use crate::api::v1::{PgCluster, PgReplica, PgTask};
use crate::util::errors::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, Histogram, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub task_failures: IntCounterVec,
    pub df_duration: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("controller_reconciliation_errors_total", "reconciliation errors",),
            &["instance", "error"],
        )
        .unwrap();
        let task_failures = IntCounterVec::new(
            opts!("task_handler_errors_total", "task handler errors by task type",),
            &["task_type", "error"],
        )
        .unwrap();
        let df_duration = Histogram::with_opts(
            histogram_opts!(
                "df_aggregation_duration_seconds",
                "The duration of a disk usage aggregation in seconds",
            )
            .buckets(vec![0.1, 0.5, 1., 5., 15., 60.]),
        )
        .unwrap();
        let reconciliations = IntCounter::new("reconciliations_total", "reconciliations").unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            task_failures,
            df_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.task_failures.clone()))?;
        registry.register(Box::new(self.df_duration.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_cluster_failure(&self, cluster: &PgCluster, e: &Error) {
        println!(
            "reconcile_cluster_failure: {:?}",
            &[cluster.name_any(), e.metric_label()]
        );
        self.failures
            .with_label_values(&[cluster.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn reconcile_replica_failure(&self, replica: &PgReplica, e: &Error) {
        println!(
            "reconcile_replica_failure: {:?}",
            &[replica.name_any(), e.metric_label()]
        );
        self.failures
            .with_label_values(&[replica.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn reconcile_task_failure(&self, task: &PgTask, e: &Error) {
        println!(
            "reconcile_task_failure: {:?}",
            &[task.name_any(), e.metric_label()]
        );
        self.failures
            .with_label_values(&[task.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn task_handler_failure(&self, task_type: &str, e: &Error) {
        self.task_failures
            .with_label_values(&[task_type, e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: controller.to_string(),
        }
    }

    pub fn measure_df(&self) -> DfMeasurer {
        DfMeasurer {
            start: Instant::now(),
            metric: self.df_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.instance.as_str()])
            .observe(duration);
    }
}

pub struct DfMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for DfMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}
