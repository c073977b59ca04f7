//! Disk usage aggregation.
//!
//! One worker per cluster lists that cluster's live database instances; one
//! worker per instance measures every PVC-backed volume with `du` inside
//! the instance container and reads the claim capacity. Results funnel
//! instance → cluster → caller over channels, and completion is detected by
//! counting: the cluster count is known up front, each cluster's instance
//! count is known once listed. Instance workers share a semaphore, so at
//! most `concurrency` probes run at once, and the first error cancels the
//! shared token and surfaces immediately.

use core::fmt;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::v1::{LABEL_BACKREST_REPO, LABEL_BOOTSTRAP, LABEL_CLUSTER, LABEL_ROLE};
use crate::util::errors::StdError;
use crate::validation::quantity::parse_quantity;

/// What a measured volume holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeRole {
    PostgresData,
    WriteAheadLog,
    Tablespace,
    BackrestRepo,
}

impl Display for VolumeRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VolumeRole::PostgresData => write!(f, "postgres-data"),
            VolumeRole::WriteAheadLog => write!(f, "write-ahead-log"),
            VolumeRole::Tablespace => write!(f, "tablespace"),
            VolumeRole::BackrestRepo => write!(f, "backrest-repo"),
        }
    }
}

/// One measured volume of one live instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DfVolumeReport {
    pub cluster: String,
    pub instance: String,
    pub role: VolumeRole,
    pub pvc: String,
    pub capacity: i64,
    pub used_bytes: i64,
}

/// A cluster selected for aggregation.
#[derive(Debug, Clone)]
pub struct DfTarget {
    pub namespace: String,
    pub name: String,
}

/// A running database instance, as the probe sees it.
#[derive(Debug, Clone)]
pub struct DfInstance {
    pub namespace: String,
    pub name: String,
    pub container: String,
    pub volumes: Vec<DfVolume>,
}

/// A PVC-backed volume mounted into the instance container.
#[derive(Debug, Clone, PartialEq)]
pub struct DfVolume {
    pub name: String,
    pub pvc: String,
    pub mount_path: String,
}

/// Measurement seam. The shipped implementation talks to the cluster; tests
/// inject synthetic topologies and failures.
#[async_trait]
pub trait DiskProbe: Send + Sync {
    /// Running pods of the cluster, bootstrap pods excluded. Eligible pods
    /// carry a database role label or the backup repository label.
    async fn running_instances(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Vec<DfInstance>, StdError>;

    /// Bytes used under the volume's mount path, measured inside the
    /// instance container.
    async fn volume_used_bytes(
        &self,
        instance: &DfInstance,
        volume: &DfVolume,
    ) -> Result<i64, StdError>;

    /// Capacity recorded on the backing claim.
    async fn volume_capacity(&self, namespace: &str, pvc: &str) -> Result<i64, StdError>;
}

/// Classifies a mounted volume by the name the provisioning strategy gave
/// it. Volumes outside the taxonomy are not measured.
pub fn volume_role(volume_name: &str) -> Option<VolumeRole> {
    match volume_name {
        "pgdata" => Some(VolumeRole::PostgresData),
        "pgwal" => Some(VolumeRole::WriteAheadLog),
        "backrestrepo" => Some(VolumeRole::BackrestRepo),
        name if name.starts_with("tablespace-") => Some(VolumeRole::Tablespace),
        _ => None,
    }
}

enum ClusterMessage {
    Volume(DfVolumeReport),
    Finished,
    Failed(StdError),
}

enum InstanceMessage {
    Volume(DfVolumeReport),
    Finished,
    Failed(StdError),
}

/// Measures every volume of every live instance of the given clusters.
/// Reports arrive in arbitrary order. The first probe error cancels the
/// remaining workers and is returned as the overall result.
pub async fn aggregate(
    targets: Vec<DfTarget>,
    probe: Arc<dyn DiskProbe>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<DfVolumeReport>, StdError> {
    let total_clusters = targets.len();
    if total_clusters == 0 {
        return Ok(Vec::new());
    }

    let token = cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<ClusterMessage>(64);

    for target in targets {
        tokio::spawn(cluster_worker(
            target,
            Arc::clone(&probe),
            Arc::clone(&semaphore),
            token.clone(),
            tx.clone(),
        ));
    }
    drop(tx);

    let mut reports = Vec::new();
    let mut finished = 0;
    while let Some(message) = rx.recv().await {
        match message {
            ClusterMessage::Volume(report) => reports.push(report),
            ClusterMessage::Finished => {
                finished += 1;
                if finished == total_clusters {
                    break;
                }
            }
            ClusterMessage::Failed(e) => {
                token.cancel();
                return Err(e);
            }
        }
    }
    Ok(reports)
}

async fn cluster_worker(
    target: DfTarget,
    probe: Arc<dyn DiskProbe>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tx: mpsc::Sender<ClusterMessage>,
) {
    let instances = tokio::select! {
        () = cancel.cancelled() => return,
        listed = probe.running_instances(&target.namespace, &target.name) => match listed {
            Ok(instances) => instances,
            Err(e) => {
                let _ = tx.send(ClusterMessage::Failed(e)).await;
                return;
            }
        },
    };

    let total_instances = instances.len();
    debug!("cluster {} has {} live instances", target.name, total_instances);

    let (itx, mut irx) = mpsc::channel::<InstanceMessage>(64);
    for instance in instances {
        tokio::spawn(instance_worker(
            target.name.clone(),
            instance,
            Arc::clone(&probe),
            Arc::clone(&semaphore),
            cancel.clone(),
            itx.clone(),
        ));
    }
    drop(itx);

    let mut finished = 0;
    while finished < total_instances {
        let message = tokio::select! {
            () = cancel.cancelled() => return,
            received = irx.recv() => match received {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            InstanceMessage::Volume(report) => {
                if tx.send(ClusterMessage::Volume(report)).await.is_err() {
                    return;
                }
            }
            InstanceMessage::Finished => finished += 1,
            InstanceMessage::Failed(e) => {
                let _ = tx.send(ClusterMessage::Failed(e)).await;
                return;
            }
        }
    }
    let _ = tx.send(ClusterMessage::Finished).await;
}

async fn instance_worker(
    cluster: String,
    instance: DfInstance,
    probe: Arc<dyn DiskProbe>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tx: mpsc::Sender<InstanceMessage>,
) {
    let _permit = tokio::select! {
        () = cancel.cancelled() => return,
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    for volume in &instance.volumes {
        let Some(role) = volume_role(&volume.name) else {
            continue;
        };
        if cancel.is_cancelled() {
            return;
        }

        let used_bytes = match probe.volume_used_bytes(&instance, volume).await {
            Ok(used) => used,
            Err(e) => {
                let _ = tx.send(InstanceMessage::Failed(e)).await;
                return;
            }
        };
        let capacity = match probe.volume_capacity(&instance.namespace, &volume.pvc).await {
            Ok(capacity) => capacity,
            Err(e) => {
                let _ = tx.send(InstanceMessage::Failed(e)).await;
                return;
            }
        };

        let report = DfVolumeReport {
            cluster: cluster.clone(),
            instance: instance.name.clone(),
            role,
            pvc: volume.pvc.clone(),
            capacity,
            used_bytes,
        };
        if tx.send(InstanceMessage::Volume(report)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(InstanceMessage::Finished).await;
}

/// The in-cluster probe: pod list for discovery, `du` over pod exec for
/// usage, the claim object for capacity.
pub struct KubeProbe {
    client: Client,
}

impl KubeProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiskProbe for KubeProbe {
    async fn running_instances(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Vec<DfInstance>, StdError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = ListParams::default().labels(&format!("{LABEL_CLUSTER}={cluster}"));
        let listed = pods.list(&selector).await.map_err(StdError::KubeError)?;

        let mut instances = Vec::new();
        for pod in listed {
            if !is_eligible_instance(&pod) {
                continue;
            }
            let name = pod.name_any();
            let Some(spec) = pod.spec.as_ref() else {
                continue;
            };
            let Some(container) = spec.containers.first() else {
                continue;
            };
            let volumes = claim_backed_volumes(&pod, &container.name);
            instances.push(DfInstance {
                namespace: namespace.to_string(),
                name,
                container: container.name.clone(),
                volumes,
            });
        }
        Ok(instances)
    }

    async fn volume_used_bytes(
        &self,
        instance: &DfInstance,
        volume: &DfVolume,
    ) -> Result<i64, StdError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &instance.namespace);
        let command = ["du", "-s", "--block-size", "1", volume.mount_path.as_str()];
        let attach_params = AttachParams {
            container: Some(instance.container.clone()),
            tty: false,
            stdin: false,
            stdout: true,
            stderr: true,
            max_stdin_buf_size: None,
            max_stdout_buf_size: None,
            max_stderr_buf_size: None,
        };

        let mut attached = pods
            .exec(&instance.name, command, &attach_params)
            .await
            .map_err(|e| StdError::ProbeFailed {
                instance: instance.name.clone(),
                detail: e.to_string(),
            })?;

        let mut stdout = String::new();
        if let Some(mut reader) = attached.stdout() {
            if let Err(e) = reader.read_to_string(&mut stdout).await {
                warn!("reading du output from pod {}: {e}", instance.name);
            }
        }
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };

        // du still prints a total when it warns about unreadable entries,
        // so the total wins over the exit code
        if let Some(bytes) = parse_du_output(&stdout) {
            return Ok(bytes);
        }
        Err(StdError::ProbeFailed {
            instance: instance.name.clone(),
            detail: format!(
                "du produced no total on {} (exit {:?})",
                volume.mount_path,
                status.and_then(|s| s.code)
            ),
        })
    }

    async fn volume_capacity(&self, namespace: &str, pvc: &str) -> Result<i64, StdError> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let claim = pvcs.get(pvc).await.map_err(StdError::KubeError)?;

        let quantity = claim
            .status
            .as_ref()
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get("storage"))
            .or_else(|| {
                claim
                    .spec
                    .as_ref()
                    .and_then(|s| s.resources.as_ref())
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|r| r.get("storage"))
            })
            .ok_or_else(|| StdError::ProbeFailed {
                instance: pvc.to_string(),
                detail: "claim reports no storage capacity".to_string(),
            })?;

        let bytes = parse_quantity(&quantity.0).map_err(|e| StdError::ProbeFailed {
            instance: pvc.to_string(),
            detail: e.to_string(),
        })?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(bytes as i64)
    }
}

/// Running, not a bootstrap pod, and carrying either a database role label
/// or the backup repository label.
fn is_eligible_instance(pod: &Pod) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running");
    if !running {
        return false;
    }
    let labels = pod.labels();
    if labels.contains_key(LABEL_BOOTSTRAP) {
        return false;
    }
    labels.contains_key(LABEL_ROLE) || labels.contains_key(LABEL_BACKREST_REPO)
}

/// Pairs the pod's claim-backed volumes with their mount paths in the given
/// container. Volumes without a claim or without a mount are skipped.
fn claim_backed_volumes(pod: &Pod, container: &str) -> Vec<DfVolume> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    let mounts = spec
        .containers
        .iter()
        .find(|c| c.name == container)
        .and_then(|c| c.volume_mounts.clone())
        .unwrap_or_default();

    spec.volumes
        .iter()
        .flatten()
        .filter_map(|volume| {
            let claim = volume.persistent_volume_claim.as_ref()?;
            let mount = mounts.iter().find(|m| m.name == volume.name)?;
            Some(DfVolume {
                name: volume.name.clone(),
                pvc: claim.claim_name.clone(),
                mount_path: mount.mount_path.clone(),
            })
        })
        .collect()
}

/// `du -s --block-size 1` prints `<bytes>\t<path>`.
fn parse_du_output(raw: &str) -> Option<i64> {
    raw.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SyntheticProbe {
        /// cluster name → instances
        topology: BTreeMap<String, Vec<DfInstance>>,
        /// instance name that fails its first volume probe
        failing_instance: Option<String>,
        probes_started: AtomicUsize,
    }

    impl SyntheticProbe {
        fn new(topology: BTreeMap<String, Vec<DfInstance>>) -> Self {
            Self {
                topology,
                failing_instance: None,
                probes_started: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, instance: &str) -> Self {
            self.failing_instance = Some(instance.to_string());
            self
        }
    }

    #[async_trait]
    impl DiskProbe for SyntheticProbe {
        async fn running_instances(
            &self,
            _namespace: &str,
            cluster: &str,
        ) -> Result<Vec<DfInstance>, StdError> {
            Ok(self.topology.get(cluster).cloned().unwrap_or_default())
        }

        async fn volume_used_bytes(
            &self,
            instance: &DfInstance,
            _volume: &DfVolume,
        ) -> Result<i64, StdError> {
            self.probes_started.fetch_add(1, Ordering::SeqCst);
            // let siblings interleave
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if self.failing_instance.as_deref() == Some(instance.name.as_str()) {
                return Err(StdError::ProbeFailed {
                    instance: instance.name.clone(),
                    detail: "synthetic failure".to_string(),
                });
            }
            Ok(1024)
        }

        async fn volume_capacity(&self, _namespace: &str, _pvc: &str) -> Result<i64, StdError> {
            Ok(1 << 30)
        }
    }

    fn instance(name: &str, volumes: &[(&str, &str)]) -> DfInstance {
        DfInstance {
            namespace: "pgo".to_string(),
            name: name.to_string(),
            container: "database".to_string(),
            volumes: volumes
                .iter()
                .map(|(volume, pvc)| DfVolume {
                    name: (*volume).to_string(),
                    pvc: (*pvc).to_string(),
                    mount_path: format!("/{volume}"),
                })
                .collect(),
        }
    }

    fn targets(names: &[&str]) -> Vec<DfTarget> {
        names
            .iter()
            .map(|name| DfTarget { namespace: "pgo".to_string(), name: (*name).to_string() })
            .collect()
    }

    #[test]
    fn volume_names_classify_into_roles() {
        assert_eq!(volume_role("pgdata"), Some(VolumeRole::PostgresData));
        assert_eq!(volume_role("pgwal"), Some(VolumeRole::WriteAheadLog));
        assert_eq!(volume_role("tablespace-ts1"), Some(VolumeRole::Tablespace));
        assert_eq!(volume_role("backrestrepo"), Some(VolumeRole::BackrestRepo));
        assert_eq!(volume_role("tls-server"), None);
        assert_eq!(volume_role("pgadmin-data"), None);
    }

    #[test]
    fn du_output_parses_to_bytes() {
        assert_eq!(parse_du_output("4096\t/pgdata\n"), Some(4096));
        assert_eq!(parse_du_output("  123 /pgwal"), Some(123));
        assert_eq!(parse_du_output("du: cannot access"), None);
        assert_eq!(parse_du_output(""), None);
    }

    #[tokio::test]
    async fn every_volume_of_every_instance_is_reported_exactly_once() {
        let mut topology = BTreeMap::new();
        topology.insert(
            "hippo".to_string(),
            vec![
                instance("hippo", &[("pgdata", "hippo"), ("pgwal", "hippo-wal")]),
                instance("hippo-lnxz", &[("pgdata", "hippo-lnxz")]),
                instance("hippo-backrest-shared-repo", &[("backrestrepo", "hippo-pgbr-repo")]),
            ],
        );
        topology.insert(
            "elephant".to_string(),
            vec![instance("elephant", &[("pgdata", "elephant"), ("tls-server", "ignored")])],
        );
        let probe = Arc::new(SyntheticProbe::new(topology));

        let cancel = CancellationToken::new();
        let reports = aggregate(targets(&["hippo", "elephant"]), probe, 4, &cancel)
            .await
            .unwrap();

        // the tls volume has no role and is skipped
        assert_eq!(reports.len(), 5);
        let mut pvcs: Vec<&str> = reports.iter().map(|r| r.pvc.as_str()).collect();
        pvcs.sort_unstable();
        assert_eq!(
            pvcs,
            vec!["elephant", "hippo", "hippo-lnxz", "hippo-pgbr-repo", "hippo-wal"]
        );
        let repo = reports
            .iter()
            .find(|r| r.pvc == "hippo-pgbr-repo")
            .cloned()
            .unwrap();
        assert_eq!(repo.role, VolumeRole::BackrestRepo);
        assert_eq!(repo.cluster, "hippo");
        assert_eq!(repo.used_bytes, 1024);
    }

    #[tokio::test]
    async fn clusters_without_instances_still_complete() {
        let mut topology = BTreeMap::new();
        topology.insert("hippo".to_string(), vec![instance("hippo", &[("pgdata", "hippo")])]);
        let probe = Arc::new(SyntheticProbe::new(topology));

        let cancel = CancellationToken::new();
        let reports = aggregate(targets(&["hippo", "empty", "shutdown"]), probe, 2, &cancel)
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn first_probe_error_fails_the_aggregation() {
        let mut topology = BTreeMap::new();
        topology.insert(
            "hippo".to_string(),
            vec![
                instance("hippo", &[("pgdata", "hippo")]),
                instance("hippo-bad", &[("pgdata", "hippo-bad")]),
            ],
        );
        let probe = Arc::new(SyntheticProbe::new(topology).failing("hippo-bad"));

        let cancel = CancellationToken::new();
        let err = aggregate(targets(&["hippo"]), probe, 4, &cancel).await.unwrap_err();
        assert!(matches!(err, StdError::ProbeFailed { instance, .. } if instance == "hippo-bad"));
    }

    #[tokio::test]
    async fn error_cancels_the_siblings() {
        let mut big_cluster = vec![instance("boom", &[("pgdata", "boom")])];
        for i in 0..20 {
            big_cluster.push(instance(&format!("inst-{i}"), &[("pgdata", "ignored")]));
        }
        let mut topology = BTreeMap::new();
        topology.insert("hippo".to_string(), big_cluster);
        let probe = Arc::new(SyntheticProbe::new(topology).failing("boom"));

        let cancel = CancellationToken::new();
        let result =
            aggregate(targets(&["hippo"]), Arc::clone(&probe) as Arc<dyn DiskProbe>, 1, &cancel)
                .await;
        assert!(result.is_err());

        // the failure cancels the token; at most one worker that had
        // already passed its cancellation check may still start a probe
        let at_error = probe.probes_started.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let after = probe.probes_started.load(Ordering::SeqCst);
        assert!(
            after <= at_error + 1,
            "probes kept starting after the failure: {at_error} then {after}"
        );
    }

    #[tokio::test]
    async fn concurrency_limit_bounds_parallel_probes() {
        struct CountingProbe {
            running: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl DiskProbe for CountingProbe {
            async fn running_instances(
                &self,
                _namespace: &str,
                _cluster: &str,
            ) -> Result<Vec<DfInstance>, StdError> {
                Ok((0..12)
                    .map(|i| DfInstance {
                        namespace: "pgo".to_string(),
                        name: format!("inst-{i}"),
                        container: "database".to_string(),
                        volumes: vec![DfVolume {
                            name: "pgdata".to_string(),
                            pvc: format!("inst-{i}"),
                            mount_path: "/pgdata".to_string(),
                        }],
                    })
                    .collect())
            }

            async fn volume_used_bytes(
                &self,
                _instance: &DfInstance,
                _volume: &DfVolume,
            ) -> Result<i64, StdError> {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(0)
            }

            async fn volume_capacity(&self, _namespace: &str, _pvc: &str) -> Result<i64, StdError> {
                Ok(0)
            }
        }

        let probe = Arc::new(CountingProbe {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let reports =
            aggregate(targets(&["hippo"]), Arc::clone(&probe) as Arc<dyn DiskProbe>, 3, &cancel)
                .await
                .unwrap();
        assert_eq!(reports.len(), 12);
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn external_cancellation_stops_the_aggregation() {
        struct StallingProbe;

        #[async_trait]
        impl DiskProbe for StallingProbe {
            async fn running_instances(
                &self,
                _namespace: &str,
                _cluster: &str,
            ) -> Result<Vec<DfInstance>, StdError> {
                // never returns; aggregation must end through the token
                std::future::pending().await
            }

            async fn volume_used_bytes(
                &self,
                _instance: &DfInstance,
                _volume: &DfVolume,
            ) -> Result<i64, StdError> {
                Ok(0)
            }

            async fn volume_capacity(&self, _namespace: &str, _pvc: &str) -> Result<i64, StdError> {
                Ok(0)
            }
        }

        let cancel = CancellationToken::new();
        let run = aggregate(targets(&["hippo"]), Arc::new(StallingProbe), 2, &cancel);
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("aggregation finished against a stalled probe"),
            () = tokio::time::sleep(std::time::Duration::from_millis(20)) => cancel.cancel(),
        }

        // workers observe the token, drop their senders, and the collector
        // drains to completion with whatever it has
        let reports = run.await.unwrap();
        assert!(reports.is_empty());
    }
}
