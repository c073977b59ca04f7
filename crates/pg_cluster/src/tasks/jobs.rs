//! Job documents for the one-shot work tasks submit: data and backup
//! removal, logical dumps, restores, and bootstrap-from-backup.
//!
//! Every job runs with `backoffLimit: 0`, mirroring the task contract: a
//! failed unit of work stays failed until someone looks at it.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tracing::info;

use crate::api::v1::{
    backrest_repo_pvc_name, backrest_repo_secret_name, PgCluster, LABEL_BOOTSTRAP, LABEL_CLUSTER,
    LABEL_RMDATA, LABEL_TASK_TYPE, LABEL_TRUE,
};
use crate::config::{OperatorConfig, OPERATOR_VERSION};
use crate::util::errors::{Error, Result, StdError};

/// What a data-removal job is allowed to destroy.
pub struct RmdataParams<'a> {
    pub cluster: &'a str,
    pub replica: Option<&'a str>,
    pub remove_data: bool,
    pub remove_backups: bool,
    pub is_replica: bool,
    pub is_backup: bool,
    /// Task-type label stamped on the job (`delete-data` or `delete-backups`)
    pub task_type: &'a str,
}

pub fn bootstrap_job_name(cluster: &str) -> String {
    format!("{cluster}-bootstrap")
}

pub fn create_desired_rmdata_job(
    config: &OperatorConfig,
    namespace: &str,
    name: &str,
    params: &RmdataParams,
    oref: &OwnerReference,
) -> Job {
    let mut labels = job_labels(params.cluster, params.task_type);
    labels.insert(LABEL_RMDATA.to_string(), LABEL_TRUE.to_string());

    let env = vec![
        env_var("PG_CLUSTER", params.cluster),
        env_var("REPLICA_NAME", params.replica.unwrap_or_default()),
        env_var("REMOVE_DATA", &params.remove_data.to_string()),
        env_var("REMOVE_BACKUP", &params.remove_backups.to_string()),
        env_var("IS_REPLICA", &params.is_replica.to_string()),
        env_var("IS_BACKUP", &params.is_backup.to_string()),
    ];

    let container = Container {
        name: "rmdata".to_string(),
        image: Some(format!("{}/pg-rmdata:{OPERATOR_VERSION}", config.image_prefix)),
        env: Some(env),
        ..Default::default()
    };
    create_desired_job(namespace, name, labels, container, Vec::new(), oref)
}

/// Dump job. When the task provisioned its own volume the claim is mounted
/// at /pgdump, otherwise the dump streams to the job's ephemeral disk.
pub fn create_desired_dump_job(
    config: &OperatorConfig,
    namespace: &str,
    name: &str,
    cluster: &str,
    dump_pvc: Option<&str>,
    oref: &OwnerReference,
) -> Job {
    let labels = job_labels(cluster, "dump");

    let mut env = vec![
        env_var("PG_CLUSTER", cluster),
        env_var("PGDUMP_HOST", cluster),
        env_var("PGDUMP_PORT", "5432"),
    ];
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    if let Some(claim) = dump_pvc {
        env.push(env_var("PGDUMP_DIR", "/pgdump"));
        volumes.push(pvc_volume("pgdump", claim));
        mounts.push(mount("pgdump", "/pgdump"));
    }

    let container = Container {
        name: "dump".to_string(),
        image: Some(format!("{}/pg-dump:{OPERATOR_VERSION}", config.image_prefix)),
        env: Some(env),
        volume_mounts: Some(mounts),
        ..Default::default()
    };
    create_desired_job(namespace, name, labels, container, volumes, oref)
}

/// Restore job against the cluster's own pgBackRest repository. Writes into
/// the primary data volume, so the caller shuts the instance down first by
/// moving the cluster to Restoring.
pub fn create_desired_restore_job(
    config: &OperatorConfig,
    namespace: &str,
    name: &str,
    cluster: &str,
    backup_path: Option<&str>,
    pitr_target: Option<&str>,
    oref: &OwnerReference,
) -> Job {
    let labels = job_labels(cluster, "restore");

    let mut env = vec![
        env_var("PG_CLUSTER", cluster),
        env_var("PGBACKREST_STANZA", "db"),
        env_var("PGBACKREST_REPO1_HOST", &format!("{cluster}-backrest-shared-repo")),
    ];
    if let Some(path) = backup_path {
        env.push(env_var("BACKREST_BACKUP_PATH", path));
    }
    if let Some(target) = pitr_target {
        env.push(env_var("PITR_TARGET", target));
    }

    let container = Container {
        name: "restore".to_string(),
        image: Some(format!("{}/pgbackrest:{OPERATOR_VERSION}", config.image_prefix)),
        env: Some(env),
        volume_mounts: Some(vec![mount("pgdata", "/pgdata")]),
        ..Default::default()
    };
    create_desired_job(
        namespace,
        name,
        labels,
        container,
        vec![pvc_volume("pgdata", cluster)],
        oref,
    )
}

/// Bootstrap job seeding a brand new cluster from another cluster's backup
/// repository. The job pods carry the bootstrap label so the disk-usage
/// aggregator skips them.
pub fn create_desired_bootstrap_job(
    config: &OperatorConfig,
    namespace: &str,
    cluster: &PgCluster,
    restore_from: &str,
    restore_opts: &str,
    oref: &OwnerReference,
) -> Job {
    let name = cluster.name_any();
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CLUSTER.to_string(), name.clone());
    labels.insert(LABEL_BOOTSTRAP.to_string(), LABEL_TRUE.to_string());

    let mut env = vec![
        env_var("PG_CLUSTER", &name),
        env_var("PGBACKREST_STANZA", "db"),
        env_var("BOOTSTRAP_FROM", restore_from),
    ];
    if !restore_opts.is_empty() {
        env.push(env_var("RESTORE_OPTS", restore_opts));
    }

    let volumes = vec![
        pvc_volume("pgdata", &name),
        pvc_volume("source-repo", &backrest_repo_pvc_name(restore_from)),
        Volume {
            name: "source-repo-config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(backrest_repo_secret_name(restore_from)),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mounts = vec![
        mount("pgdata", "/pgdata"),
        read_only_mount("source-repo", "/backrestrepo"),
        read_only_mount("source-repo-config", "/pgconf/backrest-repo"),
    ];

    let container = Container {
        name: "bootstrap".to_string(),
        image: Some(format!("{}/pgbackrest:{OPERATOR_VERSION}", config.image_prefix)),
        env: Some(env),
        volume_mounts: Some(mounts),
        ..Default::default()
    };
    create_desired_job(namespace, &bootstrap_job_name(&name), labels, container, volumes, oref)
}

fn create_desired_job(
    namespace: &str,
    name: &str,
    labels: BTreeMap<String, String>,
    container: Container,
    volumes: Vec<Volume>,
    oref: &OwnerReference,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![oref.clone()]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Creates the job unless it already exists. Redelivered task events hit
/// the already-exists branch and are a no-op.
pub async fn submit(client: &Client, namespace: &str, desired: &Job) -> Result<()> {
    let name = desired.name_any();
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);

    match jobs.get(&name).await {
        Ok(_) => {
            info!("Job '{}' already exists", name);
            Ok(())
        }
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            info!("Creating Job '{}'", name);
            jobs.create(&PostParams::default(), desired)
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
            Ok(())
        }
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}

/// True once the job reports at least one successful completion.
pub fn job_succeeded(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0
}

/// True once the job has burned its retry budget.
pub fn job_failed(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.failed).unwrap_or(0) > 0
}

fn job_labels(cluster: &str, task_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_TASK_TYPE.to_string(), task_type.to_string()),
    ])
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.to_string()), ..Default::default() }
}

fn pvc_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(
            k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                ..Default::default()
            },
        ),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.to_string(), mount_path: path.to_string(), ..Default::default() }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::PgClusterSpec;

    fn oref() -> OwnerReference {
        OwnerReference { name: "owner".to_string(), ..Default::default() }
    }

    fn job_env(job: &Job) -> Vec<EnvVar> {
        job.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.env.clone())
            .unwrap_or_default()
    }

    fn env_value<'a>(env: &'a [EnvVar], name: &str) -> &'a str {
        env.iter().find(|e| e.name == name).and_then(|e| e.value.as_deref()).unwrap_or("")
    }

    #[test]
    fn rmdata_job_encodes_the_removal_flags() {
        let config = OperatorConfig::default();
        let params = RmdataParams {
            cluster: "hippo",
            replica: Some("hippo-lnxz"),
            remove_data: true,
            remove_backups: false,
            is_replica: true,
            is_backup: false,
            task_type: "delete-data",
        };
        let job = create_desired_rmdata_job(&config, "pgo", "hippo-lnxz-rmdata", &params, &oref());

        let labels = job.labels();
        assert_eq!(labels.get(LABEL_RMDATA).map(String::as_str), Some(LABEL_TRUE));
        assert_eq!(labels.get(LABEL_TASK_TYPE).map(String::as_str), Some("delete-data"));

        let env = job_env(&job);
        assert_eq!(env_value(&env, "REPLICA_NAME"), "hippo-lnxz");
        assert_eq!(env_value(&env, "REMOVE_DATA"), "true");
        assert_eq!(env_value(&env, "REMOVE_BACKUP"), "false");
        assert_eq!(env_value(&env, "IS_REPLICA"), "true");

        let backoff = job.spec.as_ref().and_then(|s| s.backoff_limit);
        assert_eq!(backoff, Some(0));
    }

    #[test]
    fn dump_job_mounts_the_task_volume_when_present() {
        let config = OperatorConfig::default();
        let bare = create_desired_dump_job(&config, "pgo", "hippo-dump", "hippo", None, &oref());
        assert!(bare
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.volumes.as_ref())
            .is_none());

        let with_volume = create_desired_dump_job(
            &config,
            "pgo",
            "hippo-dump",
            "hippo",
            Some("hippo-dump"),
            &oref(),
        );
        let claims: Vec<String> = with_volume
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.volumes.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.persistent_volume_claim)
            .map(|c| c.claim_name)
            .collect();
        assert_eq!(claims, vec!["hippo-dump"]);
    }

    #[test]
    fn restore_job_carries_the_point_in_time_target() {
        let config = OperatorConfig::default();
        let job = create_desired_restore_job(
            &config,
            "pgo",
            "hippo-restore",
            "hippo",
            None,
            Some("2025-06-01 10:00:00"),
            &oref(),
        );
        let env = job_env(&job);
        assert_eq!(env_value(&env, "PITR_TARGET"), "2025-06-01 10:00:00");
        assert_eq!(env_value(&env, "PGBACKREST_REPO1_HOST"), "hippo-backrest-shared-repo");
        assert!(env.iter().all(|e| e.name != "BACKREST_BACKUP_PATH"));
    }

    #[test]
    fn bootstrap_job_mounts_the_source_repository_read_only() {
        let config = OperatorConfig::default();
        let mut cluster = PgCluster::new("elephant", PgClusterSpec::default());
        cluster.metadata.namespace = Some("pgo".to_string());

        let job =
            create_desired_bootstrap_job(&config, "pgo", &cluster, "hippo", "--repo-type=s3", &oref());
        assert_eq!(job.name_any(), "elephant-bootstrap");
        assert_eq!(job.labels().get(LABEL_BOOTSTRAP).map(String::as_str), Some(LABEL_TRUE));

        let pod = job.spec.as_ref().and_then(|s| s.template.spec.clone()).unwrap_or_default();
        let claims: Vec<String> = pod
            .volumes
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.persistent_volume_claim)
            .map(|c| c.claim_name)
            .collect();
        assert!(claims.contains(&"elephant".to_string()));
        assert!(claims.contains(&"hippo-pgbr-repo".to_string()));

        let repo_mount = pod
            .containers
            .first()
            .and_then(|c| c.volume_mounts.as_ref())
            .and_then(|m| m.iter().find(|m| m.name == "source-repo"))
            .cloned();
        assert_eq!(repo_mount.and_then(|m| m.read_only), Some(true));
    }

    #[test]
    fn job_completion_reads_the_status_counters() {
        let mut job = Job::default();
        assert!(!job_succeeded(&job));
        assert!(!job_failed(&job));

        job.status = Some(k8s_openapi::api::batch::v1::JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert!(job_succeeded(&job));
    }
}
