//! The version 1 layout: one single-replica deployment per PostgreSQL
//! instance, a shared pgBackRest repository deployment, and one service per
//! access path (primary, replicas, repository).

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::info;

use crate::api::v1::{
    backrest_repo_pvc_name, PgCluster, PgReplica, RepoStorageType, ResourceRequirementsSpec,
    S3RepoConfig, ServiceKind, StorageSpec, LABEL_BACKREST_REPO, LABEL_CLUSTER,
    LABEL_DEPLOYMENT_NAME, LABEL_ROLE, LABEL_TRUE, ROLE_PRIMARY, ROLE_REPLICA,
};
use crate::config::{OperatorConfig, OPERATOR_VERSION};
use crate::strategies::ClusterStrategy;
use crate::util::errors::{Error, Result, StdError};

static FIELD_MANAGER: &str = "pg-cluster-operator";

const PG_PORT: i32 = 5432;
const REPO_PORT: i32 = 2022;

#[derive(Debug)]
pub struct CoreStrategy;

#[async_trait]
impl ClusterStrategy for CoreStrategy {
    async fn prepare_volumes(
        &self,
        client: &Client,
        config: &OperatorConfig,
        cluster: &PgCluster,
    ) -> Result<()> {
        let name = cluster.name_any();
        let ns = namespace_of(cluster)?;

        let data = resolve_storage(config, &config.primary_storage, &cluster.spec.primary_storage);
        ensure_pvc(client, &ns, &create_desired_pvc(&ns, &name, &name, &data)).await?;
        if let Some(wal_spec) = &cluster.spec.wal_storage {
            let wal = resolve_storage(config, &config.wal_storage, wal_spec);
            ensure_pvc(client, &ns, &create_desired_pvc(&ns, &wal_pvc_name(&name), &name, &wal))
                .await?;
        }
        for tablespace in &cluster.spec.tablespaces {
            let storage = resolve_storage(config, &config.primary_storage, &tablespace.storage);
            let pvc_name = tablespace_pvc_name(&name, &tablespace.name);
            ensure_pvc(client, &ns, &create_desired_pvc(&ns, &pvc_name, &name, &storage)).await?;
        }
        let repo = resolve_storage(config, &config.backrest_storage, &cluster.spec.backrest_storage);
        let repo_pvc = backrest_repo_pvc_name(&name);
        ensure_pvc(client, &ns, &create_desired_pvc(&ns, &repo_pvc, &name, &repo)).await?;

        Ok(())
    }

    async fn provision(
        &self,
        client: &Client,
        config: &OperatorConfig,
        cluster: &PgCluster,
    ) -> Result<()> {
        let name = cluster.name_any();
        let ns = namespace_of(cluster)?;
        let oref = owner_ref(cluster);
        info!("Provisioning cluster '{}' in namespace '{}'", name, ns);

        self.prepare_volumes(client, config, cluster).await?;

        let primary =
            create_desired_instance_deployment(config, &ns, cluster, &name, ROLE_PRIMARY, &oref);
        apply_deployment(client, &ns, &primary).await?;
        let repo = create_desired_repo_deployment(config, &ns, cluster, &oref);
        apply_deployment(client, &ns, &repo).await?;

        let primary_service = create_desired_postgres_service(
            &ns,
            &name,
            &name,
            ROLE_PRIMARY,
            &cluster.spec.service_type,
            &oref,
        );
        apply_service(client, &ns, &primary_service).await?;
        apply_service(client, &ns, &create_desired_repo_service(&ns, &name, &oref)).await?;

        Ok(())
    }

    async fn deprovision(&self, client: &Client, cluster: &PgCluster) -> Result<()> {
        let name = cluster.name_any();
        let ns = namespace_of(cluster)?;
        info!("Deprovisioning cluster '{}' in namespace '{}'", name, ns);

        let selector = ListParams::default().labels(&format!("{LABEL_CLUSTER}={name}"));

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
        deployments
            .delete_collection(&DeleteParams::default(), &selector)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        // the Service API has no collection delete
        let services: Api<Service> = Api::namespaced(client.clone(), &ns);
        let owned = services
            .list(&selector)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        for service in owned {
            let service_name = service.name_any();
            match services.delete(&service_name, &DeleteParams::default()).await {
                Ok(_) => info!("Deleted Service '{}'", service_name),
                Err(kube::Error::Api(api_err)) if api_err.code == 404 => {}
                Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
            }
        }

        Ok(())
    }

    async fn provision_replica(
        &self,
        client: &Client,
        config: &OperatorConfig,
        cluster: &PgCluster,
        replica: &PgReplica,
    ) -> Result<()> {
        let cluster_name = cluster.name_any();
        let replica_name = replica.name_any();
        let ns = namespace_of(replica)?;
        info!("Provisioning replica '{}' of cluster '{}'", replica_name, cluster_name);

        let storage_spec = replica
            .spec
            .storage
            .as_ref()
            .or(cluster.spec.replica_storage.as_ref())
            .unwrap_or(&cluster.spec.primary_storage);
        let storage = resolve_storage(config, &config.replica_storage, storage_spec);
        ensure_pvc(client, &ns, &create_desired_pvc(&ns, &replica_name, &cluster_name, &storage))
            .await?;
        if let Some(wal_spec) = &cluster.spec.wal_storage {
            let wal = resolve_storage(config, &config.wal_storage, wal_spec);
            let pvc = create_desired_pvc(&ns, &wal_pvc_name(&replica_name), &cluster_name, &wal);
            ensure_pvc(client, &ns, &pvc).await?;
        }
        for tablespace in &cluster.spec.tablespaces {
            let storage = resolve_storage(config, &config.replica_storage, &tablespace.storage);
            let pvc_name = tablespace_pvc_name(&replica_name, &tablespace.name);
            let pvc = create_desired_pvc(&ns, &pvc_name, &cluster_name, &storage);
            ensure_pvc(client, &ns, &pvc).await?;
        }

        let replica_oref = owner_ref(replica);
        let mut deployment = create_desired_instance_deployment(
            config,
            &ns,
            cluster,
            &replica_name,
            ROLE_REPLICA,
            &replica_oref,
        );
        if let Some(selector) = replica.spec.node_label.as_deref().and_then(parse_node_label) {
            if let Some(pod) = deployment.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
                pod.node_selector = Some(selector);
            }
        }
        apply_deployment(client, &ns, &deployment).await?;

        // the replica service is shared, so the cluster owns it
        let service = create_desired_postgres_service(
            &ns,
            &replica_service_name(&cluster_name),
            &cluster_name,
            ROLE_REPLICA,
            &cluster.spec.service_type,
            &owner_ref(cluster),
        );
        apply_service(client, &ns, &service).await?;

        Ok(())
    }

    async fn deprovision_replica(&self, client: &Client, replica: &PgReplica) -> Result<()> {
        let replica_name = replica.name_any();
        let ns = namespace_of(replica)?;
        info!("Deprovisioning replica '{}' in namespace '{}'", replica_name, ns);

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
        match deployments.delete(&replica_name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted Deployment '{}'", replica_name),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {}
            Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
        }

        Ok(())
    }
}

pub fn backrest_repo_deployment_name(cluster: &str) -> String {
    format!("{cluster}-backrest-shared-repo")
}

pub fn replica_service_name(cluster: &str) -> String {
    format!("{cluster}-replica")
}

pub fn wal_pvc_name(instance: &str) -> String {
    format!("{instance}-wal")
}

pub fn tablespace_pvc_name(instance: &str, tablespace: &str) -> String {
    format!("{instance}-tablespace-{tablespace}")
}

/// Repository path inside the repo container, `/backrestrepo/<repo name>`
/// unless the spec pins one.
fn repo_path(cluster: &PgCluster, name: &str) -> String {
    if cluster.spec.backrest_repo.repo_path.is_empty() {
        format!("/backrestrepo/{}", backrest_repo_deployment_name(name))
    } else {
        cluster.spec.backrest_repo.repo_path.clone()
    }
}

struct ResolvedStorage {
    access_mode: String,
    size: String,
    storage_class: Option<String>,
}

/// The storage class falls back to the named (or role default) operator
/// storage configuration; access mode and size always come from the spec,
/// which carries defaults of its own.
fn resolve_storage(
    config: &OperatorConfig,
    role_default: &str,
    storage: &StorageSpec,
) -> ResolvedStorage {
    let base = storage.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(role_default);
    let class_from_config = config.storage_config(base).and_then(|c| c.storage_class.clone());
    ResolvedStorage {
        access_mode: storage.access_mode.clone(),
        size: storage.size.clone(),
        storage_class: storage.storage_class.clone().or(class_from_config),
    }
}

fn create_desired_pvc(
    namespace: &str,
    name: &str,
    cluster: &str,
    storage: &ResolvedStorage,
) -> PersistentVolumeClaim {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());

    // no owner reference: data volumes outlive the cluster record until the
    // delete-data task rules on them
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![storage.access_mode.clone()]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn create_desired_instance_deployment(
    config: &OperatorConfig,
    namespace: &str,
    cluster: &PgCluster,
    instance: &str,
    role: &str,
    oref: &OwnerReference,
) -> Deployment {
    let name = cluster.name_any();
    let labels = instance_labels(&name, instance, role);
    let selector = BTreeMap::from([(LABEL_DEPLOYMENT_NAME.to_string(), instance.to_string())]);

    let mode = if role == ROLE_PRIMARY && cluster.spec.standby { "standby" } else { role };
    let (volumes, volume_mounts) = instance_volumes(cluster, instance);

    Deployment {
        metadata: ObjectMeta {
            name: Some(instance.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![oref.clone()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            // the data volume is ReadWriteOnce
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "database".to_string(),
                        image: Some(format!(
                            "{}/postgres:{}",
                            config.image_prefix, cluster.spec.postgres_image_tag
                        )),
                        ports: Some(vec![ContainerPort {
                            container_port: PG_PORT,
                            ..Default::default()
                        }]),
                        env: Some(instance_env(cluster, &name, instance, mode)),
                        resources: container_resources(
                            &cluster.spec.resources,
                            &config.resources.instance_memory,
                        ),
                        volume_mounts: Some(volume_mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn create_desired_repo_deployment(
    config: &OperatorConfig,
    namespace: &str,
    cluster: &PgCluster,
    oref: &OwnerReference,
) -> Deployment {
    let name = cluster.name_any();
    let repo_name = backrest_repo_deployment_name(&name);
    let labels = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), name.clone()),
        (LABEL_BACKREST_REPO.to_string(), LABEL_TRUE.to_string()),
        (LABEL_DEPLOYMENT_NAME.to_string(), repo_name.clone()),
    ]);
    let selector = BTreeMap::from([(LABEL_DEPLOYMENT_NAME.to_string(), repo_name.clone())]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(repo_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![oref.clone()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "backrest-repo".to_string(),
                        image: Some(format!(
                            "{}/pgbackrest:{OPERATOR_VERSION}",
                            config.image_prefix
                        )),
                        ports: Some(vec![ContainerPort {
                            container_port: REPO_PORT,
                            ..Default::default()
                        }]),
                        env: Some(repo_env(config, cluster, &name)),
                        resources: container_resources(
                            &cluster.spec.backrest_resources,
                            &config.resources.backrest_memory,
                        ),
                        volume_mounts: Some(vec![mount("backrestrepo", "/backrestrepo")]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![pvc_volume("backrestrepo", &backrest_repo_pvc_name(&name))]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn create_desired_postgres_service(
    namespace: &str,
    service_name: &str,
    cluster: &str,
    role: &str,
    kind: &ServiceKind,
    oref: &OwnerReference,
) -> Service {
    let selector = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_ROLE.to_string(), role.to_string()),
    ]);
    create_desired_service(namespace, service_name, cluster, selector, PG_PORT, Some(kind), oref)
}

fn create_desired_repo_service(namespace: &str, cluster: &str, oref: &OwnerReference) -> Service {
    let selector = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_BACKREST_REPO.to_string(), LABEL_TRUE.to_string()),
    ]);
    create_desired_service(
        namespace,
        &backrest_repo_deployment_name(cluster),
        cluster,
        selector,
        REPO_PORT,
        None,
        oref,
    )
}

fn create_desired_service(
    namespace: &str,
    name: &str,
    cluster: &str,
    selector: BTreeMap<String, String>,
    port: i32,
    kind: Option<&ServiceKind>,
    oref: &OwnerReference,
) -> Service {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![oref.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            type_: kind.map(ToString::to_string),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn instance_labels(cluster: &str, instance: &str, role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_ROLE.to_string(), role.to_string()),
        (LABEL_DEPLOYMENT_NAME.to_string(), instance.to_string()),
    ])
}

fn instance_env(cluster: &PgCluster, name: &str, instance: &str, mode: &str) -> Vec<EnvVar> {
    let mut env = vec![
        env_var("PG_CLUSTER", name),
        env_var("PG_MODE", mode),
        env_var("PGDATA", &format!("/pgdata/{instance}")),
    ];
    if cluster.spec.tls_only {
        env.push(env_var("PG_TLS_ONLY", "true"));
    }
    env
}

fn repo_env(config: &OperatorConfig, cluster: &PgCluster, name: &str) -> Vec<EnvVar> {
    let mut env = vec![
        env_var("PG_CLUSTER", name),
        env_var("PGBACKREST_REPO1_PATH", &repo_path(cluster, name)),
    ];

    let types: Vec<RepoStorageType> = cluster
        .spec
        .backrest_repo
        .storage_types
        .iter()
        .filter_map(|n| RepoStorageType::from_name(n))
        .collect();
    if types.contains(&RepoStorageType::S3) {
        let inline = S3RepoConfig::default();
        let s3 = cluster.spec.backrest_repo.s3.as_ref().unwrap_or(&inline);
        env.push(env_var("PGBACKREST_REPO1_S3_BUCKET", pick(&s3.bucket, &config.backrest.s3_bucket)));
        env.push(env_var(
            "PGBACKREST_REPO1_S3_ENDPOINT",
            pick(&s3.endpoint, &config.backrest.s3_endpoint),
        ));
        env.push(env_var(
            "PGBACKREST_REPO1_S3_REGION",
            pick(&s3.region, &config.backrest.s3_region),
        ));
    }
    if types.contains(&RepoStorageType::Gcs) {
        let bucket = cluster.spec.backrest_repo.gcs.as_ref().map_or("", |g| g.bucket.as_str());
        env.push(env_var(
            "PGBACKREST_REPO1_GCS_BUCKET",
            pick(bucket, &config.backrest.gcs_bucket),
        ));
    }
    env
}

fn instance_volumes(cluster: &PgCluster, instance: &str) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = vec![pvc_volume("pgdata", instance)];
    let mut mounts = vec![mount("pgdata", "/pgdata")];

    if cluster.spec.wal_storage.is_some() {
        volumes.push(pvc_volume("pgwal", &wal_pvc_name(instance)));
        mounts.push(mount("pgwal", "/pgwal"));
    }
    for tablespace in &cluster.spec.tablespaces {
        let volume_name = format!("tablespace-{}", tablespace.name);
        volumes.push(pvc_volume(&volume_name, &tablespace_pvc_name(instance, &tablespace.name)));
        mounts.push(mount(&volume_name, &format!("/tablespaces/{}", tablespace.name)));
    }
    if let Some(tls) = cluster.spec.tls.as_ref().filter(|t| t.is_enabled()) {
        volumes.push(secret_volume("tls-server", &tls.server_secret));
        mounts.push(mount("tls-server", "/pgconf/tls"));
        volumes.push(secret_volume("tls-ca", &tls.ca_secret));
        mounts.push(mount("tls-ca", "/pgconf/tls-ca"));
        if let Some(replication) = &tls.replication_secret {
            volumes.push(secret_volume("tls-replication", replication));
            mounts.push(mount("tls-replication", "/pgconf/tls-replication"));
        }
    }

    (volumes, mounts)
}

fn container_resources(
    spec: &ResourceRequirementsSpec,
    default_memory: &str,
) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    let memory_request = pick(&spec.memory_request, default_memory);
    if !memory_request.is_empty() {
        requests.insert("memory".to_string(), Quantity(memory_request.to_string()));
    }
    if !spec.cpu_request.is_empty() {
        requests.insert("cpu".to_string(), Quantity(spec.cpu_request.clone()));
    }

    let mut limits = BTreeMap::new();
    if !spec.memory_limit.is_empty() {
        limits.insert("memory".to_string(), Quantity(spec.memory_limit.clone()));
    }
    if !spec.cpu_limit.is_empty() {
        limits.insert("cpu".to_string(), Quantity(spec.cpu_limit.clone()));
    }

    if requests.is_empty() && limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    })
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.to_string()), ..Default::default() }
}

fn pvc_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.to_string(), mount_path: path.to_string(), ..Default::default() }
}

fn namespace_of<K: ResourceExt>(resource: &K) -> Result<String> {
    resource.namespace().ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing(format!(
            "Namespace should always be set on '{}'",
            resource.name_any()
        )))
    })
}

fn owner_ref<K>(resource: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    resource.controller_owner_ref(&()).unwrap_or_else(|| OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        controller: Some(true),
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        ..Default::default()
    })
}

async fn apply_deployment(client: &Client, namespace: &str, desired: &Deployment) -> Result<()> {
    let name = desired.name_any();
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    match deployments.get(&name).await {
        Ok(existing) => {
            if deployment_needs_update(&existing, desired) {
                info!("Updating Deployment '{}'", name);
                deployments
                    .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(desired))
                    .await
                    .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
            } else {
                info!("Deployment '{}' is up to date", name);
            }
        }
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            info!("Creating Deployment '{}'", name);
            deployments
                .create(&PostParams::default(), desired)
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    Ok(())
}

async fn apply_service(client: &Client, namespace: &str, desired: &Service) -> Result<()> {
    let name = desired.name_any();
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);

    match services.get(&name).await {
        Ok(existing) => {
            if service_needs_update(&existing, desired) {
                info!("Updating Service '{}'", name);
                services
                    .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(desired))
                    .await
                    .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
            } else {
                info!("Service '{}' is up to date", name);
            }
        }
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            info!("Creating Service '{}'", name);
            services
                .create(&PostParams::default(), desired)
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    Ok(())
}

/// Volume claims are immutable once bound, so there is no update path.
async fn ensure_pvc(client: &Client, namespace: &str, desired: &PersistentVolumeClaim) -> Result<()> {
    let name = desired.name_any();
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);

    match pvcs.get(&name).await {
        Ok(_) => {}
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            info!("Creating PersistentVolumeClaim '{}'", name);
            pvcs.create(&PostParams::default(), desired)
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    Ok(())
}

fn deployment_needs_update(existing: &Deployment, desired: &Deployment) -> bool {
    let (Some(existing_spec), Some(desired_spec)) = (existing.spec.as_ref(), desired.spec.as_ref())
    else {
        return true;
    };

    fn container(spec: &DeploymentSpec) -> Option<&Container> {
        spec.template.spec.as_ref().and_then(|pod| pod.containers.first())
    }
    let existing_container = container(existing_spec);
    let desired_container = container(desired_spec);

    existing_spec.replicas != desired_spec.replicas
        || existing_container.map(|c| &c.image) != desired_container.map(|c| &c.image)
        || existing_container.map(|c| &c.env) != desired_container.map(|c| &c.env)
        || existing_container.map(|c| &c.resources) != desired_container.map(|c| &c.resources)
        || existing_container.map(|c| &c.volume_mounts) != desired_container.map(|c| &c.volume_mounts)
        || existing_spec.template.spec.as_ref().map(|p| &p.volumes)
            != desired_spec.template.spec.as_ref().map(|p| &p.volumes)
}

fn service_needs_update(existing: &Service, desired: &Service) -> bool {
    let (Some(existing_spec), Some(desired_spec)) = (existing.spec.as_ref(), desired.spec.as_ref())
    else {
        return true;
    };

    existing_spec.selector != desired_spec.selector
        || existing_spec.ports != desired_spec.ports
        || (desired_spec.type_.is_some() && existing_spec.type_ != desired_spec.type_)
}

fn pick<'a>(requested: &'a str, fallback: &'a str) -> &'a str {
    if requested.is_empty() {
        fallback
    } else {
        requested
    }
}

/// `key=value` node selector carried on replica specs.
pub fn parse_node_label(label: &str) -> Option<BTreeMap<String, String>> {
    let (key, value) = label.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some(BTreeMap::from([(key.to_string(), value.to_string())]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::{BackrestRepoSpec, PgClusterSpec, TablespaceSpec, TlsSpec};

    fn cluster(name: &str, spec: PgClusterSpec) -> PgCluster {
        let mut cluster = PgCluster::new(name, spec);
        cluster.metadata.namespace = Some("pgo".to_string());
        cluster
    }

    fn oref() -> OwnerReference {
        OwnerReference { name: "hippo".to_string(), ..Default::default() }
    }

    #[test]
    fn primary_deployment_carries_the_selection_labels() {
        let cluster = cluster("hippo", PgClusterSpec::default());
        let config = OperatorConfig::default();
        let deployment = create_desired_instance_deployment(
            &config,
            "pgo",
            &cluster,
            "hippo",
            ROLE_PRIMARY,
            &oref(),
        );

        assert_eq!(deployment.name_any(), "hippo");
        let pod_labels = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.as_ref())
            .cloned()
            .unwrap_or_default();
        assert_eq!(pod_labels.get(LABEL_CLUSTER).map(String::as_str), Some("hippo"));
        assert_eq!(pod_labels.get(LABEL_ROLE).map(String::as_str), Some(ROLE_PRIMARY));
        assert_eq!(pod_labels.get(LABEL_DEPLOYMENT_NAME).map(String::as_str), Some("hippo"));

        let image = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        assert!(image.starts_with("registry.solidbase.dev/postgres:"));
        assert!(image.ends_with(&cluster.spec.postgres_image_tag));
    }

    #[test]
    fn replica_deployment_mounts_its_own_volumes() {
        let mut spec = PgClusterSpec::default();
        spec.wal_storage = Some(StorageSpec::default());
        spec.tablespaces =
            vec![TablespaceSpec { name: "ts1".to_string(), storage: StorageSpec::default() }];
        let cluster = cluster("hippo", spec);
        let config = OperatorConfig::default();

        let deployment = create_desired_instance_deployment(
            &config,
            "pgo",
            &cluster,
            "hippo-lnxz",
            ROLE_REPLICA,
            &oref(),
        );

        let volumes = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.volumes.clone())
            .unwrap_or_default();
        let claims: Vec<String> = volumes
            .iter()
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .map(|c| c.claim_name.clone())
            .collect();
        assert_eq!(claims, vec!["hippo-lnxz", "hippo-lnxz-wal", "hippo-lnxz-tablespace-ts1"]);
    }

    #[test]
    fn standby_primary_runs_in_standby_mode() {
        let mut spec = PgClusterSpec::default();
        spec.standby = true;
        let cluster = cluster("hippo", spec);
        let config = OperatorConfig::default();

        let deployment = create_desired_instance_deployment(
            &config,
            "pgo",
            &cluster,
            "hippo",
            ROLE_PRIMARY,
            &oref(),
        );
        let env = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.env.clone())
            .unwrap_or_default();
        let mode = env.iter().find(|e| e.name == "PG_MODE").and_then(|e| e.value.clone());
        assert_eq!(mode.as_deref(), Some("standby"));

        // the role label stays primary so the service still selects the pod
        let labels = deployment.labels();
        assert_eq!(labels.get(LABEL_ROLE).map(String::as_str), Some(ROLE_PRIMARY));
    }

    #[test]
    fn tls_material_is_mounted_when_enabled() {
        let mut spec = PgClusterSpec::default();
        spec.tls = Some(TlsSpec {
            server_secret: "hippo-tls".to_string(),
            ca_secret: "hippo-ca".to_string(),
            replication_secret: Some("hippo-repl".to_string()),
        });
        let cluster = cluster("hippo", spec);

        let (volumes, mounts) = instance_volumes(&cluster, "hippo");
        let secret_names: Vec<&str> = volumes
            .iter()
            .filter_map(|v| v.secret.as_ref())
            .filter_map(|s| s.secret_name.as_deref())
            .collect();
        assert_eq!(secret_names, vec!["hippo-tls", "hippo-ca", "hippo-repl"]);
        assert!(mounts.iter().any(|m| m.mount_path == "/pgconf/tls"));
    }

    #[test]
    fn repo_deployment_exports_remote_storage_env() {
        let mut config = OperatorConfig::default();
        config.backrest.s3_endpoint = "s3.amazonaws.com".to_string();
        config.backrest.s3_region = "us-east-1".to_string();

        let mut spec = PgClusterSpec::default();
        spec.backrest_repo = BackrestRepoSpec {
            storage_types: vec!["posix".to_string(), "s3".to_string()],
            s3: Some(S3RepoConfig { bucket: "hippo-backups".to_string(), ..Default::default() }),
            ..Default::default()
        };
        let cluster = cluster("hippo", spec);

        let deployment = create_desired_repo_deployment(&config, "pgo", &cluster, &oref());
        assert_eq!(deployment.name_any(), "hippo-backrest-shared-repo");

        let env = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.env.clone())
            .unwrap_or_default();
        let value = |name: &str| {
            env.iter().find(|e| e.name == name).and_then(|e| e.value.as_deref()).unwrap_or("")
        };
        assert_eq!(value("PGBACKREST_REPO1_S3_BUCKET"), "hippo-backups");
        assert_eq!(value("PGBACKREST_REPO1_S3_ENDPOINT"), "s3.amazonaws.com");
        assert_eq!(value("PGBACKREST_REPO1_PATH"), "/backrestrepo/hippo-backrest-shared-repo");
    }

    #[test]
    fn storage_class_falls_back_to_operator_policy() {
        let mut config = OperatorConfig::default();
        if let Some(default) = config.storage.get_mut("default") {
            default.storage_class = Some("standard".to_string());
        }

        let from_config =
            resolve_storage(&config, "default", &StorageSpec { ..Default::default() });
        assert_eq!(from_config.storage_class.as_deref(), Some("standard"));

        let overridden = resolve_storage(
            &config,
            "default",
            &StorageSpec { storage_class: Some("fast".to_string()), ..Default::default() },
        );
        assert_eq!(overridden.storage_class.as_deref(), Some("fast"));
    }

    #[test]
    fn pvc_has_no_owner_reference() {
        let storage = ResolvedStorage {
            access_mode: "ReadWriteOnce".to_string(),
            size: "1Gi".to_string(),
            storage_class: None,
        };
        let pvc = create_desired_pvc("pgo", "hippo", "hippo", &storage);
        assert!(pvc.metadata.owner_references.is_none());
        let requested = pvc
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .cloned();
        assert_eq!(requested, Some(Quantity("1Gi".to_string())));
    }

    #[test]
    fn deployment_update_detection_tracks_the_pod_template() {
        let cluster = cluster("hippo", PgClusterSpec::default());
        let config = OperatorConfig::default();
        let desired = create_desired_instance_deployment(
            &config,
            "pgo",
            &cluster,
            "hippo",
            ROLE_PRIMARY,
            &oref(),
        );

        let unchanged = desired.clone();
        assert!(!deployment_needs_update(&unchanged, &desired));

        let mut image_changed = desired.clone();
        if let Some(container) = image_changed
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|p| p.containers.first_mut())
        {
            container.image = Some("other:tag".to_string());
        }
        assert!(deployment_needs_update(&image_changed, &desired));
    }

    #[test]
    fn node_labels_parse_as_single_pair_selectors() {
        let selector = parse_node_label("kubernetes.io/hostname=node-3").unwrap();
        assert_eq!(selector.get("kubernetes.io/hostname").map(String::as_str), Some("node-3"));
        assert!(parse_node_label("not-a-pair").is_none());
        assert!(parse_node_label("=empty-key").is_none());
    }

    #[test]
    fn service_update_detection_ignores_defaulted_type() {
        let desired = create_desired_repo_service("pgo", "hippo", &oref());
        let mut existing = desired.clone();
        // the API server fills in ClusterIP when the type is omitted
        if let Some(spec) = existing.spec.as_mut() {
            spec.type_ = Some("ClusterIP".to_string());
        }
        assert!(!service_needs_update(&existing, &desired));

        if let Some(spec) = existing.spec.as_mut() {
            spec.ports = Some(vec![]);
        }
        assert!(service_needs_update(&existing, &desired));
    }
}
