//! pgAdmin sidecar deployment, added and removed by task.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::info;

use crate::api::v1::{PgCluster, StorageSpec, LABEL_CLUSTER, LABEL_DEPLOYMENT_NAME};
use crate::config::{OperatorConfig, OPERATOR_VERSION};
use crate::util::errors::{Error, Result, StdError};

static FIELD_MANAGER: &str = "pg-pgadmin-operator";

const PGADMIN_PORT: i32 = 5050;

pub fn pgadmin_name(cluster: &str) -> String {
    format!("{cluster}-pgadmin")
}

/// Creates the pgAdmin claim, deployment and service for a cluster. All
/// three are owned by the cluster record.
pub async fn add(client: &Client, config: &OperatorConfig, cluster: &PgCluster) -> Result<()> {
    let cluster_name = cluster.name_any();
    let ns = cluster.namespace().ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing(format!(
            "pgcluster {cluster_name} has no namespace"
        )))
    })?;
    let name = pgadmin_name(&cluster_name);
    info!("Adding pgAdmin '{}' in namespace '{}'", name, ns);

    let oref = cluster.controller_owner_ref(&()).unwrap_or_else(|| OwnerReference {
        api_version: PgCluster::api_version(&()).into_owned(),
        kind: PgCluster::kind(&()).into_owned(),
        controller: Some(true),
        name: cluster_name.clone(),
        uid: cluster.uid().unwrap_or_default(),
        ..Default::default()
    });

    let storage = cluster.spec.pgadmin_storage.clone().unwrap_or_default();
    ensure_pvc(client, &ns, &create_desired_pvc(config, &ns, &name, &cluster_name, &storage))
        .await?;

    let deployment = create_desired_deployment(config, &ns, &cluster_name, &oref);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
    match deployments.get(&name).await {
        Ok(_) => {
            deployments
                .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&deployment))
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        }
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            info!("Creating Deployment '{}'", name);
            deployments
                .create(&PostParams::default(), &deployment)
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    let service = create_desired_service(&ns, &cluster_name, &oref);
    let services: Api<Service> = Api::namespaced(client.clone(), &ns);
    match services.get(&name).await {
        Ok(_) => {}
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            info!("Creating Service '{}'", name);
            services
                .create(&PostParams::default(), &service)
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    Ok(())
}

/// Removes the pgAdmin deployment and service. The claim stays behind with
/// the rest of the cluster's data volumes.
pub async fn remove(client: &Client, namespace: &str, cluster: &str) -> Result<()> {
    let name = pgadmin_name(cluster);
    info!("Removing pgAdmin '{}' in namespace '{}'", name, namespace);

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    match deployments.delete(&name, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted Deployment '{}'", name),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {}
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    match services.delete(&name, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted Service '{}'", name),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {}
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    Ok(())
}

fn create_desired_pvc(
    config: &OperatorConfig,
    namespace: &str,
    name: &str,
    cluster: &str,
    storage: &StorageSpec,
) -> PersistentVolumeClaim {
    let base = storage.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&config.primary_storage);
    let storage_class = storage
        .storage_class
        .clone()
        .or_else(|| config.storage_config(base).and_then(|c| c.storage_class.clone()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(LABEL_CLUSTER.to_string(), cluster.to_string())])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![storage.access_mode.clone()]),
            storage_class_name: storage_class,
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

fn create_desired_deployment(
    config: &OperatorConfig,
    namespace: &str,
    cluster: &str,
    oref: &OwnerReference,
) -> Deployment {
    let name = pgadmin_name(cluster);
    let labels = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_DEPLOYMENT_NAME.to_string(), name.clone()),
    ]);
    let selector = BTreeMap::from([(LABEL_DEPLOYMENT_NAME.to_string(), name.clone())]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![oref.clone()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "pgadmin".to_string(),
                        image: Some(format!(
                            "{}/pgadmin4:{OPERATOR_VERSION}",
                            config.image_prefix
                        )),
                        ports: Some(vec![ContainerPort {
                            container_port: PGADMIN_PORT,
                            ..Default::default()
                        }]),
                        env: Some(vec![
                            EnvVar {
                                name: "PG_CLUSTER".to_string(),
                                value: Some(cluster.to_string()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "PGADMIN_LISTEN_PORT".to_string(),
                                value: Some(PGADMIN_PORT.to_string()),
                                ..Default::default()
                            },
                        ]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "pgadmin-data".to_string(),
                            mount_path: "/var/lib/pgadmin".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "pgadmin-data".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: name,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn create_desired_service(namespace: &str, cluster: &str, oref: &OwnerReference) -> Service {
    let name = pgadmin_name(cluster);
    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(LABEL_CLUSTER.to_string(), cluster.to_string())])),
            owner_references: Some(vec![oref.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(LABEL_DEPLOYMENT_NAME.to_string(), name)])),
            ports: Some(vec![ServicePort {
                port: PGADMIN_PORT,
                target_port: Some(IntOrString::Int(PGADMIN_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn ensure_pvc(client: &Client, namespace: &str, desired: &PersistentVolumeClaim) -> Result<()> {
    let name = desired.name_any();
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);

    match pvcs.get(&name).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            info!("Creating PersistentVolumeClaim '{}'", name);
            pvcs.create(&PostParams::default(), desired)
                .await
                .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
            Ok(())
        }
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pgadmin_resources_share_the_deployment_name() {
        let config = OperatorConfig::default();
        let oref = OwnerReference { name: "hippo".to_string(), ..Default::default() };
        let deployment = create_desired_deployment(&config, "pgo", "hippo", &oref);
        let service = create_desired_service("pgo", "hippo", &oref);

        assert_eq!(deployment.name_any(), "hippo-pgadmin");
        assert_eq!(service.name_any(), "hippo-pgadmin");
        let selector = service
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.get(LABEL_DEPLOYMENT_NAME))
            .cloned();
        assert_eq!(selector.as_deref(), Some("hippo-pgadmin"));
    }

    #[test]
    fn pgadmin_claim_defaults_to_primary_storage_policy() {
        let mut config = OperatorConfig::default();
        if let Some(default) = config.storage.get_mut("default") {
            default.storage_class = Some("standard".to_string());
        }
        let pvc =
            create_desired_pvc(&config, "pgo", "hippo-pgadmin", "hippo", &StorageSpec::default());
        let class = pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone());
        assert_eq!(class.as_deref(), Some("standard"));
        assert!(pvc.metadata.owner_references.is_none());
    }
}
