use std::sync::Arc;

use anyhow::Result;
use kube::{
    api::TypeMeta,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    ResourceExt,
};
use pg_cluster::api::v1::PgCluster;
use pg_cluster::config::OperatorConfig;
use pg_cluster::validation::{validate_cluster_spec, validate_cluster_update};
use tracing::{debug, warn};

/// Runs the policy-only admission pipeline against incoming PgCluster
/// writes. Cross-resource checks (secret existence, data source readiness)
/// stay with the create intent; the webhook rejects what is wrong on the
/// face of the document.
#[derive(Clone)]
pub struct ClusterValidator {
    config: Arc<OperatorConfig>,
}

impl ClusterValidator {
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        Self { config }
    }

    pub async fn validate_cluster(
        &self,
        mut review: AdmissionReview<PgCluster>,
    ) -> Result<AdmissionReview<PgCluster>> {
        debug!("Processing admission review for PgCluster");
        let request = match review.request.take() {
            Some(req) => req,
            None => {
                return Ok(AdmissionReview {
                    response: Some(AdmissionResponse::invalid("Missing admission request")),
                    request: None,
                    types: TypeMeta {
                        api_version: "admission.k8s.io/v1".to_string(),
                        kind: "AdmissionReview".to_string(),
                    },
                });
            }
        };

        let mut response = match self.validate_request(&request) {
            Ok(()) => {
                let mut resp = AdmissionResponse::invalid(""); // Will override
                resp.allowed = true;
                resp.result = Default::default();
                resp
            }
            Err(e) => {
                warn!("Validation failed: {}", e);
                AdmissionResponse::invalid(&e.to_string())
            }
        };

        response.uid = request.uid.clone();

        Ok(AdmissionReview {
            response: Some(response),
            request: Some(request),
            types: TypeMeta {
                api_version: "admission.k8s.io/v1".to_string(),
                kind: "AdmissionReview".to_string(),
            },
        })
    }

    fn validate_request(&self, request: &AdmissionRequest<PgCluster>) -> Result<()> {
        // Only validate PgCluster resources
        if request.kind.kind != "PgCluster" {
            return Ok(());
        }

        match request.operation {
            Operation::Create => self.validate_create(request),
            Operation::Update => self.validate_update(request),
            _ => Ok(()), // Allow DELETE and other operations
        }
    }

    fn validate_create(&self, request: &AdmissionRequest<PgCluster>) -> Result<()> {
        let cluster = request
            .object
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Missing object in CREATE request"))?;

        debug!("Validating CREATE for PgCluster {}", cluster.name_any());

        validate_cluster_spec(&self.config, &cluster.spec)?;
        Ok(())
    }

    fn validate_update(&self, request: &AdmissionRequest<PgCluster>) -> Result<()> {
        let new_cluster = request
            .object
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Missing object in UPDATE request"))?;
        let old_cluster = request
            .old_object
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Missing old_object in UPDATE request"))?;

        debug!("Validating UPDATE for PgCluster {}", new_cluster.name_any());

        // Standby can only be switched on while the cluster is shutdown,
        // which only the old object's recorded state can tell us
        validate_cluster_update(&self.config, old_cluster, &new_cluster.spec)?;
        Ok(())
    }
}
