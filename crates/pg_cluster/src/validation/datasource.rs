//! Data-source admission: bootstrapping a new cluster from another
//! cluster's backup repository.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::api::v1::{
    backrest_repo_pvc_name, backrest_repo_secret_name, ClusterState, DataSourceSpec, PgCluster,
    PgClusterSpec, ANNOTATION_S3_BUCKET, ANNOTATION_S3_ENDPOINT, ANNOTATION_S3_REGION,
    SECRET_KEY_S3_KEY, SECRET_KEY_S3_KEY_SECRET,
};
use crate::util::errors::{Error, Result, StdError};
use crate::validation::ValidationError;

static S3_REPO_TYPE_OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"--repo-type=["']?s3["']?"#).unwrap());

/// Restore options select the s3 repository when `--repo-type=s3` appears,
/// optionally quoted.
pub fn requests_s3_repo(restore_opts: &str) -> bool {
    S3_REPO_TYPE_OPTION.is_match(restore_opts)
}

/// Shape check: restore options are meaningless without a cluster to restore
/// from.
pub fn validate_data_source_shape(spec: &PgClusterSpec) -> Result<(), ValidationError> {
    let Some(source) = &spec.data_source else {
        return Ok(());
    };
    if source.restore_from.is_empty() && !source.restore_opts.is_empty() {
        return Err(ValidationError::RestoreOptsWithoutSource);
    }
    Ok(())
}

/// Cross-resource admission for a data source. The source repository PVC and
/// credential secret must exist, the secret must carry complete s3 material
/// when the restore options select the s3 repository, the source cluster (if
/// it still exists) must not be shut down, and no other cluster may be
/// bootstrapping from the same source at the moment.
pub async fn validate_data_source(
    client: &kube::Client,
    namespace: &str,
    source: &DataSourceSpec,
) -> Result<()> {
    if source.restore_from.is_empty() {
        return Ok(());
    }
    let restore_from = source.restore_from.as_str();

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let pvc_name = backrest_repo_pvc_name(restore_from);
    match pvcs.get(&pvc_name).await {
        Ok(_) => {}
        Err(kube::Error::Api(err)) if err.code == 404 => {
            return Err(ValidationError::DataSourcePvcMissing {
                pvc: pvc_name,
                cluster: restore_from.to_string(),
            }
            .into());
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret_name = backrest_repo_secret_name(restore_from);
    let secret = match secrets.get(&secret_name).await {
        Ok(secret) => secret,
        Err(kube::Error::Api(err)) if err.code == 404 => {
            return Err(ValidationError::DataSourceSecretMissing {
                secret: secret_name,
                cluster: restore_from.to_string(),
            }
            .into());
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    };

    if requests_s3_repo(&source.restore_opts) && missing_s3_material(&secret) {
        return Err(ValidationError::DataSourceSecretIncomplete { secret: secret_name }.into());
    }

    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), namespace);
    match clusters.get(restore_from).await {
        Ok(cluster) => {
            if cluster.status.as_ref().and_then(|s| s.state) == Some(ClusterState::Shutdown) {
                return Err(ValidationError::DataSourceShutdown {
                    cluster: restore_from.to_string(),
                }
                .into());
            }
        }
        // a deleted source cluster is fine as long as its repo artifacts survive
        Err(kube::Error::Api(err)) if err.code == 404 => {}
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    }

    let all = clusters
        .list(&ListParams::default())
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
    for other in all {
        let bootstrapping =
            other.status.as_ref().and_then(|s| s.state) == Some(ClusterState::Bootstrapping);
        let same_source = other
            .spec
            .data_source
            .as_ref()
            .is_some_and(|s| s.restore_from == restore_from);
        if bootstrapping && same_source {
            return Err(ValidationError::DataSourceBusy {
                cluster: other.name_any(),
                source_cluster: restore_from.to_string(),
            }
            .into());
        }
    }

    Ok(())
}

/// The repository secret must carry the s3 connection annotations and both
/// credential keys before an s3 restore can work.
fn missing_s3_material(secret: &Secret) -> bool {
    let has_annotation = |key: &str| {
        secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .is_some_and(|v| !v.is_empty())
    };
    let has_data_key = |key: &str| secret.data.as_ref().is_some_and(|d| d.contains_key(key));

    !(has_annotation(ANNOTATION_S3_BUCKET)
        && has_annotation(ANNOTATION_S3_ENDPOINT)
        && has_annotation(ANNOTATION_S3_REGION)
        && has_data_key(SECRET_KEY_S3_KEY)
        && has_data_key(SECRET_KEY_S3_KEY_SECRET))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;

    use super::*;

    #[test]
    fn detects_the_s3_repo_type_option() {
        for opts in [
            "--repo-type=s3",
            "--repo-type=\"s3\"",
            "--repo-type='s3'",
            "--repo1-path=/backrestrepo/hippo-backrest-shared-repo --repo-type=s3 --delta",
        ] {
            assert!(requests_s3_repo(opts), "{opts:?} should select s3");
        }
        for opts in ["", "--repo-type=posix", "--delta", "--repo-type= s3"] {
            assert!(!requests_s3_repo(opts), "{opts:?} should not select s3");
        }
    }

    #[test]
    fn restore_opts_require_a_source_cluster() {
        validate_data_source_shape(&PgClusterSpec::default()).unwrap();

        let mut spec = PgClusterSpec::default();
        spec.data_source = Some(DataSourceSpec {
            restore_from: "hippo".to_string(),
            restore_opts: "--delta".to_string(),
        });
        validate_data_source_shape(&spec).unwrap();

        spec.data_source = Some(DataSourceSpec {
            restore_from: String::new(),
            restore_opts: "--delta".to_string(),
        });
        assert_eq!(
            validate_data_source_shape(&spec).unwrap_err(),
            ValidationError::RestoreOptsWithoutSource
        );
    }

    fn repo_secret() -> Secret {
        let mut secret = Secret::default();
        secret.metadata.annotations = Some(BTreeMap::from([
            (ANNOTATION_S3_BUCKET.to_string(), "bucket".to_string()),
            (ANNOTATION_S3_ENDPOINT.to_string(), "s3.local".to_string()),
            (ANNOTATION_S3_REGION.to_string(), "us-east-1".to_string()),
        ]));
        secret.data = Some(BTreeMap::from([
            (SECRET_KEY_S3_KEY.to_string(), ByteString(b"key".to_vec())),
            (SECRET_KEY_S3_KEY_SECRET.to_string(), ByteString(b"secret".to_vec())),
        ]));
        secret
    }

    #[test]
    fn complete_s3_material_is_accepted() {
        assert!(!missing_s3_material(&repo_secret()));
    }

    #[test]
    fn incomplete_s3_material_is_detected() {
        let mut no_region = repo_secret();
        if let Some(annotations) = no_region.metadata.annotations.as_mut() {
            annotations.remove(ANNOTATION_S3_REGION);
        }
        assert!(missing_s3_material(&no_region));

        let mut empty_bucket = repo_secret();
        if let Some(annotations) = empty_bucket.metadata.annotations.as_mut() {
            annotations.insert(ANNOTATION_S3_BUCKET.to_string(), String::new());
        }
        assert!(missing_s3_material(&empty_bucket));

        let mut no_key = repo_secret();
        if let Some(data) = no_key.data.as_mut() {
            data.remove(SECRET_KEY_S3_KEY_SECRET);
        }
        assert!(missing_s3_material(&no_key));

        assert!(missing_s3_material(&Secret::default()));
    }
}
