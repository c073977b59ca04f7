//! Policy attachment. Policy names accumulate in one comma-separated
//! cluster annotation; the database-side application happens inside the
//! instance containers, which watch the annotation.

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::info;

use crate::api::v1::{PgCluster, ANNOTATION_POLICIES};
use crate::util::errors::{Error, Result, StdError};

pub async fn apply_policies(
    client: &Client,
    namespace: &str,
    cluster: &str,
    policies: &[String],
) -> Result<()> {
    let clusters: Api<PgCluster> = Api::namespaced(client.clone(), namespace);
    let current = match clusters.get(cluster).await {
        Ok(current) => current,
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            return Err(Error::StdError(StdError::NotFound {
                kind: "pgcluster",
                name: cluster.to_string(),
            }));
        }
        Err(e) => return Err(Error::StdError(StdError::KubeError(e))),
    };

    let existing = current.annotations().get(ANNOTATION_POLICIES).map(String::as_str);
    let merged = merge_policy_annotation(existing, policies);
    if existing == Some(merged.as_str()) {
        info!("Policies on cluster '{}' already up to date", cluster);
        return Ok(());
    }

    let patch = Patch::Merge(json!({
        "metadata": {
            "resourceVersion": current.resource_version(),
            "annotations": { ANNOTATION_POLICIES: merged },
        }
    }));
    match clusters.patch(cluster, &PatchParams::default(), &patch).await {
        Ok(_) => {
            info!("Attached policies {:?} to cluster '{}'", policies, cluster);
            Ok(())
        }
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
            Err(Error::StdError(StdError::WriteConflict { name: cluster.to_string() }))
        }
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}

/// Order-preserving union of the already-attached names and the request.
fn merge_policy_annotation(existing: Option<&str>, requested: &[String]) -> String {
    let mut names: Vec<&str> = existing
        .unwrap_or_default()
        .split(',')
        .filter(|name| !name.is_empty())
        .collect();
    for policy in requested {
        if !policy.is_empty() && !names.contains(&policy.as_str()) {
            names.push(policy);
        }
    }
    names.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_accumulate_without_duplicates() {
        let merged = merge_policy_annotation(
            Some("audit,rls"),
            &["rls".to_string(), "pgaudit".to_string()],
        );
        assert_eq!(merged, "audit,rls,pgaudit");
    }

    #[test]
    fn first_attachment_starts_the_list() {
        let merged = merge_policy_annotation(None, &["audit".to_string()]);
        assert_eq!(merged, "audit");
    }

    #[test]
    fn empty_names_are_dropped() {
        let merged = merge_policy_annotation(Some(""), &[String::new(), "audit".to_string()]);
        assert_eq!(merged, "audit");
    }
}
