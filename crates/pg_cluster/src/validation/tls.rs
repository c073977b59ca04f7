//! TLS secret pairing rules and secret existence checks.

use k8s_openapi::api::core::v1::Secret;
use kube::Api;

use crate::api::v1::{PgClusterSpec, TlsSpec};
use crate::util::errors::{Error, Result, StdError};
use crate::validation::ValidationError;

/// Pairing rules for the TLS secret references, in enforcement order:
/// certificate-authenticated replication needs the server/CA pair, a cluster
/// with no TLS material at all is fine unless it demands TLS-only, and
/// setting one half of the pair without the other is always an error.
pub fn validate_tls_spec(spec: &PgClusterSpec) -> Result<(), ValidationError> {
    let tls = spec.tls.as_ref();
    let server = tls.map_or("", |t| t.server_secret.as_str());
    let ca = tls.map_or("", |t| t.ca_secret.as_str());
    let replication = tls.and_then(|t| t.replication_secret.as_deref()).unwrap_or("");

    if !replication.is_empty() && (server.is_empty() || ca.is_empty()) {
        return Err(ValidationError::ReplicationTlsWithoutSecrets);
    }

    if !spec.tls_only && server.is_empty() && ca.is_empty() {
        return Ok(());
    }

    if spec.tls_only && (server.is_empty() || ca.is_empty()) {
        return Err(ValidationError::TlsOnlyWithoutSecrets);
    }

    if server.is_empty() != ca.is_empty() {
        return Err(ValidationError::TlsPairIncomplete);
    }

    Ok(())
}

/// Every secret the TLS spec names must already exist in the cluster
/// namespace.
pub async fn ensure_tls_secrets(client: &kube::Client, namespace: &str, tls: &TlsSpec) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    for name in [tls.server_secret.as_str(), tls.ca_secret.as_str()]
        .into_iter()
        .chain(tls.replication_secret.as_deref())
        .filter(|n| !n.is_empty())
    {
        ensure_secret(&secrets, name).await?;
    }
    Ok(())
}

async fn ensure_secret(secrets: &Api<Secret>, name: &str) -> Result<()> {
    match secrets.get(name).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => {
            Err(ValidationError::SecretNotFound { name: name.to_string() }.into())
        }
        Err(e) => Err(Error::StdError(StdError::KubeError(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(server: &str, ca: &str, replication: Option<&str>, tls_only: bool) -> PgClusterSpec {
        PgClusterSpec {
            tls: Some(TlsSpec {
                server_secret: server.to_string(),
                ca_secret: ca.to_string(),
                replication_secret: replication.map(str::to_string),
            }),
            tls_only,
            ..PgClusterSpec::default()
        }
    }

    #[test]
    fn cluster_without_tls_material_passes() {
        validate_tls_spec(&PgClusterSpec::default()).unwrap();
        validate_tls_spec(&spec("", "", None, false)).unwrap();
    }

    #[test]
    fn complete_pairs_pass() {
        validate_tls_spec(&spec("hippo-tls", "hippo-ca", None, false)).unwrap();
        validate_tls_spec(&spec("hippo-tls", "hippo-ca", Some("hippo-repl"), false)).unwrap();
        validate_tls_spec(&spec("hippo-tls", "hippo-ca", None, true)).unwrap();
    }

    #[test]
    fn half_a_pair_is_rejected() {
        assert_eq!(
            validate_tls_spec(&spec("hippo-tls", "", None, false)).unwrap_err(),
            ValidationError::TlsPairIncomplete
        );
        assert_eq!(
            validate_tls_spec(&spec("", "hippo-ca", None, false)).unwrap_err(),
            ValidationError::TlsPairIncomplete
        );
    }

    #[test]
    fn tls_only_demands_the_pair() {
        assert_eq!(
            validate_tls_spec(&spec("", "", None, true)).unwrap_err(),
            ValidationError::TlsOnlyWithoutSecrets
        );
        assert_eq!(
            validate_tls_spec(&spec("hippo-tls", "", None, true)).unwrap_err(),
            ValidationError::TlsOnlyWithoutSecrets
        );
        let mut no_tls_block = PgClusterSpec::default();
        no_tls_block.tls_only = true;
        assert_eq!(
            validate_tls_spec(&no_tls_block).unwrap_err(),
            ValidationError::TlsOnlyWithoutSecrets
        );
    }

    #[test]
    fn replication_auth_demands_the_pair() {
        assert_eq!(
            validate_tls_spec(&spec("", "", Some("hippo-repl"), false)).unwrap_err(),
            ValidationError::ReplicationTlsWithoutSecrets
        );
        assert_eq!(
            validate_tls_spec(&spec("hippo-tls", "", Some("hippo-repl"), false)).unwrap_err(),
            ValidationError::ReplicationTlsWithoutSecrets
        );
    }
}
