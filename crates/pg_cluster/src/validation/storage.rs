//! Backup repository storage types and named storage-configuration
//! references.

use crate::api::v1::{BackrestRepoSpec, PgClusterSpec, RepoStorageType, S3RepoConfig, StorageSpec};
use crate::config::OperatorConfig;
use crate::validation::ValidationError;

/// Normalizes the requested storage type names: the deprecated `local`
/// spelling maps to `posix`, duplicates collapse, unknown names and the
/// s3/gcs combination are rejected. An empty request is valid and means the
/// repository is local-only.
pub fn parse_storage_types(raw: &[String]) -> Result<Vec<RepoStorageType>, ValidationError> {
    let mut types = Vec::new();
    for name in raw.iter().filter(|n| !n.is_empty()) {
        let parsed = RepoStorageType::from_name(name)
            .ok_or_else(|| ValidationError::UnknownStorageType { name: name.clone() })?;
        if !types.contains(&parsed) {
            types.push(parsed);
        }
    }

    if types.contains(&RepoStorageType::S3) && types.contains(&RepoStorageType::Gcs) {
        return Err(ValidationError::StorageTypesMutuallyExclusive);
    }

    Ok(types)
}

/// Checks the repository spec is usable: the storage types parse, and any
/// remote type has its connection material either inline in the spec or in
/// operator policy defaults.
pub fn validate_backrest_repo(
    config: &OperatorConfig,
    repo: &BackrestRepoSpec,
) -> Result<Vec<RepoStorageType>, ValidationError> {
    let types = parse_storage_types(&repo.storage_types)?;

    if types.contains(&RepoStorageType::S3) {
        let inline = S3RepoConfig::default();
        let s3 = repo.s3.as_ref().unwrap_or(&inline);
        let bucket = pick(&s3.bucket, &config.backrest.s3_bucket);
        let endpoint = pick(&s3.endpoint, &config.backrest.s3_endpoint);
        let region = pick(&s3.region, &config.backrest.s3_region);
        if bucket.is_empty() || endpoint.is_empty() || region.is_empty() {
            return Err(ValidationError::MissingS3Config);
        }
    }

    if let Some(gcs) = repo.gcs.as_ref().filter(|_| types.contains(&RepoStorageType::Gcs)) {
        if gcs.key_type != "service" && gcs.key_type != "token" {
            return Err(ValidationError::InvalidGcsKeyType {
                value: gcs.key_type.clone(),
            });
        }
    }
    if types.contains(&RepoStorageType::Gcs) {
        let bucket = repo.gcs.as_ref().map_or("", |g| g.bucket.as_str());
        if pick(bucket, &config.backrest.gcs_bucket).is_empty() {
            return Err(ValidationError::MissingGcsConfig);
        }
    }

    Ok(types)
}

/// Every named storage configuration the spec references must exist in
/// operator policy. Unnamed storage draws the role default and always
/// passes.
pub fn validate_storage_references(
    config: &OperatorConfig,
    spec: &PgClusterSpec,
) -> Result<(), ValidationError> {
    check_reference(config, &spec.primary_storage, "primary storage")?;
    check_reference(config, &spec.backrest_storage, "pgBackRest storage")?;
    if let Some(storage) = &spec.replica_storage {
        check_reference(config, storage, "replica storage")?;
    }
    if let Some(storage) = &spec.wal_storage {
        check_reference(config, storage, "WAL storage")?;
    }
    if let Some(storage) = &spec.pgadmin_storage {
        check_reference(config, storage, "pgAdmin storage")?;
    }
    for tablespace in &spec.tablespaces {
        let role = format!("tablespace {:?}", tablespace.name);
        check_reference(config, &tablespace.storage, &role)?;
    }
    Ok(())
}

fn check_reference(
    config: &OperatorConfig,
    storage: &StorageSpec,
    role: &str,
) -> Result<(), ValidationError> {
    let Some(name) = storage.name.as_deref().filter(|n| !n.is_empty()) else {
        return Ok(());
    };
    if config.storage_config(name).is_none() {
        return Err(ValidationError::UnknownStorageConfig {
            name: name.to_string(),
            role: role.to_string(),
        });
    }
    Ok(())
}

fn pick<'a>(requested: &'a str, fallback: &'a str) -> &'a str {
    if requested.is_empty() {
        fallback
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::{GcsRepoConfig, TablespaceSpec};

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn normalizes_known_storage_types() {
        let cases: &[(&[&str], &[RepoStorageType])] = &[
            (&[], &[]),
            (&["local"], &[RepoStorageType::Posix]),
            (&["posix"], &[RepoStorageType::Posix]),
            (&["s3"], &[RepoStorageType::S3]),
            (&["gcs"], &[RepoStorageType::Gcs]),
            (&["posix", "s3"], &[RepoStorageType::Posix, RepoStorageType::S3]),
            (&["local", "s3"], &[RepoStorageType::Posix, RepoStorageType::S3]),
            (&["posix", "gcs"], &[RepoStorageType::Posix, RepoStorageType::Gcs]),
            (&["local", "posix"], &[RepoStorageType::Posix]),
        ];
        for (raw, want) in cases {
            let got = parse_storage_types(&names(raw)).unwrap();
            assert_eq!(got.as_slice(), *want, "input {raw:?}");
        }
    }

    #[test]
    fn rejects_unknown_and_conflicting_storage_types() {
        assert_eq!(
            parse_storage_types(&names(&["grumpy-cat"])).unwrap_err(),
            ValidationError::UnknownStorageType {
                name: "grumpy-cat".to_string()
            }
        );
        assert_eq!(
            parse_storage_types(&names(&["s3", "gcs"])).unwrap_err(),
            ValidationError::StorageTypesMutuallyExclusive
        );
        assert_eq!(
            parse_storage_types(&names(&["posix", "s3", "gcs"])).unwrap_err(),
            ValidationError::StorageTypesMutuallyExclusive
        );
    }

    fn s3_repo(bucket: &str, endpoint: &str, region: &str) -> BackrestRepoSpec {
        BackrestRepoSpec {
            storage_types: names(&["s3"]),
            s3: Some(S3RepoConfig {
                bucket: bucket.to_string(),
                endpoint: endpoint.to_string(),
                region: region.to_string(),
            }),
            ..BackrestRepoSpec::default()
        }
    }

    #[test]
    fn s3_repo_requires_complete_connection_material() {
        let config = OperatorConfig::default();

        validate_backrest_repo(&config, &s3_repo("bucket", "s3.local", "us-east-1")).unwrap();

        for incomplete in [
            s3_repo("", "s3.local", "us-east-1"),
            s3_repo("bucket", "", "us-east-1"),
            s3_repo("bucket", "s3.local", ""),
        ] {
            assert_eq!(
                validate_backrest_repo(&config, &incomplete).unwrap_err(),
                ValidationError::MissingS3Config
            );
        }
    }

    #[test]
    fn operator_policy_fills_missing_s3_fields() {
        let mut config = OperatorConfig::default();
        config.backrest.s3_endpoint = "s3.amazonaws.com".to_string();
        config.backrest.s3_region = "us-east-1".to_string();

        validate_backrest_repo(&config, &s3_repo("bucket", "", "")).unwrap();
        // the bucket has no policy default here, so it still has to be inline
        assert_eq!(
            validate_backrest_repo(&config, &s3_repo("", "", "")).unwrap_err(),
            ValidationError::MissingS3Config
        );
    }

    #[test]
    fn gcs_repo_requires_bucket_and_known_key_type() {
        let config = OperatorConfig::default();
        let repo = |bucket: &str, key_type: &str| BackrestRepoSpec {
            storage_types: names(&["gcs"]),
            gcs: Some(GcsRepoConfig {
                bucket: bucket.to_string(),
                key_type: key_type.to_string(),
            }),
            ..BackrestRepoSpec::default()
        };

        validate_backrest_repo(&config, &repo("bucket", "service")).unwrap();
        validate_backrest_repo(&config, &repo("bucket", "token")).unwrap();
        assert_eq!(
            validate_backrest_repo(&config, &repo("", "service")).unwrap_err(),
            ValidationError::MissingGcsConfig
        );
        assert_eq!(
            validate_backrest_repo(&config, &repo("bucket", "not-a-type")).unwrap_err(),
            ValidationError::InvalidGcsKeyType {
                value: "not-a-type".to_string()
            }
        );
    }

    #[test]
    fn remote_material_is_ignored_for_local_repos() {
        let config = OperatorConfig::default();
        // incomplete s3 block, but s3 is not a requested storage type
        let repo = BackrestRepoSpec {
            storage_types: names(&["posix"]),
            s3: Some(S3RepoConfig::default()),
            gcs: Some(GcsRepoConfig::default()),
            ..BackrestRepoSpec::default()
        };
        assert_eq!(validate_backrest_repo(&config, &repo).unwrap(), vec![RepoStorageType::Posix]);
    }

    #[test]
    fn named_storage_must_exist_in_operator_policy() {
        let config = OperatorConfig::default();
        let mut spec = PgClusterSpec::default();
        spec.primary_storage.name = Some("default".to_string());
        validate_storage_references(&config, &spec).unwrap();

        spec.primary_storage.name = Some("grumpy-cat".to_string());
        assert_eq!(
            validate_storage_references(&config, &spec).unwrap_err(),
            ValidationError::UnknownStorageConfig {
                name: "grumpy-cat".to_string(),
                role: "primary storage".to_string(),
            }
        );
    }

    #[test]
    fn tablespace_storage_references_are_checked() {
        let config = OperatorConfig::default();
        let mut spec = PgClusterSpec::default();
        spec.tablespaces = vec![TablespaceSpec {
            name: "ts1".to_string(),
            storage: StorageSpec {
                name: Some("missing".to_string()),
                ..StorageSpec::default()
            },
        }];
        assert_eq!(
            validate_storage_references(&config, &spec).unwrap_err(),
            ValidationError::UnknownStorageConfig {
                name: "missing".to_string(),
                role: "tablespace \"ts1\"".to_string(),
            }
        );
    }
}
