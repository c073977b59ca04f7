//! Standby cluster gates.
//!
//! A standby replays WAL from a remote backup repository instead of
//! accepting writes, so it only makes sense with a remote repository and a
//! repository path to read from. Flipping a live cluster into standby mode
//! would fork its timeline, so the transition is gated on the cluster being
//! shut down first.

use crate::api::v1::{ClusterState, RepoStorageType};
use crate::validation::ValidationError;

/// Gates for admitting a spec with standby enabled.
pub fn validate_standby_create(
    repo_types: &[RepoStorageType],
    repo_path: &str,
) -> Result<(), ValidationError> {
    if !repo_types.iter().any(|t| t.is_remote()) {
        return Err(ValidationError::StandbyRequiresRemoteRepo);
    }
    if repo_path.is_empty() {
        return Err(ValidationError::StandbyRequiresRepoPath);
    }
    Ok(())
}

/// Enabling standby on an existing cluster requires it to be shut down.
/// Disabling standby (promotion) is always allowed.
pub fn validate_standby_transition(
    was_standby: bool,
    standby: bool,
    state: Option<ClusterState>,
) -> Result<(), ValidationError> {
    if standby && !was_standby && state != Some(ClusterState::Shutdown) {
        return Err(ValidationError::StandbyRequiresShutdown {
            state: state.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standby_requires_a_remote_repository() {
        use RepoStorageType::{Gcs, Posix, S3};

        for types in [vec![S3], vec![Gcs], vec![Posix, S3], vec![Posix, Gcs]] {
            validate_standby_create(&types, "/backrestrepo/hippo-backrest-shared-repo").unwrap();
        }
        for types in [vec![], vec![Posix]] {
            assert_eq!(
                validate_standby_create(&types, "/backrestrepo/hippo-backrest-shared-repo")
                    .unwrap_err(),
                ValidationError::StandbyRequiresRemoteRepo
            );
        }
    }

    #[test]
    fn standby_requires_a_repository_path() {
        assert_eq!(
            validate_standby_create(&[RepoStorageType::S3], "").unwrap_err(),
            ValidationError::StandbyRequiresRepoPath
        );
    }

    #[test]
    fn enabling_standby_requires_a_shutdown_cluster() {
        validate_standby_transition(false, true, Some(ClusterState::Shutdown)).unwrap();

        let err =
            validate_standby_transition(false, true, Some(ClusterState::Initialized)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::StandbyRequiresShutdown {
                state: "Initialized".to_string()
            }
        );

        // a cluster that never reported status is not shutdown either
        assert!(validate_standby_transition(false, true, None).is_err());
    }

    #[test]
    fn promotion_and_no_op_transitions_pass() {
        for state in [None, Some(ClusterState::Initialized), Some(ClusterState::Shutdown)] {
            validate_standby_transition(true, false, state).unwrap();
            validate_standby_transition(true, true, state).unwrap();
            validate_standby_transition(false, false, state).unwrap();
        }
    }
}
