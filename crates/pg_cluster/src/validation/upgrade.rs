//! Upgrade admission: image tag compatibility and the operator version
//! gate.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::UpgradePolicy;
use crate::validation::ValidationError;

/// The PostgreSQL version embedded in an image tag, e.g. `12.9` out of
/// `ubi8-12.9-4.7.4`.
static TAG_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"-(\d+)\.(\d+)\.?(\d+)?-").unwrap());

/// Operator versions are plain `major.minor.patch`.
static OPERATOR_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

/// Extracts the PostgreSQL version from the interior segment of an image
/// tag. Tags follow `<flavor>-<pg version>-<build>`; anything else yields
/// `None`.
pub fn embedded_version(tag: &str) -> Option<PgVersion> {
    let caps = TAG_VERSION.captures(tag)?;
    Some(PgVersion {
        major: caps[1].parse().ok()?,
        minor: caps[2].parse().ok()?,
        patch: caps.get(3).map(|m| m.as_str().parse()).transpose().ok()?,
    })
}

/// An upgrade may only move forward within one PostgreSQL major version.
/// Two-part versions compare on the minor value; three-part versions (the
/// 9.x line) additionally require the minor values to match and compare on
/// the patch value. Equal versions pass so a failed upgrade can be rerun.
pub fn upgrade_tag_valid(from_tag: &str, to_tag: &str) -> bool {
    let (Some(from), Some(to)) = (embedded_version(from_tag), embedded_version(to_tag)) else {
        return false;
    };

    if from.major != to.major {
        return false;
    }

    match (from.patch, to.patch) {
        (None, None) => from.minor <= to.minor,
        (Some(from_patch), Some(to_patch)) => from.minor == to.minor && from_patch <= to_patch,
        _ => false,
    }
}

pub fn validate_upgrade_tag(from_tag: &str, to_tag: &str) -> Result<(), ValidationError> {
    if upgrade_tag_valid(from_tag, to_tag) {
        Ok(())
    } else {
        Err(ValidationError::UpgradeTagRejected {
            from: from_tag.to_string(),
            to: to_tag.to_string(),
        })
    }
}

/// Whether a cluster provisioned by the given operator version can be
/// upgraded by this operator: the major version must match the policy
/// exactly and the minor version must be at least the policy minimum.
pub fn operator_version_supported(policy: &UpgradePolicy, version: &str) -> bool {
    let Some(caps) = OPERATOR_VERSION.captures(version) else {
        return false;
    };
    let (Ok(major), Ok(minor)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
        return false;
    };
    major == policy.required_major && minor >= policy.minimum_minor
}

pub fn validate_operator_version(
    policy: &UpgradePolicy,
    version: &str,
) -> Result<(), ValidationError> {
    if operator_version_supported(policy, version) {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedOperatorVersion {
            version: version.to_string(),
            required_major: policy.required_major,
            minimum_minor: policy.minimum_minor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_interior_version_segment() {
        assert_eq!(
            embedded_version("ubi8-12.9-4.7.4"),
            Some(PgVersion { major: 12, minor: 9, patch: None })
        );
        assert_eq!(
            embedded_version("rocky8-16.4.2-1.2.0"),
            Some(PgVersion { major: 16, minor: 4, patch: Some(2) })
        );
        assert_eq!(
            embedded_version("centos8-9.6.24-4.7.4"),
            Some(PgVersion { major: 9, minor: 6, patch: Some(24) })
        );
        assert_eq!(embedded_version("rocky8-latest"), None);
        assert_eq!(embedded_version("16.4"), None);
        assert_eq!(embedded_version(""), None);
    }

    #[test]
    fn minor_upgrades_within_a_major_version_pass() {
        let valid = [
            ("ubi8-12.9-4.7.4", "ubi8-12.9-4.7.5"),
            ("ubi8-12.9-4.7.4", "ubi8-12.10-4.7.5"),
            ("centos8-9.6.9-4.5.0", "centos8-9.6.24-4.7.4"),
            ("centos8-9.6.9-4.5.0", "centos8-9.6.9-4.7.4"),
        ];
        for (from, to) in valid {
            assert!(upgrade_tag_valid(from, to), "{from} -> {to} should pass");
        }
    }

    #[test]
    fn downgrades_and_major_jumps_are_rejected() {
        let invalid = [
            // moving backwards
            ("ubi8-12.10-4.7.4", "ubi8-12.9-4.7.5"),
            ("centos8-9.6.24-4.7.4", "centos8-9.6.9-4.7.4"),
            // crossing a major version
            ("ubi8-12.9-4.7.4", "ubi8-13.1-4.7.5"),
            ("centos8-9.6.9-4.5.0", "centos8-10.3.1-4.7.4"),
            // two-part and three-part versions never pair up
            ("ubi8-12.9-4.7.4", "ubi8-12.9.3-4.7.5"),
            ("ubi8-12.9.3-4.7.4", "ubi8-12.9-4.7.5"),
            // three-part versions on different minors
            ("centos8-9.6.9-4.5.0", "centos8-9.7.1-4.7.4"),
            // no embedded version at all
            ("rocky8-latest", "ubi8-12.9-4.7.5"),
            ("ubi8-12.9-4.7.4", "garbage"),
        ];
        for (from, to) in invalid {
            assert!(!upgrade_tag_valid(from, to), "{from} -> {to} should fail");
        }
    }

    #[test]
    fn operator_version_gate_matches_the_policy() {
        let policy = UpgradePolicy::default();
        for version in ["1.1.0", "1.2.0", "1.10.3"] {
            assert!(operator_version_supported(&policy, version), "{version}");
        }
        for version in ["1.0.9", "2.1.0", "0.9.0", "1.2", "1.2.3.4", "garbage", ""] {
            assert!(!operator_version_supported(&policy, version), "{version}");
        }

        let strict = UpgradePolicy { required_major: 4, minimum_minor: 1 };
        assert!(operator_version_supported(&strict, "4.1.0"));
        assert!(operator_version_supported(&strict, "4.7.4"));
        assert!(!operator_version_supported(&strict, "3.9.9"));
        assert!(!operator_version_supported(&strict, "5.0.0"));
    }

    #[test]
    fn validators_surface_the_offending_values() {
        assert_eq!(
            validate_upgrade_tag("ubi8-12.10-4.7.4", "ubi8-12.9-4.7.5").unwrap_err(),
            ValidationError::UpgradeTagRejected {
                from: "ubi8-12.10-4.7.4".to_string(),
                to: "ubi8-12.9-4.7.5".to_string(),
            }
        );
        assert_eq!(
            validate_operator_version(&UpgradePolicy::default(), "0.9.0").unwrap_err(),
            ValidationError::UnsupportedOperatorVersion {
                version: "0.9.0".to_string(),
                required_major: 1,
                minimum_minor: 1,
            }
        );
    }
}
