//! Kubernetes resource-quantity parsing and the request/limit gate.

use crate::api::v1::PgClusterSpec;
use crate::config::OperatorConfig;
use crate::validation::ValidationError;

/// Binary-SI suffixes, powers of 1024.
const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1_024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

/// Decimal-SI suffixes, powers of 10.
const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parses a quantity string (`512Mi`, `0.5`, `2k`, `1e3`) into its numeric
/// value. The grammar is the Kubernetes one: a signed decimal number with an
/// optional exponent, followed by an optional binary or decimal suffix.
pub fn parse_quantity(raw: &str) -> Result<f64, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidQuantity {
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(invalid("empty string"));
    }

    let (number, multiplier) = split_suffix(raw);
    if !is_plain_number(number) {
        return Err(invalid("not a decimal number"));
    }

    let value: f64 = number.parse().map_err(|_| invalid("not a decimal number"))?;
    if !value.is_finite() {
        return Err(invalid("out of range"));
    }

    Ok(value * multiplier)
}

/// Checks a quantity string parses. Empty is allowed: callers substitute a
/// configured default later.
pub fn validate_quantity(raw: &str) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Ok(());
    }
    parse_quantity(raw).map(|_| ())
}

/// The request/limit gate: both must parse, the configured default
/// substitutes for an empty or zero request, and when both sides are
/// non-zero the limit must be at least the request.
pub fn validate_request_limit(
    request: &str,
    limit: &str,
    default_request: &str,
) -> Result<(), ValidationError> {
    validate_quantity(request)?;
    validate_quantity(limit)?;

    let mut effective_request = request;
    let mut request_value = if request.is_empty() {
        0.0
    } else {
        parse_quantity(request)?
    };

    if request_value == 0.0 && !default_request.is_empty() {
        effective_request = default_request;
        request_value = parse_quantity(default_request)?;
    }

    let limit_value = if limit.is_empty() {
        0.0
    } else {
        parse_quantity(limit)?
    };

    if limit_value != 0.0 && request_value != 0.0 && limit_value < request_value {
        return Err(ValidationError::LimitBelowRequest {
            request: effective_request.to_string(),
            limit: limit.to_string(),
        });
    }

    Ok(())
}

/// Every quantity a cluster spec carries: the container resource pairs
/// (memory pairs draw their defaults from operator policy) and each declared
/// volume size.
pub fn validate_cluster_quantities(
    config: &OperatorConfig,
    spec: &PgClusterSpec,
) -> Result<(), ValidationError> {
    validate_request_limit(
        &spec.resources.memory_request,
        &spec.resources.memory_limit,
        &config.resources.instance_memory,
    )?;
    validate_request_limit(&spec.resources.cpu_request, &spec.resources.cpu_limit, "")?;
    validate_request_limit(
        &spec.backrest_resources.memory_request,
        &spec.backrest_resources.memory_limit,
        &config.resources.backrest_memory,
    )?;
    validate_request_limit(
        &spec.backrest_resources.cpu_request,
        &spec.backrest_resources.cpu_limit,
        "",
    )?;

    validate_quantity(&spec.primary_storage.size)?;
    validate_quantity(&spec.backrest_storage.size)?;
    for storage in [&spec.replica_storage, &spec.wal_storage, &spec.pgadmin_storage]
        .into_iter()
        .flatten()
    {
        validate_quantity(&storage.size)?;
    }
    for tablespace in &spec.tablespaces {
        validate_quantity(&tablespace.storage.size)?;
    }

    Ok(())
}

fn split_suffix(raw: &str) -> (&str, f64) {
    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return (number, *multiplier);
        }
    }
    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return (number, *multiplier);
        }
    }
    (raw, 1.0)
}

/// Signed decimal with at most one dot and an optional `e`/`E` exponent.
/// Rules out the `inf`/`nan` spellings `str::parse::<f64>` would accept.
fn is_plain_number(s: &str) -> bool {
    let mut chars = s.chars().peekable();

    if matches!(chars.peek(), Some('+') | Some('-')) {
        chars.next();
    }

    let mut digits = 0;
    let mut seen_dot = false;
    while let Some(&c) = chars.peek() {
        match c {
            '0'..='9' => {
                digits += 1;
                chars.next();
            }
            '.' if !seen_dot => {
                seen_dot = true;
                chars.next();
            }
            _ => break,
        }
    }

    if digits == 0 {
        return false;
    }

    match chars.next() {
        None => true,
        Some('e' | 'E') => {
            let exponent: String = chars.collect();
            let exponent = exponent
                .strip_prefix('+')
                .or_else(|| exponent.strip_prefix('-'))
                .unwrap_or(&exponent);
            !exponent.is_empty() && exponent.bytes().all(|b| b.is_ascii_digit())
        }
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_quantity_grammar() {
        for raw in [
            "128Mi", "1Gi", "1.5Gi", "512", "0.5", "500m", "2k", "100M", "1e3", "1E3", "1E",
            "+256Mi", "-5m", "0",
        ] {
            assert!(parse_quantity(raw).is_ok(), "{raw} should parse");
        }
    }

    #[test]
    fn rejects_malformed_quantities() {
        for raw in [
            "", "Gi", "12foo", "1.2.3", "12 Mi", "1e", "1e+", "--1", "inf", "NaN", "0x10",
        ] {
            assert!(parse_quantity(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn suffixes_scale_the_value() {
        assert_eq!(parse_quantity("2Ki").unwrap(), 2048.0);
        assert_eq!(parse_quantity("1M").unwrap(), 1_000_000.0);
        assert_eq!(parse_quantity("250m").unwrap(), 0.25);
        assert_eq!(parse_quantity("1e3").unwrap(), 1000.0);
        assert_eq!(parse_quantity("1E").unwrap(), 1e18);
    }

    #[test]
    fn empty_request_takes_the_configured_default() {
        // default below the limit: accepted
        validate_request_limit("", "256Mi", "128Mi").unwrap();

        // default above the limit: rejected
        let err = validate_request_limit("", "64Mi", "128Mi").unwrap_err();
        assert_eq!(
            err,
            ValidationError::LimitBelowRequest {
                request: "128Mi".to_string(),
                limit: "64Mi".to_string(),
            }
        );

        // an explicit zero request is treated as absent too
        assert!(validate_request_limit("0", "64Mi", "128Mi").is_err());
    }

    #[test]
    fn limit_below_request_is_rejected() {
        assert!(validate_request_limit("512Mi", "256Mi", "").is_err());
        validate_request_limit("256Mi", "256Mi", "").unwrap();
        validate_request_limit("256Mi", "512Mi", "").unwrap();
    }

    #[test]
    fn missing_limit_or_request_passes() {
        validate_request_limit("512Mi", "", "").unwrap();
        validate_request_limit("", "", "128Mi").unwrap();
        validate_request_limit("", "512Mi", "").unwrap();
    }

    #[test]
    fn comparison_crosses_suffix_families() {
        // 1Gi (1073741824) > 1G (1e9)
        assert!(validate_request_limit("1Gi", "1G", "").is_err());
        validate_request_limit("1G", "1Gi", "").unwrap();
    }

    #[test]
    fn malformed_pair_member_is_rejected() {
        assert!(validate_request_limit("12foo", "256Mi", "").is_err());
        assert!(validate_request_limit("256Mi", "12foo", "").is_err());
    }
}
