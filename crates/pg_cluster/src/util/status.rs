use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Builds a `Condition` stamped with the current time.
pub fn new_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: condition_type.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation,
    }
}

/// Merges new_condition into conditions and returns the merged vector plus
/// whether anything changed.
///
/// An existing condition of the same type is updated field by field;
/// `lastTransitionTime` only moves when the status flips. A condition type
/// not seen before is appended as-is.
pub fn set_status_condition(
    conditions: &[Condition],
    new_condition: Condition,
) -> (Vec<Condition>, bool) {
    let mut merged = Vec::from(conditions);

    let Some(existing) = merged.iter_mut().find(|c| c.type_ == new_condition.type_) else {
        merged.push(new_condition);
        return (merged, true);
    };

    let mut changed = false;

    if existing.status != new_condition.status {
        existing.status = new_condition.status;
        existing.last_transition_time = Time(Utc::now());
        changed = true;
    }

    if existing.reason != new_condition.reason {
        existing.reason = new_condition.reason;
        changed = true;
    }

    if existing.message != new_condition.message {
        existing.message = new_condition.message;
        changed = true;
    }

    if existing.observed_generation != new_condition.observed_generation {
        existing.observed_generation = new_condition.observed_generation;
        changed = true;
    }

    (merged, changed)
}

/// Finds the condition_type in conditions.
pub fn find_status_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|condition| condition.type_ == condition_type)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    is_status_condition_present_and_equal(conditions, condition_type, "True")
}

/// Returns true when condition_type is present and equal to status.
pub fn is_status_condition_present_and_equal(
    conditions: &[Condition],
    condition_type: &str,
    status: &str,
) -> bool {
    conditions
        .iter()
        .any(|condition| condition.type_ == condition_type && condition.status == status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_unknown_condition_type() {
        let conditions = Vec::new();

        let (conditions, changed) = set_status_condition(
            &conditions,
            new_condition("Provisioned", "False", "InProgress", "creating resources", Some(1)),
        );

        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "Provisioned");
        assert_eq!(conditions[0].status, "False");
    }

    #[test]
    fn updates_existing_condition_in_place() {
        let conditions = vec![new_condition(
            "Provisioned",
            "False",
            "InProgress",
            "creating resources",
            Some(1),
        )];

        let (conditions, changed) = set_status_condition(
            &conditions,
            new_condition("Provisioned", "True", "Completed", "resources created", Some(2)),
        );

        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason, "Completed");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn transition_time_moves_only_when_status_flips() {
        let original = new_condition("SpecValid", "True", "SpecAccepted", "ok", Some(1));
        let stamp = original.last_transition_time.clone();

        // Same status, new message: timestamp stays.
        let (conditions, changed) = set_status_condition(
            std::slice::from_ref(&original),
            new_condition("SpecValid", "True", "SpecAccepted", "still ok", Some(1)),
        );
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, stamp);

        // Status flip: timestamp moves.
        let (conditions, changed) = set_status_condition(
            &conditions,
            new_condition("SpecValid", "False", "SpecRejected", "bad storage", Some(2)),
        );
        assert!(changed);
        assert_ne!(conditions[0].last_transition_time, stamp);
    }

    #[test]
    fn identical_condition_reports_unchanged() {
        let current = vec![new_condition("SpecValid", "True", "SpecAccepted", "ok", Some(1))];

        let (conditions, changed) = set_status_condition(
            &current,
            new_condition("SpecValid", "True", "SpecAccepted", "ok", Some(1)),
        );

        assert!(!changed);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn condition_lookup_helpers() {
        let conditions = vec![
            new_condition("Provisioned", "True", "Completed", "resources created", Some(3)),
            new_condition("SpecValid", "False", "SpecRejected", "bad storage", Some(3)),
        ];

        assert!(find_status_condition(&conditions, "Provisioned").is_some());
        assert!(find_status_condition(&conditions, "Standby").is_none());
        assert!(is_status_condition_true(&conditions, "Provisioned"));
        assert!(!is_status_condition_true(&conditions, "SpecValid"));
        assert!(is_status_condition_present_and_equal(&conditions, "SpecValid", "False"));
    }
}
