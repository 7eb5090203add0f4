//! Status condition helpers for ServiceExport, InternalServiceExport, MultiClusterService and
//! InternalMemberCluster

use chrono::Utc;
use fleet_net_api::v1alpha1::{
    MULTI_CLUSTER_SERVICE_VALID, SERVICE_EXPORT_CONFLICT, SERVICE_EXPORT_VALID,
};
use fleet_net_api::v1beta1::AGENT_JOINED;
use fleet_net_api::{Condition, ConditionStatus};

pub const REASON_SERVICE_IS_VALID: &str = "ServiceIsValid";
pub const REASON_SERVICE_NOT_FOUND: &str = "ServiceNotFound";
pub const REASON_SERVICE_INELIGIBLE: &str = "ServiceIneligible";
pub const REASON_PENDING_CONFLICT_RESOLUTION: &str = "ServicePendingConflictResolution";
pub const REASON_NO_CONFLICT_FOUND: &str = "NoConflictFound";
pub const REASON_CONFLICT_FOUND: &str = "ConflictFound";
pub const REASON_FOUND_SERVICE_IMPORT: &str = "FoundServiceImport";
pub const REASON_UNKNOWN_SERVICE_IMPORT: &str = "UnknownServiceImport";
pub const REASON_AGENT_JOINED: &str = "AgentJoined";
pub const REASON_AGENT_LEFT: &str = "AgentLeft";

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Sets `condition`, replacing any condition of the same type. The transition time only
/// moves when the status changes.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time =
                    condition.last_transition_time.or_else(|| Some(Utc::now()));
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        }
        None => {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(Utc::now());
            }
            conditions.push(condition);
        }
    }
}

/// Removes the condition of `condition_type`; returns false if there was none.
pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.condition_type != condition_type);
    before != conditions.len()
}

/// Whether `current` already satisfies `desired`. Messages and transition times are ignored;
/// a condition observed at a newer generation counts as satisfying an older one.
pub fn equal_condition(current: Option<&Condition>, desired: Option<&Condition>) -> bool {
    match (current, desired) {
        (None, None) => true,
        (Some(current), Some(desired)) => {
            current.condition_type == desired.condition_type
                && current.status == desired.status
                && current.reason == desired.reason
                && current.observed_generation >= desired.observed_generation
        }
        _ => false,
    }
}

/// Like [`equal_condition`] but also compares messages.
pub fn equal_condition_with_message(current: Option<&Condition>, desired: Option<&Condition>) -> bool {
    equal_condition(current, desired)
        && current.map(|c| &c.message) == desired.map(|c| &c.message)
}

fn condition(
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    generation: i64,
    message: String,
) -> Condition {
    Condition {
        condition_type: condition_type.to_string(),
        status,
        reason: reason.to_string(),
        message,
        observed_generation: generation,
        last_transition_time: None,
    }
}

pub fn valid_condition(generation: i64, namespace: &str, name: &str) -> Condition {
    condition(
        SERVICE_EXPORT_VALID,
        ConditionStatus::True,
        REASON_SERVICE_IS_VALID,
        generation,
        format!("service {namespace}/{name} is valid for export"),
    )
}

pub fn not_found_condition(generation: i64, namespace: &str, name: &str) -> Condition {
    condition(
        SERVICE_EXPORT_VALID,
        ConditionStatus::False,
        REASON_SERVICE_NOT_FOUND,
        generation,
        format!("service {namespace}/{name} is not found"),
    )
}

pub fn ineligible_condition(generation: i64, namespace: &str, name: &str) -> Condition {
    condition(
        SERVICE_EXPORT_VALID,
        ConditionStatus::False,
        REASON_SERVICE_INELIGIBLE,
        generation,
        format!("service {namespace}/{name} is not eligible for export"),
    )
}

pub fn pending_conflict_condition(generation: i64, namespace: &str, name: &str) -> Condition {
    condition(
        SERVICE_EXPORT_CONFLICT,
        ConditionStatus::Unknown,
        REASON_PENDING_CONFLICT_RESOLUTION,
        generation,
        format!("service {namespace}/{name} is pending export conflict resolution"),
    )
}

/// Conflict resolution result for an exported Service, stamped with the generation of the
/// source Service so members can tell stale results apart.
pub fn conflict_condition(conflict: bool, generation: i64, namespace: &str, name: &str) -> Condition {
    if conflict {
        condition(
            SERVICE_EXPORT_CONFLICT,
            ConditionStatus::True,
            REASON_CONFLICT_FOUND,
            generation,
            format!("service {namespace}/{name} is in conflict with other exported services"),
        )
    } else {
        condition(
            SERVICE_EXPORT_CONFLICT,
            ConditionStatus::False,
            REASON_NO_CONFLICT_FOUND,
            generation,
            format!("service {namespace}/{name} is exported without conflict"),
        )
    }
}

/// True when Valid is True and Conflict is False.
pub fn is_valid_without_conflict(conditions: &[Condition]) -> bool {
    let valid = find_condition(conditions, SERVICE_EXPORT_VALID)
        .is_some_and(|c| c.status == ConditionStatus::True);
    let no_conflict = find_condition(conditions, SERVICE_EXPORT_CONFLICT)
        .is_some_and(|c| c.status == ConditionStatus::False);
    valid && no_conflict
}

/// Whether a MultiClusterService has found a ServiceImport served by at least one cluster.
pub fn service_import_condition(found: bool, generation: i64) -> Condition {
    if found {
        condition(
            MULTI_CLUSTER_SERVICE_VALID,
            ConditionStatus::True,
            REASON_FOUND_SERVICE_IMPORT,
            generation,
            "found valid service import".to_string(),
        )
    } else {
        condition(
            MULTI_CLUSTER_SERVICE_VALID,
            ConditionStatus::Unknown,
            REASON_UNKNOWN_SERVICE_IMPORT,
            generation,
            "importing service; if the condition remains for a while, verify that the service has been \
             exported and is not imported by another multi-cluster service"
                .to_string(),
        )
    }
}

pub fn agent_joined_condition(joined: bool, generation: i64) -> Condition {
    let (status, reason) = if joined {
        (ConditionStatus::True, REASON_AGENT_JOINED)
    } else {
        (ConditionStatus::False, REASON_AGENT_LEFT)
    };
    condition(AGENT_JOINED, status, reason, generation, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, valid_condition(1, "work", "app"));
        let first = conditions[0].last_transition_time;
        assert!(first.is_some());

        set_condition(&mut conditions, valid_condition(2, "work", "app"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].observed_generation, 2);
        assert_eq!(conditions[0].last_transition_time, first);

        set_condition(&mut conditions, not_found_condition(3, "work", "app"));
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].reason, REASON_SERVICE_NOT_FOUND);
    }

    #[test]
    fn test_equal_condition() {
        let current = valid_condition(3, "work", "app");
        let mut desired = valid_condition(2, "work", "app");
        desired.message = "different".to_string();
        assert!(equal_condition(Some(&current), Some(&desired)));
        assert!(!equal_condition_with_message(Some(&current), Some(&desired)));

        let newer = valid_condition(4, "work", "app");
        assert!(!equal_condition(Some(&current), Some(&newer)));
        assert!(!equal_condition(None, Some(&newer)));
        assert!(equal_condition(None, None));
    }

    #[test]
    fn test_valid_without_conflict() {
        let mut conditions = vec![valid_condition(1, "work", "app")];
        assert!(!is_valid_without_conflict(&conditions));
        set_condition(&mut conditions, pending_conflict_condition(1, "work", "app"));
        assert!(!is_valid_without_conflict(&conditions));
        set_condition(&mut conditions, conflict_condition(false, 1, "work", "app"));
        assert!(is_valid_without_conflict(&conditions));
        set_condition(&mut conditions, conflict_condition(true, 1, "work", "app"));
        assert!(!is_valid_without_conflict(&conditions));
        assert!(remove_condition(&mut conditions, SERVICE_EXPORT_CONFLICT));
        assert!(!remove_condition(&mut conditions, SERVICE_EXPORT_CONFLICT));
    }
}
