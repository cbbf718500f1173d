//! # Condition Tracker
//!
//! Upsert semantics for status condition lists.
//!
//! Conditions are keyed by `type`. Setting a condition replaces reason and
//! message in place; `lastTransitionTime` moves only when the status value
//! changes, so consumers can tell how long a resource has been in its current
//! state. Insertion order is preserved.

use crate::crd::{Condition, ConditionStatus};
use chrono::{DateTime, SecondsFormat, Utc};

/// Upsert `condition` into `conditions` using the current time.
///
/// Returns `true` when the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    set_condition_at(conditions, condition, Utc::now())
}

/// Upsert `condition` into `conditions`, stamping transitions with `now`.
///
/// Returns `true` when the list changed.
pub fn set_condition_at(
    conditions: &mut Vec<Condition>,
    mut condition: Condition,
    now: DateTime<Utc>,
) -> bool {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) else {
        condition.last_transition_time = Some(stamp);
        conditions.push(condition);
        return true;
    };

    let mut changed = false;
    if existing.status != condition.status {
        existing.status = condition.status;
        existing.last_transition_time = Some(stamp);
        changed = true;
    } else if existing.last_transition_time.is_none() {
        existing.last_transition_time = Some(stamp);
        changed = true;
    }
    if existing.reason != condition.reason {
        existing.reason = condition.reason;
        changed = true;
    }
    if existing.message != condition.message {
        existing.message = condition.message;
        changed = true;
    }
    changed
}

/// Find a condition by type.
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Whether the condition of `type` exists and is `True`.
///
/// A missing condition counts as not true.
#[must_use]
pub fn is_condition_true(conditions: &[Condition], r#type: &str) -> bool {
    find_condition(conditions, r#type).is_some_and(|c| c.status == ConditionStatus::True)
}
