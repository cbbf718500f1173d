//! # Secret Event Predicate
//!
//! Decides which credential Secret events reach the Secret-Trigger
//! reconciler. An update passes when either side carries the opt-in label, so
//! removing the label is still delivered once.

use crate::constants::NIM_APP_LABEL;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretEventKind {
    Create,
    Update,
    Delete,
    Generic,
}

/// Whether `labels` opt the Secret into App orchestration.
#[must_use]
pub fn is_labeled(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(NIM_APP_LABEL))
        .is_some_and(|v| v == "true")
}

/// Filter a Secret event.
///
/// `old_labels` is only consulted for updates; for every other kind the
/// object's current labels decide.
#[must_use]
pub fn passes(
    kind: SecretEventKind,
    old_labels: Option<&BTreeMap<String, String>>,
    new_labels: Option<&BTreeMap<String, String>>,
) -> bool {
    match kind {
        SecretEventKind::Update => is_labeled(old_labels) || is_labeled(new_labels),
        SecretEventKind::Create | SecretEventKind::Delete | SecretEventKind::Generic => {
            is_labeled(new_labels)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(NIM_APP_LABEL.to_string(), value.to_string())])
    }

    #[test]
    fn test_create_requires_label() {
        assert!(passes(SecretEventKind::Create, None, Some(&labels("true"))));
        assert!(!passes(SecretEventKind::Create, None, Some(&labels("false"))));
        assert!(!passes(SecretEventKind::Create, None, None));
    }

    #[test]
    fn test_delete_and_generic_use_current_labels() {
        assert!(passes(SecretEventKind::Delete, None, Some(&labels("true"))));
        assert!(!passes(SecretEventKind::Generic, None, Some(&BTreeMap::new())));
    }

    #[test]
    fn test_update_passes_on_label_removal() {
        let on = labels("true");
        let off = BTreeMap::new();
        assert!(passes(SecretEventKind::Update, Some(&on), Some(&off)));
        assert!(passes(SecretEventKind::Update, Some(&off), Some(&on)));
        assert!(passes(SecretEventKind::Update, Some(&on), Some(&on)));
        assert!(!passes(SecretEventKind::Update, Some(&off), Some(&off)));
    }
}
