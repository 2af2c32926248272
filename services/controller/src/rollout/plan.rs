//! Choosing which old pods to replace in one pass.

use virtops_api::Pod;
use virtops_reconcile::{select_for_replacement, IntOrString, ReconcileError, ReplacementPriority};

/// Old pods to delete this pass, in deletion order.
///
/// `max_unavailable` resolves against `desired` rounding up, never below
/// one. Deleting a not-ready pod does not lower availability, so those go
/// first and are free; ready pods are taken oldest first until the number
/// of unavailable pods would exceed the allowance.
pub fn plan_replacements<'a>(
    max_unavailable: &IntOrString,
    desired: i32,
    ready: i32,
    mut old: Vec<&'a Pod>,
) -> Result<Vec<&'a Pod>, ReconcileError> {
    let allowed = max_unavailable.scaled_value(desired, true)?.max(1);
    let unavailable = (desired - ready).max(0);
    let mut budget = (allowed - unavailable).max(0);

    old.sort_by(|a, b| {
        started(a)
            .cmp(&started(b))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    let ordered = select_for_replacement(old, |p| {
        if p.is_ready() {
            ReplacementPriority::Ready
        } else {
            ReplacementPriority::NotReady
        }
    });

    let mut planned = Vec::new();
    for pod in ordered {
        if !pod.is_ready() {
            planned.push(pod);
        } else if budget > 0 {
            budget -= 1;
            planned.push(pod);
        }
    }
    Ok(planned)
}

fn started(pod: &Pod) -> Option<chrono::DateTime<chrono::Utc>> {
    pod.status.start_time.or(pod.metadata.creation_timestamp)
}
