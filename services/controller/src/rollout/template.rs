//! Desired DaemonSet pod template: the install template with the
//! operator's component customizations applied.

use serde_json::{json, Value};
use virtops_api::{patch, CustomizeComponents, DaemonSet, Patch, PatchType, Resource};

use crate::error::{ControllerError, ControllerResult};

/// `resourceType` that addresses a DaemonSet in `customizeComponents`.
pub const DAEMONSET_RESOURCE_TYPE: &str = "DaemonSet";

/// Applies every patch addressed to `ds_name`, in order, to `base`.
///
/// Patches are written against the whole DaemonSet, so `base` is wrapped
/// as `spec.template` while they run.
pub fn desired_template(
    base: &Value,
    ds_name: &str,
    components: &CustomizeComponents,
) -> ControllerResult<Value> {
    let mut doc = json!({ "spec": { "template": base } });

    for p in components.patches_for(DAEMONSET_RESOURCE_TYPE, ds_name) {
        match p.patch_type {
            PatchType::Json => {
                let ops: Patch = serde_json::from_str(&p.patch).map_err(|e| {
                    ControllerError::invalid(DaemonSet::KIND, ds_name, format!("bad json patch: {e}"))
                })?;
                patch::apply(&mut doc, &ops)?;
            }
            PatchType::Merge | PatchType::Strategic => {
                let merge: Value = serde_json::from_str(&p.patch).map_err(|e| {
                    ControllerError::invalid(DaemonSet::KIND, ds_name, format!("bad merge patch: {e}"))
                })?;
                patch::merge(&mut doc, &merge);
            }
        }
    }

    Ok(doc
        .pointer_mut("/spec/template")
        .map(Value::take)
        .unwrap_or(Value::Null))
}
