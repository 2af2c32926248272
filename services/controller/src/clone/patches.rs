//! JSON-Patch generation for clone restores.
//!
//! Patches are computed from the VM captured in the snapshot content, never
//! from the live source, so later edits to the source do not leak into the
//! clone. Operation order: metadata filters, template metadata filters, MAC
//! addresses, SMBIOS serial, firmware UUID.
//!
//! A serial or firmware UUID present on the source is never carried over:
//! the target gets the requested serial, or a freshly generated one, and
//! always a fresh UUID. MAC addresses without a replacement are dropped so
//! the network layer assigns new ones.

use std::collections::BTreeMap;

use serde_json::json;
use uuid::Uuid;
use virtops_api::{CapturedVirtualMachine, PatchBuilder, VirtualMachineClone};

use super::filter::{FilterError, KeyFilter};
use crate::error::{ControllerError, ControllerResult};

const FIRMWARE: [&str; 6] = ["spec", "template", "spec", "domain", "firmware", ""];

/// Patches turning the captured source VM into the clone target, one
/// serialized operation per entry.
pub fn clone_patches(
    clone: &VirtualMachineClone,
    captured: &CapturedVirtualMachine,
) -> ControllerResult<Vec<String>> {
    let spec = &clone.spec;
    let mut patch = PatchBuilder::new();

    let filter = |filters: &[String]| {
        KeyFilter::parse(filters).map_err(|e: FilterError| {
            ControllerError::invalid("VirtualMachineClone", clone.metadata.name.clone(), e.to_string())
        })
    };

    strip_keys(
        &mut patch,
        &["metadata", "labels"],
        &filter(&spec.label_filters)?,
        &captured.metadata.labels,
    );
    strip_keys(
        &mut patch,
        &["metadata", "annotations"],
        &filter(&spec.annotation_filters)?,
        &captured.metadata.annotations,
    );

    let template = &captured.spec.template;
    strip_keys(
        &mut patch,
        &["spec", "template", "metadata", "labels"],
        &filter(&spec.template.label_filters)?,
        &template.metadata.labels,
    );
    strip_keys(
        &mut patch,
        &["spec", "template", "metadata", "annotations"],
        &filter(&spec.template.annotation_filters)?,
        &template.metadata.annotations,
    );

    for (i, iface) in template.spec.domain.devices.interfaces.iter().enumerate() {
        let idx = i.to_string();
        let path = [
            "spec", "template", "spec", "domain", "devices", "interfaces", idx.as_str(), "macAddress",
        ];
        match spec.new_mac_addresses.get(&iface.name) {
            Some(mac) => {
                patch.add(&path, json!(mac));
            }
            None if iface.mac_address.is_some() => {
                patch.remove(&path);
            }
            None => {}
        }
    }

    let firmware = template.spec.domain.firmware.as_ref();
    match (&spec.new_smbios_serial, firmware) {
        (Some(serial), Some(_)) => {
            patch.add(&firmware_path("serial"), json!(serial));
        }
        (Some(serial), None) => {
            patch.add(&FIRMWARE[..5], json!({ "serial": serial }));
        }
        (None, Some(fw)) if fw.serial.is_some() => {
            patch.add(&firmware_path("serial"), json!(Uuid::new_v4().simple().to_string()));
        }
        (None, _) => {}
    }

    if firmware.is_some_and(|fw| fw.uuid.is_some()) {
        patch.add(&firmware_path("uuid"), json!(Uuid::new_v4().to_string()));
    }

    Ok(patch.to_strings()?)
}

fn firmware_path(field: &str) -> [&str; 6] {
    let mut path = FIRMWARE;
    path[5] = field;
    path
}

fn strip_keys(
    patch: &mut PatchBuilder,
    parent: &[&str],
    filter: &KeyFilter,
    map: &BTreeMap<String, String>,
) {
    for key in filter.excluded_keys(map) {
        let mut path = parent.to_vec();
        path.push(key);
        patch.remove(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use virtops_api::{
        patch::apply_patch_strings, Firmware, Interface, TypedLocalObjectReference,
        VirtualMachineSpec,
    };

    fn captured() -> CapturedVirtualMachine {
        let mut spec = VirtualMachineSpec::default();
        spec.template.metadata.labels.insert("app".into(), "web".into());
        spec.template.metadata.labels.insert("tier/cache".into(), "x".into());
        spec.template.spec.domain.firmware = Some(Firmware {
            uuid: Some("0d2a2043-41c0-59c3-9b17-025022203668".into()),
            serial: Some("orig-serial".into()),
        });
        spec.template.spec.domain.devices.interfaces = vec![
            Interface {
                name: "default".into(),
                mac_address: Some("02:00:00:00:00:01".into()),
                binding: None,
            },
            Interface {
                name: "secondary".into(),
                mac_address: Some("02:00:00:00:00:02".into()),
                binding: None,
            },
        ];
        let mut vm = CapturedVirtualMachine {
            name: "vm-a".into(),
            spec,
            ..Default::default()
        };
        vm.metadata.labels.insert("key1".into(), "a".into());
        vm.metadata.labels.insert("key2".into(), "b".into());
        vm.metadata.annotations.insert("note".into(), "n".into());
        vm
    }

    fn clone() -> VirtualMachineClone {
        VirtualMachineClone::new(
            "default",
            "c1",
            TypedLocalObjectReference::new("VirtualMachine", "vm-a"),
            "vm-b",
        )
    }

    fn patched(clone: &VirtualMachineClone, captured: &CapturedVirtualMachine) -> Value {
        let patches = clone_patches(clone, captured).unwrap();
        let mut doc = serde_json::to_value(captured).unwrap();
        apply_patch_strings(&mut doc, &patches).unwrap();
        doc
    }

    #[test]
    fn test_default_clone_regenerates_identity() {
        let doc = patched(&clone(), &captured());
        let domain = &doc["spec"]["template"]["spec"]["domain"];
        let uuid = domain["firmware"]["uuid"].as_str().unwrap();
        let serial = domain["firmware"]["serial"].as_str().unwrap();
        assert_ne!(uuid, "0d2a2043-41c0-59c3-9b17-025022203668");
        assert!(Uuid::parse_str(uuid).is_ok());
        assert_ne!(serial, "orig-serial");
        assert!(!serial.is_empty());
        assert!(domain["devices"]["interfaces"][0].get("macAddress").is_none());
        assert!(domain["devices"]["interfaces"][1].get("macAddress").is_none());
        assert_eq!(doc["metadata"]["labels"]["key1"], "a");
    }

    #[test]
    fn test_new_identity_applied() {
        let mut c = clone();
        c.spec.new_mac_addresses.insert("default".into(), "02:00:00:00:00:99".into());
        c.spec.new_smbios_serial = Some("clone-serial".into());

        let doc = patched(&c, &captured());
        let domain = &doc["spec"]["template"]["spec"]["domain"];
        assert_eq!(domain["firmware"]["serial"], "clone-serial");
        assert_ne!(domain["firmware"]["uuid"], "0d2a2043-41c0-59c3-9b17-025022203668");
        assert_eq!(domain["devices"]["interfaces"][0]["macAddress"], "02:00:00:00:00:99");
        assert!(domain["devices"]["interfaces"][1].get("macAddress").is_none());
    }

    #[test]
    fn test_serial_added_without_firmware() {
        let mut source = captured();
        source.spec.template.spec.domain.firmware = None;
        let mut c = clone();
        c.spec.new_smbios_serial = Some("s1".into());

        let doc = patched(&c, &source);
        assert_eq!(doc["spec"]["template"]["spec"]["domain"]["firmware"], json!({ "serial": "s1" }));
    }

    #[test]
    fn test_filters_strip_metadata_and_template_keys() {
        let mut c = clone();
        c.spec.label_filters = vec!["*".into(), "!key2".into()];
        c.spec.annotation_filters = vec!["other".into()];
        c.spec.template.label_filters = vec!["*".into(), "!tier/*".into()];

        let doc = patched(&c, &captured());
        assert_eq!(doc["metadata"]["labels"], json!({ "key1": "a" }));
        assert_eq!(doc["metadata"]["annotations"], json!({}));
        assert_eq!(doc["spec"]["template"]["metadata"]["labels"], json!({ "app": "web" }));
    }

    #[test]
    fn test_key_with_slash_is_escaped() {
        let mut c = clone();
        c.spec.template.label_filters = vec!["app".into()];
        let patches = clone_patches(&c, &captured()).unwrap();
        assert!(patches.iter().any(|p| p.contains("tier~1cache")), "{patches:?}");
    }

    #[test]
    fn test_filter_patches_precede_identity_patches() {
        let mut c = clone();
        c.spec.label_filters = vec!["key1".into()];
        let patches = clone_patches(&c, &captured()).unwrap();
        assert!(patches[0].contains("/metadata/labels/key2"));
        assert!(patches.last().unwrap().contains("/firmware/uuid"));
    }

    #[test]
    fn test_no_identity_means_no_patches() {
        let mut source = captured();
        source.spec.template.spec.domain.firmware = None;
        source.spec.template.spec.domain.devices.interfaces.clear();
        assert!(clone_patches(&clone(), &source).unwrap().is_empty());
    }
}
