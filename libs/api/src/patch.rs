//! JSON-Patch (RFC 6902) and merge-patch (RFC 7386) helpers.
//!
//! Restores carry their patches as strings, one serialized operation per
//! entry; [`PatchBuilder::to_strings`] produces that form and
//! [`apply_patch_strings`] consumes it.

use json_patch::{
    AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation, TestOperation,
};
use jsonptr::PointerBuf;
use serde_json::Value;

use crate::StoreError;

/// Ordered list of patch operations.
#[derive(Debug, Clone, Default)]
pub struct PatchBuilder {
    ops: Vec<PatchOperation>,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `add` at the pointer made of `path` tokens; tokens are escaped.
    pub fn add(&mut self, path: &[&str], value: Value) -> &mut Self {
        self.ops.push(PatchOperation::Add(AddOperation {
            path: pointer(path),
            value,
        }));
        self
    }

    pub fn replace(&mut self, path: &[&str], value: Value) -> &mut Self {
        self.ops.push(PatchOperation::Replace(ReplaceOperation {
            path: pointer(path),
            value,
        }));
        self
    }

    pub fn remove(&mut self, path: &[&str]) -> &mut Self {
        self.ops.push(PatchOperation::Remove(RemoveOperation { path: pointer(path) }));
        self
    }

    pub fn test(&mut self, path: &[&str], value: Value) -> &mut Self {
        self.ops.push(PatchOperation::Test(TestOperation {
            path: pointer(path),
            value,
        }));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn build(self) -> Patch {
        Patch(self.ops)
    }

    /// One JSON string per operation.
    pub fn to_strings(&self) -> Result<Vec<String>, StoreError> {
        self.ops
            .iter()
            .map(|op| serde_json::to_string(op).map_err(StoreError::from))
            .collect()
    }
}

fn pointer(tokens: &[&str]) -> PointerBuf {
    PointerBuf::from_tokens(tokens.iter().copied())
}

/// Parses operations serialized one per string.
pub fn parse_patch_strings(patches: &[String]) -> Result<Patch, StoreError> {
    let ops = patches
        .iter()
        .map(|p| {
            serde_json::from_str::<PatchOperation>(p)
                .map_err(|e| StoreError::Patch(format!("invalid patch {p:?}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Patch(ops))
}

/// Applies `patch` to `doc`. On error `doc` is left unchanged.
pub fn apply(doc: &mut Value, patch: &Patch) -> Result<(), StoreError> {
    json_patch::patch(doc, &patch.0)?;
    Ok(())
}

/// Applies string-serialized operations in order.
pub fn apply_patch_strings(doc: &mut Value, patches: &[String]) -> Result<(), StoreError> {
    let patch = parse_patch_strings(patches)?;
    apply(doc, &patch)
}

/// Applies an RFC 7386 merge patch.
pub fn merge(doc: &mut Value, patch: &Value) {
    json_patch::merge(doc, patch);
}
