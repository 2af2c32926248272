//! Typed resources held in the object store.

mod apps;
mod clone;
mod kubevirt;
mod restore;
mod snapshot;
mod storage;
mod vm;

pub use apps::*;
pub use clone::*;
pub use kubevirt::*;
pub use restore::*;
pub use snapshot::*;
pub use storage::*;
pub use vm::*;
