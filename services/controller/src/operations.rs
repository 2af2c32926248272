//! User-facing VM run-state operations.

use serde_json::json;
use tracing::info;
use virtops_api::{Api, PatchBuilder, Resource, VirtualMachine, VirtualMachineRestore};

use crate::admission::AdmissionError;
use crate::context::Context;

/// Requests that `name` runs. Refused while a restore targeting the VM is
/// pending.
pub async fn start_vm(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<VirtualMachine, AdmissionError> {
    let restores: Api<VirtualMachineRestore> = ctx.api(namespace);
    if let Some(pending) = restores
        .list()
        .await?
        .into_iter()
        .find(|r| r.spec.target.name == name && r.is_pending())
    {
        return Err(AdmissionError::StartBlocked(pending.name().to_string()));
    }

    let vms: Api<VirtualMachine> = ctx.api(namespace);
    let vm = vms.get(name).await?;
    let mut patch = PatchBuilder::new();
    if vm.spec.run_strategy.is_some() {
        patch.add(&["spec", "runStrategy"], json!("Always"));
    } else {
        patch.add(&["spec", "running"], json!(true));
    }
    let vm = vms.patch(name, &patch.build()).await?;
    info!(vm = name, "Start requested");
    Ok(vm)
}

/// Requests that `name` stops.
pub async fn stop_vm(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<VirtualMachine, AdmissionError> {
    let vms: Api<VirtualMachine> = ctx.api(namespace);
    let vm = vms.get(name).await?;
    let mut patch = PatchBuilder::new();
    if vm.spec.run_strategy.is_some() {
        patch.add(&["spec", "runStrategy"], json!("Halted"));
    } else {
        patch.add(&["spec", "running"], json!(false));
    }
    let vm = vms.patch(name, &patch.build()).await?;
    info!(vm = name, "Stop requested");
    Ok(vm)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use virtops_api::{Conditions, RunStrategy, SqliteStore, VirtualMachineSpec};
    use virtops_events::MemoryRecorder;

    const NS: &str = "default";

    fn ctx() -> Context {
        Context::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(MemoryRecorder::new()),
        )
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let ctx = ctx();
        ctx.api::<VirtualMachine>(NS)
            .create(&VirtualMachine::new(NS, "vm-a", VirtualMachineSpec::default()))
            .await
            .unwrap();

        assert!(start_vm(&ctx, NS, "vm-a").await.unwrap().is_run_requested());
        assert!(!stop_vm(&ctx, NS, "vm-a").await.unwrap().is_run_requested());
    }

    #[tokio::test]
    async fn test_start_uses_run_strategy_when_set() {
        let ctx = ctx();
        let mut vm = VirtualMachine::new(NS, "vm-a", VirtualMachineSpec::default());
        vm.spec.run_strategy = Some(RunStrategy::Halted);
        ctx.api::<VirtualMachine>(NS).create(&vm).await.unwrap();

        let started = start_vm(&ctx, NS, "vm-a").await.unwrap();
        assert_eq!(started.spec.run_strategy, Some(RunStrategy::Always));
        assert!(started.spec.running.is_none());
    }

    #[tokio::test]
    async fn test_start_blocked_by_pending_restore() {
        let ctx = ctx();
        ctx.api::<VirtualMachine>(NS)
            .create(&VirtualMachine::new(NS, "vm-a", VirtualMachineSpec::default()))
            .await
            .unwrap();
        ctx.api::<VirtualMachineRestore>(NS)
            .create(&VirtualMachineRestore::new(NS, "r1", "vm-a", "snap-a"))
            .await
            .unwrap();

        let err = start_vm(&ctx, NS, "vm-a").await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot start VM until restore \"r1\" completes");
        let vm = ctx.api::<VirtualMachine>(NS).get("vm-a").await.unwrap();
        assert!(!vm.is_run_requested());
    }

    #[tokio::test]
    async fn test_failed_restore_does_not_block_start() {
        let ctx = ctx();
        ctx.api::<VirtualMachine>(NS)
            .create(&VirtualMachine::new(NS, "vm-a", VirtualMachineSpec::default()))
            .await
            .unwrap();
        let restores = ctx.api::<VirtualMachineRestore>(NS);
        let mut failed = restores
            .create(&VirtualMachineRestore::new(NS, "r1", "vm-a", "snap-a"))
            .await
            .unwrap();
        failed.status.conditions = Some(Conditions::transition(None, false, false, "Failed"));
        restores.replace_status(&failed).await.unwrap();

        assert!(start_vm(&ctx, NS, "vm-a").await.unwrap().is_run_requested());
    }
}
