//! Scripted backend clients
//!
//! The fake inventory plays back a script of batches and failures and
//! records every version token it was asked for. The recording controller
//! keeps every call and can be told to fail the next one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use cvm_sync_common::{
    ControllerClient, CvmError, CvmResult, InterfaceKey, InterfaceModel, InventoryClient,
    ManagedObjectRef, RawUpdateBatch, Reconnect, VersionToken, VirtualMachineModel,
    VmInventoryEntry,
};

/// One scripted reply to `wait_for_updates`.
#[derive(Debug, Clone)]
pub enum Step {
    Batch(RawUpdateBatch),
    Fail(CvmError),
}

/// Inventory client driven by a script.
///
/// When the script runs out, `wait_for_updates` wakes anyone waiting in
/// [`FakeInventoryClient::wait_until_idle`] and blocks until more steps are
/// pushed.
#[derive(Default)]
pub struct FakeInventoryClient {
    steps: Mutex<VecDeque<Step>>,
    requested: Mutex<Vec<VersionToken>>,
    inventory: Mutex<Vec<VmInventoryEntry>>,
    reconnect_failure: Mutex<Option<CvmError>>,
    connects: AtomicU32,
    reconnects: AtomicU32,
    blocked: AtomicBool,
    idle: Notify,
    pushed: Notify,
}

impl FakeInventoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Appends a step, waking a listener blocked on the empty script.
    pub async fn push(&self, step: Step) {
        self.steps.lock().await.push_back(step);
        self.blocked.store(false, Ordering::SeqCst);
        self.pushed.notify_one();
    }

    pub async fn push_batch(&self, batch: RawUpdateBatch) {
        self.push(Step::Batch(batch)).await;
    }

    pub async fn push_failure(&self, error: CvmError) {
        self.push(Step::Fail(error)).await;
    }

    /// Sets what `list_all` returns.
    pub async fn set_inventory(&self, entries: Vec<VmInventoryEntry>) {
        *self.inventory.lock().await = entries;
    }

    /// Makes the next reconnect fail with `error`.
    pub async fn fail_next_reconnect(&self, error: CvmError) {
        *self.reconnect_failure.lock().await = Some(error);
    }

    /// Version tokens passed to `wait_for_updates`, in call order.
    pub async fn requested_versions(&self) -> Vec<VersionToken> {
        self.requested.lock().await.clone()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Resolves once a caller is blocked on an empty script.
    pub async fn wait_until_idle(&self) {
        let notified = self.idle.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.blocked.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

#[async_trait]
impl Reconnect for FakeInventoryClient {
    fn backend(&self) -> &str {
        "fake-esxi"
    }

    async fn reconnect(&self) -> CvmResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        match self.reconnect_failure.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InventoryClient for FakeInventoryClient {
    async fn connect(&self) -> CvmResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_updates(&self, version: &VersionToken) -> CvmResult<RawUpdateBatch> {
        self.requested.lock().await.push(version.clone());

        loop {
            let step = self.steps.lock().await.pop_front();
            match step {
                Some(Step::Batch(batch)) => {
                    debug!(since = %version, version = %batch.version, "Fake batch");
                    return Ok(batch);
                }
                Some(Step::Fail(e)) => return Err(e),
                None => {
                    self.blocked.store(true, Ordering::SeqCst);
                    self.idle.notify_waiters();
                    self.pushed.notified().await;
                }
            }
        }
    }

    async fn list_all(&self) -> CvmResult<Vec<VmInventoryEntry>> {
        Ok(self.inventory.lock().await.clone())
    }
}

/// A controller call as seen by [`RecordingControllerClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCall {
    SyncVm { vm: ManagedObjectRef, name: String },
    DeleteVm(ManagedObjectRef),
    SyncInterface {
        key: InterfaceKey,
        vlan_id: Option<u16>,
        enabled: bool,
        ip_address: Option<String>,
    },
    DeleteInterface(InterfaceKey),
}

/// Controller client that records every call.
#[derive(Default)]
pub struct RecordingControllerClient {
    calls: Mutex<Vec<ControllerCall>>,
    failure: Mutex<Option<CvmError>>,
    reconnects: AtomicU32,
}

impl RecordingControllerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call fail with `error` without recording it.
    pub async fn fail_next(&self, error: CvmError) {
        *self.failure.lock().await = Some(error);
    }

    pub async fn calls(&self) -> Vec<ControllerCall> {
        self.calls.lock().await.clone()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    async fn record(&self, call: ControllerCall) -> CvmResult<()> {
        if let Some(e) = self.failure.lock().await.take() {
            return Err(e);
        }
        self.calls.lock().await.push(call);
        Ok(())
    }
}

#[async_trait]
impl Reconnect for RecordingControllerClient {
    fn backend(&self) -> &str {
        "fake-vnc"
    }

    async fn reconnect(&self) -> CvmResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ControllerClient for RecordingControllerClient {
    async fn sync_virtual_machine(&self, vm: &VirtualMachineModel) -> CvmResult<()> {
        self.record(ControllerCall::SyncVm {
            vm: vm.vm.clone(),
            name: vm.name.clone(),
        })
        .await
    }

    async fn delete_virtual_machine(&self, vm: &ManagedObjectRef) -> CvmResult<()> {
        self.record(ControllerCall::DeleteVm(vm.clone())).await
    }

    async fn sync_interface(
        &self,
        iface: &InterfaceModel,
        _vm: &VirtualMachineModel,
    ) -> CvmResult<()> {
        self.record(ControllerCall::SyncInterface {
            key: iface.key.clone(),
            vlan_id: iface.vlan_id,
            enabled: iface.enabled,
            ip_address: iface.ip_address.clone(),
        })
        .await
    }

    async fn delete_interface(&self, iface: &InterfaceModel) -> CvmResult<()> {
        self.record(ControllerCall::DeleteInterface(iface.key.clone())).await
    }
}
