//! Concrete change and event handlers.
//!
//! Each handler parses its record and delegates to [`VmService`]. Handlers
//! hold no state of their own.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use cvm_sync_common::{
    ChangeHandler, CvmError, CvmResult, Event, EventHandler, EventKind, GuestNic,
    ManagedObjectRef, PowerState, PropertyChange, ToolsStatus, VmConfig,
};

use crate::database::SyncState;
use crate::services::VmService;

pub const CONFIG_PROPERTY: &str = "config";
pub const GUEST_NET_PROPERTY: &str = "guest.net";
pub const TOOLS_STATUS_PROPERTY: &str = "guest.toolsRunningStatus";
pub const POWER_STATE_PROPERTY: &str = "runtime.powerState";
pub const NAME_PROPERTY: &str = "name";

/// Applies the event's config when present, else looks the VM up.
async fn apply_event_config(
    service: &VmService,
    state: &mut SyncState,
    event: &Event,
) -> CvmResult<()> {
    match &event.config {
        Some(config) => service.update_vm(state, &event.vm, config).await,
        None => service.recover_vm(state, &event.vm).await,
    }
}

/// VM created, cloned, deployed, migrated or given a new MAC.
pub struct VmUpdatedHandler {
    service: Arc<VmService>,
}

impl VmUpdatedHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler<SyncState> for VmUpdatedHandler {
    fn name(&self) -> &str {
        "VmUpdatedHandler"
    }

    fn events(&self) -> &'static [EventKind] {
        &[
            EventKind::VmCreated,
            EventKind::VmCloned,
            EventKind::VmDeployed,
            EventKind::VmMacChanged,
            EventKind::VmMacAssigned,
            EventKind::VmMigrated,
            EventKind::DrsVmMigrated,
        ]
    }

    #[instrument(skip(self, state, event), fields(vm = %event.vm, kind = %event.kind))]
    async fn handle_event(&self, state: &mut SyncState, event: &Event) -> CvmResult<()> {
        apply_event_config(&self.service, state, event).await
    }
}

pub struct VmRenamedHandler {
    service: Arc<VmService>,
}

impl VmRenamedHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler<SyncState> for VmRenamedHandler {
    fn name(&self) -> &str {
        "VmRenamedHandler"
    }

    fn events(&self) -> &'static [EventKind] {
        &[EventKind::VmRenamed]
    }

    #[instrument(skip(self, state, event), fields(vm = %event.vm))]
    async fn handle_event(&self, state: &mut SyncState, event: &Event) -> CvmResult<()> {
        let new_name = event
            .new_name
            .as_deref()
            .ok_or_else(|| CvmError::invalid_value(event.kind.as_str(), "missing newName"))?;
        self.service.rename_vm(state, &event.vm, new_name).await
    }
}

pub struct VmReconfiguredHandler {
    service: Arc<VmService>,
}

impl VmReconfiguredHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler<SyncState> for VmReconfiguredHandler {
    fn name(&self) -> &str {
        "VmReconfiguredHandler"
    }

    fn events(&self) -> &'static [EventKind] {
        &[EventKind::VmReconfigured]
    }

    #[instrument(skip(self, state, event), fields(vm = %event.vm))]
    async fn handle_event(&self, state: &mut SyncState, event: &Event) -> CvmResult<()> {
        apply_event_config(&self.service, state, event).await
    }
}

pub struct VmRemovedHandler {
    service: Arc<VmService>,
}

impl VmRemovedHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler<SyncState> for VmRemovedHandler {
    fn name(&self) -> &str {
        "VmRemovedHandler"
    }

    fn events(&self) -> &'static [EventKind] {
        &[EventKind::VmRemoved]
    }

    #[instrument(skip(self, state, event), fields(vm = %event.vm))]
    async fn handle_event(&self, state: &mut SyncState, event: &Event) -> CvmResult<()> {
        self.service.remove_vm(state, &event.vm).await
    }
}

pub struct VmRegisteredHandler {
    service: Arc<VmService>,
}

impl VmRegisteredHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler<SyncState> for VmRegisteredHandler {
    fn name(&self) -> &str {
        "VmRegisteredHandler"
    }

    fn events(&self) -> &'static [EventKind] {
        &[EventKind::VmRegistered]
    }

    #[instrument(skip(self, state, event), fields(vm = %event.vm))]
    async fn handle_event(&self, state: &mut SyncState, event: &Event) -> CvmResult<()> {
        apply_event_config(&self.service, state, event).await
    }
}

/// Power-on/off events.
pub struct PowerStateEventHandler {
    service: Arc<VmService>,
}

impl PowerStateEventHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler<SyncState> for PowerStateEventHandler {
    fn name(&self) -> &str {
        "PowerStateEventHandler"
    }

    fn events(&self) -> &'static [EventKind] {
        &[EventKind::VmPoweredOn, EventKind::VmPoweredOff]
    }

    #[instrument(skip(self, state, event), fields(vm = %event.vm, kind = %event.kind))]
    async fn handle_event(&self, state: &mut SyncState, event: &Event) -> CvmResult<()> {
        let power_state = match event.kind {
            EventKind::VmPoweredOn => PowerState::PoweredOn,
            _ => PowerState::PoweredOff,
        };
        self.service
            .update_power_state(state, &event.vm, power_state)
            .await
    }
}

/// `runtime.powerState` property diffs.
pub struct PowerStateHandler {
    service: Arc<VmService>,
}

impl PowerStateHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ChangeHandler<SyncState> for PowerStateHandler {
    fn name(&self) -> &str {
        "PowerStateHandler"
    }

    fn property_name(&self) -> &'static str {
        POWER_STATE_PROPERTY
    }

    #[instrument(skip(self, state, change), fields(vm = %obj))]
    async fn handle_change(
        &self,
        state: &mut SyncState,
        obj: &ManagedObjectRef,
        change: &PropertyChange,
    ) -> CvmResult<()> {
        let power_state: PowerState = change.parse()?;
        self.service.update_power_state(state, obj, power_state).await
    }
}

pub struct GuestNetHandler {
    service: Arc<VmService>,
}

impl GuestNetHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ChangeHandler<SyncState> for GuestNetHandler {
    fn name(&self) -> &str {
        "GuestNetHandler"
    }

    fn property_name(&self) -> &'static str {
        GUEST_NET_PROPERTY
    }

    #[instrument(skip(self, state, change), fields(vm = %obj))]
    async fn handle_change(
        &self,
        state: &mut SyncState,
        obj: &ManagedObjectRef,
        change: &PropertyChange,
    ) -> CvmResult<()> {
        let nics: Vec<GuestNic> = if change.op.is_removal() || change.value.is_null() {
            Vec::new()
        } else {
            change.parse()?
        };
        self.service.update_guest_net(state, obj, &nics).await
    }
}

pub struct VmwareToolsStatusHandler {
    service: Arc<VmService>,
}

impl VmwareToolsStatusHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ChangeHandler<SyncState> for VmwareToolsStatusHandler {
    fn name(&self) -> &str {
        "VmwareToolsStatusHandler"
    }

    fn property_name(&self) -> &'static str {
        TOOLS_STATUS_PROPERTY
    }

    #[instrument(skip(self, state, change), fields(vm = %obj))]
    async fn handle_change(
        &self,
        state: &mut SyncState,
        obj: &ManagedObjectRef,
        change: &PropertyChange,
    ) -> CvmResult<()> {
        let status: ToolsStatus = change.parse()?;
        self.service.update_tools_status(state, obj, status).await
    }
}

/// Full `config` property: baseline and reconfiguration diffs.
pub struct VmConfigHandler {
    service: Arc<VmService>,
}

impl VmConfigHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ChangeHandler<SyncState> for VmConfigHandler {
    fn name(&self) -> &str {
        "VmConfigHandler"
    }

    fn property_name(&self) -> &'static str {
        CONFIG_PROPERTY
    }

    #[instrument(skip(self, state, change), fields(vm = %obj))]
    async fn handle_change(
        &self,
        state: &mut SyncState,
        obj: &ManagedObjectRef,
        change: &PropertyChange,
    ) -> CvmResult<()> {
        // Removal arrives together with the VM leaving the filter
        if change.op.is_removal() {
            return Ok(());
        }
        let config: VmConfig = change.parse()?;
        self.service.update_vm(state, obj, &config).await
    }
}

pub struct VmNameHandler {
    service: Arc<VmService>,
}

impl VmNameHandler {
    pub fn new(service: Arc<VmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ChangeHandler<SyncState> for VmNameHandler {
    fn name(&self) -> &str {
        "VmNameHandler"
    }

    fn property_name(&self) -> &'static str {
        NAME_PROPERTY
    }

    #[instrument(skip(self, state, change), fields(vm = %obj))]
    async fn handle_change(
        &self,
        state: &mut SyncState,
        obj: &ManagedObjectRef,
        change: &PropertyChange,
    ) -> CvmResult<()> {
        let name: String = change.parse()?;
        self.service.rename_vm(state, obj, &name).await
    }
}

/// All event handlers, in registration order.
pub fn event_handlers(service: &Arc<VmService>) -> Vec<Arc<dyn EventHandler<SyncState>>> {
    vec![
        Arc::new(VmUpdatedHandler::new(Arc::clone(service))),
        Arc::new(VmRenamedHandler::new(Arc::clone(service))),
        Arc::new(VmReconfiguredHandler::new(Arc::clone(service))),
        Arc::new(VmRemovedHandler::new(Arc::clone(service))),
        Arc::new(VmRegisteredHandler::new(Arc::clone(service))),
        Arc::new(PowerStateEventHandler::new(Arc::clone(service))),
    ]
}

/// All change handlers, in registration order.
pub fn change_handlers(service: &Arc<VmService>) -> Vec<Arc<dyn ChangeHandler<SyncState>>> {
    vec![
        Arc::new(GuestNetHandler::new(Arc::clone(service))),
        Arc::new(VmwareToolsStatusHandler::new(Arc::clone(service))),
        Arc::new(PowerStateHandler::new(Arc::clone(service))),
        Arc::new(VmConfigHandler::new(Arc::clone(service))),
        Arc::new(VmNameHandler::new(Arc::clone(service))),
    ]
}
