//! Composition root: wires clients, store, handlers and the two tasks.

use std::sync::Arc;

use tracing::info;

use cvm_sync_common::{ControllerClient, CvmResult, InventoryClient, UpdateDispatcher};

use crate::config::VlanConfig;
use crate::database::SharedState;
use crate::event_listener::{update_set_queue, EventListener};
use crate::handlers::{change_handlers, event_handlers};
use crate::monitor::Monitor;
use crate::services::VmService;
use crate::supervisor::Supervisor;

/// A fully built engine, ready to run.
pub struct CvmContext {
    pub state: SharedState,
    pub supervisor: Supervisor,
    pub monitor: Monitor,
}

impl CvmContext {
    /// Builds the engine. Fails on an invalid VLAN range or a handler conflict.
    pub fn build<I, C>(vlan: &VlanConfig, inventory: Arc<I>, controller: Arc<C>) -> CvmResult<Self>
    where
        I: InventoryClient + 'static,
        C: ControllerClient + 'static,
    {
        let state = SharedState::new(vlan.build_pool()?);
        let (sender, receiver) = update_set_queue();

        let service = Arc::new(VmService::new(inventory.clone(), controller.clone()));
        let mut dispatcher = UpdateDispatcher::new(state.handle());
        for handler in event_handlers(&service) {
            dispatcher.register_event_handler(handler)?;
        }
        for handler in change_handlers(&service) {
            dispatcher.register_change_handler(handler)?;
        }
        info!(
            handlers = ?dispatcher.handler_names(),
            vlan_start = vlan.start,
            vlan_end = vlan.end,
            "Engine built"
        );

        let listener = EventListener::new(inventory.clone(), sender);
        let supervisor = Supervisor::new(listener, inventory).with_reconnect_hook(controller);

        Ok(Self {
            state,
            supervisor,
            monitor: Monitor::new(dispatcher, receiver),
        })
    }
}
