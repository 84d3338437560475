//! Test fixtures for inventory update streams
//!
//! Builders for raw batches and update sets in the shape the platform
//! delivers them: VM properties on `VirtualMachine` objects, events on the
//! event collector's `latestPage` property.

use serde_json::{json, Value};

use cvm_sync_common::{
    Event, EventKind, ManagedObjectRef, NicConfig, ObjectUpdateKind, PowerState, PropertyChange,
    RawFilterUpdate, RawObjectUpdate, RawUpdateBatch, ToolsStatus, UpdateSet, VersionToken,
    VmConfig, VmInventoryEntry,
};

/// NIC on network `network_id` (network name = id).
pub fn nic(mac: &str, network_id: &str) -> NicConfig {
    NicConfig {
        mac: mac.to_string(),
        network: ManagedObjectRef::network(network_id),
        network_name: network_id.to_string(),
        vlan_id: None,
    }
}

/// NIC that already carries a VLAN tag on its port.
pub fn tagged_nic(mac: &str, network_id: &str, vlan_id: u16) -> NicConfig {
    NicConfig {
        vlan_id: Some(vlan_id),
        ..nic(mac, network_id)
    }
}

pub fn vm_config(name: &str, nics: Vec<NicConfig>) -> VmConfig {
    VmConfig {
        name: name.to_string(),
        host: Some("esxi-1".to_string()),
        interfaces: nics,
    }
}

pub fn inventory_entry(vm_id: &str, config: VmConfig) -> VmInventoryEntry {
    VmInventoryEntry {
        vm: ManagedObjectRef::vm(vm_id),
        config,
    }
}

/// Property change builders
pub mod changes {
    use super::*;

    pub fn config(config: &VmConfig) -> PropertyChange {
        PropertyChange::assign("config", to_value(config))
    }

    pub fn name(name: &str) -> PropertyChange {
        PropertyChange::assign("name", json!(name))
    }

    pub fn power(state: PowerState) -> PropertyChange {
        PropertyChange::assign("runtime.powerState", to_value(state))
    }

    pub fn tools(status: ToolsStatus) -> PropertyChange {
        PropertyChange::assign("guest.toolsRunningStatus", to_value(status))
    }

    /// `guest.net` with one address per MAC.
    pub fn guest_net(nics: &[(&str, &str)]) -> PropertyChange {
        let value: Vec<Value> = nics
            .iter()
            .map(|(mac, ip)| json!({"macAddress": mac, "ipAddress": [ip]}))
            .collect();
        PropertyChange::assign("guest.net", Value::Array(value))
    }

    pub fn events(events: &[Event]) -> PropertyChange {
        PropertyChange::event_page(events).expect("events serialize")
    }

    fn to_value<T: serde::Serialize>(value: T) -> Value {
        serde_json::to_value(value).expect("fixture serializes")
    }
}

/// Event builders
pub mod events {
    use super::*;

    pub fn removed(vm_id: &str) -> Event {
        Event::new(EventKind::VmRemoved, ManagedObjectRef::vm(vm_id))
    }

    pub fn renamed(vm_id: &str, new_name: &str) -> Event {
        Event::new(EventKind::VmRenamed, ManagedObjectRef::vm(vm_id)).with_new_name(new_name)
    }

    pub fn created(vm_id: &str, config: VmConfig) -> Event {
        Event::new(EventKind::VmCreated, ManagedObjectRef::vm(vm_id)).with_config(config)
    }

    pub fn reconfigured(vm_id: &str, config: VmConfig) -> Event {
        Event::new(EventKind::VmReconfigured, ManagedObjectRef::vm(vm_id)).with_config(config)
    }

    pub fn registered(vm_id: &str) -> Event {
        Event::new(EventKind::VmRegistered, ManagedObjectRef::vm(vm_id))
    }

    pub fn powered_on(vm_id: &str) -> Event {
        Event::new(EventKind::VmPoweredOn, ManagedObjectRef::vm(vm_id))
    }
}

/// Builds a [`RawUpdateBatch`] with a single filter set.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    version: VersionToken,
    objects: Vec<RawObjectUpdate>,
}

impl BatchBuilder {
    pub fn new(version: &str) -> Self {
        Self {
            version: VersionToken::from(version),
            objects: Vec::new(),
        }
    }

    fn object(
        mut self,
        obj: ManagedObjectRef,
        kind: ObjectUpdateKind,
        changes: Vec<PropertyChange>,
    ) -> Self {
        self.objects.push(RawObjectUpdate {
            obj,
            kind,
            change_set: changes,
        });
        self
    }

    /// VM entering the filter (baseline).
    pub fn enter(self, vm_id: &str, changes: Vec<PropertyChange>) -> Self {
        self.object(ManagedObjectRef::vm(vm_id), ObjectUpdateKind::Enter, changes)
    }

    pub fn modify(self, vm_id: &str, changes: Vec<PropertyChange>) -> Self {
        self.object(ManagedObjectRef::vm(vm_id), ObjectUpdateKind::Modify, changes)
    }

    /// VM leaving the filter.
    pub fn leave(self, vm_id: &str) -> Self {
        self.object(ManagedObjectRef::vm(vm_id), ObjectUpdateKind::Leave, Vec::new())
    }

    /// Event page on the event history collector.
    pub fn events(self, events: &[Event]) -> Self {
        self.object(
            ManagedObjectRef::new(ManagedObjectRef::EVENT_HISTORY_COLLECTOR, "session-1"),
            ObjectUpdateKind::Modify,
            vec![changes::events(events)],
        )
    }

    pub fn build(self) -> RawUpdateBatch {
        RawUpdateBatch {
            version: self.version,
            filter_sets: vec![RawFilterUpdate {
                object_set: self.objects,
            }],
        }
    }

    pub fn update_set(self) -> UpdateSet {
        UpdateSet::from_raw(self.build()).expect("valid batch")
    }
}

/// Baseline with `vm_id` powered on, one NIC `mac` on `network_id`.
pub fn baseline_single_vm(version: &str, vm_id: &str, mac: &str, network_id: &str) -> BatchBuilder {
    let config = vm_config(vm_id, vec![nic(mac, network_id)]);
    BatchBuilder::new(version).enter(
        vm_id,
        vec![
            changes::config(&config),
            changes::power(PowerState::PoweredOn),
        ],
    )
}
