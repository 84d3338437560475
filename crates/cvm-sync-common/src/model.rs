//! Domain models mirrored from the inventory and pushed to the controller.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sync_map::HasRefCount;
use crate::update::ManagedObjectRef;

/// Device configuration of a virtual machine (the `config` property).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<NicConfig>,
}

/// One virtual NIC in a [`VmConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicConfig {
    pub mac: String,
    pub network: ManagedObjectRef,
    #[serde(default)]
    pub network_name: String,
    /// Tag currently programmed on the port, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
}

/// Guest-reported NIC info (one entry of the `guest.net` property).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestNic {
    pub mac_address: String,
    #[serde(default)]
    pub ip_address: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// VM runtime power state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    #[default]
    PoweredOff,
    Suspended,
}

impl PowerState {
    pub fn is_on(&self) -> bool {
        matches!(self, PowerState::PoweredOn)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// VMware tools running status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolsStatus {
    GuestToolsRunning,
    GuestToolsNotRunning,
    GuestToolsExecutingScripts,
}

impl ToolsStatus {
    pub fn is_running(&self) -> bool {
        !matches!(self, ToolsStatus::GuestToolsNotRunning)
    }
}

/// A tracked virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineModel {
    pub vm: ManagedObjectRef,
    pub name: String,
    pub host: Option<String>,
    pub power_state: PowerState,
    pub tools_status: Option<ToolsStatus>,
    /// Guest IP addresses keyed by MAC.
    pub guest_ips: BTreeMap<String, String>,
    /// MACs of the attached interfaces, in config order.
    pub interfaces: Vec<String>,
}

impl VirtualMachineModel {
    pub fn new(vm: ManagedObjectRef, name: impl Into<String>) -> Self {
        Self {
            vm,
            name: name.into(),
            host: None,
            power_state: PowerState::default(),
            tools_status: None,
            guest_ips: BTreeMap::new(),
            interfaces: Vec::new(),
        }
    }

    pub fn from_config(vm: ManagedObjectRef, config: &VmConfig) -> Self {
        let mut model = Self::new(vm, config.name.clone());
        model.host = config.host.clone();
        model.interfaces = config.interfaces.iter().map(|n| n.mac.clone()).collect();
        model
    }
}

/// Controller-side view of a network referenced by tracked interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNetworkModel {
    pub network: ManagedObjectRef,
    pub name: String,
    /// Number of interfaces attached to this network.
    pub ref_count: u32,
}

impl VirtualNetworkModel {
    pub fn new(network: ManagedObjectRef, name: impl Into<String>) -> Self {
        Self {
            network,
            name: name.into(),
            ref_count: 0,
        }
    }
}

impl HasRefCount for VirtualNetworkModel {
    fn increment_ref(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.ref_count = self.ref_count.checked_sub(1)?;
        Some(self.ref_count)
    }
}

/// Business key of an interface: owning VM plus NIC MAC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceKey {
    pub vm: ManagedObjectRef,
    pub mac: String,
}

impl InterfaceKey {
    pub fn new(vm: ManagedObjectRef, mac: impl Into<String>) -> Self {
        Self {
            vm,
            mac: mac.into(),
        }
    }
}

impl fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vm, self.mac)
    }
}

/// A VM's attachment to a network, including its bound VLAN tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceModel {
    pub key: InterfaceKey,
    pub network: ManagedObjectRef,
    /// `None` while the allocator had no id to give (pending).
    pub vlan_id: Option<u16>,
    pub ip_address: Option<String>,
    /// Port enabled on the controller (follows power state).
    pub enabled: bool,
}

impl InterfaceModel {
    pub fn new(key: InterfaceKey, network: ManagedObjectRef) -> Self {
        Self {
            key,
            network,
            vlan_id: None,
            ip_address: None,
            enabled: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.vlan_id.is_none()
    }
}
