//! VmService - applies parsed inventory changes to the store and the controller

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use cvm_sync_common::{
    ControllerClient, CvmError, CvmResult, GuestNic, InterfaceKey, InterfaceModel,
    InventoryClient, ManagedObjectRef, NicConfig, PowerState, ToolsStatus, VirtualMachineModel,
    VmConfig,
};

use crate::database::SyncState;

/// Service layer shared by all handlers.
///
/// Every method takes the locked [`SyncState`]; callers are the handlers,
/// which run under the dispatcher's coordination lock.
pub struct VmService {
    inventory: Arc<dyn InventoryClient>,
    controller: Arc<dyn ControllerClient>,
}

impl VmService {
    pub fn new(inventory: Arc<dyn InventoryClient>, controller: Arc<dyn ControllerClient>) -> Self {
        Self {
            inventory,
            controller,
        }
    }

    /// Creates or updates a VM from its full configuration and syncs its NICs.
    #[instrument(skip(self, state, config), fields(vm = %vm, nics = config.interfaces.len()))]
    pub async fn update_vm(
        &self,
        state: &mut SyncState,
        vm: &ManagedObjectRef,
        config: &VmConfig,
    ) -> CvmResult<()> {
        let model = match state.database.get_vm(vm) {
            Some(existing) => {
                let mut model = existing.clone();
                model.name = config.name.clone();
                model.host = config.host.clone();
                model.interfaces = config.interfaces.iter().map(|n| n.mac.clone()).collect();
                model
                    .guest_ips
                    .retain(|mac, _| config.interfaces.iter().any(|n| &n.mac == mac));
                model
            }
            None => {
                info!("Tracking new VM {}", config.name);
                VirtualMachineModel::from_config(vm.clone(), config)
            }
        };
        state.database.upsert_vm(model);

        self.sync_nics(state, vm, &config.interfaces).await?;
        self.push_vm(state, vm).await
    }

    /// Looks the VM up in the full inventory and applies what is found.
    #[instrument(skip(self, state), fields(vm = %vm))]
    pub async fn recover_vm(&self, state: &mut SyncState, vm: &ManagedObjectRef) -> CvmResult<()> {
        let entries = match self.inventory.list_all().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Inventory lookup failed");
                return Err(CvmError::not_found(vm));
            }
        };

        let Some(entry) = entries.into_iter().find(|e| &e.vm == vm) else {
            return Err(CvmError::not_found(vm));
        };

        info!("Recovered VM {} from inventory", entry.config.name);
        self.update_vm(state, vm, &entry.config).await
    }

    #[instrument(skip(self, state), fields(vm = %vm))]
    pub async fn rename_vm(
        &self,
        state: &mut SyncState,
        vm: &ManagedObjectRef,
        name: &str,
    ) -> CvmResult<()> {
        self.ensure_tracked(state, vm).await?;
        let model = state
            .database
            .get_vm_mut(vm)
            .ok_or_else(|| CvmError::not_found(vm))?;
        if model.name == name {
            return Ok(());
        }

        info!("Renaming VM {} to {}", model.name, name);
        model.name = name.to_string();
        self.push_vm(state, vm).await
    }

    #[instrument(skip(self, state), fields(vm = %vm))]
    pub async fn update_power_state(
        &self,
        state: &mut SyncState,
        vm: &ManagedObjectRef,
        power_state: PowerState,
    ) -> CvmResult<()> {
        self.ensure_tracked(state, vm).await?;
        let model = state
            .database
            .get_vm_mut(vm)
            .ok_or_else(|| CvmError::not_found(vm))?;
        if model.power_state == power_state {
            return Ok(());
        }
        model.power_state = power_state;

        let enabled = power_state.is_on();
        for key in state.database.interface_keys_of(vm) {
            if let Some(iface) = state.database.get_interface_mut(&key) {
                iface.enabled = enabled;
            }
        }

        info!("VM power state is now {}", power_state);
        self.push_vm(state, vm).await
    }

    /// Records guest-reported IP addresses per NIC.
    #[instrument(skip(self, state, nics), fields(vm = %vm))]
    pub async fn update_guest_net(
        &self,
        state: &mut SyncState,
        vm: &ManagedObjectRef,
        nics: &[GuestNic],
    ) -> CvmResult<()> {
        self.ensure_tracked(state, vm).await?;

        let ips: BTreeMap<String, String> = nics
            .iter()
            .filter_map(|nic| preferred_ip(&nic.ip_address).map(|ip| (nic.mac_address.clone(), ip)))
            .collect();

        let model = state
            .database
            .get_vm_mut(vm)
            .ok_or_else(|| CvmError::not_found(vm))?;
        model.guest_ips = ips.clone();
        let model = model.clone();

        let mut changed = Vec::new();
        for key in state.database.interface_keys_of(vm) {
            if let Some(iface) = state.database.get_interface_mut(&key) {
                let ip = ips.get(&key.mac).cloned();
                if iface.ip_address != ip {
                    iface.ip_address = ip;
                    changed.push(iface.clone());
                }
            }
        }

        for iface in changed.iter().filter(|i| !i.is_pending()) {
            debug!(iface = %iface.key, ip = ?iface.ip_address, "Guest IP changed");
            self.controller.sync_interface(iface, &model).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, state), fields(vm = %vm))]
    pub async fn update_tools_status(
        &self,
        state: &mut SyncState,
        vm: &ManagedObjectRef,
        status: ToolsStatus,
    ) -> CvmResult<()> {
        self.ensure_tracked(state, vm).await?;
        let model = state
            .database
            .get_vm_mut(vm)
            .ok_or_else(|| CvmError::not_found(vm))?;
        model.tools_status = Some(status);
        debug!(?status, "VMware tools status updated");
        Ok(())
    }

    /// Releases the VM's VLAN ids, deletes its interfaces and the VM itself.
    #[instrument(skip(self, state), fields(vm = %vm))]
    pub async fn remove_vm(&self, state: &mut SyncState, vm: &ManagedObjectRef) -> CvmResult<()> {
        if !state.database.contains_vm(vm) {
            return Err(CvmError::not_found(vm));
        }

        let mut released = false;
        for key in state.database.interface_keys_of(vm) {
            released |= self.detach_interface(state, &key).await?;
        }

        state.database.delete_vm(vm);
        self.controller.delete_virtual_machine(vm).await?;
        info!("Removed VM");

        if released {
            self.assign_pending(state).await?;
        }
        Ok(())
    }

    async fn ensure_tracked(&self, state: &mut SyncState, vm: &ManagedObjectRef) -> CvmResult<()> {
        if state.database.contains_vm(vm) {
            return Ok(());
        }
        warn!(vm = %vm, "VM not tracked, attempting inventory lookup");
        self.recover_vm(state, vm).await
    }

    /// Brings the VM's interfaces in line with its NIC list.
    ///
    /// NICs that vanished or moved to another network are detached first, so
    /// their ids are free for pending and new interfaces.
    async fn sync_nics(
        &self,
        state: &mut SyncState,
        vm: &ManagedObjectRef,
        nics: &[NicConfig],
    ) -> CvmResult<()> {
        let wanted: HashMap<&str, &NicConfig> = nics.iter().map(|n| (n.mac.as_str(), n)).collect();

        let mut released = false;
        for key in state.database.interface_keys_of(vm) {
            let keep = match (state.database.get_interface(&key), wanted.get(key.mac.as_str())) {
                (Some(iface), Some(nic)) => iface.network == nic.network,
                _ => false,
            };
            if !keep {
                released |= self.detach_interface(state, &key).await?;
            }
        }
        if released {
            self.assign_pending(state).await?;
        }

        let (enabled, guest_ips) = match state.database.get_vm(vm) {
            Some(model) => (model.power_state.is_on(), model.guest_ips.clone()),
            None => (false, BTreeMap::new()),
        };

        for nic in nics {
            let key = InterfaceKey::new(vm.clone(), nic.mac.clone());
            if state.database.get_interface(&key).is_some() {
                continue;
            }

            state.database.attach_network(&nic.network, &nic.network_name);
            let mut iface = InterfaceModel::new(key, nic.network.clone());
            iface.enabled = enabled;
            iface.ip_address = guest_ips.get(&nic.mac).cloned();

            match state.vlan_pool.allocate(nic.vlan_id) {
                Ok(id) => {
                    info!(
                        iface = %iface.key,
                        vlan_id = id,
                        "Attached interface to {}",
                        nic.network
                    );
                    iface.vlan_id = Some(id);
                }
                Err(e @ CvmError::PoolExhausted { .. }) => {
                    error!(
                        iface = %iface.key,
                        error = %e,
                        "No VLAN id available, interface left pending"
                    );
                }
                Err(e) => return Err(e),
            }
            state.database.upsert_interface(iface);
        }
        Ok(())
    }

    /// Removes one interface. Returns true if it held a VLAN id.
    async fn detach_interface(&self, state: &mut SyncState, key: &InterfaceKey) -> CvmResult<bool> {
        let Some(iface) = state.database.delete_interface(key) else {
            return Ok(false);
        };

        let released = iface
            .vlan_id
            .map(|id| state.vlan_pool.release(id))
            .unwrap_or(false);
        state.database.detach_network(&iface.network)?;
        self.controller.delete_interface(&iface).await?;

        info!(iface = %key, vlan_id = ?iface.vlan_id, "Detached interface");
        Ok(released)
    }

    /// Hands free ids to pending interfaces, lowest key first.
    async fn assign_pending(&self, state: &mut SyncState) -> CvmResult<()> {
        for key in state.database.pending_interfaces() {
            let Some(iface) = state.database.get_interface_mut(&key) else {
                continue;
            };
            let id = match state.vlan_pool.allocate(None) {
                Ok(id) => id,
                Err(CvmError::PoolExhausted { .. }) => break,
                Err(e) => return Err(e),
            };
            iface.vlan_id = Some(id);
            let iface = iface.clone();
            info!(iface = %key, vlan_id = id, "Assigned VLAN id to pending interface");

            if let Some(model) = state.database.get_vm(&key.vm).cloned() {
                self.controller.sync_interface(&iface, &model).await?;
            }
        }
        Ok(())
    }

    /// Pushes the VM and its bound interfaces to the controller.
    async fn push_vm(&self, state: &SyncState, vm: &ManagedObjectRef) -> CvmResult<()> {
        let model = state
            .database
            .get_vm(vm)
            .cloned()
            .ok_or_else(|| CvmError::not_found(vm))?;
        self.controller.sync_virtual_machine(&model).await?;

        let ifaces: Vec<InterfaceModel> = state
            .database
            .interface_keys_of(vm)
            .iter()
            .filter_map(|key| state.database.get_interface(key).cloned())
            .collect();
        for iface in ifaces.iter().filter(|i| !i.is_pending()) {
            self.controller.sync_interface(iface, &model).await?;
        }
        Ok(())
    }
}

/// First IPv4 address if any, else the first address.
fn preferred_ip(addresses: &[String]) -> Option<String> {
    addresses
        .iter()
        .find(|a| a.parse::<Ipv4Addr>().is_ok())
        .or_else(|| addresses.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{LoggingControllerClient, ReplayInventoryClient};
    use cvm_sync_common::{
        ObjectUpdateKind, PropertyChange, RawFilterUpdate, RawObjectUpdate, RawUpdateBatch,
        VersionToken, VlanIdPool,
    };
    use pretty_assertions::assert_eq;

    fn nic(mac: &str, net: &str) -> NicConfig {
        NicConfig {
            mac: mac.to_string(),
            network: ManagedObjectRef::network(net),
            network_name: net.to_string(),
            vlan_id: None,
        }
    }

    fn config(name: &str, nics: Vec<NicConfig>) -> VmConfig {
        VmConfig {
            name: name.to_string(),
            host: None,
            interfaces: nics,
        }
    }

    fn setup(start: u16, end: u16) -> (VmService, Arc<LoggingControllerClient>, SyncState) {
        setup_with(ReplayInventoryClient::new(Vec::new()), start, end)
    }

    fn setup_with(
        inventory: ReplayInventoryClient,
        start: u16,
        end: u16,
    ) -> (VmService, Arc<LoggingControllerClient>, SyncState) {
        let controller = Arc::new(LoggingControllerClient::new());
        let service = VmService::new(Arc::new(inventory), controller.clone());
        (service, controller, SyncState::new(VlanIdPool::new(start, end).unwrap()))
    }

    fn key(vm: &str, mac: &str) -> InterfaceKey {
        InterfaceKey::new(ManagedObjectRef::vm(vm), mac)
    }

    #[test]
    fn test_preferred_ip() {
        let addrs = vec!["fe80::1".to_string(), "10.0.0.7".to_string()];
        assert_eq!(preferred_ip(&addrs).as_deref(), Some("10.0.0.7"));
        assert_eq!(preferred_ip(&["fe80::1".to_string()]).as_deref(), Some("fe80::1"));
        assert_eq!(preferred_ip(&[]), None);
    }

    #[tokio::test]
    async fn test_update_vm_is_idempotent() {
        let (service, controller, mut state) = setup(10, 20);
        let vm = ManagedObjectRef::vm("vm-1");
        let cfg = config("web", vec![nic("m1", "net-A"), nic("m2", "net-A")]);

        service.update_vm(&mut state, &vm, &cfg).await.unwrap();
        service.update_vm(&mut state, &vm, &cfg).await.unwrap();

        assert_eq!(state.vlan_pool.allocated().collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(state.database.get_interface(&key("vm-1", "m1")).unwrap().vlan_id, Some(10));
        assert_eq!(
            state.database.get_network(&ManagedObjectRef::network("net-A")).unwrap().ref_count,
            2
        );
        // VM plus two interfaces, twice
        assert_eq!(controller.calls(), 6);
    }

    #[tokio::test]
    async fn test_remove_untracked_vm_is_not_found() {
        let (service, controller, mut state) = setup(10, 20);
        let err = service
            .remove_vm(&mut state, &ManagedObjectRef::vm("vm-404"))
            .await
            .unwrap_err();
        assert!(matches!(err, CvmError::EntityNotFound { .. }));
        assert_eq!(controller.calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_vm_hands_id_to_pending_interface() {
        let (service, _controller, mut state) = setup(10, 10);
        let vm1 = ManagedObjectRef::vm("vm-1");
        let vm2 = ManagedObjectRef::vm("vm-2");

        service.update_vm(&mut state, &vm1, &config("a", vec![nic("m1", "net-A")])).await.unwrap();
        service.update_vm(&mut state, &vm2, &config("b", vec![nic("m2", "net-B")])).await.unwrap();
        assert_eq!(state.database.pending_interfaces(), vec![key("vm-2", "m2")]);

        service.remove_vm(&mut state, &vm1).await.unwrap();

        assert!(!state.database.contains_vm(&vm1));
        assert!(state.database.get_network(&ManagedObjectRef::network("net-A")).is_none());
        assert_eq!(state.database.get_interface(&key("vm-2", "m2")).unwrap().vlan_id, Some(10));
        assert!(state.database.pending_interfaces().is_empty());
    }

    #[tokio::test]
    async fn test_rename_same_name_is_noop() {
        let (service, controller, mut state) = setup(10, 20);
        let vm = ManagedObjectRef::vm("vm-1");
        service.update_vm(&mut state, &vm, &config("web", vec![])).await.unwrap();
        let before = controller.calls();

        service.rename_vm(&mut state, &vm, "web").await.unwrap();
        assert_eq!(controller.calls(), before);

        service.rename_vm(&mut state, &vm, "db").await.unwrap();
        assert_eq!(state.database.get_vm(&vm).unwrap().name, "db");
        assert_eq!(controller.calls(), before + 1);
    }

    #[tokio::test]
    async fn test_power_state_follows_to_interfaces() {
        let (service, _controller, mut state) = setup(10, 20);
        let vm = ManagedObjectRef::vm("vm-1");
        service.update_vm(&mut state, &vm, &config("web", vec![nic("m1", "net-A")])).await.unwrap();
        assert!(!state.database.get_interface(&key("vm-1", "m1")).unwrap().enabled);

        service.update_power_state(&mut state, &vm, PowerState::PoweredOn).await.unwrap();
        assert!(state.database.get_interface(&key("vm-1", "m1")).unwrap().enabled);

        service.update_power_state(&mut state, &vm, PowerState::Suspended).await.unwrap();
        assert!(!state.database.get_interface(&key("vm-1", "m1")).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_guest_ip_carried_to_new_interface() {
        let (service, _controller, mut state) = setup(10, 20);
        let vm = ManagedObjectRef::vm("vm-1");
        service.update_vm(&mut state, &vm, &config("web", vec![nic("m1", "net-A")])).await.unwrap();

        let guest = vec![GuestNic {
            mac_address: "m1".to_string(),
            ip_address: vec!["10.1.1.1".to_string()],
            network: Some("net-A".to_string()),
        }];
        service.update_guest_net(&mut state, &vm, &guest).await.unwrap();

        // Moving the NIC recreates the interface with the known address
        service.update_vm(&mut state, &vm, &config("web", vec![nic("m1", "net-B")])).await.unwrap();
        let iface = state.database.get_interface(&key("vm-1", "m1")).unwrap();
        assert_eq!(iface.network, ManagedObjectRef::network("net-B"));
        assert_eq!(iface.ip_address.as_deref(), Some("10.1.1.1"));
    }

    #[tokio::test]
    async fn test_recover_vm_from_inventory() {
        let vm = ManagedObjectRef::vm("vm-3");
        let cfg = serde_json::to_value(config("cache", vec![nic("m3", "net-C")])).unwrap();
        let inventory = ReplayInventoryClient::new(vec![RawUpdateBatch {
            version: VersionToken::from("1"),
            filter_sets: vec![RawFilterUpdate {
                object_set: vec![RawObjectUpdate {
                    obj: vm.clone(),
                    kind: ObjectUpdateKind::Enter,
                    change_set: vec![PropertyChange::assign("config", cfg)],
                }],
            }],
        }]);
        inventory.wait_for_updates(&VersionToken::initial()).await.unwrap();
        let (service, _controller, mut state) = setup_with(inventory, 10, 20);

        service
            .update_tools_status(&mut state, &vm, ToolsStatus::GuestToolsRunning)
            .await
            .unwrap();
        let model = state.database.get_vm(&vm).unwrap();
        assert_eq!(model.name, "cache");
        assert_eq!(model.tools_status, Some(ToolsStatus::GuestToolsRunning));

        let err = service
            .recover_vm(&mut state, &ManagedObjectRef::vm("vm-4"))
            .await
            .unwrap_err();
        assert!(matches!(err, CvmError::EntityNotFound { .. }));
    }
}
