//! Shared State Store: in-memory mirror of tracked VMs, networks and interfaces.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use cvm_sync_common::{
    CvmError, CvmResult, InterfaceKey, InterfaceModel, ManagedObjectRef, SyncMap,
    VirtualMachineModel, VirtualNetworkModel, VlanIdPool,
};

/// Keyed collections per entity kind.
#[derive(Debug, Default)]
pub struct Database {
    vms: HashMap<ManagedObjectRef, VirtualMachineModel>,
    networks: SyncMap<ManagedObjectRef, VirtualNetworkModel>,
    interfaces: BTreeMap<InterfaceKey, InterfaceModel>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_vm(&self, vm: &ManagedObjectRef) -> Option<&VirtualMachineModel> {
        self.vms.get(vm)
    }

    pub fn get_vm_mut(&mut self, vm: &ManagedObjectRef) -> Option<&mut VirtualMachineModel> {
        self.vms.get_mut(vm)
    }

    pub fn contains_vm(&self, vm: &ManagedObjectRef) -> bool {
        self.vms.contains_key(vm)
    }

    pub fn upsert_vm(&mut self, model: VirtualMachineModel) -> Option<VirtualMachineModel> {
        self.vms.insert(model.vm.clone(), model)
    }

    pub fn delete_vm(&mut self, vm: &ManagedObjectRef) -> Option<VirtualMachineModel> {
        self.vms.remove(vm)
    }

    pub fn vms(&self) -> impl Iterator<Item = &VirtualMachineModel> {
        self.vms.values()
    }

    pub fn get_network(&self, network: &ManagedObjectRef) -> Option<&VirtualNetworkModel> {
        self.networks.get(network)
    }

    pub fn networks(&self) -> impl Iterator<Item = &VirtualNetworkModel> {
        self.networks.values()
    }

    /// Records one more interface on `network`, creating it on first use.
    pub fn attach_network(&mut self, network: &ManagedObjectRef, name: &str) -> u32 {
        self.networks.acquire_ref(network.clone(), || {
            VirtualNetworkModel::new(network.clone(), name)
        })
    }

    /// Drops one interface reference; returns the network once unreferenced.
    pub fn detach_network(
        &mut self,
        network: &ManagedObjectRef,
    ) -> CvmResult<Option<VirtualNetworkModel>> {
        self.networks
            .release_ref(network)
            .map_err(|e| CvmError::internal(format!("network {network}: {e}")))
    }

    pub fn get_interface(&self, key: &InterfaceKey) -> Option<&InterfaceModel> {
        self.interfaces.get(key)
    }

    pub fn get_interface_mut(&mut self, key: &InterfaceKey) -> Option<&mut InterfaceModel> {
        self.interfaces.get_mut(key)
    }

    pub fn upsert_interface(&mut self, iface: InterfaceModel) -> Option<InterfaceModel> {
        self.interfaces.insert(iface.key.clone(), iface)
    }

    pub fn delete_interface(&mut self, key: &InterfaceKey) -> Option<InterfaceModel> {
        self.interfaces.remove(key)
    }

    /// Interfaces in key order.
    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceModel> {
        self.interfaces.values()
    }

    /// Keys of the interfaces owned by `vm`.
    pub fn interface_keys_of(&self, vm: &ManagedObjectRef) -> Vec<InterfaceKey> {
        self.interfaces
            .keys()
            .filter(|key| &key.vm == vm)
            .cloned()
            .collect()
    }

    /// Keys of the interfaces still waiting for a VLAN id, in key order.
    pub fn pending_interfaces(&self) -> Vec<InterfaceKey> {
        self.interfaces
            .values()
            .filter(|iface| iface.is_pending())
            .map(|iface| iface.key.clone())
            .collect()
    }
}

/// Everything handlers mutate, guarded by one coordination lock.
#[derive(Debug)]
pub struct SyncState {
    pub database: Database,
    pub vlan_pool: VlanIdPool,
}

impl SyncState {
    pub fn new(vlan_pool: VlanIdPool) -> Self {
        Self {
            database: Database::new(),
            vlan_pool,
        }
    }
}

/// Handle on the lock-protected [`SyncState`].
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<SyncState>>,
}

impl SharedState {
    pub fn new(vlan_pool: VlanIdPool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SyncState::new(vlan_pool))),
        }
    }

    /// The coordination lock itself, for the dispatcher.
    pub fn handle(&self) -> Arc<Mutex<SyncState>> {
        Arc::clone(&self.inner)
    }

    /// Copies the store under the lock.
    pub async fn snapshot(&self) -> StateSnapshot {
        let state = self.inner.lock().await;
        StateSnapshot::capture(&state)
    }
}

/// Read-only, lock-consistent copy of the store for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Sorted by VM reference
    pub vms: Vec<VirtualMachineModel>,
    /// Sorted by network reference
    pub networks: Vec<VirtualNetworkModel>,
    /// Sorted by interface key
    pub interfaces: Vec<InterfaceModel>,
    pub allocated_vlans: Vec<u16>,
}

impl StateSnapshot {
    pub fn capture(state: &SyncState) -> Self {
        let mut vms: Vec<_> = state.database.vms().cloned().collect();
        vms.sort_by(|a, b| a.vm.cmp(&b.vm));

        let mut networks: Vec<_> = state.database.networks().cloned().collect();
        networks.sort_by(|a, b| a.network.cmp(&b.network));

        Self {
            taken_at: Utc::now(),
            vms,
            networks,
            interfaces: state.database.interfaces().cloned().collect(),
            allocated_vlans: state.vlan_pool.allocated().collect(),
        }
    }

    pub fn vm(&self, vm: &ManagedObjectRef) -> Option<&VirtualMachineModel> {
        self.vms.iter().find(|m| &m.vm == vm)
    }

    pub fn interface(&self, vm: &ManagedObjectRef, mac: &str) -> Option<&InterfaceModel> {
        self.interfaces
            .iter()
            .find(|i| &i.key.vm == vm && i.key.mac == mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn iface(vm: &str, mac: &str, net: &str) -> InterfaceModel {
        InterfaceModel::new(
            InterfaceKey::new(ManagedObjectRef::vm(vm), mac),
            ManagedObjectRef::network(net),
        )
    }

    #[test]
    fn test_vm_crud() {
        let mut db = Database::new();
        let vm = ManagedObjectRef::vm("vm-1");

        assert!(db.get_vm(&vm).is_none());
        db.upsert_vm(VirtualMachineModel::new(vm.clone(), "web"));
        assert_eq!(db.get_vm(&vm).unwrap().name, "web");

        db.get_vm_mut(&vm).unwrap().name = "web-2".to_string();
        assert_eq!(db.delete_vm(&vm).unwrap().name, "web-2");
        assert!(!db.contains_vm(&vm));
    }

    #[test]
    fn test_network_refcount_lifecycle() {
        let mut db = Database::new();
        let net = ManagedObjectRef::network("net-A");

        assert_eq!(db.attach_network(&net, "frontend"), 1);
        assert_eq!(db.attach_network(&net, "frontend"), 2);
        assert!(db.detach_network(&net).unwrap().is_none());
        assert!(db.detach_network(&net).unwrap().is_some());
        assert!(db.get_network(&net).is_none());

        let err = db.detach_network(&net).unwrap_err();
        assert!(matches!(err, CvmError::Internal { .. }));
    }

    #[test]
    fn test_interface_queries() {
        let mut db = Database::new();
        db.upsert_interface(iface("vm-2", "m1", "net-A"));
        db.upsert_interface(iface("vm-1", "m2", "net-A"));
        let mut assigned = iface("vm-1", "m1", "net-B");
        assigned.vlan_id = Some(5);
        db.upsert_interface(assigned);

        let keys = db.interface_keys_of(&ManagedObjectRef::vm("vm-1"));
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].mac, "m1");

        let pending: Vec<_> = db.pending_interfaces().into_iter().map(|k| k.to_string()).collect();
        assert_eq!(
            pending,
            vec!["VirtualMachine:vm-1/m2".to_string(), "VirtualMachine:vm-2/m1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let shared = SharedState::new(VlanIdPool::new(10, 20).unwrap());
        {
            let handle = shared.handle();
            let mut state = handle.lock().await;
            state.database.upsert_vm(VirtualMachineModel::new(ManagedObjectRef::vm("vm-1"), "web"));
            state.vlan_pool.allocate(None).unwrap();
        }

        let snapshot = shared.snapshot().await;
        assert_eq!(snapshot.vms.len(), 1);
        assert_eq!(snapshot.allocated_vlans, vec![10]);

        shared.handle().lock().await.vlan_pool.release(10);
        assert_eq!(snapshot.allocated_vlans, vec![10]);
        assert!(snapshot.vm(&ManagedObjectRef::vm("vm-1")).is_some());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("taken_at").is_some());
    }
}
