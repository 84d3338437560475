//! Verification helpers for store snapshots

use std::collections::HashSet;

use thiserror::Error;

use cvm_sync_common::{InterfaceModel, ManagedObjectRef, VirtualMachineModel};
use cvm_syncd::StateSnapshot;

/// Verification error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Expected VM '{vm}' to be tracked")]
    VmNotFound { vm: String },

    #[error("Expected VM '{vm}' to be gone")]
    VmPresent { vm: String },

    #[error("Expected interface '{key}' to exist")]
    InterfaceNotFound { key: String },

    #[error("Expected interface '{key}' to be gone")]
    InterfacePresent { key: String },

    #[error("Value mismatch for {what}: expected '{expected}', got '{actual}'")]
    ValueMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("VLAN id {vlan_id} bound to more than one interface")]
    DuplicateVlan { vlan_id: u16 },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

fn mismatch(
    what: impl Into<String>,
    expected: impl ToString,
    actual: impl ToString,
) -> VerificationError {
    VerificationError::ValueMismatch {
        what: what.into(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

/// Snapshot verification helper
pub struct StateVerifier<'a> {
    snapshot: &'a StateSnapshot,
}

impl<'a> StateVerifier<'a> {
    pub fn new(snapshot: &'a StateSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn assert_vm(&self, vm_id: &str) -> VerifyResult<&'a VirtualMachineModel> {
        self.snapshot
            .vm(&ManagedObjectRef::vm(vm_id))
            .ok_or_else(|| VerificationError::VmNotFound {
                vm: vm_id.to_string(),
            })
    }

    pub fn assert_no_vm(&self, vm_id: &str) -> VerifyResult<()> {
        match self.snapshot.vm(&ManagedObjectRef::vm(vm_id)) {
            Some(_) => Err(VerificationError::VmPresent {
                vm: vm_id.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn assert_interface(&self, vm_id: &str, mac: &str) -> VerifyResult<&'a InterfaceModel> {
        self.snapshot
            .interface(&ManagedObjectRef::vm(vm_id), mac)
            .ok_or_else(|| VerificationError::InterfaceNotFound {
                key: format!("{vm_id}/{mac}"),
            })
    }

    pub fn assert_no_interface(&self, vm_id: &str, mac: &str) -> VerifyResult<()> {
        match self.snapshot.interface(&ManagedObjectRef::vm(vm_id), mac) {
            Some(_) => Err(VerificationError::InterfacePresent {
                key: format!("{vm_id}/{mac}"),
            }),
            None => Ok(()),
        }
    }

    /// Verify the interface is attached to `network_id` with `vlan_id`
    /// (`None` = pending).
    pub fn assert_binding(
        &self,
        vm_id: &str,
        mac: &str,
        network_id: &str,
        vlan_id: Option<u16>,
    ) -> VerifyResult<()> {
        let iface = self.assert_interface(vm_id, mac)?;
        if iface.network.id != network_id {
            return Err(mismatch(format!("{vm_id}/{mac} network"), network_id, &iface.network.id));
        }
        if iface.vlan_id != vlan_id {
            return Err(mismatch(
                format!("{vm_id}/{mac} vlan"),
                format!("{vlan_id:?}"),
                format!("{:?}", iface.vlan_id),
            ));
        }
        Ok(())
    }

    pub fn assert_network_refs(&self, network_id: &str, expected: u32) -> VerifyResult<()> {
        let actual = self
            .snapshot
            .networks
            .iter()
            .find(|n| n.network.id == network_id)
            .map(|n| n.ref_count)
            .unwrap_or(0);
        if actual != expected {
            return Err(mismatch(format!("{network_id} references"), expected, actual));
        }
        Ok(())
    }

    pub fn assert_allocated(&self, expected: &[u16]) -> VerifyResult<()> {
        if self.snapshot.allocated_vlans != expected {
            return Err(mismatch(
                "allocated VLAN ids",
                format!("{expected:?}"),
                format!("{:?}", self.snapshot.allocated_vlans),
            ));
        }
        Ok(())
    }

    /// Every bound VLAN id is unique and recorded as allocated.
    pub fn assert_vlans_consistent(&self) -> VerifyResult<()> {
        let mut seen = HashSet::new();
        for vlan_id in self.snapshot.interfaces.iter().filter_map(|i| i.vlan_id) {
            if !seen.insert(vlan_id) {
                return Err(VerificationError::DuplicateVlan { vlan_id });
            }
        }
        let allocated: HashSet<u16> = self.snapshot.allocated_vlans.iter().copied().collect();
        if seen != allocated {
            return Err(mismatch(
                "bound vs allocated VLAN ids",
                format!("{allocated:?}"),
                format!("{seen:?}"),
            ));
        }
        Ok(())
    }
}
