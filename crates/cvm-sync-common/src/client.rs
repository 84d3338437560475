//! Boundaries to the two backend API clients.
//!
//! Connection setup, TLS and request marshaling live behind these traits.
//! Transport failures must surface as [`CvmError::ConnectionLost`] so the
//! supervisor can tell them apart from everything else.
//!
//! [`CvmError::ConnectionLost`]: crate::CvmError::ConnectionLost

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CvmResult;
use crate::model::{InterfaceModel, VirtualMachineModel, VmConfig};
use crate::update::{ManagedObjectRef, RawUpdateBatch, VersionToken};

/// Session re-establishment hook used while reconnecting.
#[async_trait]
pub trait Reconnect: Send + Sync {
    /// Backend name for logging (e.g. "esxi", "vnc").
    fn backend(&self) -> &str;

    /// Tears down the stale session and opens a fresh one. May block until
    /// the backend is reachable again.
    async fn reconnect(&self) -> CvmResult<()>;
}

/// One VM as returned by a full inventory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInventoryEntry {
    pub vm: ManagedObjectRef,
    pub config: VmConfig,
}

/// Virtualization inventory client.
#[async_trait]
pub trait InventoryClient: Reconnect {
    /// Establishes the initial session.
    async fn connect(&self) -> CvmResult<()> {
        Ok(())
    }

    /// Blocks until the next change batch after `version` is available.
    /// The initial token returns a full baseline.
    async fn wait_for_updates(&self, version: &VersionToken) -> CvmResult<RawUpdateBatch>;

    /// Lists every virtual machine currently known to the platform.
    async fn list_all(&self) -> CvmResult<Vec<VmInventoryEntry>>;
}

/// Networking controller client.
#[async_trait]
pub trait ControllerClient: Reconnect {
    async fn sync_virtual_machine(&self, vm: &VirtualMachineModel) -> CvmResult<()>;

    async fn delete_virtual_machine(&self, vm: &ManagedObjectRef) -> CvmResult<()>;

    /// Creates or updates the port for `iface`, including its VLAN tag.
    async fn sync_interface(
        &self,
        iface: &InterfaceModel,
        vm: &VirtualMachineModel,
    ) -> CvmResult<()>;

    async fn delete_interface(&self, iface: &InterfaceModel) -> CvmResult<()>;
}
