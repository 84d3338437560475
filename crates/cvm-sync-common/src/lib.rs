//! Common types for the vCenter to SDN controller synchronization engine.
//!
//! This crate provides the pieces the engine is built from:
//!
//! - [`UpdateSet`] and friends: typed change batches from the inventory
//! - [`UpdateDispatcher`]: routes each change or event to exactly one handler
//! - [`ChangeHandler`] / [`EventHandler`]: the handler seams
//! - [`VlanIdPool`]: fixed-range VLAN id allocator
//! - [`SyncMap`]: map that never creates entries implicitly
//! - [`InventoryClient`] / [`ControllerClient`]: backend client boundaries
//! - [`CvmError`]: the error taxonomy
//!
//! # Architecture
//!
//! 1. The listener waits on the inventory for change batches
//! 2. Each batch becomes an `UpdateSet` pushed onto a FIFO queue
//! 3. The monitor pops update sets one at a time and dispatches them
//! 4. Handlers mutate shared state under one coordination lock and call the
//!    controller client

mod client;
mod dispatcher;
mod error;
mod handler;
mod model;
mod sync_map;
mod update;
mod vlan_pool;

pub use client::{ControllerClient, InventoryClient, Reconnect, VmInventoryEntry};
pub use dispatcher::{DispatchReport, UpdateDispatcher};
pub use error::{CvmError, CvmResult, EXIT_DEFECT, EXIT_RESTART};
pub use handler::{ChangeHandler, EventHandler};
pub use model::{
    GuestNic, InterfaceKey, InterfaceModel, NicConfig, PowerState, ToolsStatus,
    VirtualMachineModel, VirtualNetworkModel, VmConfig,
};
pub use sync_map::{HasRefCount, SyncMap, SyncMapError};
pub use update::{
    ChangeOperation, Event, EventKind, ManagedObjectRef, ObjectUpdate, ObjectUpdateKind,
    PropertyChange, RawFilterUpdate, RawObjectUpdate, RawUpdateBatch, UpdateSet, VersionToken,
    EVENT_PAGE_PROPERTY,
};
pub use vlan_pool::{VlanIdPool, VLAN_ID_MAX, VLAN_ID_MIN};
