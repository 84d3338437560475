//! cvm-syncd - vCenter to SDN controller synchronization daemon
//!
//! Mirrors virtual machine, network and interface state from the
//! virtualization platform into the networking controller. Two tasks run
//! concurrently: the [`Supervisor`] keeps the [`EventListener`] pulling
//! change batches, and the [`Monitor`] feeds them to the handlers.

mod config;
mod context;
mod database;
mod event_listener;
mod handlers;
mod monitor;
mod replay;
mod services;
mod supervisor;

pub use config::*;
pub use context::CvmContext;
pub use database::{Database, SharedState, StateSnapshot, SyncState};
pub use event_listener::{update_set_queue, EventListener, UpdateSetReceiver, UpdateSetSender};
pub use handlers::*;
pub use monitor::Monitor;
pub use replay::{LoggingControllerClient, ReplayInventoryClient};
pub use services::VmService;
pub use supervisor::{Supervisor, SupervisorState, SupervisorStatus};
