//! Handler traits for the update dispatcher.
//!
//! A change handler owns exactly one property name; an event handler owns a
//! fixed set of event kinds. The dispatcher hands each handler exclusive
//! access to the shared state `S` for the duration of one call.

use async_trait::async_trait;

use crate::error::CvmResult;
use crate::update::{Event, EventKind, ManagedObjectRef, PropertyChange};

/// Handles property changes for one property name.
#[async_trait]
pub trait ChangeHandler<S: Send>: Send + Sync {
    /// Returns the name of this handler (for logging and conflicts).
    fn name(&self) -> &str;

    /// The property name this handler claims.
    fn property_name(&self) -> &'static str;

    /// Applies one change to the object it targets.
    async fn handle_change(
        &self,
        state: &mut S,
        obj: &ManagedObjectRef,
        change: &PropertyChange,
    ) -> CvmResult<()>;
}

/// Handles platform events of a fixed set of kinds.
#[async_trait]
pub trait EventHandler<S: Send>: Send + Sync {
    /// Returns the name of this handler (for logging and conflicts).
    fn name(&self) -> &str;

    /// The event kinds this handler claims.
    fn events(&self) -> &'static [EventKind];

    async fn handle_event(&self, state: &mut S, event: &Event) -> CvmResult<()>;
}
