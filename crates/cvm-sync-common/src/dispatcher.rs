//! Routes update sets to the registered handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, instrument, trace, warn};

use crate::error::{CvmError, CvmResult};
use crate::handler::{ChangeHandler, EventHandler};
use crate::update::{Event, EventKind, ManagedObjectRef, PropertyChange, UpdateSet};

/// Per-update-set dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Records a handler applied.
    pub handled: usize,
    /// Records no handler claims.
    pub ignored: usize,
    /// Records a handler rejected as not found or unparseable.
    pub skipped: usize,
}

/// Capability-based dispatch table.
///
/// Built once at composition time. Each property name and each event kind is
/// claimed by at most one handler, so a record runs at most one handler.
/// The state lock is taken around every handler call; the dispatcher itself
/// holds no other mutable state.
pub struct UpdateDispatcher<S: Send> {
    state: Arc<Mutex<S>>,
    change_handlers: HashMap<&'static str, Arc<dyn ChangeHandler<S>>>,
    event_handlers: HashMap<EventKind, Arc<dyn EventHandler<S>>>,
    registered: Vec<String>,
}

impl<S: Send> UpdateDispatcher<S> {
    pub fn new(state: Arc<Mutex<S>>) -> Self {
        Self {
            state,
            change_handlers: HashMap::new(),
            event_handlers: HashMap::new(),
            registered: Vec::new(),
        }
    }

    /// Returns the shared state the handlers mutate.
    pub fn state(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.state)
    }

    /// Handler names in registration order.
    pub fn handler_names(&self) -> &[String] {
        &self.registered
    }

    /// Registers a change handler. Fails if its property is already claimed.
    pub fn register_change_handler(&mut self, handler: Arc<dyn ChangeHandler<S>>) -> CvmResult<()> {
        let property = handler.property_name();
        if let Some(existing) = self.change_handlers.get(property) {
            return Err(CvmError::HandlerConflict {
                key: property.to_string(),
                existing: existing.name().to_string(),
            });
        }

        debug!("Registering {} for property {}", handler.name(), property);
        self.registered.push(handler.name().to_string());
        self.change_handlers.insert(property, handler);
        Ok(())
    }

    /// Registers an event handler. Fails if any of its kinds is already
    /// claimed; nothing is registered in that case.
    pub fn register_event_handler(&mut self, handler: Arc<dyn EventHandler<S>>) -> CvmResult<()> {
        for kind in handler.events() {
            if let Some(existing) = self.event_handlers.get(kind) {
                return Err(CvmError::HandlerConflict {
                    key: kind.to_string(),
                    existing: existing.name().to_string(),
                });
            }
        }

        debug!("Registering {} for events {:?}", handler.name(), handler.events());
        self.registered.push(handler.name().to_string());
        for kind in handler.events() {
            self.event_handlers.insert(*kind, Arc::clone(&handler));
        }
        Ok(())
    }

    /// Dispatches every record of `set` in the order it was supplied.
    ///
    /// Not-found and unparseable records are logged and skipped. Any other
    /// handler error stops the dispatch and is returned unchanged.
    #[instrument(skip(self, set), fields(version = %set.version, updates = set.updates.len()))]
    pub async fn dispatch(&self, set: &UpdateSet) -> CvmResult<DispatchReport> {
        let mut report = DispatchReport::default();

        for update in &set.updates {
            for change in &update.changes {
                if !change.is_event_page() {
                    self.dispatch_change(&update.obj, change, &mut report).await?;
                    continue;
                }

                let events = match Event::parse_page(&change.value) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(obj = %update.obj, error = %e, "Skipping malformed event page");
                        report.skipped += 1;
                        continue;
                    }
                };
                for event in &events {
                    self.dispatch_event(event, &mut report).await?;
                }
            }
        }

        debug!(
            handled = report.handled,
            ignored = report.ignored,
            skipped = report.skipped,
            "Update set dispatched"
        );
        Ok(report)
    }

    async fn dispatch_change(
        &self,
        obj: &ManagedObjectRef,
        change: &PropertyChange,
        report: &mut DispatchReport,
    ) -> CvmResult<()> {
        let Some(handler) = self.change_handlers.get(change.name.as_str()) else {
            trace!(obj = %obj, property = %change.name, "No handler for property");
            report.ignored += 1;
            return Ok(());
        };

        let result = {
            let mut state = self.state.lock().await;
            handler.handle_change(&mut *state, obj, change).await
        };
        settle(result, handler.name(), &obj.to_string(), report)
    }

    async fn dispatch_event(&self, event: &Event, report: &mut DispatchReport) -> CvmResult<()> {
        let handler = match event.kind {
            EventKind::Other => None,
            kind => self.event_handlers.get(&kind),
        };
        let Some(handler) = handler else {
            trace!(vm = %event.vm, kind = %event.kind, "No handler for event");
            report.ignored += 1;
            return Ok(());
        };

        let result = {
            let mut state = self.state.lock().await;
            handler.handle_event(&mut *state, event).await
        };
        settle(result, handler.name(), &event.vm.to_string(), report)
    }
}

fn settle(
    result: CvmResult<()>,
    handler: &str,
    target: &str,
    report: &mut DispatchReport,
) -> CvmResult<()> {
    match result {
        Ok(()) => {
            report.handled += 1;
            Ok(())
        }
        Err(e) if e.is_skippable() => {
            warn!(handler, target, error = %e, "Skipping record");
            report.skipped += 1;
            Ok(())
        }
        Err(e) => {
            error!(handler, target, error = %e, "Handler failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{ObjectUpdate, ObjectUpdateKind, VersionToken};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    type Log = Vec<String>;

    struct Recorder {
        name: &'static str,
        property: &'static str,
    }

    #[async_trait]
    impl ChangeHandler<Log> for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn property_name(&self) -> &'static str {
            self.property
        }

        async fn handle_change(
            &self,
            state: &mut Log,
            obj: &ManagedObjectRef,
            change: &PropertyChange,
        ) -> CvmResult<()> {
            match change.value.as_str() {
                Some("missing") => Err(CvmError::not_found(obj)),
                Some("broken") => Err(CvmError::domain("rule violated")),
                _ => {
                    state.push(format!("{}:{}={}", obj.id, change.name, change.value));
                    Ok(())
                }
            }
        }
    }

    struct EventRecorder(&'static [EventKind]);

    #[async_trait]
    impl EventHandler<Log> for EventRecorder {
        fn name(&self) -> &str {
            "EventRecorder"
        }

        fn events(&self) -> &'static [EventKind] {
            self.0
        }

        async fn handle_event(&self, state: &mut Log, event: &Event) -> CvmResult<()> {
            state.push(format!("{}:{}", event.vm.id, event.kind));
            Ok(())
        }
    }

    fn dispatcher() -> UpdateDispatcher<Log> {
        let mut d = UpdateDispatcher::new(Arc::new(Mutex::new(Vec::new())));
        d.register_change_handler(Arc::new(Recorder { name: "NameRecorder", property: "name" }))
            .unwrap();
        d.register_change_handler(Arc::new(Recorder {
            name: "PowerRecorder",
            property: "runtime.powerState",
        }))
        .unwrap();
        d.register_event_handler(Arc::new(EventRecorder(&[
            EventKind::VmRemoved,
            EventKind::VmRenamed,
        ])))
        .unwrap();
        d
    }

    fn set(changes: Vec<PropertyChange>) -> UpdateSet {
        UpdateSet {
            version: VersionToken::from("1"),
            updates: vec![ObjectUpdate {
                obj: ManagedObjectRef::vm("vm-1"),
                kind: ObjectUpdateKind::Modify,
                changes,
            }],
        }
    }

    #[tokio::test]
    async fn test_changes_applied_in_order() {
        let d = dispatcher();
        let report = d
            .dispatch(&set(vec![
                PropertyChange::assign("name", json!("a")),
                PropertyChange::assign("name", json!("b")),
            ]))
            .await
            .unwrap();

        assert_eq!(report.handled, 2);
        let state = d.state();
        assert_eq!(
            *state.lock().await,
            vec![r#"vm-1:name="a""#.to_string(), r#"vm-1:name="b""#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_unmatched_property_ignored() {
        let d = dispatcher();
        let report = d
            .dispatch(&set(vec![PropertyChange::assign("summary.quickStats", json!(1))]))
            .await
            .unwrap();

        assert_eq!(report, DispatchReport { handled: 0, ignored: 1, skipped: 0 });
        assert!(d.state().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_event_page_routed_to_event_handler() {
        let d = dispatcher();
        let events = vec![
            Event::new(EventKind::VmRenamed, ManagedObjectRef::vm("vm-1")),
            Event::new(EventKind::VmPoweredOn, ManagedObjectRef::vm("vm-1")),
            Event::new(EventKind::VmRemoved, ManagedObjectRef::vm("vm-2")),
        ];
        let report = d
            .dispatch(&set(vec![PropertyChange::event_page(&events).unwrap()]))
            .await
            .unwrap();

        assert_eq!(report.handled, 2);
        assert_eq!(report.ignored, 1);
        assert_eq!(
            *d.state().lock().await,
            vec!["vm-1:VmRenamedEvent".to_string(), "vm-2:VmRemovedEvent".to_string()]
        );
    }

    #[tokio::test]
    async fn test_not_found_is_skipped() {
        let d = dispatcher();
        let report = d
            .dispatch(&set(vec![
                PropertyChange::assign("name", json!("missing")),
                PropertyChange::assign("runtime.powerState", json!("poweredOn")),
            ]))
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.handled, 1);
    }

    #[tokio::test]
    async fn test_domain_error_propagates_and_stops() {
        let d = dispatcher();
        let err = d
            .dispatch(&set(vec![
                PropertyChange::assign("name", json!("broken")),
                PropertyChange::assign("runtime.powerState", json!("poweredOn")),
            ]))
            .await
            .unwrap_err();

        assert_eq!(err, CvmError::domain("rule violated"));
        assert!(d.state().lock().await.is_empty());
    }

    #[test]
    fn test_conflicting_registration_rejected() {
        let mut d = dispatcher();
        let err = d
            .register_change_handler(Arc::new(Recorder { name: "Other", property: "name" }))
            .unwrap_err();
        assert_eq!(
            err,
            CvmError::HandlerConflict {
                key: "name".to_string(),
                existing: "NameRecorder".to_string()
            }
        );

        let err = d
            .register_event_handler(Arc::new(EventRecorder(&[
                EventKind::VmCreated,
                EventKind::VmRemoved,
            ])))
            .unwrap_err();
        assert!(matches!(err, CvmError::HandlerConflict { .. }));
        // Nothing from the rejected handler was registered
        assert_eq!(d.handler_names().len(), 3);
    }
}
