//! Inventory update types: what the listener produces and the dispatcher consumes.
//!
//! The virtualization platform reports changes as batches of per-object
//! property diffs. Events (VM removed, VM renamed, ...) are not diffs; the
//! platform multiplexes them through the [`EVENT_PAGE_PROPERTY`] property,
//! whose value is a page of [`Event`] records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{CvmError, CvmResult};
use crate::model::VmConfig;

/// Property name under which the platform delivers event pages.
pub const EVENT_PAGE_PROPERTY: &str = "latestPage";

/// Reference to an inventory object. Equality is by `(kind, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    /// Object type, e.g. "VirtualMachine", "Network".
    pub kind: String,
    /// Inventory id, e.g. "vm-42".
    pub id: String,
}

impl ManagedObjectRef {
    pub const VIRTUAL_MACHINE: &'static str = "VirtualMachine";
    pub const NETWORK: &'static str = "Network";
    pub const EVENT_HISTORY_COLLECTOR: &'static str = "EventHistoryCollector";

    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn vm(id: impl Into<String>) -> Self {
        Self::new(Self::VIRTUAL_MACHINE, id)
    }

    pub fn network(id: impl Into<String>) -> Self {
        Self::new(Self::NETWORK, id)
    }

    pub fn is_vm(&self) -> bool {
        self.kind == Self::VIRTUAL_MACHINE
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for ManagedObjectRef {
    type Err = CvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(Self::new(kind, id)),
            _ => Err(CvmError::invalid_value("ManagedObjectRef", format!("malformed '{s}'"))),
        }
    }
}

/// Opaque position in the platform's change stream.
///
/// The empty token is the initial token: waiting on it yields a full
/// baseline of everything currently known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(pub String);

impl VersionToken {
    pub fn initial() -> Self {
        Self::default()
    }

    pub fn is_initial(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_initial() {
            f.write_str("<initial>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for VersionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a property change applies to its field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOperation {
    /// The field took a new value.
    #[default]
    Assign,
    /// The field was removed.
    Remove,
    /// The field went away because its parent did.
    IndirectRemove,
}

impl ChangeOperation {
    pub fn is_removal(&self) -> bool {
        matches!(self, ChangeOperation::Remove | ChangeOperation::IndirectRemove)
    }
}

/// One field update on one managed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Property path, e.g. "runtime.powerState".
    pub name: String,
    /// New value (`Null` for removals).
    #[serde(default, rename = "val")]
    pub value: Value,
    #[serde(default)]
    pub op: ChangeOperation,
}

impl PropertyChange {
    pub fn assign(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            op: ChangeOperation::Assign,
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
            op: ChangeOperation::Remove,
        }
    }

    /// Wraps events into an event page change.
    pub fn event_page(events: &[Event]) -> CvmResult<Self> {
        let value = serde_json::to_value(events)
            .map_err(|e| CvmError::invalid_value(EVENT_PAGE_PROPERTY, e))?;
        Ok(Self::assign(EVENT_PAGE_PROPERTY, value))
    }

    /// Returns true if this change actually carries an event page.
    pub fn is_event_page(&self) -> bool {
        self.name == EVENT_PAGE_PROPERTY
    }

    /// Parses the value into a typed structure.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> CvmResult<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| CvmError::invalid_value(&self.name, e))
    }
}

/// Kind of object update within a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectUpdateKind {
    /// Object entered the filter (baseline or newly created).
    Enter,
    /// Object properties changed.
    #[default]
    Modify,
    /// Object left the filter (deleted or unregistered).
    Leave,
}

/// Raw per-object update as returned by the inventory client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawObjectUpdate {
    pub obj: ManagedObjectRef,
    #[serde(default)]
    pub kind: ObjectUpdateKind,
    #[serde(default)]
    pub change_set: Vec<PropertyChange>,
}

/// Raw filter update: one property filter's share of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFilterUpdate {
    #[serde(default)]
    pub object_set: Vec<RawObjectUpdate>,
}

/// Raw change batch returned by one wait-for-updates call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUpdateBatch {
    /// Version to wait on next.
    pub version: VersionToken,
    #[serde(default)]
    pub filter_sets: Vec<RawFilterUpdate>,
}

/// All changes reported for one object in one update set.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectUpdate {
    pub obj: ManagedObjectRef,
    pub kind: ObjectUpdateKind,
    pub changes: Vec<PropertyChange>,
}

/// One poll cycle's worth of changes, in the order the platform supplied them.
///
/// Produced once by the listener and consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSet {
    /// Version token of the batch this set was built from.
    pub version: VersionToken,
    pub updates: Vec<ObjectUpdate>,
}

impl UpdateSet {
    /// Converts a raw batch into an update set.
    ///
    /// Filter sets are flattened in order. A virtual machine leaving the
    /// filter becomes a `VmRemoved` event on the event page property so it
    /// is routed like any other removal notification.
    pub fn from_raw(batch: RawUpdateBatch) -> CvmResult<Self> {
        let mut updates = Vec::new();

        for filter in batch.filter_sets {
            for object in filter.object_set {
                let changes = if object.kind == ObjectUpdateKind::Leave && object.obj.is_vm() {
                    let removed = Event::new(EventKind::VmRemoved, object.obj.clone());
                    vec![PropertyChange::event_page(&[removed])?]
                } else {
                    object.change_set
                };

                updates.push(ObjectUpdate {
                    obj: object.obj,
                    kind: object.kind,
                    changes,
                });
            }
        }

        Ok(Self {
            version: batch.version,
            updates,
        })
    }

    /// Total number of property changes (event pages count once).
    pub fn change_count(&self) -> usize {
        self.updates.iter().map(|u| u.changes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.iter().all(|u| u.changes.is_empty())
    }
}

/// Event categories the engine knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    VmCreated,
    VmCloned,
    VmDeployed,
    VmMacChanged,
    VmMacAssigned,
    VmMigrated,
    DrsVmMigrated,
    VmRenamed,
    VmReconfigured,
    VmRemoved,
    VmRegistered,
    VmPoweredOn,
    VmPoweredOff,
    /// Any event type not listed above; never routed.
    Other,
}

impl EventKind {
    /// Wire name used by the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::VmCreated => "VmCreatedEvent",
            EventKind::VmCloned => "VmClonedEvent",
            EventKind::VmDeployed => "VmDeployedEvent",
            EventKind::VmMacChanged => "VmMacChangedEvent",
            EventKind::VmMacAssigned => "VmMacAssignedEvent",
            EventKind::VmMigrated => "VmMigratedEvent",
            EventKind::DrsVmMigrated => "DrsVmMigratedEvent",
            EventKind::VmRenamed => "VmRenamedEvent",
            EventKind::VmReconfigured => "VmReconfiguredEvent",
            EventKind::VmRemoved => "VmRemovedEvent",
            EventKind::VmRegistered => "VmRegisteredEvent",
            EventKind::VmPoweredOn => "VmPoweredOnEvent",
            EventKind::VmPoweredOff => "VmPoweredOffEvent",
            EventKind::Other => "Event",
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "VmCreatedEvent" => EventKind::VmCreated,
            "VmClonedEvent" => EventKind::VmCloned,
            "VmDeployedEvent" => EventKind::VmDeployed,
            "VmMacChangedEvent" => EventKind::VmMacChanged,
            "VmMacAssignedEvent" => EventKind::VmMacAssigned,
            "VmMigratedEvent" => EventKind::VmMigrated,
            "DrsVmMigratedEvent" => EventKind::DrsVmMigrated,
            "VmRenamedEvent" => EventKind::VmRenamed,
            "VmReconfiguredEvent" => EventKind::VmReconfigured,
            "VmRemovedEvent" => EventKind::VmRemoved,
            "VmRegisteredEvent" => EventKind::VmRegistered,
            "VmPoweredOnEvent" => EventKind::VmPoweredOn,
            "VmPoweredOffEvent" => EventKind::VmPoweredOff,
            _ => EventKind::Other,
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A platform event about one virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event sequence number.
    #[serde(default)]
    pub key: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub vm: ManagedObjectRef,
    #[serde(default)]
    pub vm_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Populated for rename events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    /// Device configuration, when the event carries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<VmConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(kind: EventKind, vm: ManagedObjectRef) -> Self {
        Self {
            key: 0,
            kind,
            vm,
            vm_name: String::new(),
            host: None,
            new_name: None,
            config: None,
            created_time: None,
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.vm_name = config.name.clone();
        self.config = Some(config);
        self
    }

    pub fn with_new_name(mut self, name: impl Into<String>) -> Self {
        self.new_name = Some(name.into());
        self
    }

    /// Unwraps an event page value into individual events.
    ///
    /// Accepts an array, a single event object, or null. Entries that do not
    /// parse are logged and dropped; the rest of the page is kept.
    pub fn parse_page(value: &Value) -> CvmResult<Vec<Event>> {
        let entries = match value {
            Value::Null => return Ok(Vec::new()),
            Value::Array(entries) => entries.as_slice(),
            Value::Object(_) => std::slice::from_ref(value),
            other => {
                return Err(CvmError::invalid_value(
                    EVENT_PAGE_PROPERTY,
                    format!("expected event array, got {other}"),
                ))
            }
        };

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<Event>(entry.clone()) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "Dropping unparseable event"),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_managed_object_ref_roundtrip() {
        let vm = ManagedObjectRef::vm("vm-1");
        assert_eq!(vm.to_string(), "VirtualMachine:vm-1");
        assert_eq!("VirtualMachine:vm-1".parse::<ManagedObjectRef>().unwrap(), vm);
        assert!("vm-1".parse::<ManagedObjectRef>().is_err());
        assert!(vm.is_vm());
        assert!(!ManagedObjectRef::network("net-A").is_vm());
    }

    #[test]
    fn test_version_token_initial() {
        assert!(VersionToken::initial().is_initial());
        assert!(!VersionToken::from("3").is_initial());
        assert_eq!(VersionToken::initial().to_string(), "<initial>");
    }

    #[test]
    fn test_property_change_deserialize_defaults() {
        let change: PropertyChange =
            serde_json::from_value(json!({"name": "runtime.powerState", "val": "poweredOn"}))
                .unwrap();
        assert_eq!(change.op, ChangeOperation::Assign);
        assert_eq!(change.value, json!("poweredOn"));

        let removed: PropertyChange =
            serde_json::from_value(json!({"name": "guest.net", "op": "indirectRemove"})).unwrap();
        assert!(removed.op.is_removal());
        assert_eq!(removed.value, Value::Null);
    }

    #[test]
    fn test_event_kind_wire_names() {
        let kind: EventKind = serde_json::from_value(json!("VmRenamedEvent")).unwrap();
        assert_eq!(kind, EventKind::VmRenamed);

        let unknown: EventKind = serde_json::from_value(json!("AlarmStatusChangedEvent")).unwrap();
        assert_eq!(unknown, EventKind::Other);

        assert_eq!(serde_json::to_value(EventKind::VmRemoved).unwrap(), json!("VmRemovedEvent"));
    }

    #[test]
    fn test_parse_page_accepts_array_object_and_null() {
        let single = json!({
            "type": "VmRemovedEvent",
            "vm": {"kind": "VirtualMachine", "id": "vm-1"}
        });
        let events = Event::parse_page(&single).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::VmRemoved);

        let page = json!([
            single,
            {"type": "VmPoweredOnEvent", "vm": {"kind": "VirtualMachine", "id": "vm-2"}}
        ]);
        assert_eq!(Event::parse_page(&page).unwrap().len(), 2);

        assert!(Event::parse_page(&Value::Null).unwrap().is_empty());
        assert!(Event::parse_page(&json!(42)).is_err());
    }

    #[test]
    fn test_parse_page_drops_malformed_entries() {
        let page = json!([
            {"type": "VmRemovedEvent"},
            {
                "type": "VmRenamedEvent",
                "vm": {"kind": "VirtualMachine", "id": "vm-3"},
                "newName": "db"
            }
        ]);
        let events = Event::parse_page(&page).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_name.as_deref(), Some("db"));
    }

    #[test]
    fn test_update_set_from_raw_preserves_order() {
        let batch = RawUpdateBatch {
            version: VersionToken::from("7"),
            filter_sets: vec![
                RawFilterUpdate {
                    object_set: vec![RawObjectUpdate {
                        obj: ManagedObjectRef::vm("vm-1"),
                        kind: ObjectUpdateKind::Enter,
                        change_set: vec![
                            PropertyChange::assign("name", json!("web")),
                            PropertyChange::assign("runtime.powerState", json!("poweredOn")),
                        ],
                    }],
                },
                RawFilterUpdate {
                    object_set: vec![RawObjectUpdate {
                        obj: ManagedObjectRef::vm("vm-2"),
                        kind: ObjectUpdateKind::Modify,
                        change_set: vec![PropertyChange::assign("name", json!("db"))],
                    }],
                },
            ],
        };

        let set = UpdateSet::from_raw(batch).unwrap();
        assert_eq!(set.version, VersionToken::from("7"));
        assert_eq!(set.change_count(), 3);
        assert_eq!(set.updates[0].obj.id, "vm-1");
        assert_eq!(set.updates[0].changes[0].name, "name");
        assert_eq!(set.updates[0].changes[1].name, "runtime.powerState");
        assert_eq!(set.updates[1].obj.id, "vm-2");
    }

    #[test]
    fn test_vm_leave_becomes_removed_event() {
        let batch = RawUpdateBatch {
            version: VersionToken::from("8"),
            filter_sets: vec![RawFilterUpdate {
                object_set: vec![RawObjectUpdate {
                    obj: ManagedObjectRef::vm("vm-1"),
                    kind: ObjectUpdateKind::Leave,
                    change_set: vec![],
                }],
            }],
        };

        let set = UpdateSet::from_raw(batch).unwrap();
        let change = &set.updates[0].changes[0];
        assert!(change.is_event_page());

        let events = Event::parse_page(&change.value).unwrap();
        assert_eq!(events[0].kind, EventKind::VmRemoved);
        assert_eq!(events[0].vm, ManagedObjectRef::vm("vm-1"));
    }
}
