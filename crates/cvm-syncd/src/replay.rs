//! Simulation clients: replay a recorded update stream, log controller calls.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cvm_sync_common::{
    ControllerClient, CvmError, CvmResult, InterfaceModel, InventoryClient, ManagedObjectRef,
    ObjectUpdateKind, RawUpdateBatch, Reconnect, VersionToken, VirtualMachineModel, VmConfig,
    VmInventoryEntry,
};

use crate::handlers::CONFIG_PROPERTY;

#[derive(Default)]
struct ReplayInner {
    pending: VecDeque<RawUpdateBatch>,
    /// Latest config per VM seen in served batches
    inventory: BTreeMap<ManagedObjectRef, VmConfig>,
}

/// Inventory client that serves batches from a JSON-lines recording.
///
/// Once the recording is exhausted, `wait_for_updates` blocks forever, like
/// a quiet platform.
pub struct ReplayInventoryClient {
    inner: Mutex<ReplayInner>,
}

impl ReplayInventoryClient {
    pub fn new(batches: Vec<RawUpdateBatch>) -> Self {
        Self {
            inner: Mutex::new(ReplayInner {
                pending: batches.into(),
                inventory: BTreeMap::new(),
            }),
        }
    }

    /// Loads one [`RawUpdateBatch`] per non-empty line.
    pub fn from_file(path: impl AsRef<Path>) -> CvmResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CvmError::invalid_config("simulation.replay_file", format!("{}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CvmResult<Self> {
        let mut batches = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let batch: RawUpdateBatch = serde_json::from_str(line).map_err(|e| {
                CvmError::invalid_config(
                    "simulation.replay_file",
                    format!("line {}: {e}", lineno + 1),
                )
            })?;
            batches.push(batch);
        }

        info!(batches = batches.len(), "Loaded update recording");
        Ok(Self::new(batches))
    }

    fn record(inventory: &mut BTreeMap<ManagedObjectRef, VmConfig>, batch: &RawUpdateBatch) {
        for object in batch.filter_sets.iter().flat_map(|f| &f.object_set) {
            if object.kind == ObjectUpdateKind::Leave {
                inventory.remove(&object.obj);
                continue;
            }
            for change in object.change_set.iter().filter(|c| c.name == CONFIG_PROPERTY) {
                if let Ok(config) = change.parse::<VmConfig>() {
                    inventory.insert(object.obj.clone(), config);
                }
            }
        }
    }
}

#[async_trait]
impl Reconnect for ReplayInventoryClient {
    fn backend(&self) -> &str {
        "replay"
    }

    async fn reconnect(&self) -> CvmResult<()> {
        info!("Replay session reopened");
        Ok(())
    }
}

#[async_trait]
impl InventoryClient for ReplayInventoryClient {
    async fn wait_for_updates(&self, version: &VersionToken) -> CvmResult<RawUpdateBatch> {
        let next = {
            let mut inner = self.inner.lock().await;
            let next = inner.pending.pop_front();
            if let Some(batch) = &next {
                Self::record(&mut inner.inventory, batch);
            }
            next
        };

        match next {
            Some(batch) => {
                debug!(since = %version, version = %batch.version, "Replaying batch");
                Ok(batch)
            }
            None => {
                info!("Recording exhausted, waiting indefinitely");
                std::future::pending().await
            }
        }
    }

    async fn list_all(&self) -> CvmResult<Vec<VmInventoryEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .inventory
            .iter()
            .map(|(vm, config)| VmInventoryEntry {
                vm: vm.clone(),
                config: config.clone(),
            })
            .collect())
    }
}

/// Controller client that only logs what would be sent.
#[derive(Default)]
pub struct LoggingControllerClient {
    calls: AtomicU64,
}

impl LoggingControllerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Reconnect for LoggingControllerClient {
    fn backend(&self) -> &str {
        "vnc-log"
    }

    async fn reconnect(&self) -> CvmResult<()> {
        warn!("Logging controller has no session to reconnect");
        Ok(())
    }
}

#[async_trait]
impl ControllerClient for LoggingControllerClient {
    async fn sync_virtual_machine(&self, vm: &VirtualMachineModel) -> CvmResult<()> {
        self.count();
        info!(
            vm = %vm.vm,
            name = %vm.name,
            power = %vm.power_state,
            "controller: sync virtual-machine"
        );
        Ok(())
    }

    async fn delete_virtual_machine(&self, vm: &ManagedObjectRef) -> CvmResult<()> {
        self.count();
        info!(vm = %vm, "controller: delete virtual-machine");
        Ok(())
    }

    async fn sync_interface(
        &self,
        iface: &InterfaceModel,
        vm: &VirtualMachineModel,
    ) -> CvmResult<()> {
        self.count();
        info!(
            iface = %iface.key,
            vm_name = %vm.name,
            network = %iface.network,
            vlan_id = ?iface.vlan_id,
            enabled = iface.enabled,
            "controller: sync virtual-machine-interface"
        );
        Ok(())
    }

    async fn delete_interface(&self, iface: &InterfaceModel) -> CvmResult<()> {
        self.count();
        info!(iface = %iface.key, "controller: delete virtual-machine-interface");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RECORDING: &str = r#"
# baseline
{"version":"1","filterSets":[{"objectSet":[{"obj":{"kind":"VirtualMachine","id":"vm-1"},"kind":"enter","changeSet":[{"name":"config","val":{"name":"web","interfaces":[{"mac":"m1","network":{"kind":"Network","id":"net-A"}}]}}]}]}]}

{"version":"2","filterSets":[{"objectSet":[{"obj":{"kind":"VirtualMachine","id":"vm-1"},"kind":"leave"}]}]}
"#;

    #[tokio::test]
    async fn test_replay_serves_batches_in_order() {
        let client = ReplayInventoryClient::parse(RECORDING).unwrap();

        let first = client.wait_for_updates(&VersionToken::initial()).await.unwrap();
        assert_eq!(first.version, VersionToken::from("1"));

        let inventory = client.list_all().await.unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].config.name, "web");

        let second = client.wait_for_updates(&first.version).await.unwrap();
        assert_eq!(second.version, VersionToken::from("2"));
        assert!(client.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_blocks_when_exhausted() {
        let client = ReplayInventoryClient::new(Vec::new());
        let initial = VersionToken::initial();
        let wait = client.wait_for_updates(&initial);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), wait).await;
        assert!(timed_out.is_err());
    }

    #[test]
    fn test_parse_reports_bad_line() {
        let err = ReplayInventoryClient::parse("{\"version\":\"1\"}\nnot json\n")
            .err()
            .unwrap();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_logging_controller_counts_calls() {
        let controller = LoggingControllerClient::new();
        controller
            .delete_virtual_machine(&ManagedObjectRef::vm("vm-1"))
            .await
            .unwrap();
        assert_eq!(controller.calls(), 1);
    }
}
