//! Engine harness: builds a context on the fake clients and runs both tasks

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use cvm_sync_common::{CvmError, CvmResult};
use cvm_syncd::{CvmContext, SharedState, StateSnapshot, SupervisorStatus, VlanConfig};

use crate::fakes::{FakeInventoryClient, RecordingControllerClient};

/// How long helpers wait before declaring a test hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A running engine wired to fake backends.
pub struct TestEngine {
    pub inventory: Arc<FakeInventoryClient>,
    pub controller: Arc<RecordingControllerClient>,
    pub state: SharedState,
    pub status: watch::Receiver<SupervisorStatus>,
    progress: watch::Receiver<u64>,
    supervise: JoinHandle<CvmResult<Infallible>>,
    monitor: JoinHandle<CvmResult<Infallible>>,
}

impl TestEngine {
    /// Builds the engine and spawns `supervise` and `monitor`.
    pub fn start(
        vlan: VlanConfig,
        inventory: Arc<FakeInventoryClient>,
        controller: Arc<RecordingControllerClient>,
    ) -> CvmResult<Self> {
        let CvmContext {
            state,
            mut supervisor,
            mut monitor,
        } = CvmContext::build(&vlan, Arc::clone(&inventory), Arc::clone(&controller))?;

        let status = supervisor.subscribe();
        let progress = monitor.subscribe();

        Ok(Self {
            inventory,
            controller,
            state,
            status,
            progress,
            supervise: tokio::spawn(async move { supervisor.supervise().await }),
            monitor: tokio::spawn(async move { monitor.monitor().await }),
        })
    }

    /// Starts an engine over a fresh recording controller.
    pub fn with_inventory(vlan: VlanConfig, inventory: FakeInventoryClient) -> CvmResult<Self> {
        Self::start(vlan, Arc::new(inventory), Arc::new(RecordingControllerClient::new()))
    }

    /// Waits until `count` update sets have been applied; returns a snapshot.
    pub async fn wait_for_sets(&mut self, count: u64) -> StateSnapshot {
        tokio::time::timeout(TEST_TIMEOUT, self.progress.wait_for(|p| *p >= count))
            .await
            .expect("timed out waiting for update sets")
            .expect("monitor stopped before applying all update sets");
        self.state.snapshot().await
    }

    /// Waits for the listener to drain the script, then for `count` sets.
    pub async fn settle(&mut self, count: u64) -> StateSnapshot {
        tokio::time::timeout(TEST_TIMEOUT, self.inventory.wait_until_idle())
            .await
            .expect("timed out waiting for the listener to go idle");
        self.wait_for_sets(count).await
    }

    /// Awaits the monitor's terminal error.
    ///
    /// The supervisor keeps running until the monitor stops, so the update
    /// queue stays open while the failing set is applied.
    pub async fn monitor_error(self) -> CvmError {
        let result = tokio::time::timeout(TEST_TIMEOUT, self.monitor).await;
        self.supervise.abort();
        match result
            .expect("monitor did not stop")
            .expect("monitor task panicked")
        {
            Ok(never) => match never {},
            Err(e) => e,
        }
    }

    /// Awaits the supervisor's terminal error.
    pub async fn supervisor_error(self) -> CvmError {
        let result = tokio::time::timeout(TEST_TIMEOUT, self.supervise).await;
        self.monitor.abort();
        match result
            .expect("supervisor did not stop")
            .expect("supervisor task panicked")
        {
            Ok(never) => match never {},
            Err(e) => e,
        }
    }
}
