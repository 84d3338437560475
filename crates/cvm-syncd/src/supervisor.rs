//! Supervisor: keeps the event listener running across connectivity loss.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cvm_sync_common::{CvmResult, InventoryClient, Reconnect};

use crate::event_listener::EventListener;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Starting,
    Running,
    Reconnecting,
    /// Terminal
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Starting => "STARTING",
            SupervisorState::Running => "RUNNING",
            SupervisorState::Reconnecting => "RECONNECTING",
            SupervisorState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Published supervisor status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    /// Completed reconnection cycles
    pub reconnects: u64,
}

/// Owns the listener lifecycle.
///
/// `ConnectionLost` from the listener triggers one reconnection cycle: the
/// inventory session and every extra hook are re-established, then the
/// listener resumes from its last acknowledged version. Any other error
/// ends supervision.
pub struct Supervisor {
    listener: EventListener,
    inventory: Arc<dyn InventoryClient>,
    hooks: Vec<Arc<dyn Reconnect>>,
    status: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    pub fn new(listener: EventListener, inventory: Arc<dyn InventoryClient>) -> Self {
        let (status, _) = watch::channel(SupervisorStatus {
            state: SupervisorState::Starting,
            reconnects: 0,
        });
        Self {
            listener,
            inventory,
            hooks: Vec::new(),
            status,
        }
    }

    /// Adds a session that must be re-established along with the inventory.
    pub fn with_reconnect_hook(mut self, hook: Arc<dyn Reconnect>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    pub fn listener(&self) -> &EventListener {
        &self.listener
    }

    /// Runs the listener under supervision. Returns only on a fatal error.
    pub async fn supervise(&mut self) -> CvmResult<Infallible> {
        self.set_state(SupervisorState::Starting);
        let err = match self.run().await {
            Ok(never) => match never {},
            Err(e) => e,
        };

        error!(error = %err, "Supervisor failed");
        self.set_state(SupervisorState::Failed);
        Err(err)
    }

    async fn run(&mut self) -> CvmResult<Infallible> {
        self.inventory.connect().await?;
        info!(backend = self.inventory.backend(), "Connected to inventory");

        loop {
            self.set_state(SupervisorState::Running);
            let err = match self.listener.listen().await {
                Ok(never) => match never {},
                Err(e) => e,
            };

            if !err.is_recoverable() {
                return Err(err);
            }

            warn!(error = %err, resume_from = %self.listener.version(), "Listener lost connection");
            self.set_state(SupervisorState::Reconnecting);
            self.reconnect().await?;

            self.status.send_modify(|s| s.reconnects += 1);
            info!(reconnects = self.status().reconnects, "Reconnected");
        }
    }

    async fn reconnect(&self) -> CvmResult<()> {
        info!(backend = self.inventory.backend(), "Reconnecting");
        self.inventory.reconnect().await?;

        for hook in &self.hooks {
            info!(backend = hook.backend(), "Reconnecting");
            hook.reconnect().await?;
        }
        Ok(())
    }

    fn set_state(&self, state: SupervisorState) {
        self.status.send_modify(|s| s.state = state);
    }
}
