//! Monitor: drains the update set queue into the dispatcher.

use std::convert::Infallible;

use tokio::sync::watch;
use tracing::{debug, error};

use cvm_sync_common::{CvmError, CvmResult, UpdateDispatcher};

use crate::database::SyncState;
use crate::event_listener::UpdateSetReceiver;

/// Single consumer of the update set queue.
///
/// One update set is fully dispatched before the next is taken, so state
/// mutations follow arrival order.
pub struct Monitor {
    dispatcher: UpdateDispatcher<SyncState>,
    queue: UpdateSetReceiver,
    processed: u64,
    progress: watch::Sender<u64>,
}

impl Monitor {
    pub fn new(dispatcher: UpdateDispatcher<SyncState>, queue: UpdateSetReceiver) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            dispatcher,
            queue,
            processed: 0,
            progress,
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Subscribes to the count of fully applied update sets.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    /// Runs until the dispatcher fails or the queue closes.
    ///
    /// Dispatcher errors are returned unchanged.
    pub async fn monitor(&mut self) -> CvmResult<Infallible> {
        loop {
            let Some(set) = self.queue.recv().await else {
                error!("Update set queue closed");
                return Err(CvmError::QueueClosed);
            };

            let report = self.dispatcher.dispatch(&set).await?;
            self.processed += 1;
            self.progress.send_replace(self.processed);
            debug!(
                version = %set.version,
                processed = self.processed,
                handled = report.handled,
                "Update set applied"
            );
        }
    }
}
