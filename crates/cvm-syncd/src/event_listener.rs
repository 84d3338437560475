//! Event Listener: long-poll loop on the inventory change feed.

use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};

use cvm_sync_common::{CvmError, CvmResult, InventoryClient, UpdateSet, VersionToken};

/// Producer side of the update set queue.
pub type UpdateSetSender = mpsc::UnboundedSender<UpdateSet>;

/// Consumer side of the update set queue.
pub type UpdateSetReceiver = mpsc::UnboundedReceiver<UpdateSet>;

/// Creates the FIFO queue between listener and monitor.
pub fn update_set_queue() -> (UpdateSetSender, UpdateSetReceiver) {
    mpsc::unbounded_channel()
}

/// Pulls change batches and enqueues them as update sets.
///
/// The listener never retries. A transport failure ends [`listen`] with
/// `ConnectionLost`; the version token of the last enqueued batch survives,
/// so the next call resumes where the stream left off.
///
/// [`listen`]: EventListener::listen
pub struct EventListener {
    inventory: Arc<dyn InventoryClient>,
    queue: UpdateSetSender,
    version: VersionToken,
    batches: u64,
}

impl EventListener {
    pub fn new(inventory: Arc<dyn InventoryClient>, queue: UpdateSetSender) -> Self {
        Self {
            inventory,
            queue,
            version: VersionToken::initial(),
            batches: 0,
        }
    }

    /// Last acknowledged version token.
    pub fn version(&self) -> &VersionToken {
        &self.version
    }

    /// Number of batches received since construction.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Starts listening from `version`. The initial token forces a baseline.
    pub async fn start(&mut self, version: VersionToken) -> CvmResult<Infallible> {
        self.version = version;
        self.listen().await
    }

    /// Listens from the last acknowledged version. Returns only on error.
    #[instrument(skip(self), fields(from = %self.version))]
    pub async fn listen(&mut self) -> CvmResult<Infallible> {
        if self.version.is_initial() {
            info!("Requesting baseline from inventory");
        }

        loop {
            let batch = self.inventory.wait_for_updates(&self.version).await?;
            let next = batch.version.clone();
            let set = UpdateSet::from_raw(batch)?;
            self.batches += 1;

            if set.is_empty() {
                trace!(version = %next, "Empty batch");
            } else {
                debug!(version = %next, changes = set.change_count(), "Enqueueing update set");
                self.queue.send(set).map_err(|_| CvmError::QueueClosed)?;
            }
            self.version = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplayInventoryClient;
    use cvm_sync_common::{
        ManagedObjectRef, ObjectUpdateKind, PropertyChange, RawFilterUpdate, RawObjectUpdate,
        RawUpdateBatch,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn batch(version: &str, changes: Vec<PropertyChange>) -> RawUpdateBatch {
        RawUpdateBatch {
            version: VersionToken::from(version),
            filter_sets: vec![RawFilterUpdate {
                object_set: vec![RawObjectUpdate {
                    obj: ManagedObjectRef::vm("vm-1"),
                    kind: ObjectUpdateKind::Modify,
                    change_set: changes,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn test_listen_enqueues_non_empty_sets() {
        let inventory = Arc::new(ReplayInventoryClient::new(vec![
            batch("1", vec![PropertyChange::assign("name", json!("web"))]),
            batch("2", vec![]),
            batch("3", vec![PropertyChange::assign("name", json!("db"))]),
        ]));
        let (sender, mut receiver) = update_set_queue();
        let mut listener = EventListener::new(inventory, sender);

        let result = tokio::time::timeout(Duration::from_millis(50), listener.listen()).await;
        assert!(result.is_err(), "listener should block on an exhausted stream");

        assert_eq!(listener.version(), &VersionToken::from("3"));
        assert_eq!(listener.batches(), 3);

        let versions: Vec<String> = [receiver.try_recv().unwrap(), receiver.try_recv().unwrap()]
            .iter()
            .map(|set| set.version.to_string())
            .collect();
        assert_eq!(versions, vec!["1", "3"]);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_queue_keeps_version() {
        let inventory = Arc::new(ReplayInventoryClient::new(vec![batch(
            "1",
            vec![PropertyChange::assign("name", json!("web"))],
        )]));
        let (sender, receiver) = update_set_queue();
        drop(receiver);

        let mut listener = EventListener::new(inventory, sender);
        let err = match listener.start(VersionToken::initial()).await {
            Ok(never) => match never {},
            Err(e) => e,
        };
        assert_eq!(err, CvmError::QueueClosed);
        assert!(listener.version().is_initial());
    }
}
