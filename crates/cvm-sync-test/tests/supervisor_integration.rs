//! Supervisor integration tests
//!
//! Connectivity loss, reconnection and fatal listener errors.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use cvm_sync_common::{CvmError, VersionToken};
use cvm_sync_test::{
    baseline_single_vm, changes, BatchBuilder, FakeInventoryClient, RecordingControllerClient,
    StateVerifier, Step, TestEngine,
};
use cvm_syncd::{SupervisorState, VlanConfig};

fn vlan() -> VlanConfig {
    VlanConfig {
        start: 100,
        end: 110,
    }
}

/// One reconnect cycle resumes from the last acknowledged version and
/// re-establishes both sessions exactly once.
#[tokio::test]
async fn test_reconnect_resumes_from_last_version() {
    let inventory = FakeInventoryClient::with_steps([
        Step::Batch(baseline_single_vm("1", "vm-1", "m1", "net-A").build()),
        Step::Fail(CvmError::connection_lost("fake-esxi", "connection reset")),
        Step::Batch(
            BatchBuilder::new("2")
                .modify("vm-1", vec![changes::name("web")])
                .build(),
        ),
    ]);
    let mut engine = TestEngine::with_inventory(vlan(), inventory).unwrap();

    let snapshot = engine.settle(2).await;

    assert_eq!(
        engine.inventory.requested_versions().await,
        vec![
            VersionToken::initial(),
            VersionToken::from("1"),
            VersionToken::from("1"),
            VersionToken::from("2"),
        ]
    );
    assert_eq!(engine.inventory.connects(), 1);
    assert_eq!(engine.inventory.reconnects(), 1);
    assert_eq!(engine.controller.reconnects(), 1);

    let status = *engine.status.borrow();
    assert_eq!(status.state, SupervisorState::Running);
    assert_eq!(status.reconnects, 1);

    // Baseline applied once: still a single allocation
    let verifier = StateVerifier::new(&snapshot);
    assert_eq!(verifier.assert_vm("vm-1").unwrap().name, "web");
    verifier.assert_allocated(&[100]).unwrap();
}

#[tokio::test]
async fn test_repeated_connection_loss() {
    let inventory = FakeInventoryClient::with_steps([
        Step::Fail(CvmError::connection_lost("fake-esxi", "timeout")),
        Step::Fail(CvmError::connection_lost("fake-esxi", "timeout")),
        Step::Batch(baseline_single_vm("1", "vm-1", "m1", "net-A").build()),
    ]);
    let mut engine = TestEngine::with_inventory(vlan(), inventory).unwrap();

    let snapshot = engine.settle(1).await;
    StateVerifier::new(&snapshot).assert_vm("vm-1").unwrap();
    assert_eq!(engine.inventory.reconnects(), 2);
    assert_eq!(engine.status.borrow().reconnects, 2);
    assert_eq!(
        engine.inventory.requested_versions().await[..3],
        [VersionToken::initial(), VersionToken::initial(), VersionToken::initial()]
    );
}

/// Anything other than connectivity loss ends supervision.
#[tokio::test]
async fn test_non_recoverable_listener_error_fails_supervisor() {
    let inventory = FakeInventoryClient::with_steps([Step::Fail(CvmError::domain(
        "filter rejected",
    ))]);
    let engine = TestEngine::with_inventory(vlan(), inventory).unwrap();
    let status = engine.status.clone();
    let inventory = Arc::clone(&engine.inventory);

    let err = engine.supervisor_error().await;
    assert_eq!(err, CvmError::domain("filter rejected"));

    assert_eq!(status.borrow().state, SupervisorState::Failed);
    assert_eq!(inventory.reconnects(), 0);
}

#[tokio::test]
async fn test_failed_reconnect_is_fatal() {
    let inventory = FakeInventoryClient::with_steps([Step::Fail(CvmError::connection_lost(
        "fake-esxi",
        "reset",
    ))]);
    inventory
        .fail_next_reconnect(CvmError::connection_lost("fake-esxi", "refused"))
        .await;
    let controller = Arc::new(RecordingControllerClient::new());
    let engine = TestEngine::start(vlan(), Arc::new(inventory), Arc::clone(&controller)).unwrap();
    let status = engine.status.clone();

    let err = engine.supervisor_error().await;
    assert!(err.is_recoverable());
    assert_eq!(err.exit_code(), 1);
    assert_eq!(status.borrow().state, SupervisorState::Failed);
    assert_eq!(status.borrow().reconnects, 0);
    // Inventory failed first, controller never reached
    assert_eq!(controller.reconnects(), 0);
}
