//! Behaviour under store faults.

use std::time::Duration;

use msh_reliability::{
    CoreConfig,
    GroupStatus,
    MessageId,
    Role,
    StatusEvent,
    StoreError,
    WorkerError,
    config::BackoffConfig,
    group::{FragmentationError, SplitOptions},
    reliability::{DeliveryError, ExchangePattern},
    store::GroupStore,
};
use msh_testing::{FaultPlan, FlakyStore, Gateway, SequentialGroupIds, TestResult, patterned, t0};
use rstest::rstest;

fn small_fragments() -> CoreConfig {
    let mut config = CoreConfig::default()
        .with_max_fragment_bytes(16)
        .with_io_timeout(Duration::from_millis(200));
    config.cleanup_backoff = BackoffConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    };
    config
}

fn sender(config: CoreConfig) -> TestResult<Gateway> {
    Ok(Gateway::new(config)?.with_group_ids(std::sync::Arc::new(SequentialGroupIds::default())))
}

#[rstest]
#[tokio::test]
async fn failed_fragment_write_fails_the_group() -> TestResult {
    let config = small_fragments();
    let gateway = sender(config.clone())?;
    gateway.store.inject("put_fragment", FaultPlan::FailAfter(2));

    let err = gateway
        .fragmenter
        .split_at(
            MessageId::new("broken"),
            &patterned(100)[..],
            SplitOptions::from_config(&config),
            t0(),
        )
        .await
        .expect_err("third fragment write fails");
    assert!(matches!(
        err,
        FragmentationError::Store(StoreError::Unavailable(_))
    ));

    let groups = gateway.sink.events();
    let [StatusEvent::GroupFailed { group_id, role, .. }] = groups.as_slice() else {
        panic!("expected one failure event, got {groups:?}");
    };
    assert_eq!(*role, Role::Sending);
    let group = gateway
        .store
        .load_group(*group_id)
        .await?
        .ok_or("group missing")?;
    assert_eq!(group.status, GroupStatus::Failed);
    assert_eq!(gateway.store.inner().groups_with_fragments(), 0);
    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stalled_store_times_out() -> TestResult {
    let config = small_fragments();
    let gateway = sender(config.clone())?;
    gateway.store.inject("seal_group", FaultPlan::Stall);

    let err = gateway
        .fragmenter
        .split_at(
            MessageId::new("stalled"),
            &patterned(40)[..],
            SplitOptions::from_config(&config),
            t0(),
        )
        .await
        .expect_err("seal never completes");
    assert!(matches!(
        err,
        FragmentationError::Store(StoreError::Timeout {
            operation: "seal_group",
            ..
        })
    ));
    assert_eq!(gateway.sink.events().len(), 1);
    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cleanup_retries_transient_delete_failures() -> TestResult {
    let config = small_fragments();
    let gateway = sender(config.clone())?;
    let split = gateway
        .fragmenter
        .split_at(
            MessageId::new("cleanup"),
            &patterned(64)[..],
            SplitOptions::from_config(&config),
            t0(),
        )
        .await?;
    gateway.store.inject("delete_fragments", FaultPlan::FailTimes(2));

    gateway.fragmenter.complete_sending(split.group.group_id).await?;
    assert_eq!(gateway.store.inner().groups_with_fragments(), 0);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn scheduler_pass_reports_store_failures() -> TestResult {
    let store = FlakyStore::new();
    store.inject("claim_due", FaultPlan::FailTimes(1));
    let gateway = Gateway::with_store(CoreConfig::default(), store)?;

    let err = gateway
        .scheduler
        .run_once_at(t0())
        .await
        .expect_err("claim fails");
    assert!(matches!(
        err,
        WorkerError::Delivery(DeliveryError::Store(StoreError::Unavailable(_)))
    ));
    assert!(gateway.scheduler.run_once_at(t0()).await.is_ok());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn tracker_surfaces_store_errors_without_state_change() -> TestResult {
    let gateway = Gateway::new(CoreConfig::default())?;
    let message = MessageId::new("m");
    gateway
        .tracker
        .record_dispatch_at(&message, ExchangePattern::Push, Role::Sending, None, t0())
        .await?;

    gateway.store.inject("update_delivery", FaultPlan::FailTimes(1));
    let err = gateway
        .tracker
        .record_outcome_at(&message, msh_reliability::Outcome::Timeout, t0())
        .await
        .expect_err("update fails");
    assert!(matches!(err, DeliveryError::Store(_)));

    let state = gateway.tracker.get(&message).await?.ok_or("state missing")?;
    assert_eq!(state.status, msh_reliability::DeliveryStatus::Dispatched);
    assert_eq!(state.version, 0);
    Ok(())
}
