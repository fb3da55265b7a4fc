//! Group expiry across the sweeper, the fragmenter and the reassembler.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::TimeDelta;
use msh_reliability::{
    CoreConfig,
    GroupId,
    GroupStatus,
    MessageId,
    Role,
    StatusEvent,
    group::{AcceptOutcome, InboundFragment, SequenceNumber, SplitOptions, SweepReport},
    store::GroupStore,
};
use msh_testing::{FaultPlan, Gateway, TestResult, gateway, t0};
use rstest::rstest;
use tokio_util::sync::CancellationToken;

fn fragment(group: u128, sequence: u32) -> InboundFragment {
    InboundFragment {
        group_id: GroupId::new(uuid::Uuid::from_u128(group)),
        source_message_id: MessageId::new(format!("msg-{group}")),
        sequence: SequenceNumber::new(sequence),
        total_fragment_count: 3,
        compressed: false,
        payload: Bytes::from_static(b"part"),
    }
}

#[rstest]
#[tokio::test]
async fn incomplete_receiving_group_expires_once(gateway: Gateway) -> TestResult {
    gateway
        .reassembler
        .accept_fragment_at(fragment(1, 0), t0())
        .await?;
    let group_id = GroupId::new(uuid::Uuid::from_u128(1));

    let early = gateway.sweeper.sweep_at(t0() + TimeDelta::minutes(119)).await?;
    assert!(early.expired.is_empty());

    let late = t0() + TimeDelta::minutes(121);
    let report = gateway.sweeper.sweep_at(late).await?;
    assert_eq!(report.expired, vec![group_id]);
    gateway.sweeper.wait_for_cleanup().await;
    assert_eq!(gateway.store.inner().groups_with_fragments(), 0);

    let again = gateway.sweeper.sweep_at(late).await?;
    assert!(again.expired.is_empty());

    let straggler = gateway
        .reassembler
        .accept_fragment_at(fragment(1, 1), late)
        .await?;
    assert_eq!(
        straggler,
        AcceptOutcome::Closed {
            status: GroupStatus::Expired
        }
    );
    assert_eq!(gateway.store.inner().groups_with_fragments(), 0);

    assert_eq!(
        gateway.sink.events(),
        vec![StatusEvent::GroupExpired {
            group_id,
            source_message_id: MessageId::new("msg-1"),
            role: Role::Receiving,
        }]
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn sending_group_expires_before_delivery(gateway: Gateway) -> TestResult {
    let config = CoreConfig::default().with_max_fragment_bytes(4);
    let split = gateway
        .fragmenter
        .split_at(
            MessageId::new("slow-peer"),
            &b"0123456789"[..],
            SplitOptions::from_config(&config),
            t0(),
        )
        .await?;

    let report = gateway
        .sweeper
        .sweep_at(t0() + TimeDelta::hours(3))
        .await?;
    assert_eq!(report.expired, vec![split.group.group_id]);
    gateway.sweeper.wait_for_cleanup().await;

    assert!(
        gateway
            .fragmenter
            .complete_sending(split.group.group_id)
            .await
            .is_err()
    );
    let group = gateway
        .store
        .load_group(split.group.group_id)
        .await?
        .ok_or("group missing")?;
    assert_eq!(group.status, GroupStatus::Expired);
    assert!(
        gateway
            .fragmenter
            .load_fragment(split.fragments[0])
            .await?
            .is_none()
    );
    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn group_expired_during_join_reports_closed() -> TestResult {
    let gateway = Gateway::new(CoreConfig::default().with_io_timeout(Duration::from_millis(200)))?;
    gateway.store.inject("load_fragments", FaultPlan::Stall);
    let group_id = GroupId::new(uuid::Uuid::from_u128(9));
    let only = InboundFragment {
        total_fragment_count: 1,
        ..fragment(9, 0)
    };

    let accept = gateway.reassembler.accept_fragment_at(only, t0());
    let expire = async {
        loop {
            let status = gateway.store.inner().load_group(group_id).await?.map(|g| g.status);
            if status == Some(GroupStatus::Reassembling) {
                break;
            }
            tokio::task::yield_now().await;
        }
        let report = gateway.sweeper.sweep_at(t0() + TimeDelta::hours(3)).await?;
        TestResult::<SweepReport>::Ok(report)
    };
    let (accepted, swept) = tokio::join!(accept, expire);
    let swept = swept?;

    assert_eq!(swept.expired, vec![group_id]);
    assert_eq!(
        accepted?,
        AcceptOutcome::Closed {
            status: GroupStatus::Expired
        }
    );
    gateway.sweeper.wait_for_cleanup().await;
    assert!(matches!(
        gateway.sink.events().as_slice(),
        [StatusEvent::GroupExpired { .. }]
    ));
    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn sweeper_worker_runs_until_shutdown() -> TestResult {
    let mut config = CoreConfig::default();
    config.sweep_interval = Duration::from_secs(60);
    let gateway = Gateway::new(config)?;
    gateway
        .reassembler
        .accept_fragment_at(fragment(5, 2), t0())
        .await?;

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(Arc::clone(&gateway.sweeper).run(shutdown.clone()));
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    worker.await?;

    assert_eq!(gateway.sink.events().len(), 1);
    assert_eq!(gateway.store.inner().groups_with_fragments(), 0);
    Ok(())
}
