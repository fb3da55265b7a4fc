//! Tests for the group expiration sweeper.

use chrono::TimeDelta;
use uuid::Uuid;

use super::{Harness, t0};
use crate::{
    config::CoreConfig,
    group::{AcceptOutcome, GroupId, GroupStatus, InboundFragment, SequenceNumber, SplitOptions},
    message::{MessageId, Role},
    sink::StatusEvent,
    store::{FragmentStore, GroupStore},
};

fn inbound(group: u128, sequence: u32, total: u32) -> InboundFragment {
    InboundFragment {
        group_id: GroupId::new(Uuid::from_u128(group)),
        source_message_id: MessageId::new(format!("m-{group}")),
        sequence: SequenceNumber::new(sequence),
        total_fragment_count: total,
        compressed: false,
        payload: bytes::Bytes::from_static(b"data"),
    }
}

#[tokio::test]
async fn overdue_groups_expire_once_and_release_fragments() {
    let mut harness = Harness::new(CoreConfig::default());
    let outcome = harness
        .reassembler
        .accept_fragment_at(inbound(10, 0, 2), t0())
        .await
        .expect("accept");
    assert!(matches!(outcome, AcceptOutcome::Buffered { .. }));
    let group_id = GroupId::new(Uuid::from_u128(10));

    let early = harness
        .sweeper
        .sweep_at(t0() + TimeDelta::minutes(30))
        .await
        .expect("sweep");
    assert!(early.expired.is_empty());

    let late = harness
        .sweeper
        .sweep_at(t0() + TimeDelta::hours(3))
        .await
        .expect("sweep");
    assert_eq!(late.expired, vec![group_id]);
    harness.sweeper.wait_for_cleanup().await;

    let group = harness
        .store
        .load_group(group_id)
        .await
        .expect("load")
        .expect("group");
    assert_eq!(group.status, GroupStatus::Expired);
    assert_eq!(harness.store.fragment_count(group_id).await.expect("count"), 0);

    let again = harness
        .sweeper
        .sweep_at(t0() + TimeDelta::hours(4))
        .await
        .expect("sweep");
    assert!(again.expired.is_empty());

    let events = harness.drain_events();
    assert_eq!(
        events,
        vec![StatusEvent::GroupExpired {
            group_id,
            source_message_id: MessageId::new("m-10"),
            role: Role::Receiving,
        }]
    );
}

#[tokio::test]
async fn completed_groups_are_never_expired() {
    let harness = Harness::new(CoreConfig::default());
    harness
        .reassembler
        .accept_fragment_at(inbound(11, 0, 1), t0())
        .await
        .expect("accept");

    let report = harness
        .sweeper
        .sweep_at(t0() + TimeDelta::hours(3))
        .await
        .expect("sweep");
    assert!(report.expired.is_empty());
    let group = harness
        .store
        .load_group(GroupId::new(Uuid::from_u128(11)))
        .await
        .expect("load")
        .expect("group");
    assert_eq!(group.status, GroupStatus::Completed);
}

#[tokio::test]
async fn sending_groups_expire_too() {
    let mut harness = Harness::new(CoreConfig::default());
    let outcome = harness
        .fragmenter
        .split_at(
            MessageId::new("m-out"),
            &[0_u8; 12][..],
            SplitOptions {
                max_fragment_bytes: 5,
                compress: false,
            },
            t0(),
        )
        .await
        .expect("split");

    let report = harness
        .sweeper
        .sweep_at(t0() + TimeDelta::hours(3))
        .await
        .expect("sweep");
    assert_eq!(report.expired, vec![outcome.group.group_id]);
    harness.sweeper.wait_for_cleanup().await;
    assert_eq!(
        harness
            .store
            .fragment_count(outcome.group.group_id)
            .await
            .expect("count"),
        0
    );
    assert!(matches!(
        harness.drain_events().as_slice(),
        [StatusEvent::GroupExpired {
            role: Role::Sending,
            ..
        }]
    ));
}
