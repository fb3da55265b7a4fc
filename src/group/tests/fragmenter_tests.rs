//! Tests for outbound splitting, sealing and abort handling.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use rstest::rstest;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

use super::{Harness, t0};
use crate::{
    config::{ConfigError, CoreConfig},
    group::{FragmentationError, GroupId, GroupStatus, SplitOptions},
    message::MessageId,
    sink::StatusEvent,
    store::{FragmentStore, GroupStore},
};

fn options(max_fragment_bytes: usize) -> SplitOptions {
    SplitOptions {
        max_fragment_bytes,
        compress: false,
    }
}

fn first_group() -> GroupId { GroupId::new(Uuid::from_u128(1)) }

/// Reader yielding `data` once, then failing.
struct FailingReader {
    data: Option<Vec<u8>>,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.data.take() {
            Some(data) => {
                buf.put_slice(&data);
                Poll::Ready(Ok(()))
            }
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer gone"))),
        }
    }
}

#[rstest]
#[case(25, 10, vec![10, 10, 5])]
#[case(20, 10, vec![10, 10])]
#[case(3, 10, vec![3])]
#[case(0, 10, vec![0])]
#[tokio::test]
async fn split_cuts_payload_into_bounded_fragments(
    #[case] len: usize,
    #[case] max: usize,
    #[case] expected: Vec<usize>,
) {
    let harness = Harness::new(CoreConfig::default());
    let payload = vec![7_u8; len];

    let outcome = harness
        .fragmenter
        .split_at(MessageId::new("m-1"), payload.as_slice(), options(max), t0())
        .await
        .expect("split succeeds");

    let lengths: Vec<_> = outcome.fragments.iter().map(|f| f.len).collect();
    assert_eq!(lengths, expected);
    assert_eq!(outcome.group.status, GroupStatus::Sending);
    assert_eq!(
        outcome.group.total_fragment_count as usize,
        expected.len()
    );

    let stored = harness
        .store
        .load_group(outcome.group.group_id)
        .await
        .expect("load")
        .expect("group stored");
    assert_eq!(stored, outcome.group);
    assert_eq!(
        harness
            .store
            .fragment_count(outcome.group.group_id)
            .await
            .expect("count") as usize,
        expected.len()
    );
}

#[tokio::test]
async fn zero_fragment_size_fails_before_creating_a_group() {
    let harness = Harness::new(CoreConfig::default());
    let err = harness
        .fragmenter
        .split_at(MessageId::new("m-1"), &b"abc"[..], options(0), t0())
        .await
        .expect_err("zero size must fail");
    assert!(matches!(
        err,
        FragmentationError::Config(ConfigError::NonPositiveFragmentSize)
    ));
    assert!(
        harness
            .store
            .load_group(first_group())
            .await
            .expect("load")
            .is_none()
    );
}

#[tokio::test]
async fn read_failure_fails_group_and_releases_fragments() {
    let mut harness = Harness::new(CoreConfig::default());
    let reader = FailingReader {
        data: Some(vec![1; 25]),
    };

    let err = harness
        .fragmenter
        .split_at(MessageId::new("m-1"), reader, options(10), t0())
        .await
        .expect_err("read failure must surface");
    assert!(matches!(err, FragmentationError::Read(_)));

    let group = harness
        .store
        .load_group(first_group())
        .await
        .expect("load")
        .expect("group kept for audit");
    assert_eq!(group.status, GroupStatus::Failed);
    assert_eq!(
        harness
            .store
            .fragment_count(first_group())
            .await
            .expect("count"),
        0
    );

    let events = harness.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        StatusEvent::GroupFailed { group_id, .. } if *group_id == first_group()
    ));
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_times_out() {
    let config = CoreConfig::default().with_io_timeout(Duration::from_secs(2));
    let harness = Harness::new(config);
    let (_writer, reader) = tokio::io::duplex(64);

    let err = harness
        .fragmenter
        .split_at(MessageId::new("m-1"), reader, options(10), t0())
        .await
        .expect_err("stall must time out");
    assert!(matches!(err, FragmentationError::ReadTimeout { .. }));

    let group = harness
        .store
        .load_group(first_group())
        .await
        .expect("load")
        .expect("group stored");
    assert_eq!(group.status, GroupStatus::Failed);
}

#[tokio::test]
async fn expiry_during_split_cancels_without_failure_report() {
    let config = CoreConfig::default().with_cancellation_check_every(1);
    let mut harness = Harness::new(config);
    let (mut writer, reader) = tokio::io::duplex(64);

    let split = harness
        .fragmenter
        .split_at(MessageId::new("m-1"), reader, options(4), t0());
    let drive = async {
        writer.write_all(&[1; 8]).await.expect("write");
        while harness
            .store
            .fragment_count(first_group())
            .await
            .expect("count")
            < 2
        {
            tokio::task::yield_now().await;
        }
        let report = harness
            .sweeper
            .sweep_at(t0() + chrono::TimeDelta::hours(3))
            .await
            .expect("sweep");
        assert_eq!(report.expired, vec![first_group()]);
        writer.write_all(&[2; 8]).await.expect("write");
        drop(writer);
    };
    let (result, ()) = tokio::join!(split, drive);

    let err = result.expect_err("split must be cancelled");
    assert!(matches!(
        err,
        FragmentationError::Cancelled {
            status: GroupStatus::Expired,
            ..
        }
    ));
    harness.sweeper.wait_for_cleanup().await;
    assert_eq!(
        harness
            .store
            .fragment_count(first_group())
            .await
            .expect("count"),
        0
    );

    let events = harness.drain_events();
    assert_eq!(events.len(), 1, "only the expiry is reported: {events:?}");
    assert!(matches!(events[0], StatusEvent::GroupExpired { .. }));
}

#[tokio::test]
async fn complete_sending_releases_fragments() {
    let harness = Harness::new(CoreConfig::default());
    let outcome = harness
        .fragmenter
        .split_at(MessageId::new("m-1"), &[5_u8; 30][..], options(10), t0())
        .await
        .expect("split");
    let loaded = harness
        .fragmenter
        .load_fragment(outcome.fragments[1])
        .await
        .expect("load")
        .expect("fragment present");
    assert_eq!(loaded.payload.len(), 10);

    harness
        .fragmenter
        .complete_sending(outcome.group.group_id)
        .await
        .expect("complete");
    let group = harness
        .store
        .load_group(outcome.group.group_id)
        .await
        .expect("load")
        .expect("group");
    assert_eq!(group.status, GroupStatus::Completed);
    assert!(
        harness
            .fragmenter
            .load_fragment(outcome.fragments[1])
            .await
            .expect("load")
            .is_none()
    );

    let again = harness
        .fragmenter
        .complete_sending(outcome.group.group_id)
        .await
        .expect_err("terminal group cannot complete twice");
    assert!(matches!(
        again,
        FragmentationError::GroupClosed {
            status: GroupStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn fail_sending_reports_once() {
    let mut harness = Harness::new(CoreConfig::default());
    let outcome = harness
        .fragmenter
        .split_at(MessageId::new("m-1"), &[5_u8; 30][..], options(10), t0())
        .await
        .expect("split");
    let group_id = outcome.group.group_id;

    harness
        .fragmenter
        .fail_sending(group_id, "peer rejected fragment 2")
        .await
        .expect("fail");
    let second = harness.fragmenter.fail_sending(group_id, "again").await;
    assert!(matches!(
        second,
        Err(FragmentationError::GroupClosed {
            status: GroupStatus::Failed,
            ..
        })
    ));

    let events = harness.drain_events();
    assert_eq!(
        events,
        vec![StatusEvent::GroupFailed {
            group_id,
            source_message_id: MessageId::new("m-1"),
            role: crate::message::Role::Sending,
            reason: "peer rejected fragment 2".into(),
        }]
    );
}
