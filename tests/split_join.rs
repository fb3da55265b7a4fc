//! End-to-end split-and-join tests.
//!
//! A sending gateway cuts a payload into stored fragments and a separate
//! receiving gateway rebuilds it from fragments delivered in arbitrary order.

use std::sync::Arc;

use bytes::Bytes;
use msh_reliability::{
    CoreConfig,
    GroupStatus,
    MessageId,
    group::{
        AcceptOutcome,
        FragmentRef,
        InboundFragment,
        SequenceNumber,
        SplitOptions,
        SplitOutcome,
    },
    store::GroupStore,
};
use msh_testing::{Gateway, SequentialGroupIds, TestResult, patterned, t0};
use proptest::prelude::*;
use rstest::rstest;

const MIB: usize = 1024 * 1024;

fn gateways(config: &CoreConfig) -> TestResult<(Gateway, Gateway)> {
    let sender =
        Gateway::new(config.clone())?.with_group_ids(Arc::new(SequentialGroupIds::default()));
    let receiver = Gateway::new(config.clone())?;
    Ok((sender, receiver))
}

async fn inbound(
    sender: &Gateway,
    split: &SplitOutcome,
    reference: FragmentRef,
) -> TestResult<InboundFragment> {
    let fragment = sender
        .fragmenter
        .load_fragment(reference)
        .await?
        .ok_or("fragment missing from sender store")?;
    Ok(InboundFragment {
        group_id: fragment.group_id,
        source_message_id: split.group.source_message_id.clone(),
        sequence: fragment.sequence,
        total_fragment_count: split.group.total_fragment_count,
        compressed: split.group.compression_enabled,
        payload: fragment.payload,
    })
}

#[rstest]
#[tokio::test]
async fn large_payload_rejoins_out_of_order() -> TestResult {
    let config = CoreConfig::default().with_max_fragment_bytes(10 * MIB);
    let (sender, receiver) = gateways(&config)?;
    let payload = patterned(25 * MIB);
    let source = MessageId::new("order-25mb@sender.example");

    let split = sender
        .fragmenter
        .split_at(
            source.clone(),
            &payload[..],
            SplitOptions::from_config(&config),
            t0(),
        )
        .await?;
    assert_eq!(split.group.total_fragment_count, 3);
    assert_eq!(split.group.status, GroupStatus::Sending);
    let sizes: Vec<_> = split.fragments.iter().map(|f| f.len).collect();
    assert_eq!(sizes, vec![10 * MIB, 10 * MIB, 5 * MIB]);

    let mut outcomes = Vec::new();
    for index in [2, 0, 1] {
        let fragment = inbound(&sender, &split, split.fragments[index]).await?;
        outcomes.push(receiver.reassembler.accept_fragment_at(fragment, t0()).await?);
    }
    assert_eq!(
        outcomes[0],
        AcceptOutcome::Buffered {
            received: 1,
            total: 3
        }
    );
    assert_eq!(
        outcomes[1],
        AcceptOutcome::Buffered {
            received: 2,
            total: 3
        }
    );
    let AcceptOutcome::Completed(message) = &outcomes[2] else {
        panic!("last fragment should complete the group: {:?}", outcomes[2]);
    };
    assert_eq!(message.source_message_id, source);
    assert_eq!(message.payload, payload);

    let group = receiver
        .store
        .load_group(split.group.group_id)
        .await?
        .ok_or("receiving group missing")?;
    assert_eq!(group.status, GroupStatus::Completed);
    assert_eq!(receiver.store.inner().groups_with_fragments(), 0);

    sender.fragmenter.complete_sending(split.group.group_id).await?;
    assert_eq!(sender.store.inner().groups_with_fragments(), 0);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn duplicate_after_completion_changes_nothing() -> TestResult {
    let config = CoreConfig::default().with_max_fragment_bytes(4);
    let (sender, receiver) = gateways(&config)?;
    let split = sender
        .fragmenter
        .split_at(
            MessageId::new("dup"),
            &b"abcdefgh"[..],
            SplitOptions::from_config(&config),
            t0(),
        )
        .await?;

    let mut last = None;
    for reference in &split.fragments {
        let fragment = inbound(&sender, &split, *reference).await?;
        last = Some(receiver.reassembler.accept_fragment_at(fragment, t0()).await?);
    }
    assert!(matches!(last, Some(AcceptOutcome::Completed(_))));

    let again = inbound(&sender, &split, split.fragments[0]).await?;
    let outcome = receiver.reassembler.accept_fragment_at(again, t0()).await?;
    assert_eq!(outcome, AcceptOutcome::Duplicate);
    assert!(receiver.sink.events().is_empty());
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_last_fragments_complete_once() -> TestResult {
    let config = CoreConfig::default();
    let receiver = Arc::new(Gateway::new(config)?);
    let group_id = msh_reliability::GroupId::new(uuid::Uuid::from_u128(7));
    let fragment = |sequence: u32| InboundFragment {
        group_id,
        source_message_id: MessageId::new("race"),
        sequence: SequenceNumber::new(sequence),
        total_fragment_count: 4,
        compressed: false,
        payload: Bytes::from(vec![u8::try_from(sequence).unwrap_or(0); 3]),
    };

    for sequence in [0, 1] {
        receiver
            .reassembler
            .accept_fragment_at(fragment(sequence), t0())
            .await?;
    }

    let handles: Vec<_> = [2, 3, 2, 3]
        .into_iter()
        .map(|sequence| {
            let receiver = Arc::clone(&receiver);
            let fragment = fragment(sequence);
            tokio::spawn(async move {
                receiver
                    .reassembler
                    .accept_fragment_at(fragment, t0())
                    .await
            })
        })
        .collect();

    let mut completed = Vec::new();
    for handle in handles {
        if let AcceptOutcome::Completed(message) = handle.await?? {
            completed.push(message);
        }
    }
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].payload,
        Bytes::from_static(&[0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3])
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn mismatched_declarations_are_rejected_without_storing() -> TestResult {
    let receiver = Gateway::new(CoreConfig::default())?;
    let group_id = msh_reliability::GroupId::new(uuid::Uuid::from_u128(9));
    let first = InboundFragment {
        group_id,
        source_message_id: MessageId::new("m"),
        sequence: SequenceNumber::new(0),
        total_fragment_count: 2,
        compressed: false,
        payload: Bytes::from_static(b"aa"),
    };
    receiver.reassembler.accept_fragment_at(first.clone(), t0()).await?;

    let wrong_source = InboundFragment {
        source_message_id: MessageId::new("other"),
        sequence: SequenceNumber::new(1),
        ..first.clone()
    };
    assert!(
        receiver
            .reassembler
            .accept_fragment_at(wrong_source, t0())
            .await
            .is_err()
    );

    let wrong_total = InboundFragment {
        total_fragment_count: 3,
        sequence: SequenceNumber::new(1),
        ..first
    };
    assert!(
        receiver
            .reassembler
            .accept_fragment_at(wrong_total, t0())
            .await
            .is_err()
    );
    assert_eq!(receiver.store.inner().groups_with_fragments(), 1);
    Ok(())
}

fn round_trip(
    payload: &[u8],
    max_fragment_bytes: usize,
    compress: bool,
    order: &[usize],
) -> TestResult<Bytes> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let config = CoreConfig::default()
            .with_max_fragment_bytes(max_fragment_bytes)
            .with_compression(compress);
        let (sender, receiver) = gateways(&config)?;
        let split = sender
            .fragmenter
            .split_at(
                MessageId::new("prop"),
                payload,
                SplitOptions::from_config(&config),
                t0(),
            )
            .await?;
        let count = split.fragments.len();
        let mut sequence: Vec<usize> = order.iter().map(|i| i % count).collect();
        sequence.extend(0..count);

        for index in sequence {
            let fragment = inbound(&sender, &split, split.fragments[index]).await?;
            if let AcceptOutcome::Completed(message) =
                receiver.reassembler.accept_fragment_at(fragment, t0()).await?
            {
                return Ok(message.payload);
            }
        }
        Err("group never completed".into())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn any_delivery_order_rebuilds_the_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        max_fragment_bytes in 1_usize..700,
        compress in any::<bool>(),
        order in proptest::collection::vec(any::<usize>(), 0..16),
    ) {
        let rebuilt = round_trip(&payload, max_fragment_bytes, compress, &order)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(&rebuilt[..], &payload[..]);
    }
}
