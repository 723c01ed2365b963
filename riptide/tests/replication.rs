//! End-to-end exchanges between a producer and a consumer endpoint,
//! with events carried in memory instead of over a socket.

use std::sync::Arc;

use riptide::{
    config::ConnectionConfig,
    node::{
        consumer::DcpConsumer,
        error::DcpError,
        producer::{BackfillStatus, DcpProducer},
    },
    proto::event::{DcpEvent, EndStreamReason},
    utils::testing::{replica_store, seeded_store},
};
use riptide_lib::core::{
    item::Item,
    store::{MemoryStore, MutationSink},
    types::Vbid,
};

fn quiet_config(window: u64) -> ConnectionConfig {
    ConnectionConfig {
        enable_noop: false,
        connection_buffer_size: window,
        ..ConnectionConfig::default()
    }
}

struct Channel {
    producer: Arc<DcpProducer<MemoryStore>>,
    consumer: Arc<DcpConsumer<MemoryStore>>,
    window: u64,
}

impl Channel {
    fn new(
        producer_store: Arc<MemoryStore>,
        consumer_store: Arc<MemoryStore>,
        window: u64,
    ) -> Channel {
        let config = quiet_config(window);
        Channel {
            producer: Arc::new(DcpProducer::new("producer", producer_store, &config)),
            consumer: Arc::new(DcpConsumer::new("consumer", consumer_store, &config)),
            window,
        }
    }

    fn deliver_to_producer(&self, event: DcpEvent) {
        if let Ok(Some(response)) = self.producer.dispatch(event) {
            self.consumer.dispatch(response).unwrap();
        }
    }

    fn deliver_to_consumer(&self, event: DcpEvent) {
        if let Ok(Some(response)) = self.consumer.dispatch(event) {
            self.producer.dispatch(response).unwrap();
        }
    }

    /// Move events in both directions until the channel goes quiet,
    /// returning everything the producer put on the wire.
    fn pump(&self) -> Vec<DcpEvent> {
        let mut wire = Vec::new();

        loop {
            let mut progress = false;

            while let Ok(Some(event)) = self.consumer.step() {
                progress = true;
                self.deliver_to_producer(event);
            }

            while let Ok(BackfillStatus::Success) = self.producer.run_backfill() {
                progress = true;
            }

            while let Ok(Some(event)) = self.producer.step() {
                progress = true;
                if self.window > 0 {
                    // The producer never overruns the advertised window.
                    assert!(self.producer.buffer_log().bytes_sent() <= self.window);
                }
                wire.push(event.clone());
                self.deliver_to_consumer(event);
            }

            self.consumer.process_buffered_items();

            while let Some(request) = self.consumer.next_rollback() {
                progress = true;
                while self.consumer.do_rollback(request)
                    == riptide::node::consumer::RollbackOutcome::Retry
                {}
            }

            if !progress {
                break;
            }
        }

        wire
    }
}

/// Every event sits inside its marker, seqnos climb strictly, markers
/// never overlap.
fn verify_stream_invariants(wire: &[DcpEvent], vbucket: Vbid) {
    let mut current: Option<(u64, u64)> = None;
    let mut previous_end: Option<u64> = None;
    let mut last_seqno = 0;

    for event in wire.iter().filter(|event| event.vbucket() == vbucket) {
        match event {
            DcpEvent::SnapshotMarker(marker) => {
                assert!(marker.start <= marker.end, "inverted marker");
                if let Some(previous_end) = previous_end {
                    assert!(
                        marker.start > previous_end,
                        "marker [{}, {}] overlaps the previous snapshot ending at {}",
                        marker.start,
                        marker.end,
                        previous_end
                    );
                }
                previous_end = Some(marker.end);
                current = Some((marker.start, marker.end));
            }
            DcpEvent::Mutation { item, .. } | DcpEvent::Deletion { item, .. } => {
                let (start, end) = current.expect("mutation before any snapshot marker");
                assert!(start <= item.by_seqno && item.by_seqno <= end);
                assert!(item.by_seqno > last_seqno, "seqnos must climb");
                last_seqno = item.by_seqno;
            }
            _ => {}
        }
    }
}

#[test]
fn fresh_stream_replicates_disk_and_memory_phases() {
    let producer_store = seeded_store(0, 100);
    // Seqnos below 51 have been evicted from checkpoint memory.
    producer_store.set_memory_floor(0, 51);
    let consumer_store = replica_store(0);

    let channel = Channel::new(producer_store.clone(), consumer_store.clone(), 4096);
    channel.consumer.add_stream(1, 0, 0).unwrap();

    let wire = channel.pump();

    verify_stream_invariants(&wire, 0);
    assert_eq!(consumer_store.item_count(0), 100);
    assert_eq!(MutationSink::high_seqno(&*consumer_store, 0).unwrap(), 100);

    // Both phases went over the wire.
    let markers = wire
        .iter()
        .filter(|event| matches!(event, DcpEvent::SnapshotMarker(_)))
        .count();
    assert!(markers >= 2);

    // The producer window was acknowledged back down.
    assert!(channel.producer.buffer_log().acked_bytes() > 0);
    assert_eq!(channel.producer.items_sent(), 100);
}

#[test]
fn replicated_state_converges_keywise() {
    let producer_store = seeded_store(0, 1);
    // Rewrite the same key a few times, then delete another.
    producer_store.seed(0, b"key0", b"second");
    producer_store.seed(0, b"other", b"value");
    producer_store.seed(0, b"key0", b"third");
    let consumer_store = replica_store(0);

    let channel = Channel::new(producer_store.clone(), consumer_store.clone(), 0);
    channel.consumer.add_stream(1, 0, 0).unwrap();
    channel.pump();

    let replicated = consumer_store.get(0, b"key0").expect("key0 missing");
    assert_eq!(replicated.value.as_deref(), Some(&b"third"[..]));
    assert_eq!(
        consumer_store.item_count(0),
        producer_store.item_count(0)
    );
}

#[test]
fn unknown_history_rolls_back_to_zero_then_streams() {
    let producer_store = seeded_store(0, 3);
    // The consumer diverged: same vbucket, alien failover history.
    let consumer_store = Arc::new(MemoryStore::default());
    consumer_store.add_vbucket(0, riptide_lib::core::types::VbState::Replica, 999);
    for n in 0..5 {
        consumer_store.seed(0, format!("stale{}", n).as_bytes(), b"old");
    }

    let channel = Channel::new(producer_store.clone(), consumer_store.clone(), 0);
    channel.consumer.add_stream(1, 0, 0).unwrap();

    let wire = channel.pump();

    // The stale writes were truncated and replaced by the producer's.
    assert_eq!(consumer_store.item_count(0), 3);
    assert!(consumer_store.get(0, b"stale4").is_none());
    assert!(consumer_store.get(0, b"key2").is_some());
    verify_stream_invariants(&wire, 0);

    // The consumer adopted the producer's history.
    assert_eq!(
        consumer_store.latest_failover(0).unwrap().vb_uuid,
        producer_store.latest_failover(0).unwrap().vb_uuid
    );
}

#[test]
fn slow_stream_eviction_reconnects_and_resumes() {
    let producer_store = seeded_store(0, 10);
    let consumer_store = replica_store(0);

    let channel = Channel::new(producer_store.clone(), consumer_store.clone(), 0);
    channel.consumer.add_stream(1, 0, 0).unwrap();
    channel.pump();
    assert_eq!(consumer_store.item_count(0), 10);

    // Memory pressure drops the stream's cursor.
    assert!(!channel.producer.close_slow_stream(0));
    channel
        .producer
        .control(9, "supports_cursor_dropping", "true")
        .unwrap();
    assert!(channel.producer.close_slow_stream(0));

    let stats = channel.producer.takeover_stats(0).expect("stats lost");
    assert_eq!(stats.status, "temporarily-disconnected");
    assert_eq!(stats.last_sent_seqno, 10);

    // STREAM_END(slow) flows down, the consumer reconnects, and the
    // stream comes back for new seqnos.
    let wire = channel.pump();
    assert!(wire.iter().any(|event| matches!(
        event,
        DcpEvent::StreamEnd {
            reason: EndStreamReason::Slow,
            ..
        }
    )));
    assert!(channel.consumer.is_stream_present(0));

    producer_store.seed(0, b"fresh", b"value");
    channel.producer.notify_seqno_available(0, 11);
    channel.pump();

    assert_eq!(consumer_store.item_count(0), 11);
    assert!(consumer_store.get(0, b"fresh").is_some());
    // Reconnection cleared the eviction bookkeeping.
    assert_eq!(channel.producer.takeover_stats(0).unwrap().status, "in-memory");
}

#[test]
fn full_window_pauses_until_acknowledged() {
    let producer_store = seeded_store(0, 50);
    let consumer_store = replica_store(0);

    let config = quiet_config(0);
    let producer = Arc::new(DcpProducer::new("producer", producer_store, &config));
    let consumer = Arc::new(DcpConsumer::new("consumer", consumer_store, &config));

    // A window too small for the whole stream.
    producer.control(1, "connection_buffer_size", "256").unwrap();
    while let Ok(Some(_)) = producer.step() {}

    consumer.add_stream(1, 0, 0).unwrap();
    let mut sent = 0;
    while let Ok(Some(event)) = consumer.step() {
        if let Ok(Some(response)) = producer.dispatch(event) {
            consumer.dispatch(response).unwrap();
        }
    }

    while let Ok(Some(event)) = producer.step() {
        sent += event.wire_len() as u64;
        assert!(producer.buffer_log().bytes_sent() <= 256);
        consumer.dispatch(event).unwrap();
    }

    // Paused, not finished: the window is exhausted.
    assert!(producer.is_paused());
    assert!(sent > 0);
    let before = producer.buffer_log().bytes_sent();
    assert!(before > 0);

    // Credit flows back and the stream moves again.
    producer.buffer_ack(before);
    assert!(producer.step().unwrap().is_some());
}

#[test]
fn silent_peer_trips_the_noop_watchdog() {
    let producer_store = seeded_store(0, 1);
    let config = ConnectionConfig {
        noop_interval: 0,
        ..ConnectionConfig::default()
    };
    let producer = Arc::new(DcpProducer::new("producer", producer_store, &config));

    producer.control(1, "enable_noop", "true").unwrap();
    producer.control(2, "set_noop_interval", "0").unwrap();

    let mut saw_noop = false;
    let verdict = loop {
        match producer.step() {
            Ok(Some(DcpEvent::Noop { .. })) => saw_noop = true,
            Ok(Some(_)) => {}
            Ok(None) => panic!("watchdog never fired"),
            Err(error) => break error,
        }
    };

    assert!(saw_noop);
    assert_eq!(verdict, DcpError::Disconnect);
    assert!(producer.disconnected());
    assert_eq!(producer.step().unwrap_err(), DcpError::Disconnect);
}

#[test]
fn zero_seqno_event_is_fatal() {
    let consumer_store = replica_store(0);
    let consumer = Arc::new(DcpConsumer::new(
        "consumer",
        consumer_store,
        &quiet_config(0),
    ));
    consumer.add_stream(1, 0, 0).unwrap();

    let poison = DcpEvent::Mutation {
        opaque: 1,
        item: Item {
            vbucket: 0,
            key: b"key"[..].into(),
            value: Some(b"value"[..].into()),
            flags: 0,
            expiry: 0,
            cas: 0,
            by_seqno: 0,
            rev_seqno: 0,
            nru: 0,
            deleted: false,
            ext_meta: None,
        },
    };

    assert_eq!(consumer.dispatch(poison).unwrap_err(), DcpError::Invalid);

    // The transport tears the connection down on Invalid.
    consumer.set_disconnect();
    assert!(!consumer.is_stream_present(0));
    assert_eq!(
        consumer.dispatch(DcpEvent::Noop { opaque: 1 }).unwrap_err(),
        DcpError::Disconnect
    );
}

#[test]
fn one_stream_per_vbucket_per_connection() {
    let producer_store = seeded_store(0, 2);
    let consumer_store = replica_store(0);
    let channel = Channel::new(producer_store, consumer_store, 0);

    channel.consumer.add_stream(1, 0, 0).unwrap();
    assert_eq!(
        channel.consumer.add_stream(2, 0, 0).unwrap_err(),
        DcpError::KeyExists
    );

    // Producer side enforces it independently.
    let request = riptide::proto::event::StreamReq {
        vbucket: 0,
        opaque: 5,
        flags: 0,
        start_seqno: 0,
        end_seqno: u64::MAX,
        vb_uuid: 100,
        snap_start: 0,
        snap_end: 0,
    };
    channel.producer.stream_request(request).unwrap();
    assert_eq!(
        channel.producer.stream_request(request).unwrap_err(),
        DcpError::KeyExists
    );
}

#[test]
fn replaying_a_snapshot_is_idempotent() {
    let consumer_store = replica_store(0);
    let consumer = Arc::new(DcpConsumer::new(
        "consumer",
        consumer_store.clone(),
        &quiet_config(0),
    ));
    consumer.add_stream(1, 0, 0).unwrap();
    consumer
        .dispatch(DcpEvent::StreamReqRsp {
            opaque: 1,
            body: riptide::proto::event::StreamReqBody::Accepted(vec![(100, 0)]),
        })
        .unwrap();

    use riptide::utils::testing::{memory_marker, mutation};

    for _ in 0..2 {
        consumer.dispatch(memory_marker(1, 0, 1, 3)).unwrap();
        for seqno in 1..=3 {
            consumer.dispatch(mutation(1, 0, seqno)).unwrap();
        }
        consumer.process_buffered_items();
    }

    assert_eq!(consumer_store.item_count(0), 3);
    assert_eq!(MutationSink::high_seqno(&*consumer_store, 0).unwrap(), 3);
}

#[test]
fn buffer_acks_cover_applied_and_rejected_bytes() {
    let producer_store = seeded_store(0, 30);
    let consumer_store = replica_store(0);
    let channel = Channel::new(producer_store, consumer_store, 2048);

    channel.consumer.add_stream(1, 0, 0).unwrap();
    let wire = channel.pump();

    let data_bytes: u64 = wire
        .iter()
        .filter(|event| {
            matches!(
                event,
                DcpEvent::SnapshotMarker(_)
                    | DcpEvent::Mutation { .. }
                    | DcpEvent::Deletion { .. }
            )
        })
        .map(|event| event.wire_len() as u64)
        .sum();

    // Everything the producer billed was either acknowledged or is
    // sitting in the consumer's pending-ack counter below the batching
    // threshold.
    let pending = channel.consumer.flow_control().freed_bytes();
    assert_eq!(
        channel.producer.buffer_log().acked_bytes() + pending,
        data_bytes
    );
    assert_eq!(channel.producer.buffer_log().bytes_sent(), pending);
}
