//! Events framed over in-memory transports.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use riptide::{
    proto::{event::EndStreamReason, DcpCodec, DcpEvent},
    utils::{
        stream::TestStream,
        testing::{memory_marker, mutation},
    },
};
use tokio_util::codec::{Decoder, Framed};

#[tokio::test]
async fn events_survive_the_framed_transport() {
    let (client, server) = tokio::io::duplex(4096);
    let mut producer_end = Framed::new(client, DcpCodec::default());
    let mut consumer_end = Framed::new(server, DcpCodec::default());

    let events = vec![
        memory_marker(7, 3, 1, 2),
        mutation(7, 3, 1),
        mutation(7, 3, 2),
        DcpEvent::StreamEnd {
            vbucket: 3,
            opaque: 7,
            reason: EndStreamReason::Ok,
        },
    ];

    for event in events.clone() {
        producer_end.send(event).await.unwrap();
    }

    for expected in events {
        let received = consumer_end.next().await.unwrap().unwrap();
        assert_eq!(received, expected);
    }
}

#[tokio::test]
async fn interleaved_vbuckets_keep_per_vbucket_order() {
    let (client, server) = tokio::io::duplex(16_384);
    let mut producer_end = Framed::new(client, DcpCodec::default());
    let mut consumer_end = Framed::new(server, DcpCodec::default());

    for seqno in 1..=5 {
        producer_end.send(mutation(1, 0, seqno)).await.unwrap();
        producer_end.send(mutation(2, 1, seqno)).await.unwrap();
    }

    let mut last_seen = [0u64; 2];
    for _ in 0..10 {
        let event = consumer_end.next().await.unwrap().unwrap();
        let vbucket = event.vbucket() as usize;
        let seqno = event.by_seqno().unwrap();
        assert!(seqno > last_seen[vbucket]);
        last_seen[vbucket] = seqno;
    }
    assert_eq!(last_seen, [5, 5]);
}

#[tokio::test]
async fn framed_test_stream_round_trips() {
    // Read side: a pre-encoded event comes off the transport.
    let stream =
        TestStream::with_output(mutation(9, 2, 42), &mut DcpCodec::default()).unwrap();
    let mut framed = Framed::new(stream, DcpCodec::default());

    let received = framed.next().await.unwrap().unwrap();
    assert_eq!(received, mutation(9, 2, 42));

    // Write side: what we send is inspectable on the transport.
    framed.send(memory_marker(9, 2, 42, 50)).await.unwrap();
    let mut written = BytesMut::from(framed.get_ref().input());
    assert_eq!(
        DcpCodec::default().decode(&mut written).unwrap().unwrap(),
        memory_marker(9, 2, 42, 50)
    );
}
