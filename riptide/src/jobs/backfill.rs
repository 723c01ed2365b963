use std::{sync::Arc, time::Duration};

use riptide_lib::core::store::StreamSource;
use tokio::time::{sleep, timeout};

use crate::node::producer::{BackfillStatus, DcpProducer};

/// How long a saturated scan waits before re-checking its byte budget
const SNOOZE: Duration = Duration::from_millis(500);

/// How long an idle scan driver sleeps between wake-up sweeps
const IDLE_SWEEP: Duration = Duration::from_secs(1);

/// Service a producer's backfill scans until it disconnects. Runs on a
/// disk-reader task since scans block on I/O.
pub async fn spawn_backfills<S: StreamSource>(producer: &Arc<DcpProducer<S>>) {
    debug!("Spawning backfill driver for {}", producer.name());

    loop {
        match producer.run_backfill() {
            Ok(BackfillStatus::Success) => {}
            Ok(BackfillStatus::Snooze) => sleep(SNOOZE).await,
            Ok(BackfillStatus::Idle) => {
                timeout(IDLE_SWEEP, producer.backfills().notified())
                    .await
                    .ok();
                if producer.disconnected() {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    debug!("Backfill driver for {} exiting", producer.name());
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use riptide_lib::core::types::MAX_SEQNO;

    use super::spawn_backfills;
    use crate::{
        node::producer::DcpProducer,
        proto::event::{DcpEvent, StreamReq, StreamReqBody},
        utils::testing::{seeded_store, CONFIG},
    };

    #[tokio::test]
    async fn test_backfill_driver_feeds_stream() {
        let store = seeded_store(0, 8);
        store.set_memory_floor(0, 5);

        let producer = Arc::new(DcpProducer::new("test", store.clone(), &CONFIG));

        let response = producer
            .stream_request(StreamReq {
                vbucket: 0,
                opaque: 7,
                flags: 0,
                start_seqno: 0,
                end_seqno: MAX_SEQNO,
                vb_uuid: 100,
                snap_start: 0,
                snap_end: 0,
            })
            .unwrap();
        assert!(matches!(
            response,
            DcpEvent::StreamReqRsp {
                body: StreamReqBody::Accepted(_),
                ..
            }
        ));

        let worker = {
            let producer = producer.clone();
            tokio::spawn(async move { spawn_backfills(&producer).await })
        };

        // The disk phase covers seqnos 1-4, the memory phase 5-8.
        let mut seqnos = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while seqnos.len() < 8 {
                match producer.step().unwrap() {
                    Some(event) => seqnos.extend(event.by_seqno()),
                    None => tokio::task::yield_now().await,
                }
            }
        })
        .await
        .expect("backfill never fed the stream");

        assert_eq!(seqnos, (1..=8).collect::<Vec<u64>>());

        producer.set_disconnect();
        worker.await.unwrap();
    }
}
