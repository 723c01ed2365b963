use std::{sync::Arc, time::Duration};

use riptide_lib::core::store::MutationSink;
use tokio::time::sleep;

use crate::node::consumer::{DcpConsumer, RollbackOutcome};

/// Execute rollbacks the producer demanded, retrying temporary
/// failures, until the consumer disconnects. Runs on a writer task
/// since storage may block.
pub async fn spawn_rollbacks<S: MutationSink>(consumer: &Arc<DcpConsumer<S>>) {
    debug!("Spawning rollback executor for {}", consumer.name());

    let retry_timer = Duration::from_secs(consumer.rollback_retry_timer());

    while !consumer.disconnected() {
        let request = match consumer.next_rollback() {
            Some(request) => request,
            None => {
                consumer.rollback_notified().await;
                continue;
            }
        };

        loop {
            match consumer.do_rollback(request) {
                RollbackOutcome::Retry => sleep(retry_timer).await,
                RollbackOutcome::Done => {
                    info!(
                        "(vb {}) Rollback to seqno {} complete",
                        request.vbucket, request.seqno
                    );
                    break;
                }
                RollbackOutcome::Dropped => break,
            }
        }
    }

    debug!("Rollback executor for {} exiting", consumer.name());
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::spawn_rollbacks;
    use crate::{
        node::consumer::{DcpConsumer, RollbackOutcome, RollbackReq},
        proto::event::{DcpEvent, StreamReqBody},
        utils::testing::{replica_store, CONFIG},
    };

    #[tokio::test]
    async fn test_rollback_task_truncates_storage() {
        let store = replica_store(0);
        for n in 0..5 {
            store.seed(0, format!("key{}", n).as_bytes(), b"value");
        }

        let consumer = Arc::new(DcpConsumer::new("test", store.clone(), &CONFIG));
        consumer.add_stream(1, 0, 0).unwrap();
        while consumer.step().unwrap().is_some() {}

        consumer
            .dispatch(DcpEvent::StreamReqRsp {
                opaque: 1,
                body: StreamReqBody::Rollback(3),
            })
            .unwrap();

        crate::dispatch_jobs!(consumer, spawn_rollbacks);

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.item_count(0) != 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("rollback never ran");

        consumer.set_disconnect();
    }

    #[tokio::test]
    async fn test_rollback_reissues_stream_request() {
        let store = replica_store(0);
        for n in 0..5 {
            store.seed(0, format!("key{}", n).as_bytes(), b"value");
        }

        let consumer = Arc::new(DcpConsumer::new("test", store.clone(), &CONFIG));
        consumer.add_stream(1, 0, 0).unwrap();
        let opaque = 1;

        // Drain the negotiation messages and the initial stream request.
        while consumer.step().unwrap().is_some() {}

        consumer
            .dispatch(DcpEvent::StreamReqRsp {
                opaque,
                body: StreamReqBody::Rollback(2),
            })
            .unwrap();

        let request = consumer.next_rollback().unwrap();
        assert_eq!(
            request,
            RollbackReq {
                opaque,
                vbucket: 0,
                seqno: 2
            }
        );

        assert_eq!(consumer.do_rollback(request), RollbackOutcome::Done);
        assert_eq!(store.item_count(0), 2);

        // The stream re-requests from the post-rollback position.
        let mut saw_request = false;
        while let Ok(Some(event)) = consumer.step() {
            if let DcpEvent::StreamReq(request) = event {
                assert_eq!(request.start_seqno, 2);
                assert_eq!(request.opaque, opaque);
                saw_request = true;
                break;
            }
        }
        assert!(saw_request);
    }

    #[tokio::test]
    async fn test_rollback_retries_on_tmp_fail() {
        let store = replica_store(0);
        let consumer = Arc::new(DcpConsumer::new("test", store.clone(), &CONFIG));
        consumer.add_stream(1, 0, 0).unwrap();

        let request = RollbackReq {
            opaque: 1,
            vbucket: 0,
            seqno: 0,
        };

        store.inject_tmp_fails(1);
        assert_eq!(consumer.do_rollback(request), RollbackOutcome::Retry);
        assert_eq!(consumer.backoffs(), 1);
        assert_eq!(consumer.do_rollback(request), RollbackOutcome::Done);
    }
}
