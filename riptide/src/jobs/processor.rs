use std::{sync::Arc, time::Duration};

use riptide_lib::core::store::MutationSink;
use tokio::time::{sleep, timeout};

use crate::node::consumer::{DcpConsumer, ProcessResult};

/// Drain a consumer's stream buffers until it is cancelled.
///
/// The pacing mirrors the drain verdict: go again immediately when more
/// arrived, park until woken (with a periodic sweep) when idle, back
/// off when the write path pushes back.
pub async fn spawn_processor<S: MutationSink>(consumer: &Arc<DcpConsumer<S>>) {
    debug!("Spawning buffered item processor for {}", consumer.name());

    let (idle_timer, throttle_timer) = consumer.processor_snooze();

    loop {
        if consumer.processor_cancelled() || consumer.disconnected() {
            break;
        }

        match consumer.process_buffered_items() {
            ProcessResult::MoreToProcess => tokio::task::yield_now().await,
            ProcessResult::AllProcessed => {
                timeout(
                    Duration::from_secs(idle_timer),
                    consumer.processor_notified(),
                )
                .await
                .ok();
            }
            ProcessResult::CannotProcess => sleep(Duration::from_secs(throttle_timer)).await,
        }
    }

    debug!("Buffered item processor for {} exiting", consumer.name());
}
