use std::sync::Arc;

use once_cell::sync::Lazy;
use riptide_lib::core::{
    item::ItemBuilder,
    store::MemoryStore,
    types::{Opaque, Seqno, VbState, Vbid},
};

use crate::{
    config::ConnectionConfig,
    proto::event::{marker_flags, DcpEvent, SnapshotMarker},
};

pub static CONFIG: Lazy<ConnectionConfig> = Lazy::new(|| ConnectionConfig {
    noop_interval: 1,
    connection_buffer_size: 1_048_576,
    processor_idle_timer: 1,
    processor_throttle_timer: 1,
    rollback_retry_timer: 1,
    ..ConnectionConfig::default()
});

/// An active vbucket seeded with `count` distinct writes
pub fn seeded_store(vbucket: Vbid, count: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    store.add_vbucket(vbucket, VbState::Active, 100);
    for n in 0..count {
        store.seed(vbucket, format!("key{}", n).as_bytes(), b"value");
    }
    store
}

/// An empty replica vbucket ready to ingest a stream
pub fn replica_store(vbucket: Vbid) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    store.add_vbucket(vbucket, VbState::Replica, 100);
    store
}

pub fn mutation(opaque: Opaque, vbucket: Vbid, seqno: Seqno) -> DcpEvent {
    DcpEvent::Mutation {
        opaque,
        item: ItemBuilder::default()
            .vbucket(vbucket)
            .key(format!("key{}", seqno))
            .value(b"value")
            .by_seqno(seqno)
            .compose()
            .unwrap(),
    }
}

pub fn memory_marker(opaque: Opaque, vbucket: Vbid, start: Seqno, end: Seqno) -> DcpEvent {
    DcpEvent::SnapshotMarker(SnapshotMarker {
        vbucket,
        opaque,
        start,
        end,
        flags: marker_flags::MEMORY,
    })
}
