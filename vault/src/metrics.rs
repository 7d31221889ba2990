//! Global prometheus counters for the daemon.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

pub static WAL_SEGMENTS_SEALED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pgvault_wal_segments_sealed_total",
        "Number of WAL segments completed and renamed from .partial"
    )
    .expect("Failed to register pgvault_wal_segments_sealed_total counter")
});

pub static WAL_BYTES_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pgvault_wal_bytes_received_total",
        "Bytes of WAL received over replication connections"
    )
    .expect("Failed to register pgvault_wal_bytes_received_total counter")
});

pub static STORAGE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgvault_storage_errors_total",
        "Errors talking to storage tiers, by backend",
        &["backend"]
    )
    .expect("Failed to register pgvault_storage_errors_total counter")
});
