//! `observe-drivers-oplog` metrics sink, following `sync::metrics`'s
//! convention: a public, high-level function per logged event, all metric
//! names/labels kept as constants in this module.

use std::time::Duration;

use ::metrics::{
    log_counter,
    log_distribution,
    log_distribution_with_labels,
    register_convex_counter,
    register_convex_histogram,
    MetricLabel,
    StatusTimer,
};

register_convex_histogram!(
    OPLOG_DRIVER_TIME_SPENT_IN_PHASE_SECONDS,
    "Time spent in a given observe-driver phase before transitioning out of it",
    &["phase"]
);
pub fn log_phase_duration(phase: &'static str, elapsed: Duration) {
    log_distribution_with_labels(
        &OPLOG_DRIVER_TIME_SPENT_IN_PHASE_SECONDS,
        elapsed.as_secs_f64(),
        vec![MetricLabel::new("phase", phase)],
    );
}

register_convex_counter!(
    OPLOG_DRIVER_FETCH_BATCH_TOTAL,
    "Number of fetch batches issued by the fetch loop"
);
pub fn log_fetch_batch_issued() {
    log_counter(&OPLOG_DRIVER_FETCH_BATCH_TOTAL, 1);
}

register_convex_histogram!(
    OPLOG_DRIVER_FETCH_BATCH_SIZE,
    "Number of ids in a single fetch batch"
);
pub fn log_fetch_batch_size(size: usize) {
    log_distribution(&OPLOG_DRIVER_FETCH_BATCH_SIZE, size as f64);
}

register_convex_counter!(
    OPLOG_DRIVER_REQUERY_TOTAL,
    "Number of full requeries triggered (collection drop, buffer emptying, failover)"
);
pub fn log_requery_triggered() {
    log_counter(&OPLOG_DRIVER_REQUERY_TOTAL, 1);
}

register_convex_counter!(
    OPLOG_DRIVER_DROPPED_FROM_CACHE_TOTAL,
    "Number of matching documents evicted from the buffer and dropped from cache entirely"
);
pub fn log_dropped_from_cache() {
    log_counter(&OPLOG_DRIVER_DROPPED_FROM_CACHE_TOTAL, 1);
}

register_convex_counter!(
    OPLOG_DRIVER_WRITE_FENCE_COMMIT_TOTAL,
    "Number of write-fence tokens committed"
);
pub fn log_write_fence_committed() {
    log_counter(&OPLOG_DRIVER_WRITE_FENCE_COMMIT_TOTAL, 1);
}

register_convex_counter!(
    OPLOG_DRIVER_FETCHING_TIMEOUT_TOTAL,
    "Number of fetch batches abandoned because OPLOG_DRIVER_FETCHING_TIMEOUT_MS elapsed before they drained"
);
pub fn log_fetching_timeout() {
    log_counter(&OPLOG_DRIVER_FETCHING_TIMEOUT_TOTAL, 1);
}

register_convex_histogram!(
    OPLOG_DRIVER_FETCH_LOOP_SECONDS,
    "Time spent inside a single fetch-loop batch round-trip",
    &::metrics::STATUS_LABEL
);
pub fn fetch_batch_timer() -> StatusTimer {
    StatusTimer::new(&OPLOG_DRIVER_FETCH_LOOP_SECONDS)
}
