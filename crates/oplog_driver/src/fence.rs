//! Component H: the write-fence coordinator, spec.md §4.H.
//!
//! A write under an outer write fence must not be acknowledged to its
//! caller until every live subscriber has observed its effect. The driver
//! captures the token, waits for the oplog to catch up, and then either
//! commits immediately (stopped, or already steady) or parks the token
//! until the next transition into `STEADY`.

use std::sync::Arc;

use crate::Inner;

/// Take every token queued while the driver wasn't steady, clearing the
/// queue. Called with the state lock held; the result is registered with
/// the multiplexer via `register_flush_commit` after the lock is dropped.
pub(crate) fn drain_pending_writes(
    state: &mut crate::state::DriverState,
) -> Vec<Box<dyn crate::types::WriteToken>> {
    std::mem::take(&mut state.writes_to_commit_when_we_reach_steady)
}

impl Inner {
    /// Captures a write token arriving from the outer write fence and
    /// schedules the async wait described in spec.md §4.H. Never suspends
    /// itself: the actual wait runs on a spawned task.
    pub(crate) fn begin_write(self: &Arc<Self>) {
        let token = self.write_fence.begin_write();
        let inner = self.clone();
        tokio::spawn(async move {
            inner.oplog.wait_until_caught_up().await;

            let mut state = inner.state.lock();
            if state.stopped {
                drop(state);
                token.committed();
                return;
            }
            if state.phase() == crate::phase::Phase::Steady {
                drop(state);
                inner.multiplexer.on_flush(Box::new(move || {
                    token.committed();
                    crate::metrics::log_write_fence_committed();
                }));
            } else {
                state.writes_to_commit_when_we_reach_steady.push(token);
            }
        });
    }

}

/// Registers a single `onFlush` callback that commits every pending token,
/// called once per transition into `STEADY` with a non-empty pending list.
pub(crate) fn register_flush_commit(
    multiplexer: &dyn crate::types::Multiplexer,
    pending: Vec<Box<dyn crate::types::WriteToken>>,
) {
    if pending.is_empty() {
        return;
    }
    multiplexer.on_flush(Box::new(move || {
        for token in pending {
            token.committed();
            crate::metrics::log_write_fence_committed();
        }
    }));
}
