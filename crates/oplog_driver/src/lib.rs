//! A live query driver that keeps a client-visible result set continuously
//! synchronized with a collection by tailing the database's replication
//! operation log, emitting a monotonic `added`/`changed`/`removed` stream
//! that reproduces the query's current result when replayed against an
//! initially empty set.
//!
//! The driver's own state (phase, published/buffer caches, fetch
//! bookkeeping) is serialized through a single `parking_lot::Mutex`; the
//! oplog reader, document fetcher, query runner, multiplexer and write
//! fence are external collaborators reached through the trait surface in
//! [`types`].

mod admissibility;
mod cache;
mod classify;
mod config;
mod errors;
mod fence;
mod fetch;
mod matching;
mod metrics;
mod oplog_handler;
mod phase;
mod poll;
mod state;
mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use futures::stream::StreamExt;
use parking_lot::Mutex;

pub use crate::{
    admissibility::{
        check_admissible,
        Inadmissible,
    },
    config::ObserveDriverConfig,
    errors::DriverError,
    matching::MatchingSet,
    phase::Phase,
    state::DriverState,
    types::{
        CursorDescription,
        CursorOptions,
        Document,
        DocumentId,
        DocFetcher,
        Matcher,
        MatchResult,
        Multiplexer,
        OpKind,
        OplogEntry,
        OplogHandle,
        OplogNotification,
        PrimaryFailoverSignal,
        QueryCursor,
        QueryRunner,
        Timestamp,
        UpdatePayload,
        WriteFence,
        WriteToken,
    },
};

/// Internal, `Arc`-shared state: the driver's mutable state plus its
/// collaborators. Every spawned task holds a clone of the `Arc`.
pub(crate) struct Inner {
    cursor: CursorDescription,
    matcher: Arc<dyn Matcher>,
    query_runner: Arc<dyn QueryRunner>,
    doc_fetcher: Arc<dyn DocFetcher>,
    multiplexer: Arc<dyn Multiplexer>,
    write_fence: Arc<dyn WriteFence>,
    oplog: Arc<dyn OplogHandle>,
    config: ObserveDriverConfig,
    state: Mutex<DriverState>,
}

/// A running live query driver for a single cursor.
///
/// Construct with [`ObserveDriver::new`], which runs the admissibility
/// check, starts the initial query, and subscribes to the oplog feed. Call
/// [`ObserveDriver::stop`] exactly once when the last subscriber detaches.
pub struct ObserveDriver {
    inner: Arc<Inner>,
}

impl ObserveDriver {
    /// Constructs and starts a driver for `cursor`, rejecting it up front
    /// if it can't be served by oplog tailing (spec.md §4.I).
    ///
    /// `fields_projectable` should reflect whether the caller already
    /// confirmed `matcher.combineIntoProjection` succeeds for this cursor's
    /// `fields` option; the driver never attempts the projection compile
    /// itself.
    pub fn new(
        cursor: CursorDescription,
        matcher: Arc<dyn Matcher>,
        query_runner: Arc<dyn QueryRunner>,
        doc_fetcher: Arc<dyn DocFetcher>,
        multiplexer: Arc<dyn Multiplexer>,
        write_fence: Arc<dyn WriteFence>,
        oplog: Arc<dyn OplogHandle>,
        fields_projectable: bool,
    ) -> Result<Self, Inadmissible> {
        Self::new_with_failover_signal(
            cursor,
            matcher,
            query_runner,
            doc_fetcher,
            multiplexer,
            write_fence,
            oplog,
            fields_projectable,
            None,
        )
    }

    /// As [`ObserveDriver::new`], but additionally selects on `failover`
    /// (spec.md §9 open question (b)): a `true` transition is treated
    /// exactly like a collection drop.
    pub fn new_with_failover_signal(
        cursor: CursorDescription,
        matcher: Arc<dyn Matcher>,
        query_runner: Arc<dyn QueryRunner>,
        doc_fetcher: Arc<dyn DocFetcher>,
        multiplexer: Arc<dyn Multiplexer>,
        write_fence: Arc<dyn WriteFence>,
        oplog: Arc<dyn OplogHandle>,
        fields_projectable: bool,
        failover: Option<PrimaryFailoverSignal>,
    ) -> Result<Self, Inadmissible> {
        check_admissible(&cursor, matcher.as_ref(), fields_projectable)?;

        let limit = cursor.options.limit;
        let comparator = cursor
            .options
            .sort
            .clone()
            .unwrap_or_else(|| Arc::new(|_: &Document, _: &Document| std::cmp::Ordering::Equal));
        let matching = MatchingSet::new(limit, comparator);
        let state = Mutex::new(DriverState::new(matching));

        let inner = Arc::new(Inner {
            cursor,
            matcher,
            query_runner,
            doc_fetcher,
            multiplexer,
            write_fence,
            oplog,
            config: ObserveDriverConfig::from_env(),
            state,
        });

        Self::spawn_oplog_subscription(&inner);
        if let Some(failover) = failover {
            Self::spawn_failover_watch(&inner, failover);
        }

        let initial = inner.clone();
        tokio::spawn(async move {
            if let Err(err) = initial.run_initial_query().await {
                tracing::error!(?err, "oplog driver initial query failed");
            }
        });

        Ok(Self { inner })
    }

    fn spawn_failover_watch(inner: &Arc<Inner>, mut failover: PrimaryFailoverSignal) {
        let inner = inner.clone();
        tokio::spawn(async move {
            loop {
                if inner.state.lock().stopped {
                    return;
                }
                if failover.changed().await.is_err() {
                    // Sender dropped: no more failover signals are coming.
                    return;
                }
                if *failover.borrow_and_update() {
                    tracing::warn!("oplog driver observed primary failover, forcing requery");
                    inner.need_to_poll_query();
                }
            }
        });
    }

    fn spawn_oplog_subscription(inner: &Arc<Inner>) {
        let inner = inner.clone();
        let mut stream = inner.oplog.subscribe();
        tokio::spawn(async move {
            while let Some(notif) = stream.next().await {
                if inner.state.lock().stopped {
                    break;
                }
                if let Err(err) = inner.handle_oplog_notification(notif) {
                    tracing::error!(?err, "oplog driver failed to handle oplog entry");
                    break;
                }
            }
        });
    }

    /// Registers a write under the outer write fence so its acknowledgement
    /// is delayed until every live subscriber has observed its effect
    /// (spec.md §4.H).
    pub fn begin_write(&self) {
        self.inner.begin_write();
    }

    /// Idempotent shutdown: unsubscribes from the oplog feed (by making the
    /// subscription loop and fetch/poll loops observe `stopped` and exit),
    /// immediately commits any captured write tokens, and drops the caches.
    pub fn stop(&self) {
        let pending = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.matching.clear_buffer();
            std::mem::take(&mut state.writes_to_commit_when_we_reach_steady)
        };
        for token in pending {
            token.committed();
            crate::metrics::log_write_fence_committed();
        }
    }

    pub fn current_phase(&self) -> Phase {
        self.inner.state.lock().phase()
    }
}
