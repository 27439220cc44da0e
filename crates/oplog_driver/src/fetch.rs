//! Component F: the fetch loop, spec.md §4.F.
//!
//! Triggered on entry into `FETCHING`. Runs on a spawned task so individual
//! fetches may suspend; every result is revalidated against the generation
//! observed when its batch was issued before it's allowed to mutate state.

use std::sync::Arc;

use futures::stream::{
    self,
    StreamExt,
};

use crate::{
    classify::handle_doc,
    phase::Phase,
    Inner,
};

impl Inner {
    /// Starts (or no-ops if one is already running for this generation) the
    /// asynchronous fetch loop described in spec.md §4.F.
    pub(crate) fn spawn_fetch_loop(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.run_fetch_loop().await {
                tracing::error!(?err, "oplog driver fetch loop failed");
            }
        });
    }

    async fn run_fetch_loop(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let generation;
            let batch: Vec<(crate::types::DocumentId, crate::types::Timestamp)>;
            {
                let mut state = self.state.lock();
                if state.stopped {
                    return Ok(());
                }
                if state.phase() != Phase::Fetching {
                    // A concurrent repoll cancelled this loop.
                    return Ok(());
                }
                if state.need_to_fetch.is_empty() {
                    drop(state);
                    self.be_steady();
                    return Ok(());
                }
                state.currently_fetching = std::mem::take(&mut state.need_to_fetch);
                state.fetch_generation += 1;
                generation = state.fetch_generation;
                batch = state
                    .currently_fetching
                    .iter()
                    .map(|(id, ts)| (id.clone(), *ts))
                    .collect();
            }

            crate::metrics::log_fetch_batch_issued();
            crate::metrics::log_fetch_batch_size(batch.len());
            let timer = crate::metrics::fetch_batch_timer();

            // Bounded by `fetch_concurrency` rather than issued all at once:
            // a batch built up over a long `FETCHING` stretch can be large
            // enough that unbounded concurrency would thrash the fetcher.
            let mut in_flight = stream::iter(batch.into_iter().map(|(id, ts)| {
                let inner = self.clone();
                async move {
                    let result = inner
                        .doc_fetcher
                        .fetch(&inner.cursor.collection_name, &id, ts)
                        .await;
                    (id, result)
                }
            }))
            .buffer_unordered(self.config.fetch_concurrency.max(1));

            let mut first_error = None;
            let mut requery_needed = false;
            let mut timed_out = false;
            loop {
                let next = match self.config.fetching_timeout {
                    // spec.md §9 open question (a): FETCHING held open-ended
                    // past this deadline without draining forces a repoll
                    // instead of waiting indefinitely on a slow fetcher.
                    Some(timeout) => match tokio::time::timeout(timeout, in_flight.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            timed_out = true;
                            break;
                        },
                    },
                    None => in_flight.next().await,
                };
                let Some((id, result)) = next else {
                    break;
                };
                match result {
                    Ok(doc) => {
                        let mut state = self.state.lock();
                        let still_current = !state.stopped
                            && state.phase() == Phase::Fetching
                            && state.fetch_generation == generation;
                        if still_current {
                            let projected = doc.map(|d| self.matcher.shared_projection(&d));
                            if let Err(err) = handle_doc(
                                &mut state.matching,
                                self.matcher.as_ref(),
                                id,
                                projected,
                                self.multiplexer.as_ref(),
                            ) {
                                if first_error.is_none() {
                                    first_error = Some(err);
                                }
                            }
                            requery_needed |= state.matching.take_requery_needed();
                        }
                    },
                    Err(err) if first_error.is_none() => {
                        first_error =
                            Some(err.context(crate::errors::DriverError::Fetch(id.clone())));
                    },
                    Err(_) => {},
                }
            }

            {
                let mut state = self.state.lock();
                state.currently_fetching.clear();
            }

            if let Some(err) = first_error {
                timer.finish_with("error");
                return Err(err.context("fetch loop: batch had at least one failed fetch"));
            }

            if timed_out {
                timer.finish_with("timeout");
                crate::metrics::log_fetching_timeout();
                // Abandons whatever is still in flight for this generation;
                // their results will fail the generation check and no-op.
                self.need_to_poll_query();
                return Ok(());
            }
            timer.finish();

            if requery_needed {
                // A buffer emptying mid-batch requires a full requery (spec.md
                // §4.B `removeBuffered`); this supersedes the rest of this batch.
                self.need_to_poll_query();
                return Ok(());
            }

            if self.state.lock().phase() != Phase::Fetching {
                return Ok(());
            }
        }
    }

    /// `beSteady()` from spec.md §4.G/§4.H: transition into `STEADY` and
    /// commit any write tokens queued while not steady, via a single
    /// multiplexer flush.
    pub(crate) fn be_steady(self: &Arc<Self>) {
        let pending = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.phase.transition(Phase::Steady);
            crate::fence::drain_pending_writes(&mut state)
        };
        crate::fence::register_flush_commit(self.multiplexer.as_ref(), pending);
    }
}
