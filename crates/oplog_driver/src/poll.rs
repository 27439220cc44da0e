//! Component G: the poll/requery loop, spec.md §4.G.

use std::sync::Arc;

use crate::{
    classify::handle_doc,
    phase::Phase,
    types::{
        Document,
        DocumentId,
    },
    Inner,
};

impl Inner {
    /// `runInitialQuery`: runs once, at driver construction.
    pub(crate) async fn run_initial_query(self: Arc<Self>) -> anyhow::Result<()> {
        let fetch_limit = if self.cursor.options.is_limited() {
            self.cursor.options.limit * self.config.poll_query_limit_multiplier
        } else {
            0
        };

        let mut cursor = self.query_runner.run(fetch_limit).await?;
        let mut fetched_count = 0usize;
        loop {
            let batch = cursor.next_batch(256).await?;
            if batch.is_empty() {
                break;
            }
            fetched_count += batch.len();
            let mut state = self.state.lock();
            for (id, doc) in batch {
                state.matching.add_matching(id, doc, self.multiplexer.as_ref())?;
            }
            if fetch_limit > 0 && fetched_count >= fetch_limit {
                break;
            }
        }

        if self.cursor.options.is_limited() {
            let mut state = self.state.lock();
            let safe = fetched_count < fetch_limit;
            state.matching.set_safe_append_to_buffer(safe);
        }

        self.multiplexer.ready();
        self.done_querying().await
    }

    /// `pollQuery`: a full requery triggered by a collection drop or a
    /// buffer emptying under an unsafe append state.
    pub(crate) fn spawn_poll_query(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.need_to_fetch.clear();
            state.currently_fetching.clear();
            state.fetch_generation += 1;
            state.phase.transition(Phase::Querying);
        }
        crate::metrics::log_requery_triggered();

        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.run_poll_query().await {
                tracing::error!(?err, "oplog driver poll query failed");
            }
        });
    }

    async fn run_poll_query(self: Arc<Self>) -> anyhow::Result<()> {
        let limit = self.cursor.options.limit;
        let fetch_limit = if limit > 0 {
            limit * self.config.poll_query_limit_multiplier
        } else {
            0
        };

        let mut cursor = self.query_runner.run(fetch_limit).await?;
        let mut all: Vec<(DocumentId, Document)> = Vec::new();
        loop {
            let batch = cursor.next_batch(256).await?;
            if batch.is_empty() {
                break;
            }
            let reached_limit = fetch_limit > 0 && all.len() + batch.len() >= fetch_limit;
            all.extend(batch);
            if reached_limit {
                break;
            }
        }

        let (new_results, new_buffer) = if limit > 0 {
            if all.len() > limit {
                let buffer = all.split_off(limit);
                (all, buffer)
            } else {
                (all, Vec::new())
            }
        } else {
            (all, Vec::new())
        };

        self.publish_new_results(new_results, new_buffer)?;
        self.done_querying().await
    }

    /// `publishNewResults(newResults, newBuffer)`.
    fn publish_new_results(
        self: &Arc<Self>,
        new_results: Vec<(DocumentId, Document)>,
        new_buffer: Vec<(DocumentId, Document)>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let limited = state.matching.is_limited();

        if limited {
            state.matching.clear_buffer();
        }

        let new_ids: std::collections::HashSet<&DocumentId> =
            new_results.iter().map(|(id, _)| id).collect();
        let stale: Vec<DocumentId> = state
            .matching
            .published()
            .ids()
            .filter(|id| !new_ids.contains(id))
            .cloned()
            .collect();
        for id in stale {
            state.matching.remove_matching(&id, self.multiplexer.as_ref())?;
        }

        for (id, doc) in new_results.iter() {
            handle_doc(
                &mut state.matching,
                self.matcher.as_ref(),
                id.clone(),
                Some(doc.clone()),
                self.multiplexer.as_ref(),
            )?;
        }

        if state.matching.published().size() != new_results.len() {
            anyhow::bail!(
                "publishNewResults: published.size() ({}) != newResults.size() ({})",
                state.matching.published().size(),
                new_results.len()
            );
        }
        for (id, _) in &new_results {
            if !state.matching.published().has(id) {
                anyhow::bail!("publishNewResults: {id} missing from published after sync");
            }
        }

        let new_buffer_len = new_buffer.len();
        for (id, doc) in new_buffer {
            state.matching.add_buffered(id, doc);
        }
        if limited {
            let limit = state.matching.limit();
            state.matching.set_safe_append_to_buffer(new_buffer_len < limit);
        }
        // This requery is itself the repoll any intermediate buffer emptying
        // (stale removal, handleDoc demotions) would have requested.
        state.matching.take_requery_needed();
        Ok(())
    }

    /// `needToPollQuery`: requests a requery, immediately if we're not
    /// already querying, or deferred until the current query finishes.
    pub(crate) fn need_to_poll_query(self: &Arc<Self>) {
        let should_spawn = {
            let mut state = self.state.lock();
            if state.stopped {
                false
            } else if state.phase() == Phase::Querying {
                state.requery_when_done_this_query = true;
                false
            } else {
                true
            }
        };
        if should_spawn {
            self.spawn_poll_query();
        }
    }

    /// `doneQuerying`: suspends until the oplog has caught up to this
    /// query's start, then either requeries again, goes steady, or starts
    /// the fetch loop.
    async fn done_querying(self: &Arc<Self>) -> anyhow::Result<()> {
        self.oplog.wait_until_caught_up().await;

        let requery = {
            let mut state = self.state.lock();
            if state.stopped {
                return Ok(());
            }
            std::mem::replace(&mut state.requery_when_done_this_query, false)
        };

        if requery {
            self.spawn_poll_query();
            return Ok(());
        }

        let needs_fetch = {
            let state = self.state.lock();
            !state.need_to_fetch.is_empty()
        };

        if needs_fetch {
            {
                let mut state = self.state.lock();
                state.phase.transition(Phase::Fetching);
            }
            self.spawn_fetch_loop();
        } else {
            self.be_steady();
        }
        Ok(())
    }
}
