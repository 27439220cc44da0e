//! Component E: the oplog entry handler, spec.md §4.E.
//!
//! Entry point runs synchronously with respect to the oplog reader and must
//! not suspend; any work that needs to suspend (a fetch, a repoll) is
//! deferred to a spawned task.

use std::sync::Arc;

use crate::{
    classify::handle_doc,
    errors::invariant,
    phase::Phase,
    types::{
        Document,
        OpKind,
        OplogEntry,
        OplogNotification,
        UpdatePayload,
    },
    Inner,
};

/// Fields matching this prefix mark a custom-type (EJSON) encoding; a
/// modifier touching one can't be applied locally and forces a refetch.
const CUSTOM_TYPE_FIELD_MARKER: &str = "EJSON$";

fn modifier_touches_custom_type(modifier: &Document) -> bool {
    modifier.values().any(|op| match op.as_object() {
        Some(fields) => fields.keys().any(|k| k.starts_with(CUSTOM_TYPE_FIELD_MARKER)),
        None => false,
    })
}

/// Applies a `{"$set": {...}, "$unset": {...}}`-shaped modifier to a clone
/// of `doc`. Returns `None` for any other top-level operator; the caller
/// must treat that the same as an uncached doc and fall through to a
/// refetch rather than drop the update.
fn apply_modifier_locally(doc: &Document, modifier: &Document) -> Option<Document> {
    let mut result = doc.clone();
    for (op, payload) in modifier {
        let fields = payload.as_object()?;
        match op.as_str() {
            "$set" => {
                for (k, v) in fields {
                    result.insert(k.clone(), v.clone());
                }
            },
            "$unset" => {
                for k in fields.keys() {
                    result.remove(k);
                }
            },
            _ => return None,
        }
    }
    Some(result)
}

impl Inner {
    /// Per-phase dispatch of a single oplog notification. Called from the
    /// subscription loop; never suspends.
    pub(crate) fn handle_oplog_notification(self: &Arc<Self>, notif: OplogNotification) -> anyhow::Result<()> {
        match notif {
            OplogNotification::CollectionDropped => {
                self.need_to_poll_query();
                Ok(())
            },
            OplogNotification::Entry(entry) => self.handle_oplog_entry(entry),
        }
    }

    fn handle_oplog_entry(self: &Arc<Self>, entry: OplogEntry) -> anyhow::Result<()> {
        let result = self.handle_oplog_entry_locked(entry);
        if self.take_requery_needed() {
            self.need_to_poll_query();
        }
        result
    }

    /// Checks and clears the `safeAppendToBuffer`-driven repoll request
    /// (spec.md §4.B `removeBuffered`) left behind by a buffer emptying
    /// during this entry's processing. Must be called with the state lock
    /// released, since `need_to_poll_query` takes it itself.
    fn take_requery_needed(self: &Arc<Self>) -> bool {
        self.state.lock().matching.take_requery_needed()
    }

    fn handle_oplog_entry_locked(self: &Arc<Self>, entry: OplogEntry) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Ok(());
        }

        if state.phase() == Phase::Querying {
            state.need_to_fetch.insert(entry.id.clone(), entry.ts);
            return Ok(());
        }

        if state.need_to_fetch.contains_key(&entry.id) || state.currently_fetching.contains_key(&entry.id) {
            state.need_to_fetch.insert(entry.id.clone(), entry.ts);
            return Ok(());
        }

        match entry.op {
            OpKind::Delete => {
                if state.matching.is_cached(&entry.id) {
                    state.matching.remove_matching(&entry.id, self.multiplexer.as_ref())?;
                }
            },
            OpKind::Insert => {
                let doc = entry
                    .insert_doc
                    .ok_or_else(|| anyhow::anyhow!("insert oplog entry without a document"))?;
                if state.matching.is_cached(&entry.id) {
                    invariant!("insert for already-cached id {}", entry.id);
                }
                if self.matcher.document_matches(&doc).result {
                    state.matching.add_matching(entry.id, doc, self.multiplexer.as_ref())?;
                }
            },
            OpKind::Update => {
                let payload = entry
                    .update_payload
                    .ok_or_else(|| anyhow::anyhow!("update oplog entry without a payload"))?;
                match payload {
                    UpdatePayload::Replacement(mut replacement) => {
                        replacement.insert(
                            "_id".to_string(),
                            serde_json::Value::String(entry.id.clone()),
                        );
                        let projected = self.matcher.shared_projection(&replacement);
                        handle_doc(
                            &mut state.matching,
                            self.matcher.as_ref(),
                            entry.id,
                            Some(projected),
                            self.multiplexer.as_ref(),
                        )?;
                    },
                    UpdatePayload::Modifier(modifier) => {
                        let cached = state.matching.get_cached(&entry.id).cloned();
                        let can_try_locally = !modifier_touches_custom_type(&modifier) && cached.is_some();
                        let applied = can_try_locally
                            .then(|| apply_modifier_locally(cached.as_ref().expect("checked above"), &modifier))
                            .flatten();
                        // `apply_modifier_locally` also returns `None` for an
                        // operator other than `$set`/`$unset` (e.g. `$inc`,
                        // `$push`); that case must fall through to the fetch
                        // below just like an uncached doc or an EJSON field,
                        // or the cache would go stale silently.
                        let locally_applicable = applied.is_some();

                        if let Some(applied) = applied {
                            let projected = self.matcher.shared_projection(&applied);
                            handle_doc(
                                &mut state.matching,
                                self.matcher.as_ref(),
                                entry.id,
                                Some(projected),
                                self.multiplexer.as_ref(),
                            )?;
                            return Ok(());
                        }

                        if self.matcher.can_become_true_by_modifier(&modifier) || !locally_applicable {
                            state.need_to_fetch.insert(entry.id.clone(), entry.ts);
                            if state.phase() == Phase::Steady {
                                state.phase.transition(Phase::Fetching);
                                drop(state);
                                self.spawn_fetch_loop();
                            }
                        }
                    },
                }
            },
        }
        Ok(())
    }
}
