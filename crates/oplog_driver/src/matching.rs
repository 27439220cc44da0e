//! Component C: the matching-set mutator.
//!
//! Owns the published/buffer heaps (component B) and the operations that
//! keep them consistent with the limit and ordering invariants in `spec.md`
//! §3 and §4.B/§4.C: `addPublished`, `removePublished`, `changePublished`,
//! `addBuffered`, `removeBuffered`, `addMatching`, `removeMatching`.

use std::cmp::Ordering;

use crate::{
    cache::IndexedHeap,
    errors::{
        ensure_invariant,
        invariant,
    },
    types::{
        Comparator,
        Document,
        DocumentId,
        Multiplexer,
    },
};

/// The published/buffer caches plus the bookkeeping the spec calls
/// `safeAppendToBuffer` and `requeryWhenDoneThisQuery`. `requery_needed` is
/// read and cleared by the poll loop (component G); this type only sets it.
pub struct MatchingSet {
    limit: usize,
    comparator: Comparator,
    published: IndexedHeap,
    unpublished_buffer: IndexedHeap,
    /// True iff the buffer is known to hold the next `limit` matching
    /// documents in order, i.e. no matching document has been dropped from
    /// cache since the last full requery.
    safe_append_to_buffer: bool,
    /// Set when a buffer emptying (while unsafe to append) demands a repoll;
    /// cleared by whoever acts on it.
    requery_needed: bool,
}

impl MatchingSet {
    pub fn new(limit: usize, comparator: Comparator) -> Self {
        Self {
            limit,
            published: IndexedHeap::new(comparator.clone()),
            unpublished_buffer: IndexedHeap::new(comparator.clone()),
            comparator,
            safe_append_to_buffer: true,
            requery_needed: false,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limit > 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn published(&self) -> &IndexedHeap {
        &self.published
    }

    pub fn unpublished_buffer(&self) -> &IndexedHeap {
        &self.unpublished_buffer
    }

    pub fn safe_append_to_buffer(&self) -> bool {
        self.safe_append_to_buffer
    }

    pub fn set_safe_append_to_buffer(&mut self, value: bool) {
        self.safe_append_to_buffer = value;
    }

    pub fn take_requery_needed(&mut self) -> bool {
        std::mem::replace(&mut self.requery_needed, false)
    }

    fn compare(&self, a: &Document, b: &Document) -> Ordering {
        (self.comparator)(a, b)
    }

    /// Public comparator access for component D, which needs to order
    /// documents that aren't yet cached against `published`/`buffer`
    /// extremes while classifying an update.
    pub fn compare_docs(&self, a: &Document, b: &Document) -> Ordering {
        self.compare(a, b)
    }

    /// Clears the published and buffer heaps, used by the poll loop before
    /// installing a fresh requery result (`publishNewResults`).
    pub fn clear_buffer(&mut self) {
        self.unpublished_buffer.clear();
    }

    // ---- component B: cache mutators -----------------------------------

    /// `addPublished(id, doc)` from spec.md §4.B/4.C.
    pub fn add_published(
        &mut self,
        id: DocumentId,
        doc: Document,
        mux: &dyn Multiplexer,
    ) -> anyhow::Result<()> {
        ensure_invariant!(
            !self.published.has(&id),
            "addPublished: {id} is already published"
        );
        let fields = doc.clone();
        self.published.set(id.clone(), doc);
        mux.added(&id, fields);

        if self.is_limited() && self.published.size() > self.limit {
            let overflow_id = self
                .published
                .max_element_id()
                .ok_or_else(|| anyhow::anyhow!("published overflowed with no max element"))?;
            ensure_invariant!(
                overflow_id != id,
                "addPublished: overflow evicted the document just inserted ({id})"
            );
            let evicted = self
                .published
                .remove(&overflow_id)
                .ok_or_else(|| anyhow::anyhow!("overflow id vanished before eviction"))?;
            ensure_invariant!(
                self.published.size() <= self.limit,
                "addPublished: overflow of more than one element past limit"
            );
            mux.removed(&overflow_id);
            self.add_buffered(overflow_id, evicted);
        }
        Ok(())
    }

    /// `removePublished(id)` from spec.md §4.B.
    pub fn remove_published(
        &mut self,
        id: &DocumentId,
        mux: &dyn Multiplexer,
    ) -> anyhow::Result<()> {
        let removed = self
            .published
            .remove(id)
            .ok_or_else(|| anyhow::anyhow!("removePublished: {id} was not published"))?;
        mux.removed(id);
        let _ = removed;

        if self.is_limited()
            && self.published.size() < self.limit
            && !self.unpublished_buffer.is_empty()
        {
            let promote_id = self
                .unpublished_buffer
                .min_element_id()
                .expect("buffer non-empty");
            let doc = self
                .remove_buffered(&promote_id)
                .ok_or_else(|| anyhow::anyhow!("promote: {promote_id} vanished from buffer"))?;
            self.add_published(promote_id, doc, mux)?;
        }
        Ok(())
    }

    /// `changePublished(id, oldDoc, newDoc)` from spec.md §4.B.
    pub fn change_published(
        &mut self,
        id: &DocumentId,
        new_doc: Document,
        mux: &dyn Multiplexer,
    ) -> anyhow::Result<()> {
        let old_doc = self
            .published
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("changePublished: {id} is not published"))?
            .clone();
        let diff = diff_fields(&old_doc, &new_doc);
        self.published.set(id.clone(), new_doc);
        if !diff.is_empty() {
            mux.changed(id, diff);
        }
        Ok(())
    }

    /// `addBuffered(id, doc)` from spec.md §4.B.
    pub fn add_buffered(&mut self, id: DocumentId, doc: Document) {
        self.unpublished_buffer.set(id, doc);
        if self.is_limited() && self.unpublished_buffer.size() > self.limit {
            if let Some(overflow_id) = self.unpublished_buffer.max_element_id() {
                self.unpublished_buffer.remove(&overflow_id);
                self.safe_append_to_buffer = false;
                crate::metrics::log_dropped_from_cache();
            }
        }
    }

    /// `removeBuffered(id)` from spec.md §4.B. Returns the removed document,
    /// if present.
    pub fn remove_buffered(&mut self, id: &DocumentId) -> Option<Document> {
        let doc = self.unpublished_buffer.remove(id);
        if self.unpublished_buffer.is_empty() && !self.safe_append_to_buffer {
            self.requery_needed = true;
        }
        doc
    }

    // ---- component C: matching-set mutator ------------------------------

    /// `addMatching(doc)` from spec.md §4.C.
    pub fn add_matching(
        &mut self,
        id: DocumentId,
        doc: Document,
        mux: &dyn Multiplexer,
    ) -> anyhow::Result<()> {
        ensure_invariant!(
            !self.published.has(&id) && !self.unpublished_buffer.has(&id),
            "addMatching: {id} is already cached"
        );

        if !self.is_limited()
            || self.published.size() < self.limit
            || self
                .published
                .max_element_id()
                .map(|max_id| {
                    let max_doc = self.published.get(&max_id).expect("max exists").clone();
                    self.compare(&doc, &max_doc) == Ordering::Less
                })
                .unwrap_or(true)
        {
            self.add_published(id, doc, mux)?;
            return Ok(());
        }

        let max_buffered = self
            .unpublished_buffer
            .max_element_id()
            .map(|mid| self.unpublished_buffer.get(&mid).expect("max exists").clone());
        let fits_buffer = (self.safe_append_to_buffer && self.unpublished_buffer.size() < self.limit)
            || max_buffered
                .as_ref()
                .map(|max_doc| self.compare(&doc, max_doc) != Ordering::Greater)
                .unwrap_or(false);

        if fits_buffer {
            self.add_buffered(id, doc);
        } else {
            self.safe_append_to_buffer = false;
        }
        Ok(())
    }

    /// `removeMatching(id)` from spec.md §4.C.
    pub fn remove_matching(&mut self, id: &DocumentId, mux: &dyn Multiplexer) -> anyhow::Result<()> {
        if self.published.has(id) {
            self.remove_published(id, mux)
        } else if self.unpublished_buffer.has(id) {
            self.remove_buffered(id);
            Ok(())
        } else {
            invariant!("removeMatching: {id} is not cached anywhere");
        }
    }

    pub fn is_cached(&self, id: &DocumentId) -> bool {
        self.published.has(id) || self.unpublished_buffer.has(id)
    }

    pub fn get_cached(&self, id: &DocumentId) -> Option<&Document> {
        self.published.get(id).or_else(|| self.unpublished_buffer.get(id))
    }
}

/// Diff of `new` against `old`, limited to keys present in either: changed
/// or added keys take `new`'s value, removed keys map to `Json::Null` per
/// the multiplexer's diff convention.
fn diff_fields(old: &Document, new: &Document) -> Document {
    let mut diff = Document::new();
    for (k, v) in new {
        if old.get(k) != Some(v) {
            diff.insert(k.clone(), v.clone());
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            diff.insert(k.clone(), serde_json::Value::Null);
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        Mutex,
    };

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingMux {
        events: Mutex<Vec<String>>,
    }

    impl Multiplexer for RecordingMux {
        fn added(&self, id: &DocumentId, _fields: Document) {
            self.events.lock().unwrap().push(format!("added({id})"));
        }

        fn changed(&self, id: &DocumentId, _diff: Document) {
            self.events.lock().unwrap().push(format!("changed({id})"));
        }

        fn removed(&self, id: &DocumentId) {
            self.events.lock().unwrap().push(format!("removed({id})"));
        }

        fn ready(&self) {}

        fn on_flush(&self, cb: Box<dyn FnOnce() + Send>) {
            cb();
        }
    }

    fn by_n() -> Comparator {
        Arc::new(|a: &Document, b: &Document| {
            let an = a.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            let bn = b.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            an.cmp(&bn)
        })
    }

    fn doc(n: i64) -> Document {
        let mut d = Document::new();
        d.insert("n".to_string(), json!(n));
        d
    }

    #[test]
    fn unlimited_publishes_everything() {
        let mux = RecordingMux::default();
        let mut set = MatchingSet::new(0, by_n());
        set.add_matching("1".into(), doc(5), &mux).unwrap();
        assert_eq!(set.published().size(), 1);
        assert_eq!(*mux.events.lock().unwrap(), vec!["added(1)"]);
    }

    #[test]
    fn limited_evicts_max_into_buffer() {
        let mux = RecordingMux::default();
        let mut set = MatchingSet::new(2, by_n());
        set.add_matching("1".into(), doc(10), &mux).unwrap();
        set.add_matching("2".into(), doc(20), &mux).unwrap();
        set.add_matching("3".into(), doc(30), &mux).unwrap();
        assert_eq!(set.published().size(), 2);
        assert!(set.published().has(&"1".to_string()));
        assert!(set.published().has(&"2".to_string()));
        assert!(set.unpublished_buffer().has(&"3".to_string()));
    }

    #[test]
    fn removing_published_promotes_from_buffer() {
        let mux = RecordingMux::default();
        let mut set = MatchingSet::new(2, by_n());
        set.add_matching("1".into(), doc(10), &mux).unwrap();
        set.add_matching("2".into(), doc(20), &mux).unwrap();
        set.add_matching("3".into(), doc(30), &mux).unwrap();
        set.remove_matching(&"1".to_string(), &mux).unwrap();
        assert!(set.published().has(&"2".to_string()));
        assert!(set.published().has(&"3".to_string()));
        assert!(!set.unpublished_buffer().has(&"3".to_string()));
    }

    #[test]
    fn buffer_overflow_clears_safe_append() {
        let mux = RecordingMux::default();
        let mut set = MatchingSet::new(1, by_n());
        set.add_matching("1".into(), doc(1), &mux).unwrap();
        set.add_matching("2".into(), doc(2), &mux).unwrap();
        set.add_matching("3".into(), doc(3), &mux).unwrap();
        assert!(!set.safe_append_to_buffer());
    }

    #[test]
    fn emptying_unsafe_buffer_requests_requery() {
        let mux = RecordingMux::default();
        let mut set = MatchingSet::new(1, by_n());
        set.add_matching("1".into(), doc(1), &mux).unwrap();
        set.add_matching("2".into(), doc(2), &mux).unwrap();
        set.set_safe_append_to_buffer(false);
        set.remove_buffered(&"2".to_string());
        assert!(set.take_requery_needed());
    }
}
