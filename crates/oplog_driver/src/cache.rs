//! Component B: published/buffer caches.
//!
//! `IndexedHeap` realizes the design note in `spec.md` §9: "an order-
//! statistic balanced tree keyed by `(sortKey, id)` with a side hash". Since
//! the comparator here is an arbitrary `Fn(&Document, &Document) -> Ordering`
//! rather than an extractable sort key, each ordered entry carries a clone of
//! the (cheaply-cloneable, `Arc`-backed) comparator so `BTreeSet` can order
//! entries consistently; the side `HashMap` gives O(1) `get`/`has`/`remove`
//! by id.

use std::{
    cmp::Ordering,
    collections::{
        BTreeSet,
        HashMap,
    },
    sync::Arc,
};

use crate::types::{
    Comparator,
    Document,
    DocumentId,
};

struct HeapEntry {
    id: DocumentId,
    doc: Arc<Document>,
    comparator: Comparator,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.comparator)(&self.doc, &other.doc).then_with(|| self.id.cmp(&other.id))
    }
}

/// An id-indexed min/max heap ordered by a caller-supplied comparator.
#[derive(Default)]
pub struct IndexedHeap {
    comparator: Option<Comparator>,
    ordered: BTreeSet<HeapEntry>,
    by_id: HashMap<DocumentId, Arc<Document>>,
}

impl IndexedHeap {
    pub fn new(comparator: Comparator) -> Self {
        Self {
            comparator: Some(comparator),
            ordered: BTreeSet::new(),
            by_id: HashMap::new(),
        }
    }

    fn comparator(&self) -> Comparator {
        self.comparator
            .clone()
            .expect("IndexedHeap::new must be used before insertion")
    }

    fn entry_for(&self, id: &DocumentId, doc: Arc<Document>) -> HeapEntry {
        HeapEntry {
            id: id.clone(),
            doc,
            comparator: self.comparator(),
        }
    }

    pub fn set(&mut self, id: DocumentId, doc: Document) {
        let doc = Arc::new(doc);
        if let Some(old) = self.by_id.get(&id).cloned() {
            self.ordered.remove(&self.entry_for(&id, old));
        }
        self.ordered.insert(self.entry_for(&id, doc.clone()));
        self.by_id.insert(id, doc);
    }

    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.by_id.get(id).map(|d| d.as_ref())
    }

    pub fn has(&self, id: &DocumentId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn remove(&mut self, id: &DocumentId) -> Option<Document> {
        let doc = self.by_id.remove(id)?;
        self.ordered.remove(&self.entry_for(id, doc.clone()));
        Some(Arc::try_unwrap(doc).unwrap_or_else(|arc| (*arc).clone()))
    }

    pub fn size(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn min_element_id(&self) -> Option<DocumentId> {
        self.ordered.iter().next().map(|e| e.id.clone())
    }

    pub fn max_element_id(&self) -> Option<DocumentId> {
        self.ordered.iter().next_back().map(|e| e.id.clone())
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.by_id.clear();
    }

    pub fn for_each(&self, mut f: impl FnMut(&DocumentId, &Document)) {
        for entry in &self.ordered {
            f(&entry.id, &entry.doc);
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.by_id.keys()
    }

    /// Compare `doc` against the element stored at `id` using this heap's
    /// comparator, without requiring `doc` to already live in the heap.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        (self.comparator())(a, b)
    }
}
