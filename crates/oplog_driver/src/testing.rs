//! Reference mock collaborators, gated behind the `testing` feature (and
//! always available to this crate's own tests). These are the concrete
//! stand-ins for the "out of scope" interfaces the driver depends on:
//! enough to drive the scenarios in spec.md §8 without a real storage
//! engine, oplog or multiplexer.

use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;
use futures::stream::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::types::{
    Document,
    DocumentId,
    DocFetcher,
    MatchResult,
    Matcher,
    Multiplexer,
    OplogEntry,
    OplogHandle,
    OplogNotification,
    QueryCursor,
    QueryRunner,
    Timestamp,
    WriteFence,
    WriteToken,
};

/// An in-memory collection, queryable and oplog-feedable, standing in for
/// the real storage engine + oplog reader pair.
pub struct FakeCollection {
    docs: Mutex<BTreeMap<DocumentId, Document>>,
    sender: mpsc::UnboundedSender<OplogNotification>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<OplogNotification>>>,
    comparator: Option<Arc<dyn Fn(&Document, &Document) -> std::cmp::Ordering + Send + Sync>>,
}

impl FakeCollection {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            docs: Mutex::new(BTreeMap::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            comparator: None,
        })
    }

    pub fn with_sort(
        comparator: Arc<dyn Fn(&Document, &Document) -> std::cmp::Ordering + Send + Sync>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            docs: Mutex::new(BTreeMap::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            comparator: Some(comparator),
        })
    }

    /// Inserts a document directly into storage (for seeding a collection
    /// before the driver's initial query runs) without emitting an oplog
    /// entry.
    pub fn seed(&self, id: DocumentId, doc: Document) {
        self.docs.lock().insert(id, doc);
    }

    /// Removes a document from storage without emitting an oplog entry, for
    /// simulating a write the oplog feed never delivered (e.g. one that
    /// landed only on a failed-over primary).
    pub fn remove_silently(&self, id: &DocumentId) {
        self.docs.lock().remove(id);
    }

    pub fn insert(&self, id: DocumentId, ts: Timestamp, doc: Document) {
        self.docs.lock().insert(id.clone(), doc.clone());
        let _ = self.sender.send(OplogNotification::Entry(OplogEntry::insert(id, ts, doc)));
    }

    pub fn delete(&self, id: DocumentId, ts: Timestamp) {
        self.docs.lock().remove(&id);
        let _ = self.sender.send(OplogNotification::Entry(OplogEntry::delete(id, ts)));
    }

    pub fn update(&self, id: DocumentId, ts: Timestamp, payload: crate::types::UpdatePayload) {
        {
            let mut docs = self.docs.lock();
            if let Some(doc) = docs.get_mut(&id) {
                match &payload {
                    crate::types::UpdatePayload::Replacement(r) => *doc = r.clone(),
                    crate::types::UpdatePayload::Modifier(m) => {
                        for (op, fields) in m {
                            if let Some(fields) = fields.as_object() {
                                match op.as_str() {
                                    "$set" => {
                                        for (k, v) in fields {
                                            doc.insert(k.clone(), v.clone());
                                        }
                                    },
                                    "$unset" => {
                                        for k in fields.keys() {
                                            doc.remove(k);
                                        }
                                    },
                                    _ => {},
                                }
                            }
                        }
                    },
                }
            }
        }
        let _ = self
            .sender
            .send(OplogNotification::Entry(OplogEntry::update(id, ts, payload)));
    }

    pub fn drop_collection(&self) {
        let _ = self.sender.send(OplogNotification::CollectionDropped);
    }
}

#[async_trait]
impl QueryRunner for FakeCollection {
    async fn run(&self, _limit: usize) -> anyhow::Result<Box<dyn QueryCursor>> {
        let mut docs: Vec<(DocumentId, Document)> =
            self.docs.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if let Some(cmp) = &self.comparator {
            let cmp = cmp.clone();
            docs.sort_by(|(_, a), (_, b)| cmp(a, b));
        }
        Ok(Box::new(FakeCursor { docs, offset: 0 }))
    }
}

#[async_trait]
impl DocFetcher for FakeCollection {
    async fn fetch(
        &self,
        _collection_name: &str,
        id: &DocumentId,
        _cache_key: Timestamp,
    ) -> anyhow::Result<Option<Document>> {
        Ok(self.docs.lock().get(id).cloned())
    }
}

#[async_trait]
impl OplogHandle for FakeCollection {
    fn subscribe(&self) -> Pin<Box<dyn Stream<Item = OplogNotification> + Send>> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .expect("FakeCollection::subscribe called more than once");
        Box::pin(UnboundedReceiverStream::new(receiver))
    }

    async fn wait_until_caught_up(&self) {
        // The fake feed is delivered in-process over an unbounded channel;
        // by the time this is awaited every previously-sent notification
        // has already been enqueued, so there's nothing to wait for.
    }
}

struct FakeCursor {
    docs: Vec<(DocumentId, Document)>,
    offset: usize,
}

#[async_trait]
impl QueryCursor for FakeCursor {
    async fn next_batch(&mut self, limit: usize) -> anyhow::Result<Vec<(DocumentId, Document)>> {
        let end = (self.offset + limit).min(self.docs.len());
        let batch = self.docs[self.offset..end].to_vec();
        self.offset = end;
        Ok(batch)
    }
}

/// A matcher over a simple equality selector (`{field: value}`), the
/// minimum needed to exercise the scenarios in spec.md §8.
pub struct EqualityMatcher {
    field: String,
    value: serde_json::Value,
}

impl EqualityMatcher {
    pub fn new(field: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

impl Matcher for EqualityMatcher {
    fn document_matches(&self, doc: &Document) -> MatchResult {
        MatchResult {
            result: doc.get(&self.field) == Some(&self.value),
        }
    }

    fn can_become_true_by_modifier(&self, modifier: &Document) -> bool {
        modifier.values().any(|op| {
            op.as_object()
                .map(|fields| fields.contains_key(&self.field))
                .unwrap_or(false)
        })
    }

    fn publish_projection(&self, doc: &Document) -> Document {
        doc.clone()
    }

    fn shared_projection(&self, doc: &Document) -> Document {
        doc.clone()
    }

    fn has_where(&self) -> bool {
        false
    }

    fn has_geo_query(&self) -> bool {
        false
    }
}

/// Records every callback it receives, for scenario assertions.
#[derive(Default)]
pub struct RecordingMultiplexer {
    pub events: Mutex<Vec<MuxEvent>>,
    flush_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MuxEvent {
    Added(DocumentId, Document),
    Changed(DocumentId, Document),
    Removed(DocumentId),
    Ready,
}

impl RecordingMultiplexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs every callback registered via `on_flush` since the last call.
    pub fn flush(&self) {
        let callbacks = std::mem::take(&mut *self.flush_callbacks.lock());
        for cb in callbacks {
            cb();
        }
    }
}

impl Multiplexer for RecordingMultiplexer {
    fn added(&self, id: &DocumentId, fields: Document) {
        self.events.lock().push(MuxEvent::Added(id.clone(), fields));
    }

    fn changed(&self, id: &DocumentId, diff: Document) {
        self.events.lock().push(MuxEvent::Changed(id.clone(), diff));
    }

    fn removed(&self, id: &DocumentId) {
        self.events.lock().push(MuxEvent::Removed(id.clone()));
    }

    fn ready(&self) {
        self.events.lock().push(MuxEvent::Ready);
    }

    fn on_flush(&self, cb: Box<dyn FnOnce() + Send>) {
        self.flush_callbacks.lock().push(cb);
    }
}

/// A write fence that hands out tokens recording whether they were
/// committed, for scenario assertions.
#[derive(Default)]
pub struct FakeWriteFence {
    committed_count: Arc<Mutex<usize>>,
}

impl FakeWriteFence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn committed_count(&self) -> usize {
        *self.committed_count.lock()
    }
}

impl WriteFence for FakeWriteFence {
    fn begin_write(&self) -> Box<dyn WriteToken> {
        Box::new(FakeWriteToken {
            committed_count: self.committed_count.clone(),
        })
    }
}

struct FakeWriteToken {
    committed_count: Arc<Mutex<usize>>,
}

impl WriteToken for FakeWriteToken {
    fn committed(self: Box<Self>) {
        *self.committed_count.lock() += 1;
    }
}
