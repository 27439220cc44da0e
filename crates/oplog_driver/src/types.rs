//! Data model and external-collaborator traits.
//!
//! Everything in this module other than the driver's own state is an
//! "out of scope" collaborator per the specification: the oplog reader, the
//! document fetcher, the multiplexer, the matcher/projection engine and the
//! write fence are all owned by the caller. The driver only depends on the
//! trait surface here.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::Value as Json;

/// Opaque document id. The real id encoding belongs to the out-of-scope
/// storage layer; the driver only ever compares and hashes ids.
pub type DocumentId = String;

/// A cached document: the shared-projection view the driver keeps around.
pub type Document = BTreeMap<String, Json>;

/// Oplog timestamp, doubling as the document fetcher's cache/generation key.
pub type Timestamp = u64;

/// A compiled comparator derived from `CursorDescription::options.sort`.
/// Ties are expected to be broken by id by callers of `IndexedHeap`.
pub type Comparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Sort/limit/skip/fields/transform options for a cursor. `transform` is
/// represented only as a marker bool (applied by the out-of-scope
/// multiplexer) since the driver never runs it.
#[derive(Clone, Debug, Default)]
pub struct CursorOptions {
    pub sort: Option<Comparator>,
    pub limit: usize,
    pub skip: usize,
    pub has_fields_projection: bool,
    pub has_transform: bool,
}

impl CursorOptions {
    pub fn is_limited(&self) -> bool {
        self.limit > 0
    }
}

/// Immutable description of the query being observed.
#[derive(Clone)]
pub struct CursorDescription {
    pub collection_name: String,
    pub selector_disables_oplog: bool,
    pub options: CursorOptions,
}

/// The kind of operation carried by an oplog entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

/// Whether an update entry is a full replacement or a modifier document.
#[derive(Clone, Debug)]
pub enum UpdatePayload {
    /// A full replacement document (no `$set`/`$unset` top-level keys).
    Replacement(Document),
    /// A modifier document, e.g. `{"$set": {...}, "$unset": {...}}`.
    Modifier(Document),
}

/// A single operation-log entry, filtered to the collection/selector this
/// driver cares about.
#[derive(Clone, Debug)]
pub struct OplogEntry {
    pub op: OpKind,
    pub id: DocumentId,
    pub ts: Timestamp,
    /// Present for insert/update; `None` for delete.
    pub insert_doc: Option<Document>,
    pub update_payload: Option<UpdatePayload>,
}

impl OplogEntry {
    pub fn delete(id: DocumentId, ts: Timestamp) -> Self {
        Self {
            op: OpKind::Delete,
            id,
            ts,
            insert_doc: None,
            update_payload: None,
        }
    }

    pub fn insert(id: DocumentId, ts: Timestamp, doc: Document) -> Self {
        Self {
            op: OpKind::Insert,
            id,
            ts,
            insert_doc: Some(doc),
            update_payload: None,
        }
    }

    pub fn update(id: DocumentId, ts: Timestamp, payload: UpdatePayload) -> Self {
        Self {
            op: OpKind::Update,
            id,
            ts,
            insert_doc: None,
            update_payload: Some(payload),
        }
    }
}

/// A notification delivered by the oplog reader: either a filtered entry, or
/// a collection-drop signal.
#[derive(Clone, Debug)]
pub enum OplogNotification {
    Entry(OplogEntry),
    CollectionDropped,
}

/// Result of a matcher's predicate check.
pub struct MatchResult {
    pub result: bool,
}

/// Compiled selector predicate, the projection engine, and the modifier
/// applicability oracle. All out of scope: given/provided by the caller.
pub trait Matcher: Send + Sync {
    fn document_matches(&self, doc: &Document) -> MatchResult;

    /// Could applying `modifier` possibly make the selector become true for a
    /// document it previously didn't match? A conservative `true` is always
    /// safe; only `false` need be exact.
    fn can_become_true_by_modifier(&self, modifier: &Document) -> bool;

    /// Project `doc` down to the fields exposed to subscribers.
    fn publish_projection(&self, doc: &Document) -> Document;

    /// Project `doc` down to the publish projection unioned with
    /// selector-relevant fields (what the driver caches).
    fn shared_projection(&self, doc: &Document) -> Document;

    fn has_where(&self) -> bool;
    fn has_geo_query(&self) -> bool;
}

/// A cursor over an initial/poll query's results, in sort order.
#[async_trait]
pub trait QueryCursor: Send {
    /// Fetch up to `limit` more `(id, doc)` pairs (already shared-projected).
    /// Returns fewer than `limit` iff the cursor is exhausted.
    async fn next_batch(&mut self, limit: usize) -> anyhow::Result<Vec<(DocumentId, Document)>>;
}

/// Runs the initial/poll queries. Out of scope: owns the actual collection
/// scan/sort/limit execution; the driver only consumes the resulting cursor.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run(&self, limit: usize) -> anyhow::Result<Box<dyn QueryCursor>>;
}

/// Point-fetcher for resolving ambiguous updates by id.
#[async_trait]
pub trait DocFetcher: Send + Sync {
    /// Never invoked synchronously with respect to the caller; always
    /// resolves on a later poll.
    async fn fetch(
        &self,
        collection_name: &str,
        id: &DocumentId,
        cache_key: Timestamp,
    ) -> anyhow::Result<Option<Document>>;
}

/// Fan-out target for `added`/`changed`/`removed`/`ready`/flush notifications.
pub trait Multiplexer: Send + Sync {
    fn added(&self, id: &DocumentId, fields: Document);
    fn changed(&self, id: &DocumentId, diff: Document);
    fn removed(&self, id: &DocumentId);
    fn ready(&self);

    /// Registers `cb` to run after every subscriber has observed every
    /// change emitted before this call.
    fn on_flush(&self, cb: Box<dyn FnOnce() + Send>);
}

/// A write-fence token captured while the driver isn't yet steady.
pub trait WriteToken: Send {
    fn committed(self: Box<Self>);
}

/// Coordination primitive that delays a write ack until all live
/// subscribers have observed its effect.
pub trait WriteFence: Send + Sync {
    fn begin_write(&self) -> Box<dyn WriteToken>;
}

/// `spec.md` §9 open question (b): a caller-owned signal that flips to
/// `true` on a primary-failover event the driver should treat exactly like
/// a collection drop. The driver only selects on it; detecting failover
/// remains the caller's responsibility.
pub type PrimaryFailoverSignal = tokio::sync::watch::Receiver<bool>;

/// Handle to the live oplog feed: filtered per-query notifications plus a
/// way to wait for the reader to have drained everything observed so far.
///
/// `subscribe` is the Rust realization of the spec's
/// `onOplogEntry(filter, cb)`: rather than registering a callback, the
/// caller hands the driver a stream already filtered to this cursor's
/// collection/selector, and the driver's main loop treats each item as a
/// non-suspending critical callback.
#[async_trait]
pub trait OplogHandle: Send + Sync {
    fn subscribe(&self) -> Pin<Box<dyn Stream<Item = OplogNotification> + Send>>;

    /// Suspends until every oplog entry the reader has observed up to this
    /// call has been delivered to `subscribe`'s stream.
    async fn wait_until_caught_up(&self);
}
