//! Component D: the document classifier, `handleDoc`.
//!
//! Reclassifies an id after a fetch or a direct-apply from the oplog entry
//! handler, per the decision table in `spec.md` §4.D.

use std::cmp::Ordering;

use crate::{
    matching::MatchingSet,
    types::{
        Document,
        DocumentId,
        Matcher,
        Multiplexer,
    },
};

/// `handleDoc(id, newDoc?)` from spec.md §4.D.
pub fn handle_doc(
    set: &mut MatchingSet,
    matcher: &dyn Matcher,
    id: DocumentId,
    new_doc: Option<Document>,
    mux: &dyn Multiplexer,
) -> anyhow::Result<()> {
    let matches_now = new_doc
        .as_ref()
        .map(|doc| matcher.document_matches(doc).result)
        .unwrap_or(false);
    let published_before = set.published().has(&id);
    let buffered_before = set.unpublished_buffer().has(&id);
    let cached_before = published_before || buffered_before;

    match (matches_now, cached_before) {
        (true, false) => {
            let doc = new_doc.expect("matches_now implies new_doc is Some");
            set.add_matching(id, doc, mux)?;
        },
        (false, true) => {
            set.remove_matching(&id, mux)?;
        },
        (false, false) => {
            // No-op: the document never matched and isn't cached.
        },
        (true, true) if published_before => {
            let doc = new_doc.expect("matches_now implies new_doc is Some");
            handle_published_update(set, id, doc, mux)?;
        },
        (true, true) => {
            // bufferedBefore
            let doc = new_doc.expect("matches_now implies new_doc is Some");
            handle_buffered_update(set, id, doc, mux)?;
        },
    }
    Ok(())
}

fn handle_published_update(
    set: &mut MatchingSet,
    id: DocumentId,
    new_doc: Document,
    mux: &dyn Multiplexer,
) -> anyhow::Result<()> {
    let min_buffered = set
        .unpublished_buffer()
        .min_element_id()
        .map(|mid| set.unpublished_buffer().get(&mid).expect("min exists").clone());

    let stays_published = !set.is_limited()
        || min_buffered
            .as_ref()
            .map(|min_doc| compare(set, &new_doc, min_doc) != Ordering::Greater)
            .unwrap_or(true);

    if stays_published {
        set.change_published(&id, new_doc, mux)?;
        return Ok(());
    }

    set.remove_published(&id, mux)?;
    let max_buffered = set
        .unpublished_buffer()
        .max_element_id()
        .map(|mid| set.unpublished_buffer().get(&mid).expect("max exists").clone());
    let fits_buffer = set.safe_append_to_buffer()
        || max_buffered
            .as_ref()
            .map(|max_doc| compare(set, &new_doc, max_doc) != Ordering::Greater)
            .unwrap_or(false);
    if fits_buffer {
        set.add_buffered(id, new_doc);
    } else {
        set.set_safe_append_to_buffer(false);
    }
    Ok(())
}

fn handle_buffered_update(
    set: &mut MatchingSet,
    id: DocumentId,
    new_doc: Document,
    mux: &dyn Multiplexer,
) -> anyhow::Result<()> {
    set.remove_buffered(&id);

    let max_published = set
        .published()
        .max_element_id()
        .map(|mid| set.published().get(&mid).expect("max exists").clone());
    let promotes = max_published
        .as_ref()
        .map(|max_doc| compare(set, &new_doc, max_doc) == Ordering::Less)
        .unwrap_or(true);

    if promotes {
        set.add_published(id, new_doc, mux)?;
        return Ok(());
    }

    let max_buffered = set
        .unpublished_buffer()
        .max_element_id()
        .map(|mid| set.unpublished_buffer().get(&mid).expect("max exists").clone());
    let fits_buffer = set.safe_append_to_buffer()
        || max_buffered
            .as_ref()
            .map(|max_doc| compare(set, &new_doc, max_doc) != Ordering::Greater)
            .unwrap_or(false);
    if fits_buffer {
        set.add_buffered(id, new_doc);
    } else {
        set.set_safe_append_to_buffer(false);
    }
    Ok(())
}

fn compare(set: &MatchingSet, a: &Document, b: &Document) -> Ordering {
    set.compare_docs(a, b)
}
