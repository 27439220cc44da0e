//! Component I: static admissibility check, spec.md §4.I.
//!
//! Answers whether a cursor can be served by oplog tailing at all, before a
//! driver is ever constructed. Rejections here are not errors: they mean the
//! caller should fall back to poll-and-diff observation instead.

use crate::types::{
    CursorDescription,
    Matcher,
};

/// Why a cursor was rejected, for logging/diagnostics at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inadmissible {
    OplogDisabled,
    NonZeroSkip,
    LimitWithoutSort,
    UnprojectableFields,
    HasWhereSelector,
    HasGeoSelector,
}

impl std::fmt::Display for Inadmissible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Inadmissible::OplogDisabled => "cursor opted out of oplog tailing",
            Inadmissible::NonZeroSkip => "skip > 0 is unsupported",
            Inadmissible::LimitWithoutSort => "limit without a deterministic sort is unsupported",
            Inadmissible::UnprojectableFields => "projection cannot be expressed through the matcher",
            Inadmissible::HasWhereSelector => "$where selectors are unsupported",
            Inadmissible::HasGeoSelector => "geo selectors are unsupported",
        };
        f.write_str(msg)
    }
}

/// `spec.md` §4.I's static admissibility check. `fields_projectable` stands
/// in for "projection-compile errors of the 'unsupported operator' kind":
/// the caller is expected to have already attempted to compile the
/// projection through the matcher and report whether that succeeded.
pub fn check_admissible(
    cursor: &CursorDescription,
    matcher: &dyn Matcher,
    fields_projectable: bool,
) -> Result<(), Inadmissible> {
    if cursor.selector_disables_oplog {
        return Err(Inadmissible::OplogDisabled);
    }
    if cursor.options.skip > 0 {
        return Err(Inadmissible::NonZeroSkip);
    }
    if cursor.options.is_limited() && cursor.options.sort.is_none() {
        return Err(Inadmissible::LimitWithoutSort);
    }
    if cursor.options.has_fields_projection && !fields_projectable {
        return Err(Inadmissible::UnprojectableFields);
    }
    if matcher.has_where() {
        return Err(Inadmissible::HasWhereSelector);
    }
    if matcher.has_geo_query() {
        return Err(Inadmissible::HasGeoSelector);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::types::{
        CursorOptions,
        Document,
        MatchResult,
    };

    use super::*;

    struct AlwaysMatcher {
        has_where: bool,
        has_geo: bool,
    }

    impl Matcher for AlwaysMatcher {
        fn document_matches(&self, _doc: &Document) -> MatchResult {
            MatchResult { result: true }
        }

        fn can_become_true_by_modifier(&self, _modifier: &Document) -> bool {
            true
        }

        fn publish_projection(&self, doc: &Document) -> Document {
            doc.clone()
        }

        fn shared_projection(&self, doc: &Document) -> Document {
            doc.clone()
        }

        fn has_where(&self) -> bool {
            self.has_where
        }

        fn has_geo_query(&self) -> bool {
            self.has_geo
        }
    }

    fn cursor(disables_oplog: bool, skip: usize, limit: usize, sorted: bool) -> CursorDescription {
        CursorDescription {
            collection_name: "things".to_string(),
            selector_disables_oplog: disables_oplog,
            options: CursorOptions {
                sort: sorted.then(|| Arc::new(|_: &Document, _: &Document| std::cmp::Ordering::Equal) as _),
                limit,
                skip,
                has_fields_projection: false,
                has_transform: false,
            },
        }
    }

    #[test]
    fn accepts_plain_cursor() {
        let matcher = AlwaysMatcher { has_where: false, has_geo: false };
        let cursor = cursor(false, 0, 0, false);
        assert_eq!(check_admissible(&cursor, &matcher, true), Ok(()));
    }

    #[test]
    fn rejects_disabled_oplog() {
        let matcher = AlwaysMatcher { has_where: false, has_geo: false };
        let cursor = cursor(true, 0, 0, false);
        assert_eq!(check_admissible(&cursor, &matcher, true), Err(Inadmissible::OplogDisabled));
    }

    #[test]
    fn rejects_skip() {
        let matcher = AlwaysMatcher { has_where: false, has_geo: false };
        let cursor = cursor(false, 1, 0, false);
        assert_eq!(check_admissible(&cursor, &matcher, true), Err(Inadmissible::NonZeroSkip));
    }

    #[test]
    fn rejects_limit_without_sort() {
        let matcher = AlwaysMatcher { has_where: false, has_geo: false };
        let cursor = cursor(false, 0, 10, false);
        assert_eq!(check_admissible(&cursor, &matcher, true), Err(Inadmissible::LimitWithoutSort));
    }

    #[test]
    fn accepts_limit_with_sort() {
        let matcher = AlwaysMatcher { has_where: false, has_geo: false };
        let cursor = cursor(false, 0, 10, true);
        assert_eq!(check_admissible(&cursor, &matcher, true), Ok(()));
    }

    #[test]
    fn rejects_where_and_geo() {
        let cursor = cursor(false, 0, 0, false);
        let where_matcher = AlwaysMatcher { has_where: true, has_geo: false };
        assert_eq!(
            check_admissible(&cursor, &where_matcher, true),
            Err(Inadmissible::HasWhereSelector)
        );
        let geo_matcher = AlwaysMatcher { has_where: false, has_geo: true };
        assert_eq!(
            check_admissible(&cursor, &geo_matcher, true),
            Err(Inadmissible::HasGeoSelector)
        );
    }
}
