//! Zero-copy URL handling: query-string stripping and the handler's
//! narrow post-strip shape check.
//!
//! Character-class, `..`, and `//` validation do NOT live here any more
//! (`original_source/http_handler.c`'s `validate_url` runs those inside
//! `on_url_callback`, aborting the parse on failure rather than
//! producing a response): that check now happens while the URL is still
//! being accumulated, in `server::worker`'s `UrlSink::on_url`, so a
//! connection that sends `..`/`//`/illegal characters is closed without
//! a response rather than answered with 400. What's left here mirrors
//! only `handle_request_and_prepare_response`'s post-query-strip check
//! (`http_handler.c:152`): empty, or missing its leading slash.

/// A request target, already known to be free of illegal characters and
/// `..`/`//` segments by the time it reaches here, split into path and
/// query. `path()` is the part used for route lookup; the query string,
/// if any, is reachable via `query()` but is never required by any
/// route this engine serves.
#[derive(Debug, Clone, Copy)]
pub struct Url<'a> {
    path: &'a [u8],
    query: Option<&'a [u8]>,
}

/// Why a URL was rejected. Both map to "400 Bad Request, keep-alive
/// forced off" per the handler policy in `SPEC_FULL.md` §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlError {
    Empty,
    MissingLeadingSlash,
}

impl<'a> Url<'a> {
    /// Strips the query string and checks the remaining path's shape.
    pub fn parse(target: &'a [u8]) -> Result<Self, UrlError> {
        let (path, query) = match crate::bytes::find_char(target, b'?') {
            Some(idx) => (&target[..idx], Some(&target[idx + 1..])),
            None => (target, None),
        };

        if path.is_empty() {
            return Err(UrlError::Empty);
        }
        if path[0] != b'/' {
            return Err(UrlError::MissingLeadingSlash);
        }

        Ok(Url { path, query })
    }

    #[inline]
    pub fn path(&self) -> &'a [u8] {
        self.path
    }

    #[inline]
    pub fn query(&self) -> Option<&'a [u8]> {
        self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_query_string() {
        let url = Url::parse(b"/bonuses?x=1").unwrap();
        assert_eq!(url.path(), b"/bonuses");
        assert_eq!(url.query(), Some(&b"x=1"[..]));
    }

    #[test]
    fn plain_path_has_no_query() {
        let url = Url::parse(b"/health").unwrap();
        assert_eq!(url.path(), b"/health");
        assert_eq!(url.query(), None);
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(Url::parse(b""), Err(UrlError::Empty));
    }

    #[test]
    fn rejects_missing_leading_slash() {
        assert_eq!(Url::parse(b"bonuses"), Err(UrlError::MissingLeadingSlash));
    }

    #[test]
    fn query_stripped_before_shape_check_so_dot_dot_in_query_is_irrelevant_here() {
        // `..`/`//`/illegal-character rejection happens upstream, in
        // `server::worker`'s URL accumulation callback, before a target
        // ever reaches `Url::parse` — see that module's tests.
        let url = Url::parse(b"/bonuses?../x").unwrap();
        assert_eq!(url.path(), b"/bonuses");
    }

    #[test]
    fn boundary_255_accepted_256_rejected_at_caller() {
        // Url::parse itself has no length cap; the 256-byte cap is
        // enforced by the parser while accumulating URL bytes (see
        // http/parser.rs), matching the record's inline 256-byte field.
        let ok = vec![b'/'; 1]
            .into_iter()
            .chain(std::iter::repeat(b'a').take(254))
            .collect::<Vec<u8>>();
        assert_eq!(ok.len(), 255);
        assert!(Url::parse(&ok).is_ok());
    }
}
