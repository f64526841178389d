//! The fixed, immutable route table (`spec.md` §6). No teacher analogue:
//! `maker_web` is a generic dynamic-dispatch framework, while this
//! engine serves exactly the handful of payloads named in the
//! specification's worked examples and nothing else — dynamic route
//! registration is explicitly out of scope.

/// `(path, body)` pairs, matched by exact byte equality against the
/// request target after its query string has been stripped.
pub const ROUTES: &[(&str, &[u8])] = &[
    ("/bonuses", br#"{"bonuses":[10,20,30]}"#),
    ("/settings", br#"{"settings":{"theme":"dark"}}"#),
    ("/games", br#"{"games":["chess","poker"]}"#),
    ("/health", br#"{"status":"OK"}"#),
];

/// A thin, `'static` view over [`ROUTES`]. Exists mainly so
/// [`crate::handler::RouteTableHandler`] takes something it can hold a
/// reference to rather than reaching for the module-level const
/// directly, keeping the handler testable against a smaller table.
pub struct RouteTable {
    routes: &'static [(&'static str, &'static [u8])],
}

impl RouteTable {
    pub const fn new() -> Self {
        RouteTable { routes: ROUTES }
    }

    /// Looks up `path` (already query-stripped) against the table.
    pub fn lookup(&self, path: &[u8]) -> Option<&'static [u8]> {
        self.routes
            .iter()
            .find(|(route, _)| route.as_bytes() == path)
            .map(|&(_, body)| body)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_route_resolves_to_its_body() {
        let table = RouteTable::new();
        assert_eq!(table.lookup(b"/health"), Some(br#"{"status":"OK"}"#.as_slice()));
    }

    #[test]
    fn unknown_route_resolves_to_none() {
        let table = RouteTable::new();
        assert_eq!(table.lookup(b"/missing"), None);
    }

    #[test]
    fn lookup_is_exact_no_trailing_slash_normalisation() {
        let table = RouteTable::new();
        assert_eq!(table.lookup(b"/health/"), None);
    }
}
