//! Zero-copy URL query string parser.
//!
//! Carried over from the teacher's query parser largely unchanged: no
//! route this engine serves depends on query parameters, but stripping
//! and optionally inspecting the query string is still a capability the
//! handler may reach for, so it stays as a small, self-contained utility
//! rather than being deleted outright.

use memchr::memchr;
use std::collections::HashMap;

pub struct Query;

impl Query {
    /// Parses a query string (with or without a leading `?`) into a new
    /// collection, honoring a hard cap on the number of parameters.
    #[inline]
    pub fn parse<'a, C: QueryCollector<'a>>(query: &'a [u8], limit: usize) -> Result<C, Error> {
        let mut result = C::with_capacity(limit);
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Parses into an existing collection, appending.
    pub fn parse_into<'a, C: QueryCollector<'a>>(
        result: &mut C,
        query: &'a [u8],
        limit: usize,
    ) -> Result<(), Error> {
        let data = match query.first().ok_or(Error::Empty)? {
            b'?' => &query[1..],
            _ => query,
        };

        let mut start = 0;
        while start < data.len() {
            if result.length() >= limit {
                return Err(Error::OverLimit(limit));
            }

            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            let index = memchr(b'=', &data[start..end]).unwrap_or(end - start);
            let split_index = start + index;

            let key = &data[start..split_index];
            let value = match split_index < end {
                true => &data[split_index + 1..end],
                false => b"",
            };

            result.add_param(key, value);
            start = end + 1;
        }

        Ok(())
    }
}

pub trait QueryCollector<'a>
where
    Self: Sized,
{
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]);
    fn length(&self) -> usize;
    fn with_capacity(capacity: usize) -> Self;
}

impl<'a> QueryCollector<'a> for Vec<(&'a [u8], &'a [u8])> {
    #[inline]
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]) {
        self.push((key, value));
    }
    #[inline]
    fn length(&self) -> usize {
        self.len()
    }
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }
}

impl<'a> QueryCollector<'a> for HashMap<&'a [u8], &'a [u8]> {
    #[inline]
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]) {
        self.insert(key, value);
    }
    #[inline]
    fn length(&self) -> usize {
        self.len()
    }
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity(capacity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("query parameter limit exceeded: limit={0}")]
    OverLimit(usize),
    #[error("query string is empty or contains no parameters")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: (&[u8], &[u8])) -> (&str, &str) {
        (
            std::str::from_utf8(v.0).unwrap(),
            std::str::from_utf8(v.1).unwrap(),
        )
    }

    #[test]
    fn basic() {
        for line in ["a=1&b=2", "?a=1&b=2"] {
            let params: Vec<(&[u8], &[u8])> = Query::parse(line.as_bytes(), 8).unwrap();
            assert_eq!(params.len(), 2);
            assert_eq!(s(params[0]), ("a", "1"));
            assert_eq!(s(params[1]), ("b", "2"));
        }
    }

    #[test]
    fn limit_error() {
        assert_eq!(
            Query::parse::<Vec<(&[u8], &[u8])>>(b"a&a", 1),
            Err(Error::OverLimit(1))
        );
    }

    #[test]
    fn empty_error() {
        assert_eq!(
            Query::parse::<Vec<(&[u8], &[u8])>>(b"", 10),
            Err(Error::Empty)
        );
    }
}
