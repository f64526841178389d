//! Status codes this engine ever emits.

/// The engine's fixed output vocabulary of status codes. Only the
/// statuses the handler in `SPEC_FULL.md` §4.6 can produce are
/// represented; this is not a general-purpose status code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl StatusCode {
    #[inline]
    pub const fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::InternalServerError => 500,
        }
    }

    #[inline]
    pub const fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }

    /// Renders `"HTTP/1.1 200 OK\r\n"` for the given wire version.
    #[inline]
    pub fn status_line(self, version: super::Version) -> &'static str {
        match (version, self) {
            (super::Version::Http11, StatusCode::Ok) => "HTTP/1.1 200 OK\r\n",
            (super::Version::Http11, StatusCode::BadRequest) => "HTTP/1.1 400 Bad Request\r\n",
            (super::Version::Http11, StatusCode::NotFound) => "HTTP/1.1 404 Not Found\r\n",
            (super::Version::Http11, StatusCode::MethodNotAllowed) => {
                "HTTP/1.1 405 Method Not Allowed\r\n"
            }
            (super::Version::Http11, StatusCode::InternalServerError) => {
                "HTTP/1.1 500 Internal Server Error\r\n"
            }
            (super::Version::Http10, StatusCode::Ok) => "HTTP/1.0 200 OK\r\n",
            (super::Version::Http10, StatusCode::BadRequest) => "HTTP/1.0 400 Bad Request\r\n",
            (super::Version::Http10, StatusCode::NotFound) => "HTTP/1.0 404 Not Found\r\n",
            (super::Version::Http10, StatusCode::MethodNotAllowed) => {
                "HTTP/1.0 405 Method Not Allowed\r\n"
            }
            (super::Version::Http10, StatusCode::InternalServerError) => {
                "HTTP/1.0 500 Internal Server Error\r\n"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Version;

    #[test]
    fn status_line_matches_version() {
        assert_eq!(
            StatusCode::NotFound.status_line(Version::Http11),
            "HTTP/1.1 404 Not Found\r\n"
        );
        assert_eq!(
            StatusCode::Ok.status_line(Version::Http10),
            "HTTP/1.0 200 OK\r\n"
        );
    }

    #[test]
    fn codes_match_reasons() {
        assert_eq!(StatusCode::MethodNotAllowed.code(), 405);
        assert_eq!(StatusCode::MethodNotAllowed.reason(), "Method Not Allowed");
    }
}
