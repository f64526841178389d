pub mod method;
pub mod parser;
pub mod query;
pub mod status;
pub mod url;
pub mod version;

pub use method::Method;
pub use status::StatusCode;
pub use url::Url;
pub use version::Version;
