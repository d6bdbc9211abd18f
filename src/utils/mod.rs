//! Utility functions for the proxy server

pub mod http;
pub mod url;

pub use self::http::*;
pub use self::url::*;
