//! Authority and URL helpers

use crate::error::{Error, Result};
use hyper::http::uri::Authority;

/// Port assumed when a CONNECT target omits one
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Parse host and port from a CONNECT target.
///
/// IPv6 literals are returned without brackets.
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let authority: Authority = target.trim().parse()?;

    if authority.as_str().contains('@') {
        return Err(Error::Config(format!(
            "CONNECT target must not carry credentials: {}",
            target
        )));
    }

    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return Err(Error::InvalidName(target.to_string()));
    }

    let port = match authority.port() {
        Some(port) => port
            .as_str()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::InvalidName(target.to_string()))?,
        None => DEFAULT_TLS_PORT,
    };

    Ok((host, port))
}

/// Join host and port into a dialable address string
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
