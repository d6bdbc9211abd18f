//! Intercept-or-relay decision for CONNECT destinations

use crate::error::{Error, Result};
use std::fmt;
use std::net::Ipv6Addr;

/// What to do with a CONNECT destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Terminate TLS locally and route decrypted requests
    Intercept,
    /// Copy bytes to the dialed destination untouched
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatch {
    Any,
    Exact(String),
    /// Subdomains of the stored suffix, not the suffix itself
    Subdomain(String),
}

/// One `intercept.hosts` entry: `*`, `*.example.com` or `example.com`,
/// each optionally followed by `:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    host: HostMatch,
    port: Option<u16>,
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid intercept pattern '{}'", pattern));
        let pattern = pattern.trim();

        let (host, port) = if let Some(rest) = pattern.strip_prefix('[') {
            // `[v6]` or `[v6]:port`
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            let port = match rest {
                "" => None,
                _ => {
                    let port = rest.strip_prefix(':').ok_or_else(invalid)?;
                    Some(port.parse::<u16>().map_err(|_| invalid())?)
                }
            };
            (host, port)
        } else {
            match pattern.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => {
                    let port = port.parse::<u16>().map_err(|_| invalid())?;
                    (host, Some(port))
                }
                _ => (pattern, None),
            }
        };

        let host = canonical_host(host);
        let host = if host == "*" {
            HostMatch::Any
        } else if let Some(suffix) = host.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(invalid());
            }
            HostMatch::Subdomain(suffix.to_string())
        } else {
            if host.is_empty() || host.contains('*') {
                return Err(invalid());
            }
            HostMatch::Exact(host)
        };

        Ok(Self { host, port })
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        if self.port.map_or(false, |p| p != port) {
            return false;
        }
        let host = canonical_host(host);
        match &self.host {
            HostMatch::Any => true,
            HostMatch::Exact(expected) => host == *expected,
            HostMatch::Subdomain(suffix) => host
                .strip_suffix(suffix.as_str())
                .map_or(false, |prefix| prefix.len() > 1 && prefix.ends_with('.')),
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            HostMatch::Any => write!(f, "*")?,
            HostMatch::Exact(host) if host.contains(':') => write!(f, "[{}]", host)?,
            HostMatch::Exact(host) => write!(f, "{}", host)?,
            HostMatch::Subdomain(suffix) => write!(f, "*.{}", suffix)?,
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Lowercase without a trailing dot; IPv6 literals in their compressed form
fn canonical_host(host: &str) -> String {
    match host.parse::<Ipv6Addr>() {
        Ok(addr) => addr.to_string(),
        Err(_) => host.trim_end_matches('.').to_ascii_lowercase(),
    }
}

/// Ordered host patterns; an empty policy relays everything
#[derive(Debug, Clone, Default)]
pub struct InterceptPolicy {
    patterns: Vec<HostPattern>,
}

impl InterceptPolicy {
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| HostPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn decide(&self, host: &str, port: u16) -> Decision {
        if self.patterns.iter().any(|p| p.matches(host, port)) {
            Decision::Intercept
        } else {
            Decision::Relay
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[HostPattern] {
        &self.patterns
    }
}
