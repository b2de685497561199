//! Host address parsing: `wsync://host[:port]`, `host:port` or bare `host`

use std::fmt;

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

pub fn parse_server_addr(input: &str) -> Option<ServerAddr> {
    let s = input.trim();
    let rest = match s.find("://") {
        Some(i) if s[..i].eq_ignore_ascii_case("wsync") => &s[i + 3..],
        Some(_) => return None,
        None => s,
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return None;
    }

    // [v6]:port
    if let Some(inner) = rest.strip_prefix('[') {
        let (host, tail) = inner.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return None,
        };
        return Some(ServerAddr {
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => (h, p.parse().ok()?),
        None => (rest, DEFAULT_PORT),
    };
    if host.is_empty() || host.contains(':') || host.contains('/') {
        return None;
    }
    Some(ServerAddr {
        host: host.to_string(),
        port,
    })
}
