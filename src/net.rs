// SPDX-License-Identifier: MPL-2.0

//! Network addresses: viewer destinations and control listeners

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use tracing::error;

/// UDP destination of the egress branch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Control plane listen address such as `https://0.0.0.0:5443`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddr {
    pub scheme: Scheme,
    pub addr: SocketAddr,
}

impl ListenAddr {
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.addr)
    }
}

impl FromStr for ListenAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = s.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(format!("listen url {s} must start with http:// or https://"));
        };

        let addr = rest
            .trim_end_matches('/')
            .parse::<SocketAddr>()
            .map_err(|e| format!("listen url {s} has an invalid address: {e}"))?;

        Ok(Self { scheme, addr })
    }
}

/// Parse listen URLs, dropping the ones that do not parse
pub fn parse_listeners<S: AsRef<str>>(urls: &[S]) -> Vec<ListenAddr> {
    urls.iter()
        .filter_map(|url| match url.as_ref().parse::<ListenAddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                error!(error = %e, "Ignoring listen address");
                None
            }
        })
        .collect()
}
