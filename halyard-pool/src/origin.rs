//! Origin keys.
//!
//! A pool serves exactly one origin. The origin is carried for logging and
//! handed to the delegate on shutdown; pools for different origins are
//! multiplexed by a layer above this crate.

use std::fmt;

/// URL scheme of an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// The default port for this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Https => f.write_str("https"),
        }
    }
}

/// The (scheme, host, port) triple identifying one pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    /// URL scheme.
    pub scheme: Scheme,
    /// Host name or address.
    pub host: String,
    /// Port. Defaults to the scheme's well-known port in the constructors.
    pub port: u16,
}

impl Origin {
    /// Create an origin with an explicit port.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Create an `http` origin on the default port.
    pub fn http(host: impl Into<String>) -> Self {
        Self::new(Scheme::Http, host, Scheme::Http.default_port())
    }

    /// Create an `https` origin on the default port.
    pub fn https(host: impl Into<String>) -> Self {
        Self::new(Scheme::Https, host, Scheme::Https.default_port())
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        assert_eq!(Origin::http("example.com").port, 80);
        assert_eq!(Origin::https("example.com").port, 443);
    }

    #[test]
    fn test_display() {
        let origin = Origin::new(Scheme::Https, "api.example.com", 8443);
        assert_eq!(origin.to_string(), "https://api.example.com:8443");
    }

    #[test]
    fn test_equality() {
        assert_eq!(Origin::http("a"), Origin::new(Scheme::Http, "a", 80));
        assert_ne!(Origin::http("a"), Origin::https("a"));
    }
}
