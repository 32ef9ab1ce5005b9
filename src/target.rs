use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use url::{Host, Url};

/// URL scheme of a proxy target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    /// Whether connections to this scheme are TLS encrypted.
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            443
        } else {
            80
        }
    }

    /// The HTTP scheme used on the wire; websocket targets are dialed over
    /// plain HTTP(S) and upgraded.
    pub fn http_scheme(&self) -> &'static str {
        if self.is_secure() {
            "https"
        } else {
            "http"
        }
    }
}

/// Errors produced while parsing a target URL.
#[derive(Debug, Error)]
pub enum TargetParseError {
    #[error("invalid target url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported target scheme: {0}")]
    UnsupportedScheme(String),
    #[error("target url has no host")]
    MissingHost,
}

/// A resolved backend address.
///
/// A target is owned by a single dispatch; the normalizer hands every
/// dispatch its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: Scheme,
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Base path (and query) of the target, empty when the URL had none.
    pub path: String,
    /// Extra PEM encoded root certificates trusted for this target.
    pub ca: Option<Bytes>,
}

impl ProxyTarget {
    /// A plain HTTP target with no base path.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Http,
            host: host.into(),
            port,
            path: String::new(),
            ca: None,
        }
    }

    /// Parse a target from a URL such as `http://127.0.0.1:8080/base?x=1`.
    pub fn parse(input: &str) -> Result<Self, TargetParseError> {
        let url = Url::parse(input)?;
        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| TargetParseError::UnsupportedScheme(url.scheme().to_string()))?;
        let host = match url.host().ok_or(TargetParseError::MissingHost)? {
            Host::Ipv6(addr) => addr.to_string(),
            Host::Ipv4(addr) => addr.to_string(),
            Host::Domain(s) => s.to_string(),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        // `Url` always reports at least "/" for special schemes; only keep a
        // path when the input actually carried one.
        let mut path = String::new();
        if url.path() != "/" || input.trim_end().ends_with('/') {
            path.push_str(url.path());
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
            ca: None,
        })
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Trust the given PEM bundle in addition to the system roots.
    pub fn with_ca(mut self, pem: impl Into<Bytes>) -> Self {
        self.ca = Some(pem.into());
        self
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    fn host_literal(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host:port`, always including the port.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host_literal(), self.port)
    }

    /// Value for a `Host` header: the port is omitted when it is the
    /// scheme's default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host_literal()
        } else {
            self.authority()
        }
    }

    /// Absolute URI used to dial the target with the given request path.
    pub(crate) fn uri_for(&self, path: &str) -> String {
        let path = if path.starts_with('/') || path.is_empty() {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("{}://{}{}", self.scheme.http_scheme(), self.authority(), path)
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme.as_str(),
            self.host_header(),
            self.path
        )
    }
}

impl std::str::FromStr for ProxyTarget {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProxyTarget::parse(s)
    }
}
