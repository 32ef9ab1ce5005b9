//! Error taxonomy shared by both pipelines.
//!
//! Every lower-level failure met while proxying is normalized into one
//! [`ProxyError`] carrying a stable [`code`](ProxyError::code). The
//! orchestrator routes it to the per-dispatch callback or to the `error` /
//! `econnreset` events, then returns it to the caller wrapped in a
//! [`DispatchError`].

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used as the source of upstream failures.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Unified error type for every proxy operation.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Neither `target` nor `forward` resolved to an address.
    #[error("must provide a proper URL as target")]
    MissingTarget,

    /// `insert_*_pass` was given an anchor that is not registered.
    #[error("no such pass: {name}")]
    PassNotFound {
        /// The anchor name that was looked up.
        name: String,
    },

    /// The target refused the TCP connection.
    #[error("connection refused by {target}")]
    ConnectionRefused {
        /// Address of the refusing target.
        target: String,
        #[source]
        source: BoxError,
    },

    /// The connection was reset, either by the target or by the client
    /// going away before the target answered.
    #[error("connection reset: {cause}")]
    ConnectionReset {
        /// Which side dropped the connection.
        cause: ResetCause,
        #[source]
        source: Option<BoxError>,
    },

    /// The target did not send a response head within `proxy_timeout`.
    #[error("the proxy request timed out after {after:?}")]
    Timeout {
        /// The configured `proxy_timeout`.
        after: Duration,
        /// Whether `proxy_timeout_custom_error` asked for `ETIMEDOUT`.
        custom_code: bool,
    },

    /// The client side stayed idle for longer than `timeout`.
    #[error("client connection idle for {after:?}")]
    InboundIdleTimeout {
        /// The configured inbound `timeout`.
        after: Duration,
    },

    /// TLS certificate validation of the target failed.
    #[error("TLS verification of {target} failed")]
    TlsVerificationFailure {
        /// Address of the target whose certificate was rejected.
        target: String,
        #[source]
        source: BoxError,
    },

    /// Any other failure reported by the upstream client.
    #[error("upstream request to {target} failed")]
    Upstream {
        /// Address of the target being contacted.
        target: String,
        #[source]
        source: BoxError,
    },

    /// The outbound request could not be assembled.
    #[error("invalid outbound request: {0}")]
    InvalidRequest(#[from] http::Error),

    /// Socket level failure while relaying an upgraded connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The web pipeline ran to completion without producing a response.
    #[error("the web pipeline finished without producing a response")]
    NoResponse,
}

/// The side responsible for a [`ProxyError::ConnectionReset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    /// The target closed or reset the connection.
    Target,
    /// The client went away before the target answered.
    ClientAborted,
}

impl std::fmt::Display for ResetCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetCause::Target => f.write_str("target closed the connection"),
            ResetCause::ClientAborted => f.write_str("client aborted the request"),
        }
    }
}

impl ProxyError {
    /// Stable, machine readable code for this error.
    ///
    /// Socket-level failures reuse the familiar errno names so callers can
    /// match on them the same way they would on a raw socket error.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::MissingTarget => "EMISSINGTARGET",
            ProxyError::PassNotFound { .. } => "ENOPASS",
            ProxyError::ConnectionRefused { .. } => "ECONNREFUSED",
            ProxyError::ConnectionReset { .. } => "ECONNRESET",
            ProxyError::Timeout {
                custom_code: true, ..
            } => "ETIMEDOUT",
            ProxyError::Timeout { .. } => "ECONNRESET",
            ProxyError::InboundIdleTimeout { .. } => "ECONNRESET",
            ProxyError::TlsVerificationFailure { .. } => "ECERTVERIFY",
            ProxyError::Upstream { .. } => "EUPSTREAM",
            ProxyError::InvalidRequest(_) => "EINVALIDREQUEST",
            ProxyError::Io(_) => "EIO",
            ProxyError::NoResponse => "ENORESPONSE",
        }
    }

    /// Whether this failure is delivered through the `econnreset` event
    /// rather than the generic `error` event.
    pub fn is_econnreset(&self) -> bool {
        matches!(
            self,
            ProxyError::ConnectionReset { .. } | ProxyError::InboundIdleTimeout { .. }
        )
    }

    /// Whether this failure is any kind of timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProxyError::Timeout { .. } | ProxyError::InboundIdleTimeout { .. }
        )
    }

    /// Classify an upstream client failure by walking its source chain.
    pub(crate) fn from_upstream(err: BoxError, target: &str, secure: bool) -> Self {
        let mut refused = false;
        let mut reset = false;
        let mut tls = false;

        let mut current: Option<&(dyn StdError + 'static)> = Some(err.as_ref());
        while let Some(e) = current {
            if e.downcast_ref::<native_tls::Error>().is_some() {
                tls = true;
            }
            if let Some(io) = e.downcast_ref::<io::Error>() {
                match io.kind() {
                    io::ErrorKind::ConnectionRefused => refused = true,
                    kind if is_reset_kind(kind) => reset = true,
                    _ => {}
                }
            }
            if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
                if hyper_err.is_incomplete_message() || hyper_err.is_closed() {
                    reset = true;
                }
            }
            current = e.source();
        }

        let target = target.to_string();
        if refused {
            ProxyError::ConnectionRefused {
                target,
                source: err,
            }
        } else if tls && secure {
            ProxyError::TlsVerificationFailure {
                target,
                source: err,
            }
        } else if reset {
            ProxyError::ConnectionReset {
                cause: ResetCause::Target,
                source: Some(err),
            }
        } else {
            ProxyError::Upstream {
                target,
                source: err,
            }
        }
    }

    /// Classify a socket error met on one side of an upgraded connection.
    pub(crate) fn from_socket(err: io::Error, cause: ResetCause) -> Self {
        if is_reset_kind(err.kind()) {
            ProxyError::ConnectionReset {
                cause,
                source: Some(Box::new(err)),
            }
        } else {
            ProxyError::Io(err)
        }
    }
}

fn is_reset_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// The failure of one dispatch, as returned to the caller.
///
/// `handled` records whether a per-dispatch callback or at least one event
/// listener received the error. An unhandled error must be acted upon by
/// the caller; it is never silently dropped.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DispatchError {
    /// The normalized failure.
    #[source]
    pub error: ProxyError,
    /// Whether a callback or listener observed the failure.
    pub handled: bool,
}

impl DispatchError {
    /// Stable code of the underlying [`ProxyError`].
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}
