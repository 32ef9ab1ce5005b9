//! TLS connector construction for upstream connections.
//!
//! # Security Warning
//!
//! With `secure` turned off certificate validation is completely disabled,
//! making connections to the target vulnerable to man-in-the-middle attacks.
//! Only do that for development or testing targets.

use native_tls::{Certificate, TlsConnector};

/// Build the TLS connector used to reach a target.
///
/// `ca` is an extra PEM bundle trusted on top of the system roots. When
/// `verify` is false ANY certificate is accepted, including:
/// - Self-signed certificates
/// - Expired certificates
/// - Certificates with wrong hostnames
/// - Certificates from untrusted CAs
pub(crate) fn tls_connector(
    verify: bool,
    ca: Option<&[u8]>,
) -> Result<TlsConnector, native_tls::Error> {
    let mut builder = TlsConnector::builder();
    if let Some(pem) = ca {
        builder.add_root_certificate(Certificate::from_pem(pem)?);
    }
    if !verify {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_both_policies() {
        assert!(tls_connector(true, None).is_ok());
        assert!(tls_connector(false, None).is_ok());
    }

    #[test]
    fn rejects_garbage_ca() {
        assert!(tls_connector(true, Some(&b"not a certificate"[..])).is_err());
    }
}
