//! Proxy configuration and the option normalizer.
//!
//! A [`ProxyOptions`] value is built once per proxy. Every dispatch merges
//! its per-call overrides onto a copy of it with [`normalize`]; the base is
//! never mutated, so concurrent dispatches with different overrides cannot
//! interfere with each other.

use bytes::Bytes;
use http::{request, response, HeaderMap, Method};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cookie::CookieRewrite;
use crate::error::ProxyError;
use crate::target::ProxyTarget;
use crate::websocket::StreamTransform;

/// A target as configured: either a URL still to be parsed or an already
/// structured address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Url(String),
    Resolved(ProxyTarget),
}

impl From<&str> for TargetSpec {
    fn from(url: &str) -> Self {
        TargetSpec::Url(url.to_string())
    }
}

impl From<String> for TargetSpec {
    fn from(url: String) -> Self {
        TargetSpec::Url(url)
    }
}

impl From<&String> for TargetSpec {
    fn from(url: &String) -> Self {
        TargetSpec::Url(url.clone())
    }
}

impl From<ProxyTarget> for TargetSpec {
    fn from(target: ProxyTarget) -> Self {
        TargetSpec::Resolved(target)
    }
}

impl TargetSpec {
    fn resolve(&self, field: &str) -> Option<ProxyTarget> {
        match self {
            TargetSpec::Resolved(target) => Some(target.clone()),
            TargetSpec::Url(url) => match ProxyTarget::parse(url) {
                Ok(target) => Some(target),
                Err(e) => {
                    warn!("ignoring unresolvable {field} {url:?}: {e}");
                    None
                }
            },
        }
    }
}

type SelfHandlePredicate = dyn Fn(&request::Parts, &response::Parts) -> bool + Send + Sync;

/// Whether the caller takes over writing the client response.
#[derive(Clone)]
pub enum SelfHandleResponse {
    Always,
    Never,
    /// Decided per response.
    When(Arc<SelfHandlePredicate>),
}

impl SelfHandleResponse {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&request::Parts, &response::Parts) -> bool + Send + Sync + 'static,
    {
        SelfHandleResponse::When(Arc::new(predicate))
    }

    pub(crate) fn applies(&self, req: &request::Parts, res: &response::Parts) -> bool {
        match self {
            SelfHandleResponse::Always => true,
            SelfHandleResponse::Never => false,
            SelfHandleResponse::When(predicate) => predicate(req, res),
        }
    }
}

impl From<bool> for SelfHandleResponse {
    fn from(value: bool) -> Self {
        if value {
            SelfHandleResponse::Always
        } else {
            SelfHandleResponse::Never
        }
    }
}

impl fmt::Debug for SelfHandleResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfHandleResponse::Always => f.write_str("Always"),
            SelfHandleResponse::Never => f.write_str("Never"),
            SelfHandleResponse::When(_) => f.write_str("When(<predicate>)"),
        }
    }
}

type TransformFn =
    dyn Fn(&request::Parts, &response::Parts) -> Box<dyn StreamTransform> + Send + Sync;

/// Factory producing a byte transform for one direction of a websocket
/// splice. It receives the client's upgrade request and the target's
/// handshake response.
#[derive(Clone)]
pub struct TransformFactory(Arc<TransformFn>);

impl TransformFactory {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&request::Parts, &response::Parts) -> Box<dyn StreamTransform> + Send + Sync + 'static,
    {
        Self(Arc::new(factory))
    }

    pub(crate) fn create(
        &self,
        req: &request::Parts,
        res: &response::Parts,
    ) -> Box<dyn StreamTransform> {
        (self.0)(req, res)
    }
}

impl fmt::Debug for TransformFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransformFactory(<fn>)")
    }
}

/// Redirect following for outbound web requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowRedirects {
    /// Maximum number of redirects followed before the last redirect
    /// response is relayed as-is.
    pub max_redirects: usize,
}

impl Default for FollowRedirects {
    fn default() -> Self {
        Self { max_redirects: 21 }
    }
}

/// Configuration of a [`ProxyServer`](crate::ProxyServer).
///
/// Every field is optional. Unset fields fall back to the base options of
/// the proxy when merged, and to the documented default when read.
///
/// # Example
///
/// ```rust
/// use axum_pass_proxy::ProxyOptions;
/// use std::time::Duration;
///
/// let options = ProxyOptions::new()
///     .with_target("http://127.0.0.1:3000")
///     .with_change_origin(true)
///     .with_xfwd(true)
///     .with_proxy_timeout(Duration::from_secs(30));
/// assert!(options.change_origin());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    target: Option<TargetSpec>,
    forward: Option<TargetSpec>,
    ws: Option<bool>,
    xfwd: Option<bool>,
    secure: Option<bool>,
    to_proxy: Option<bool>,
    prepend_path: Option<bool>,
    ignore_path: Option<bool>,
    change_origin: Option<bool>,
    preserve_header_key_case: Option<bool>,
    auth: Option<String>,
    host_rewrite: Option<String>,
    auto_rewrite: Option<bool>,
    protocol_rewrite: Option<String>,
    cookie_domain_rewrite: Option<CookieRewrite>,
    cookie_path_rewrite: Option<CookieRewrite>,
    cookie_remove_secure: Option<bool>,
    merge_cookies: Option<bool>,
    headers: Option<HeaderMap>,
    outgoing_headers: Option<HeaderMap>,
    proxy_timeout: Option<Duration>,
    proxy_timeout_custom_error: Option<bool>,
    timeout: Option<Duration>,
    self_handle_response: Option<SelfHandleResponse>,
    force_passes: Option<bool>,
    ws_client_transform: Option<TransformFactory>,
    ws_server_transform: Option<TransformFactory>,
    follow_redirects: Option<FollowRedirects>,
    local_address: Option<IpAddr>,
    buffer: Option<Bytes>,
    method: Option<Method>,
}

macro_rules! flags {
    ($($(#[$doc:meta])* $name:ident / $setter:ident = $default:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $setter(mut self, value: bool) -> Self {
                self.$name = Some(value);
                self
            }

            pub fn $name(&self) -> bool {
                self.$name.unwrap_or($default)
            }
        )*
    };
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    flags! {
        /// Proxy websocket upgrades when served through [`ProxyServer::listen`](crate::ProxyServer::listen)
        /// or the tower service.
        ws / with_ws = false;
        /// Append `X-Forwarded-*` headers.
        xfwd / with_xfwd = false;
        /// Verify the target's TLS certificate.
        secure / with_secure = true;
        /// The target is itself a proxy: forward the full request-target.
        to_proxy / with_to_proxy = false;
        /// Keep the target's base path in front of the request path.
        prepend_path / with_prepend_path = true;
        /// Drop the inbound request path.
        ignore_path / with_ignore_path = false;
        /// Set `Host` to the target's host.
        change_origin / with_change_origin = false;
        /// Keep the target's response header-name casing.
        preserve_header_key_case / with_preserve_header_key_case = false;
        /// Rewrite redirect locations to the inbound `Host`.
        auto_rewrite / with_auto_rewrite = false;
        /// Remove the `Secure` attribute from `Set-Cookie` headers.
        cookie_remove_secure / with_cookie_remove_secure = false;
        /// Combine pre-seeded and target `Set-Cookie` headers.
        merge_cookies / with_merge_cookies = false;
        /// Run the response shaping passes even when self-handling.
        force_passes / with_force_passes = false;
        /// Report outbound timeouts as `ETIMEDOUT`.
        proxy_timeout_custom_error / with_proxy_timeout_custom_error = false;
    }

    pub fn with_target(mut self, target: impl Into<TargetSpec>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_forward(mut self, forward: impl Into<TargetSpec>) -> Self {
        self.forward = Some(forward.into());
        self
    }

    /// Basic auth credentials in `user:password` form.
    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn with_host_rewrite(mut self, host: impl Into<String>) -> Self {
        self.host_rewrite = Some(host.into());
        self
    }

    /// `http` or `https`.
    pub fn with_protocol_rewrite(mut self, protocol: impl Into<String>) -> Self {
        self.protocol_rewrite = Some(protocol.into());
        self
    }

    pub fn with_cookie_domain_rewrite(mut self, rewrite: impl Into<CookieRewrite>) -> Self {
        self.cookie_domain_rewrite = Some(rewrite.into());
        self
    }

    pub fn with_cookie_path_rewrite(mut self, rewrite: impl Into<CookieRewrite>) -> Self {
        self.cookie_path_rewrite = Some(rewrite.into());
        self
    }

    /// Headers merged into the outbound request, replacing inbound values
    /// of the same name.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Headers written onto the outbound request last, overriding anything
    /// computed by the pipeline.
    pub fn with_outgoing_headers(mut self, headers: HeaderMap) -> Self {
        self.outgoing_headers = Some(headers);
        self
    }

    /// Bound on the wait for the target's response head.
    pub fn with_proxy_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_timeout = Some(timeout);
        self
    }

    /// Idle timeout applied to the client side of a dispatch.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_self_handle_response(mut self, value: impl Into<SelfHandleResponse>) -> Self {
        self.self_handle_response = Some(value.into());
        self
    }

    /// Transform applied to bytes travelling from the client to the target.
    pub fn with_ws_client_transform(mut self, factory: TransformFactory) -> Self {
        self.ws_client_transform = Some(factory);
        self
    }

    /// Transform applied to bytes travelling from the target to the client.
    pub fn with_ws_server_transform(mut self, factory: TransformFactory) -> Self {
        self.ws_server_transform = Some(factory);
        self
    }

    pub fn with_follow_redirects(mut self, follow: FollowRedirects) -> Self {
        self.follow_redirects = Some(follow);
        self
    }

    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    /// Send these bytes as the request body instead of the inbound body.
    pub fn with_buffer(mut self, buffer: impl Into<Bytes>) -> Self {
        self.buffer = Some(buffer.into());
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn target(&self) -> Option<&TargetSpec> {
        self.target.as_ref()
    }

    pub fn forward(&self) -> Option<&TargetSpec> {
        self.forward.as_ref()
    }

    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    pub fn host_rewrite(&self) -> Option<&str> {
        self.host_rewrite.as_deref()
    }

    pub fn protocol_rewrite(&self) -> Option<&str> {
        self.protocol_rewrite.as_deref()
    }

    pub fn cookie_domain_rewrite(&self) -> Option<&CookieRewrite> {
        self.cookie_domain_rewrite.as_ref()
    }

    pub fn cookie_path_rewrite(&self) -> Option<&CookieRewrite> {
        self.cookie_path_rewrite.as_ref()
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub fn outgoing_headers(&self) -> Option<&HeaderMap> {
        self.outgoing_headers.as_ref()
    }

    pub fn proxy_timeout(&self) -> Option<Duration> {
        self.proxy_timeout
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn self_handle_response(&self) -> Option<&SelfHandleResponse> {
        self.self_handle_response.as_ref()
    }

    pub fn ws_client_transform(&self) -> Option<&TransformFactory> {
        self.ws_client_transform.as_ref()
    }

    pub fn ws_server_transform(&self) -> Option<&TransformFactory> {
        self.ws_server_transform.as_ref()
    }

    pub fn follow_redirects(&self) -> Option<FollowRedirects> {
        self.follow_redirects
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    pub fn buffer(&self) -> Option<&Bytes> {
        self.buffer.as_ref()
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// Field-wise merge: every field set on `overrides` wins, everything
    /// else is taken from `self`. Neither input is modified.
    pub fn merge(&self, overrides: &ProxyOptions) -> ProxyOptions {
        macro_rules! pick {
            ($($field:ident),* $(,)?) => {
                ProxyOptions {
                    $($field: overrides.$field.clone().or_else(|| self.$field.clone()),)*
                }
            };
        }

        pick!(
            target,
            forward,
            ws,
            xfwd,
            secure,
            to_proxy,
            prepend_path,
            ignore_path,
            change_origin,
            preserve_header_key_case,
            auth,
            host_rewrite,
            auto_rewrite,
            protocol_rewrite,
            cookie_domain_rewrite,
            cookie_path_rewrite,
            cookie_remove_secure,
            merge_cookies,
            headers,
            outgoing_headers,
            proxy_timeout,
            proxy_timeout_custom_error,
            timeout,
            self_handle_response,
            force_passes,
            ws_client_transform,
            ws_server_transform,
            follow_redirects,
            local_address,
            buffer,
            method,
        )
    }
}

/// Options of one dispatch with its target and forward resolved.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub options: ProxyOptions,
    pub target: Option<ProxyTarget>,
    pub forward: Option<ProxyTarget>,
}

/// Merge `overrides` onto `base` and resolve target/forward.
///
/// Fails with [`ProxyError::MissingTarget`] when neither resolves; this
/// happens before any socket is opened.
pub fn normalize(
    base: &ProxyOptions,
    overrides: Option<&ProxyOptions>,
) -> Result<ResolvedOptions, ProxyError> {
    let options = match overrides {
        Some(overrides) => base.merge(overrides),
        None => base.clone(),
    };

    let target = options.target.as_ref().and_then(|t| t.resolve("target"));
    let forward = options.forward.as_ref().and_then(|f| f.resolve("forward"));

    if target.is_none() && forward.is_none() {
        return Err(ProxyError::MissingTarget);
    }

    Ok(ResolvedOptions {
        options,
        target,
        forward,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn defaults_follow_documented_values() {
        let options = ProxyOptions::new();
        assert!(options.prepend_path());
        assert!(options.secure());
        assert!(!options.xfwd());
        assert!(!options.change_origin());
        assert!(options.proxy_timeout().is_none());
    }

    #[test]
    fn overrides_win_and_base_is_untouched() {
        let base = ProxyOptions::new()
            .with_target("http://127.0.0.1:1")
            .with_xfwd(true)
            .with_auth("a:b");
        let overrides = ProxyOptions::new()
            .with_target("http://127.0.0.1:2")
            .with_xfwd(false);

        let merged = base.merge(&overrides);
        assert!(!merged.xfwd());
        assert_eq!(merged.auth(), Some("a:b"));
        assert_eq!(merged.target(), Some(&TargetSpec::from("http://127.0.0.1:2")));

        assert!(base.xfwd());
        assert_eq!(base.target(), Some(&TargetSpec::from("http://127.0.0.1:1")));
    }

    #[test]
    fn normalize_requires_target_or_forward() {
        let err = normalize(&ProxyOptions::new(), None).unwrap_err();
        assert!(matches!(err, ProxyError::MissingTarget));

        let forward_only = ProxyOptions::new().with_forward("http://127.0.0.1:9");
        let resolved = normalize(&forward_only, None).unwrap();
        assert!(resolved.target.is_none());
        assert_eq!(resolved.forward.unwrap().port, 9);
    }

    #[test]
    fn unparseable_target_counts_as_missing() {
        let options = ProxyOptions::new().with_target("::not a url::");
        assert!(matches!(
            normalize(&options, None),
            Err(ProxyError::MissingTarget)
        ));
    }

    #[test]
    fn override_can_supply_the_only_target() {
        let base = ProxyOptions::new().with_ignore_path(true);
        let overrides = ProxyOptions::new().with_target(ProxyTarget::new("localhost", 8080));
        let resolved = normalize(&base, Some(&overrides)).unwrap();
        assert!(resolved.options.ignore_path());
        assert_eq!(resolved.target.unwrap().authority(), "localhost:8080");
    }

    #[test]
    fn header_maps_are_replaced_not_mixed() {
        let mut a = HeaderMap::new();
        a.insert("x-a", HeaderValue::from_static("1"));
        let mut b = HeaderMap::new();
        b.insert("x-b", HeaderValue::from_static("2"));

        let merged = ProxyOptions::new()
            .with_headers(a)
            .merge(&ProxyOptions::new().with_headers(b));
        let headers = merged.headers().unwrap();
        assert!(headers.get("x-a").is_none());
        assert_eq!(headers["x-b"], "2");
    }
}
