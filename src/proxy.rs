use axum::body::Body;
use axum::extract::ConnectInfo;
use bytes::Bytes;
use http::{request, Extensions, Request, Response};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::client::{Clients, Resolve, TokioResolver};
use crate::error::{DispatchError, ProxyError};
use crate::events::{EventDispatcher, EventKind, ProxyEvent};
use crate::options::{normalize, ProxyOptions};
use crate::pass::{Pass, Pipeline, Placement};
use crate::target::ProxyTarget;
use crate::web::{self, WebContext, WebOutcome};
use crate::websocket::{self, ClientSocket, WsContext};

/// Per-dispatch failure callback. When supplied, error-class failures go
/// here instead of to the `error` event.
pub type ErrorCallback =
    Arc<dyn Fn(&ProxyError, &request::Parts, Option<&ProxyTarget>) + Send + Sync>;

/// What the proxy knows about the client connection.
///
/// Taken from a `ClientInfo` request extension when present, otherwise from
/// axum's `ConnectInfo<SocketAddr>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Whether the client connection is TLS.
    pub encrypted: bool,
}

impl ClientInfo {
    pub(crate) fn from_extensions(extensions: &Extensions) -> Self {
        if let Some(info) = extensions.get::<ClientInfo>() {
            return *info;
        }
        ClientInfo {
            remote_addr: extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            encrypted: false,
        }
    }
}

/// A pass-pipeline reverse proxy for HTTP and websocket traffic.
///
/// Cloning is cheap; clones share configuration, pipelines, listeners and
/// pooled upstream connections.
///
/// # Example
///
/// ```rust
/// use axum::Router;
/// use axum_pass_proxy::{EventKind, ProxyEvent, ProxyOptions, ProxyServer};
///
/// let proxy = ProxyServer::new(
///     ProxyOptions::new()
///         .with_target("http://127.0.0.1:3000")
///         .with_change_origin(true),
/// );
/// proxy.on(EventKind::Error, |event: &mut ProxyEvent<'_>| {
///     if let ProxyEvent::Error { error, .. } = event {
///         eprintln!("proxy error: {error}");
///     }
/// });
/// let app: Router = proxy.into();
/// ```
#[derive(Clone)]
pub struct ProxyServer {
    inner: Arc<Inner>,
}

struct Inner {
    options: ProxyOptions,
    web: Pipeline<WebContext>,
    ws: Pipeline<WsContext>,
    events: EventDispatcher,
    clients: Clients,
}

impl ProxyServer {
    /// Creates a proxy resolving target host names through the system
    /// resolver.
    pub fn new(options: ProxyOptions) -> Self {
        Self::with_resolver(options, TokioResolver)
    }

    /// Creates a proxy resolving target host names through `resolver`.
    pub fn with_resolver(options: ProxyOptions, resolver: impl Resolve) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                web: Pipeline::new(web::default_passes()),
                ws: Pipeline::new(websocket::default_passes()),
                events: EventDispatcher::new(),
                clients: Clients::new(Arc::new(resolver)),
            }),
        }
    }

    /// The base configuration every dispatch starts from.
    pub fn options(&self) -> &ProxyOptions {
        &self.inner.options
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    /// Register an event listener.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> &Self
    where
        F: Fn(&mut ProxyEvent<'_>) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
        self
    }

    pub fn web_passes(&self) -> &Pipeline<WebContext> {
        &self.inner.web
    }

    pub fn ws_passes(&self) -> &Pipeline<WsContext> {
        &self.inner.ws
    }

    /// Insert `pass` into the web pipeline next to an existing pass.
    ///
    /// Fails with [`ProxyError::PassNotFound`] when the anchor name is not
    /// registered; the pipeline is then left unchanged. Dispatches already
    /// running keep the pass list they started with.
    pub fn insert_web_pass(
        &self,
        placement: Placement<'_>,
        pass: impl Pass<WebContext> + 'static,
    ) -> Result<(), ProxyError> {
        self.inner.web.insert(placement, Arc::new(pass))
    }

    /// Insert `pass` into the websocket pipeline next to an existing pass.
    pub fn insert_ws_pass(
        &self,
        placement: Placement<'_>,
        pass: impl Pass<WsContext> + 'static,
    ) -> Result<(), ProxyError> {
        self.inner.ws.insert(placement, Arc::new(pass))
    }

    pub(crate) fn clients(&self) -> &Clients {
        &self.inner.clients
    }

    /// Route a failure to the callback or the matching event. Returns whether
    /// anyone received it.
    pub(crate) fn report(
        &self,
        error: &ProxyError,
        req: &request::Parts,
        target: Option<&ProxyTarget>,
        callback: Option<&ErrorCallback>,
    ) -> bool {
        if error.is_econnreset() {
            let heard = self.inner.events.emit(&mut ProxyEvent::EconnReset {
                error,
                req,
                target,
            });
            return match callback {
                Some(callback) => {
                    callback(error, req, target);
                    true
                }
                None => heard,
            };
        }

        match callback {
            Some(callback) => {
                callback(error, req, target);
                true
            }
            None => self.inner.events.emit(&mut ProxyEvent::Error { error, req, target }),
        }
    }

    fn fail(
        &self,
        error: ProxyError,
        req: &request::Parts,
        target: Option<&ProxyTarget>,
        callback: Option<&ErrorCallback>,
    ) -> DispatchError {
        let handled = self.report(&error, req, target, callback);
        if !handled {
            error!(
                "Unhandled proxy error code={} method={} uri={} err={}",
                error.code(),
                req.method,
                req.uri,
                error
            );
        }
        DispatchError { error, handled }
    }

    /// Proxy one HTTP request through the web pipeline.
    ///
    /// `overrides` are merged onto a copy of the base options for this
    /// dispatch only.
    pub async fn dispatch_web(
        &self,
        req: Request<Body>,
        overrides: Option<&ProxyOptions>,
        callback: Option<ErrorCallback>,
    ) -> Result<WebOutcome, DispatchError> {
        trace!("Dispatching request method={} uri={}", req.method(), req.uri());
        let client = ClientInfo::from_extensions(req.extensions());

        let resolved = match normalize(self.options(), overrides) {
            Ok(resolved) => resolved,
            Err(error) => {
                let (parts, _) = req.into_parts();
                return Err(self.fail(error, &parts, None, callback.as_ref()));
            }
        };

        let mut ctx = WebContext::new(req, client, resolved, callback);
        match self.inner.web.run(&mut ctx, self).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Err(self.fail(
                ProxyError::NoResponse,
                &ctx.req,
                ctx.target.as_ref(),
                ctx.callback.as_ref(),
            )),
            Err(error) => Err(self.fail(
                error,
                &ctx.req,
                ctx.target.as_ref(),
                ctx.callback.as_ref(),
            )),
        }
    }

    /// Proxy a websocket upgrade on a socket the caller already owns.
    ///
    /// `head` holds bytes already read from the socket past the request
    /// head; they are written to the target before anything else the client
    /// sends. The handshake answer is written to `socket` directly.
    pub async fn dispatch_upgrade<S>(
        &self,
        req: Request<()>,
        socket: S,
        head: Bytes,
        overrides: Option<&ProxyOptions>,
        callback: Option<ErrorCallback>,
    ) -> Result<(), DispatchError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let client = ClientInfo::from_extensions(req.extensions());
        let (parts, ()) = req.into_parts();
        self.run_upgrade(
            parts,
            client,
            ClientSocket::Raw(Box::new(socket)),
            head,
            overrides,
            callback,
        )
        .await
    }

    /// Upgrade variant for connections served by hyper: the handshake answer
    /// is sent through `reply` and the client stream is taken from the
    /// request's pending upgrade.
    pub(crate) async fn dispatch_upgrade_hyper(
        &self,
        mut req: Request<Body>,
        reply: oneshot::Sender<Response<Body>>,
    ) -> Result<(), DispatchError> {
        let client = ClientInfo::from_extensions(req.extensions());
        let on_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _) = req.into_parts();
        self.run_upgrade(
            parts,
            client,
            ClientSocket::Pending { on_upgrade, reply },
            Bytes::new(),
            None,
            None,
        )
        .await
    }

    async fn run_upgrade(
        &self,
        req: request::Parts,
        client: ClientInfo,
        socket: ClientSocket,
        head: Bytes,
        overrides: Option<&ProxyOptions>,
        callback: Option<ErrorCallback>,
    ) -> Result<(), DispatchError> {
        trace!("Dispatching upgrade uri={} head_len={}", req.uri, head.len());
        let resolved = match normalize(self.options(), overrides) {
            Ok(resolved) => resolved,
            Err(error) => return Err(self.fail(error, &req, None, callback.as_ref())),
        };

        let mut ctx = WsContext::new(req, client, resolved, socket, head);
        match self.inner.ws.run(&mut ctx, self).await {
            Ok(_) => Ok(()),
            Err(error) => Err(self.fail(
                error,
                &ctx.req,
                ctx.target.as_ref(),
                callback.as_ref(),
            )),
        }
    }
}

impl fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("options", &self.inner.options)
            .field("web", &self.inner.web)
            .field("ws", &self.inner.ws)
            .field("events", &self.inner.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request_head() -> request::Parts {
        Request::new(()).into_parts().0
    }

    #[test]
    fn client_info_prefers_explicit_extension() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 1000))));
        assert_eq!(
            ClientInfo::from_extensions(&extensions).remote_addr,
            Some(SocketAddr::from(([10, 0, 0, 1], 1000)))
        );

        let explicit = ClientInfo {
            remote_addr: Some(SocketAddr::from(([10, 0, 0, 2], 2000))),
            encrypted: true,
        };
        extensions.insert(explicit);
        assert_eq!(ClientInfo::from_extensions(&extensions), explicit);
    }

    #[test]
    fn report_without_listeners_is_unhandled() {
        let proxy = ProxyServer::new(ProxyOptions::new());
        assert!(!proxy.report(&ProxyError::MissingTarget, &request_head(), None, None));
    }

    #[test]
    fn callback_replaces_error_event() {
        let proxy = ProxyServer::new(ProxyOptions::new());
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        proxy.on(EventKind::Error, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback: ErrorCallback = Arc::new(
            move |_: &ProxyError, _: &request::Parts, _: Option<&ProxyTarget>| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(proxy.report(
            &ProxyError::MissingTarget,
            &request_head(),
            None,
            Some(&callback)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.load(Ordering::SeqCst), 0);

        assert!(proxy.report(&ProxyError::MissingTarget, &request_head(), None, None));
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resets_reach_econnreset_listeners() {
        let proxy = ProxyServer::new(ProxyOptions::new());
        let resets = Arc::new(AtomicUsize::new(0));
        let counter = resets.clone();
        proxy.on(EventKind::EconnReset, move |event| {
            assert!(matches!(event, ProxyEvent::EconnReset { .. }));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let error = ProxyError::ConnectionReset {
            cause: crate::error::ResetCause::Target,
            source: None,
        };
        assert!(proxy.report(&error, &request_head(), None, None));
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_target_fails_before_any_pass() {
        let proxy = ProxyServer::new(ProxyOptions::new());
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = proxy.dispatch_web(req, None, None).await.unwrap_err();
        assert!(matches!(err.error, ProxyError::MissingTarget));
        assert!(!err.handled);
    }
}
