//! Serving a [`ProxyServer`] through axum and tower.

use axum::body::Body;
use axum::routing::Router;
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::Service;
use tracing::{debug, error, trace};

use crate::error::ProxyError;
use crate::proxy::ProxyServer;
use crate::websocket;

fn failure_response(error: &ProxyError) -> Response<Body> {
    let status = if error.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::BAD_GATEWAY
    };
    let mut res = Response::new(Body::from(format!(
        "Failed to connect to upstream server: {error}"
    )));
    *res.status_mut() = status;
    res
}

impl ProxyServer {
    async fn serve(&self, req: Request<Body>) -> Response<Body> {
        trace!("Proxying request method={} uri={}", req.method(), req.uri());

        if self.options().ws() && websocket::is_websocket_upgrade(req.headers()) {
            trace!("Detected WebSocket upgrade request");
            return self.serve_upgrade(req).await;
        }

        match self.dispatch_web(req, None, None).await {
            Ok(outcome) => outcome.into_response(),
            Err(e) => failure_response(&e.error),
        }
    }

    /// The splice outlives this call: the task keeps running once the `101`
    /// has been handed to hyper.
    async fn serve_upgrade(&self, req: Request<Body>) -> Response<Body> {
        let (reply, answer) = oneshot::channel();
        let proxy = self.clone();
        let task = tokio::spawn(async move { proxy.dispatch_upgrade_hyper(req, reply).await });

        match answer.await {
            Ok(response) => response,
            Err(_) => match task.await {
                Ok(Err(e)) => failure_response(&e.error),
                Ok(Ok(())) => failure_response(&ProxyError::NoResponse),
                Err(join) => {
                    error!("WebSocket dispatch task failed: {}", join);
                    failure_response(&ProxyError::NoResponse)
                }
            },
        }
    }

    /// Bind `addr` and serve every accepted connection through this proxy.
    ///
    /// Upgrades are only proxied when the `ws` option is set.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> io::Result<Listening> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let app: Router = self.clone().into();

        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = signal.await;
            })
            .await;
            if let Err(e) = served {
                error!("Proxy listener failed: {}", e);
            }
        });

        debug!("Proxy listening on {}", local_addr);
        Ok(Listening {
            local_addr,
            shutdown,
            task,
        })
    }
}

/// A running listener returned by [`ProxyServer::listen`].
#[derive(Debug)]
pub struct Listening {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Listening {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    pub async fn close(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!("Proxy listener task failed: {}", e);
        }
        debug!("Proxy on {} closed", self.local_addr);
    }
}

impl Service<Request<Body>> for ProxyServer {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.serve(req).await) })
    }
}

/// Enables conversion from a `ProxyServer` into an Axum `Router`.
///
/// Every request the router receives falls through to the proxy.
///
/// # Example
///
/// ```rust
/// use axum::Router;
/// use axum_pass_proxy::{ProxyOptions, ProxyServer};
///
/// let proxy = ProxyServer::new(ProxyOptions::new().with_target("https://api.example.com"));
/// let app: Router = proxy.into();
/// ```
impl<S> From<ProxyServer> for Router<S>
where
    S: Send + Sync + Clone + 'static,
{
    fn from(proxy: ProxyServer) -> Self {
        Router::<S>::new().fallback_service(proxy)
    }
}
