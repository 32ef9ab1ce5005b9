//! Upstream client configuration.
//!
//! The proxy keeps one pooled hyper-util client per TLS policy and local
//! address. DNS resolution goes through an injectable [`Resolve`]
//! implementation instead of the connector's built-in resolver.

use axum::body::Body;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::{dns::Name, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;
use tracing::{debug, trace};
use url::Url;

use crate::danger;
use crate::error::ProxyError;
use crate::options::{FollowRedirects, ProxyOptions};
use crate::target::ProxyTarget;

/// Future returned by [`Resolve::resolve`].
pub type ResolveFuture = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send>>;

/// Host name resolution used when dialing targets.
///
/// Returned addresses may carry any port; the port of the target is applied
/// by the connector. IP literals never reach the resolver.
pub trait Resolve: Send + Sync + 'static {
    fn resolve(&self, host: &str) -> ResolveFuture;
}

impl<F> Resolve for F
where
    F: Fn(&str) -> ResolveFuture + Send + Sync + 'static,
{
    fn resolve(&self, host: &str) -> ResolveFuture {
        self(host)
    }
}

/// Resolves through the operating system via [`tokio::net::lookup_host`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioResolver;

impl Resolve for TokioResolver {
    fn resolve(&self, host: &str) -> ResolveFuture {
        let host = host.to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host.as_str(), 0)).await?;
            Ok(addrs.collect())
        })
    }
}

/// Adapts a [`Resolve`] to the service interface `HttpConnector` expects.
#[derive(Clone)]
pub(crate) struct DynResolver(Arc<dyn Resolve>);

impl Service<Name> for DynResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.0.clone();
        Box::pin(async move {
            let addrs = resolver.resolve(name.as_str()).await?;
            trace!("Resolved host={} addrs={:?}", name, addrs);
            Ok(addrs.into_iter())
        })
    }
}

pub(crate) type UpstreamClient = Client<HttpsConnector<HttpConnector<DynResolver>>, Body>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    verify: bool,
    local_address: Option<IpAddr>,
    ca: Option<Bytes>,
}

/// Pooled upstream clients, built on first use.
pub(crate) struct Clients {
    resolver: DynResolver,
    cache: Mutex<HashMap<ClientKey, UpstreamClient>>,
}

impl Clients {
    pub(crate) fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self {
            resolver: DynResolver(resolver),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Client honoring the TLS policy and local address of `options`.
    pub(crate) fn for_target(
        &self,
        target: &ProxyTarget,
        options: &ProxyOptions,
    ) -> Result<UpstreamClient, ProxyError> {
        let key = ClientKey {
            verify: options.secure(),
            local_address: options.local_address(),
            ca: target.ca.clone(),
        };

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = cache.get(&key) {
            return Ok(client.clone());
        }

        let client = self.build(&key).map_err(|e| ProxyError::Upstream {
            target: target.authority(),
            source: Box::new(e),
        })?;
        debug!(
            "Built upstream client verify={} local_address={:?}",
            key.verify, key.local_address
        );
        cache.insert(key, client.clone());
        Ok(client)
    }

    fn build(&self, key: &ClientKey) -> Result<UpstreamClient, native_tls::Error> {
        let mut connector = HttpConnector::new_with_resolver(self.resolver.clone());
        connector.set_nodelay(true);
        connector.enforce_http(false);
        connector.set_keepalive(Some(Duration::from_secs(60)));
        connector.set_connect_timeout(Some(Duration::from_secs(10)));
        connector.set_reuse_address(true);
        connector.set_local_address(key.local_address);

        let tls = danger::tls_connector(key.verify, key.ca.as_deref())?;
        let connector = HttpsConnector::from((connector, tokio_native_tls::TlsConnector::from(tls)));

        Ok(Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(32)
            .retry_canceled_requests(true)
            .set_host(true)
            .http1_preserve_header_case(true)
            .build(connector))
    }
}

/// Send `req` to `target`, classifying failures.
pub(crate) async fn send(
    client: &UpstreamClient,
    req: Request<Body>,
    target: &ProxyTarget,
) -> Result<Response<Incoming>, ProxyError> {
    client
        .request(req)
        .await
        .map_err(|e| ProxyError::from_upstream(Box::new(e), &target.authority(), target.is_secure()))
}

/// Send `req`, following redirects up to `follow.max_redirects`.
///
/// The request body is buffered so it can be replayed. The last redirect
/// response is returned as-is once the limit is reached.
pub(crate) async fn send_following(
    client: &UpstreamClient,
    req: Request<Body>,
    target: &ProxyTarget,
    follow: FollowRedirects,
) -> Result<Response<Incoming>, ProxyError> {
    let (mut head, body) = req.into_parts();
    let mut body = body
        .collect()
        .await
        .map_err(|e| ProxyError::Upstream {
            target: target.authority(),
            source: Box::new(e),
        })?
        .to_bytes();

    let mut redirects = 0;
    loop {
        let attempt = Request::from_parts(head.clone(), Body::from(body.clone()));
        let res = send(client, attempt, target).await?;
        if redirects >= follow.max_redirects {
            return Ok(res);
        }
        let Some(next) = redirect_location(&head.uri, &res) else {
            return Ok(res);
        };
        redirects += 1;
        trace!("Following redirect status={} location={}", res.status(), next);

        let status = res.status();
        let downgrade = ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
            && head.method == Method::POST)
            || (status == StatusCode::SEE_OTHER
                && head.method != Method::GET
                && head.method != Method::HEAD);
        if downgrade {
            head.method = Method::GET;
            body = Bytes::new();
            head.headers.remove(header::CONTENT_LENGTH);
            head.headers.remove(header::CONTENT_TYPE);
            head.headers.remove(header::TRANSFER_ENCODING);
        }

        head.headers.remove(header::HOST);
        if next.authority() != head.uri.authority() {
            head.headers.remove(header::AUTHORIZATION);
            head.headers.remove(header::PROXY_AUTHORIZATION);
            head.headers.remove(header::COOKIE);
        }
        head.uri = next;
    }
}

fn redirect_location<B>(current: &Uri, res: &Response<B>) -> Option<Uri> {
    if !res.status().is_redirection() {
        return None;
    }
    let location = res.headers().get(header::LOCATION)?.to_str().ok()?;
    let base = Url::parse(&current.to_string()).ok()?;
    base.join(location).ok()?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redirect(status: u16, location: &str) -> Response<()> {
        Response::builder()
            .status(status)
            .header("location", location)
            .body(())
            .unwrap()
    }

    #[test]
    fn resolves_relative_locations() {
        let current: Uri = "http://127.0.0.1:8080/a/b?x=1".parse().unwrap();
        let next = redirect_location(&current, &redirect(302, "/c")).unwrap();
        assert_eq!(next, "http://127.0.0.1:8080/c");

        let next = redirect_location(&current, &redirect(301, "d")).unwrap();
        assert_eq!(next, "http://127.0.0.1:8080/a/d");
    }

    #[test]
    fn ignores_non_redirects() {
        let current: Uri = "http://127.0.0.1:8080/".parse().unwrap();
        assert!(redirect_location(&current, &redirect(200, "/c")).is_none());
    }

    #[tokio::test]
    async fn closures_can_resolve() {
        let resolver: Arc<dyn Resolve> = Arc::new(|_host: &str| -> ResolveFuture {
            Box::pin(async { Ok(vec![SocketAddr::from(([127, 0, 0, 1], 0))]) })
        });
        let mut dynamic = DynResolver(resolver);
        let name: Name = "backend.internal".parse().unwrap();
        let addrs: Vec<_> = dynamic.call(name).await.unwrap().collect();
        assert_eq!(addrs, vec![SocketAddr::from(([127, 0, 0, 1], 0))]);
    }
}
