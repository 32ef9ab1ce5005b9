//! The web pipeline: passes that turn an inbound request into an outbound
//! one and hand the target's response to the shaping passes.

use axum::body::Body;
use http::{header, request, response, HeaderMap, HeaderValue, Method, Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::body::{tee, ActivityBody, IdleTimer, RelayBody};
use crate::client::{self, UpstreamClient};
use crate::error::{ProxyError, ResetCause};
use crate::events::ProxyEvent;
use crate::options::{ProxyOptions, ResolvedOptions};
use crate::outgoing;
use crate::pass::{Flow, Pass, PassContext, PassFuture, StaticPass};
use crate::proxy::{ClientInfo, ErrorCallback, ProxyServer};
use crate::response as shaping;
use crate::target::ProxyTarget;

/// How a web dispatch completed.
#[derive(Debug)]
pub enum WebOutcome {
    /// The response to send to the client.
    Response(Response<Body>),
    /// `self_handle_response` applied: the target's response is handed to
    /// the caller untouched (or shaped but unsent, with `force_passes`).
    SelfHandled(Response<Body>),
}

impl WebOutcome {
    pub fn into_response(self) -> Response<Body> {
        match self {
            WebOutcome::Response(res) | WebOutcome::SelfHandled(res) => res,
        }
    }

    pub fn is_self_handled(&self) -> bool {
        matches!(self, WebOutcome::SelfHandled(_))
    }
}

/// State of one web dispatch, shared by every pass.
pub struct WebContext {
    /// Inbound request head. Request passes mutate it before it is copied
    /// into the outbound request.
    pub req: request::Parts,
    /// Inbound request body, taken by the `stream` pass.
    pub body: Option<Body>,
    pub client: ClientInfo,
    pub options: ProxyOptions,
    pub target: Option<ProxyTarget>,
    pub forward: Option<ProxyTarget>,
    /// Target response head, available once `stream` ran.
    pub proxy_res: Option<response::Parts>,
    /// Client response under construction. Headers placed here before
    /// `writeHeaders` act as pre-seeded headers.
    pub res: response::Parts,
    pub(crate) proxy_body: Option<Incoming>,
    pub(crate) idle: Option<IdleTimer>,
    pub(crate) self_handled: bool,
    pub(crate) callback: Option<ErrorCallback>,
}

impl PassContext for WebContext {
    type Output = WebOutcome;
}

impl WebContext {
    pub(crate) fn new(
        req: Request<Body>,
        client: ClientInfo,
        resolved: ResolvedOptions,
        callback: Option<ErrorCallback>,
    ) -> Self {
        let (req, body) = req.into_parts();
        Self {
            req,
            body: Some(body),
            client,
            options: resolved.options,
            target: resolved.target,
            forward: resolved.forward,
            proxy_res: None,
            res: empty_head(),
            proxy_body: None,
            idle: None,
            self_handled: false,
            callback,
        }
    }

    /// Wrap the target's body so `end` fires once it is drained and the
    /// inbound idle timeout keeps applying while it streams.
    pub(crate) fn relay_body(
        &self,
        proxy: &ProxyServer,
        proxy_res: &response::Parts,
        body: Incoming,
    ) -> Body {
        let end = {
            let proxy = proxy.clone();
            let req = self.req.clone();
            let proxy_res = proxy_res.clone();
            move || {
                proxy.events().emit(&mut ProxyEvent::End {
                    req: &req,
                    proxy_res: &proxy_res,
                });
            }
        };
        let mut relay = RelayBody::new(body).on_end(Box::new(end));

        if let Some(idle) = &self.idle {
            let proxy = proxy.clone();
            let req = self.req.clone();
            let target = self.target.clone();
            let callback = self.callback.clone();
            relay = relay.idle_timeout(
                idle.timeout(),
                Box::new(move |error| {
                    proxy.report(error, &req, target.as_ref(), callback.as_ref());
                }),
            );
        }
        Body::new(relay)
    }
}

pub(crate) fn empty_head() -> response::Parts {
    Response::new(()).into_parts().0
}

/// The default web passes, in order.
pub(crate) fn default_passes() -> Vec<Arc<dyn Pass<WebContext>>> {
    vec![
        StaticPass::new("deleteLength", delete_length),
        StaticPass::new("timeout", timeout),
        StaticPass::new("XHeaders", x_headers),
        StaticPass::new("stream", stream),
        StaticPass::new("proxyRes", proxy_res),
        StaticPass::new("removeChunked", shaping::remove_chunked),
        StaticPass::new("setConnection", shaping::set_connection),
        StaticPass::new("setRedirectHostRewrite", shaping::set_redirect_host_rewrite),
        StaticPass::new("writeHeaders", shaping::write_headers),
        StaticPass::new("writeStatusCode", shaping::write_status_code),
        StaticPass::new("pipe", shaping::pipe),
    ]
}

/// Append `X-Forwarded-*` values describing the immediate client. Existing
/// values are extended, never replaced, so proxy chains keep their history.
pub(crate) fn append_forwarded(headers: &mut HeaderMap, client: &ClientInfo, proto: &str) {
    let mut values = Vec::with_capacity(3);
    if let Some(addr) = client.remote_addr {
        values.push(("x-forwarded-for", addr.ip().to_string()));
        values.push(("x-forwarded-port", addr.port().to_string()));
    }
    values.push(("x-forwarded-proto", proto.to_string()));

    for (name, value) in values {
        let combined = match headers.get(name).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing},{value}"),
            _ => value,
        };
        if let Ok(value) = HeaderValue::from_str(&combined) {
            headers.insert(name, value);
        }
    }

    if !headers.contains_key("x-forwarded-host") {
        if let Some(host) = headers.get(header::HOST).cloned() {
            headers.insert("x-forwarded-host", host);
        }
    }
}

fn delete_length<'a>(ctx: &'a mut WebContext, _proxy: &'a ProxyServer) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        let method = &ctx.req.method;
        if (*method == Method::DELETE || *method == Method::OPTIONS)
            && !ctx.req.headers.contains_key(header::CONTENT_LENGTH)
        {
            ctx.req
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            ctx.req.headers.remove(header::TRANSFER_ENCODING);
            ctx.body = Some(Body::empty());
        }
        Ok(Flow::Continue)
    })
}

fn timeout<'a>(ctx: &'a mut WebContext, _proxy: &'a ProxyServer) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        if let Some(after) = ctx.options.timeout() {
            ctx.idle = Some(IdleTimer::new(after));
        }
        Ok(Flow::Continue)
    })
}

fn x_headers<'a>(ctx: &'a mut WebContext, _proxy: &'a ProxyServer) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        if ctx.options.xfwd() {
            let proto = if ctx.client.encrypted { "https" } else { "http" };
            append_forwarded(&mut ctx.req.headers, &ctx.client, proto);
        }
        Ok(Flow::Continue)
    })
}

fn stream<'a>(ctx: &'a mut WebContext, proxy: &'a ProxyServer) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        let start = ctx.target.as_ref().or(ctx.forward.as_ref());
        let Some(start) = start else {
            return Err(ProxyError::MissingTarget);
        };
        proxy.events().emit(&mut ProxyEvent::Start {
            req: &ctx.req,
            target: start,
        });

        let mut body = match ctx.options.buffer() {
            Some(buffer) => Body::from(buffer.clone()),
            None => ctx.body.take().unwrap_or_else(Body::empty),
        };
        if let Some(idle) = &ctx.idle {
            body = Body::new(ActivityBody::new(body, idle.clone()));
        }

        if let Some(forward) = ctx.forward.clone() {
            if ctx.target.is_none() {
                forward_request(&ctx.req, &ctx.options, proxy, &forward, body).await?;
                return Ok(Flow::Done(WebOutcome::Response(Response::new(Body::empty()))));
            }

            let (to_target, to_forward) = tee(body);
            spawn_forward(ctx, proxy, forward, Body::new(to_forward))?;
            body = Body::new(to_target);
        }

        let Some(target) = ctx.target.clone() else {
            return Err(ProxyError::MissingTarget);
        };

        let mut head = outgoing::outbound_head(&ctx.req, &target, &ctx.options, false)?;
        if !head.headers.contains_key(header::EXPECT) {
            proxy.events().emit(&mut ProxyEvent::ProxyReq {
                proxy_req: &mut head,
                req: &ctx.req,
                options: &ctx.options,
            });
        }

        let client = proxy.clients().for_target(&target, &ctx.options)?;
        let outbound = Request::from_parts(head, body);

        let mut guard = AbortGuard {
            proxy,
            req: &ctx.req,
            target: &target,
            callback: ctx.callback.as_ref(),
            armed: true,
        };
        let result = await_response(
            &ctx.options,
            ctx.idle.as_ref(),
            &client,
            outbound,
            &target,
        )
        .await;
        guard.armed = false;
        drop(guard);

        let (parts, body) = result?.into_parts();
        trace!(
            "Received response status={} headers={:?} version={:?}",
            parts.status,
            parts.headers,
            parts.version
        );
        ctx.proxy_res = Some(parts);
        ctx.proxy_body = Some(body);
        Ok(Flow::Continue)
    })
}

fn proxy_res<'a>(ctx: &'a mut WebContext, proxy: &'a ProxyServer) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        let Some(res) = ctx.proxy_res.as_ref() else {
            return Ok(Flow::Continue);
        };
        proxy.events().emit(&mut ProxyEvent::ProxyRes {
            proxy_res: res,
            req: &ctx.req,
        });

        let self_handle = ctx
            .options
            .self_handle_response()
            .is_some_and(|policy| policy.applies(&ctx.req, res));
        if !self_handle {
            return Ok(Flow::Continue);
        }
        if ctx.options.force_passes() {
            ctx.self_handled = true;
            return Ok(Flow::Continue);
        }

        let (Some(parts), Some(body)) = (ctx.proxy_res.take(), ctx.proxy_body.take()) else {
            return Ok(Flow::Continue);
        };
        let body = ctx.relay_body(proxy, &parts, body);
        Ok(Flow::Done(WebOutcome::SelfHandled(Response::from_parts(
            parts, body,
        ))))
    })
}

async fn forward_request(
    req: &request::Parts,
    options: &ProxyOptions,
    proxy: &ProxyServer,
    forward: &ProxyTarget,
    body: Body,
) -> Result<(), ProxyError> {
    let head = outgoing::outbound_head(req, forward, options, false)?;
    let client = proxy.clients().for_target(forward, options)?;
    let res = client::send(&client, Request::from_parts(head, body), forward).await?;
    trace!("Forward target answered status={}", res.status());
    let _ = res.into_body().collect().await;
    Ok(())
}

fn spawn_forward(
    ctx: &WebContext,
    proxy: &ProxyServer,
    forward: ProxyTarget,
    body: Body,
) -> Result<(), ProxyError> {
    let head = outgoing::outbound_head(&ctx.req, &forward, &ctx.options, false)?;
    let client = proxy.clients().for_target(&forward, &ctx.options)?;
    let proxy = proxy.clone();
    let req = ctx.req.clone();
    let callback = ctx.callback.clone();

    tokio::spawn(async move {
        let outbound = Request::from_parts(head, body);
        match client::send(&client, outbound, &forward).await {
            Ok(res) => {
                let _ = res.into_body().collect().await;
            }
            Err(error) => {
                debug!("Forward request to {} failed: {}", forward, error);
                proxy.report(&error, &req, Some(&forward), callback.as_ref());
            }
        }
    });
    Ok(())
}

/// Send the outbound request, bounded by `proxy_timeout` and raced against
/// the inbound idle timer.
async fn await_response(
    options: &ProxyOptions,
    idle: Option<&IdleTimer>,
    client: &UpstreamClient,
    outbound: Request<Body>,
    target: &ProxyTarget,
) -> Result<Response<Incoming>, ProxyError> {
    let send = async {
        match options.follow_redirects() {
            Some(follow) => client::send_following(client, outbound, target, follow).await,
            None => client::send(client, outbound, target).await,
        }
    };

    let bounded = async {
        match options.proxy_timeout() {
            Some(after) => match tokio::time::timeout(after, send).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("No response from {} within {:?}", target, after);
                    Err(ProxyError::Timeout {
                        after,
                        custom_code: options.proxy_timeout_custom_error(),
                    })
                }
            },
            None => send.await,
        }
    };

    match idle {
        Some(idle) => tokio::select! {
            result = bounded => result,
            _ = idle.expired() => Err(ProxyError::InboundIdleTimeout { after: idle.timeout() }),
        },
        None => bounded.await,
    }
}

/// Reports a client abort if the dispatch is dropped while the outbound
/// request is still waiting for its response.
struct AbortGuard<'a> {
    proxy: &'a ProxyServer,
    req: &'a request::Parts,
    target: &'a ProxyTarget,
    callback: Option<&'a ErrorCallback>,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let error = ProxyError::ConnectionReset {
            cause: ResetCause::ClientAborted,
            source: None,
        };
        debug!("Client went away before {} answered", self.target);
        self.proxy
            .report(&error, self.req, Some(self.target), self.callback);
    }
}
