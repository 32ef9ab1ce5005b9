//! The websocket pipeline: validate the handshake, dial the target, answer
//! the client with the target's own `101` and splice both connections.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http::{header, request, response, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::client;
use crate::error::{ProxyError, ResetCause};
use crate::events::ProxyEvent;
use crate::options::{ProxyOptions, ResolvedOptions};
use crate::outgoing;
use crate::pass::{Flow, Pass, PassContext, PassFuture, StaticPass};
use crate::proxy::{ClientInfo, ProxyServer};
use crate::target::ProxyTarget;
use crate::web::append_forwarded;

/// Byte transform applied to one direction of a spliced connection.
///
/// Chunks arrive as they were read from the socket; frame boundaries are not
/// preserved.
pub trait StreamTransform: Send {
    fn transform(&mut self, chunk: Bytes) -> Bytes;
}

impl<F> StreamTransform for F
where
    F: FnMut(Bytes) -> Bytes + Send,
{
    fn transform(&mut self, chunk: Bytes) -> Bytes {
        self(chunk)
    }
}

/// A bidirectional byte stream usable as the client side of an upgrade.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// The client connection of an upgrade dispatch.
pub(crate) enum ClientSocket {
    /// A socket the proxy writes the handshake answer to itself.
    Raw(Box<dyn Io>),
    /// A hyper-managed connection: the answer goes through `reply` and the
    /// socket becomes available once hyper hands it over.
    Pending {
        on_upgrade: OnUpgrade,
        reply: oneshot::Sender<Response<Body>>,
    },
}

/// State of one websocket dispatch.
pub struct WsContext {
    /// The client's upgrade request head.
    pub req: request::Parts,
    pub client: ClientInfo,
    pub options: ProxyOptions,
    pub target: Option<ProxyTarget>,
    pub forward: Option<ProxyTarget>,
    /// The target's handshake response, once `stream` ran.
    pub proxy_res: Option<response::Parts>,
    pub(crate) head: Bytes,
    pub(crate) socket: Option<ClientSocket>,
    pub(crate) upstream: Option<TokioIo<Upgraded>>,
}

impl PassContext for WsContext {
    type Output = ();
}

impl WsContext {
    pub(crate) fn new(
        req: request::Parts,
        client: ClientInfo,
        resolved: ResolvedOptions,
        socket: ClientSocket,
        head: Bytes,
    ) -> Self {
        Self {
            req,
            client,
            options: resolved.options,
            target: resolved.target,
            forward: resolved.forward,
            proxy_res: None,
            head,
            socket: Some(socket),
            upstream: None,
        }
    }
}

/// The default websocket passes, in order.
pub(crate) fn default_passes() -> Vec<Arc<dyn Pass<WsContext>>> {
    vec![
        StaticPass::new("checkMethodAndHeader", check_method_and_header),
        StaticPass::new("XHeaders", x_headers),
        StaticPass::new("stream", stream),
        StaticPass::new("splice", splice),
    ]
}

fn has_upgrade_headers(headers: &HeaderMap<HeaderValue>) -> (bool, bool) {
    let has_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let has_connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    (has_upgrade, has_connection)
}

/// Check if a request is a WebSocket upgrade request by examining the headers.
///
/// According to the WebSocket protocol specification (RFC 6455), a WebSocket upgrade request must have:
/// - An "Upgrade: websocket" header (case-insensitive)
/// - A "Connection: Upgrade" header (case-insensitive)
/// - A "Sec-WebSocket-Key" header with a base64-encoded 16-byte value
/// - A "Sec-WebSocket-Version" header
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap<HeaderValue>) -> bool {
    let (has_upgrade, has_connection) = has_upgrade_headers(headers);
    let has_websocket_key = headers.contains_key(header::SEC_WEBSOCKET_KEY);
    let has_websocket_version = headers.contains_key(header::SEC_WEBSOCKET_VERSION);

    trace!(
        "is_websocket_upgrade - upgrade: {has_upgrade}, connection: {has_connection}, websocket key: {has_websocket_key}, websocket version: {has_websocket_version}"
    );
    has_upgrade && has_connection && has_websocket_key && has_websocket_version
}

fn check_method_and_header<'a>(
    ctx: &'a mut WsContext,
    _proxy: &'a ProxyServer,
) -> PassFuture<'a, ()> {
    Box::pin(async move {
        let (has_upgrade, has_connection) = has_upgrade_headers(&ctx.req.headers);
        if ctx.req.method == Method::GET && has_upgrade && has_connection {
            return Ok(Flow::Continue);
        }

        debug!(
            "Rejecting upgrade method={} upgrade={} connection={}",
            ctx.req.method, has_upgrade, has_connection
        );
        match ctx.socket.take() {
            Some(ClientSocket::Raw(mut io)) => {
                let _ = io.shutdown().await;
            }
            Some(ClientSocket::Pending { reply, .. }) => {
                let mut rejection = Response::new(Body::empty());
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                let _ = reply.send(rejection);
            }
            None => {}
        }
        Ok(Flow::Done(()))
    })
}

fn x_headers<'a>(ctx: &'a mut WsContext, _proxy: &'a ProxyServer) -> PassFuture<'a, ()> {
    Box::pin(async move {
        if ctx.options.xfwd() {
            let proto = if ctx.client.encrypted { "wss" } else { "ws" };
            append_forwarded(&mut ctx.req.headers, &ctx.client, proto);
        }
        Ok(Flow::Continue)
    })
}

fn client_gone(source: Option<crate::error::BoxError>) -> ProxyError {
    ProxyError::ConnectionReset {
        cause: ResetCause::ClientAborted,
        source,
    }
}

fn stream<'a>(ctx: &'a mut WsContext, proxy: &'a ProxyServer) -> PassFuture<'a, ()> {
    Box::pin(async move {
        let Some(target) = ctx.target.clone() else {
            return Err(ProxyError::MissingTarget);
        };

        let head = outgoing::outbound_head(&ctx.req, &target, &ctx.options, true)?;
        let upstream_client = proxy.clients().for_target(&target, &ctx.options)?;
        let send = client::send(
            &upstream_client,
            Request::from_parts(head, Body::empty()),
            &target,
        );
        let mut res = match ctx.options.proxy_timeout() {
            Some(after) => tokio::time::timeout(after, send).await.map_err(|_| {
                ProxyError::Timeout {
                    after,
                    custom_code: ctx.options.proxy_timeout_custom_error(),
                }
            })??,
            None => send.await?,
        };

        if res.status() != StatusCode::SWITCHING_PROTOCOLS {
            trace!("Target refused the upgrade status={}", res.status());
            answer_without_upgrade(ctx.socket.take(), res).await?;
            return Ok(Flow::Done(()));
        }

        let upgraded = hyper::upgrade::on(&mut res).await.map_err(|e| {
            ProxyError::from_upstream(Box::new(e), &target.authority(), target.is_secure())
        })?;
        let (parts, _) = res.into_parts();
        trace!("Target accepted the upgrade headers={:?}", parts.headers);

        let client_io: Box<dyn Io> = match ctx.socket.take() {
            Some(ClientSocket::Raw(mut io)) => {
                let mut answer = b"HTTP/1.1 101 Switching Protocols\r\n".to_vec();
                write_header_lines(&mut answer, &parts.headers);
                io.write_all(&answer).await.map_err(client_write_failed)?;
                io
            }
            Some(ClientSocket::Pending { on_upgrade, reply }) => {
                let mut answer = Response::new(Body::empty());
                *answer.status_mut() = parts.status;
                *answer.headers_mut() = parts.headers.clone();
                if reply.send(answer).is_err() {
                    return Err(client_gone(None));
                }
                let upgraded = on_upgrade
                    .await
                    .map_err(|e| client_gone(Some(Box::new(e))))?;
                Box::new(TokioIo::new(upgraded))
            }
            None => return Err(client_gone(None)),
        };

        ctx.socket = Some(ClientSocket::Raw(client_io));
        ctx.upstream = Some(TokioIo::new(upgraded));
        proxy.events().emit(&mut ProxyEvent::Open {
            req: &ctx.req,
            target: &target,
            proxy_res: &parts,
        });
        ctx.proxy_res = Some(parts);
        Ok(Flow::Continue)
    })
}

fn splice<'a>(ctx: &'a mut WsContext, proxy: &'a ProxyServer) -> PassFuture<'a, ()> {
    Box::pin(async move {
        let (Some(ClientSocket::Raw(client_io)), Some(upstream)) =
            (ctx.socket.take(), ctx.upstream.take())
        else {
            return Ok(Flow::Continue);
        };

        let (client_transform, server_transform) = match ctx.proxy_res.as_ref() {
            Some(res) => (
                ctx.options
                    .ws_client_transform()
                    .map(|factory| factory.create(&ctx.req, res)),
                ctx.options
                    .ws_server_transform()
                    .map(|factory| factory.create(&ctx.req, res)),
            ),
            None => (None, None),
        };

        let head = ctx.head.clone();
        let result = relay_both(client_io, upstream, head, client_transform, server_transform).await;
        trace!("Websocket splice finished result={:?}", result);

        if let (Some(target), Some(res)) = (ctx.target.as_ref(), ctx.proxy_res.as_ref()) {
            proxy.events().emit(&mut ProxyEvent::Close {
                req: &ctx.req,
                target,
                proxy_res: res,
            });
        }
        result.map_err(|(cause, e)| ProxyError::from_socket(e, cause))?;
        Ok(Flow::Done(()))
    })
}

fn write_header_lines(buf: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Relay a non-`101` target answer to the client as-is.
async fn answer_without_upgrade(
    socket: Option<ClientSocket>,
    res: Response<Incoming>,
) -> Result<(), ProxyError> {
    let (mut parts, mut body) = res.into_parts();
    match socket {
        Some(ClientSocket::Raw(mut io)) => {
            // The body is written decoded and delimited by closing the socket.
            parts.headers.remove(header::TRANSFER_ENCODING);
            parts
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));

            let mut answer = format!(
                "HTTP/1.1 {} {}\r\n",
                parts.status.as_u16(),
                parts.status.canonical_reason().unwrap_or_default()
            )
            .into_bytes();
            write_header_lines(&mut answer, &parts.headers);
            io.write_all(&answer).await.map_err(client_write_failed)?;

            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| ProxyError::ConnectionReset {
                    cause: ResetCause::Target,
                    source: Some(Box::new(e)),
                })?;
                if let Ok(data) = frame.into_data() {
                    io.write_all(&data).await.map_err(client_write_failed)?;
                }
            }
            io.shutdown().await.map_err(client_write_failed)?;
        }
        Some(ClientSocket::Pending { reply, .. }) => {
            let _ = reply.send(Response::from_parts(parts, Body::new(body)));
        }
        None => {}
    }
    Ok(())
}

fn client_write_failed(err: io::Error) -> ProxyError {
    ProxyError::from_socket(err, ResetCause::ClientAborted)
}

/// A splice failure, tagged with the side whose socket failed.
type SpliceError = (ResetCause, io::Error);

async fn relay_both(
    client: Box<dyn Io>,
    mut upstream: TokioIo<Upgraded>,
    head: Bytes,
    client_transform: Option<Box<dyn StreamTransform>>,
    server_transform: Option<Box<dyn StreamTransform>>,
) -> Result<(), SpliceError> {
    if !head.is_empty() {
        upstream
            .write_all(&head)
            .await
            .map_err(|e| (ResetCause::Target, e))?;
    }

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    // Whichever side finishes first tears the other one down.
    let result = tokio::select! {
        r = copy_direction(
            &mut client_read,
            ResetCause::ClientAborted,
            &mut upstream_write,
            ResetCause::Target,
            client_transform,
        ) => r,
        r = copy_direction(
            &mut upstream_read,
            ResetCause::Target,
            &mut client_write,
            ResetCause::ClientAborted,
            server_transform,
        ) => r,
    };
    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;
    result.map(|_| ())
}

/// Copy `reader` into `writer` until EOF. Errors carry the side they came
/// from.
async fn copy_direction<R, W>(
    reader: &mut R,
    reader_side: ResetCause,
    writer: &mut W,
    writer_side: ResetCause,
    mut transform: Option<Box<dyn StreamTransform>>,
) -> Result<u64, SpliceError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        buf.reserve(16 * 1024);
        let n = reader
            .read_buf(&mut buf)
            .await
            .map_err(|e| (reader_side, e))?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        let chunk = buf.split().freeze();
        let chunk = match transform.as_mut() {
            Some(transform) => transform.transform(chunk),
            None => chunk,
        };
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| (writer_side, e))?;
        writer.flush().await.map_err(|e| (writer_side, e))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Upgrade", HeaderValue::from_static("websocket"));
        headers.insert(
            "Connection",
            HeaderValue::from_static("keep-alive, Upgrade"),
        );
        headers.insert(
            "Sec-WebSocket-Key",
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers.insert("Sec-WebSocket-Version", HeaderValue::from_static("13"));
        headers
    }

    #[test]
    fn websocket_upgrade_valid_headers() {
        assert!(is_websocket_upgrade(&upgrade_headers()));
    }

    #[test]
    fn websocket_upgrade_missing_upgrade_header() {
        let mut headers = upgrade_headers();
        headers.remove("Upgrade");
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn websocket_upgrade_invalid_connection_header() {
        let mut headers = upgrade_headers();
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn websocket_upgrade_missing_key_or_version() {
        let mut headers = upgrade_headers();
        headers.remove("Sec-WebSocket-Key");
        assert!(!is_websocket_upgrade(&headers));

        let mut headers = upgrade_headers();
        headers.remove("Sec-WebSocket-Version");
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn header_lines_end_with_blank_line() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        let mut buf = Vec::new();
        write_header_lines(&mut buf, &headers);
        assert_eq!(buf, b"upgrade: websocket\r\n\r\n");
    }

    #[tokio::test]
    async fn transforms_rewrite_one_direction() {
        let (mut near, far) = tokio::io::duplex(64);
        let (mut far_read, _far_write) = tokio::io::split(far);
        let (mut out_read, mut out_write) = tokio::io::duplex(64);

        near.write_all(b"abc").await.unwrap();
        drop(near);

        let upper: Box<dyn StreamTransform> =
            Box::new(|chunk: Bytes| Bytes::from(chunk.to_ascii_uppercase()));
        copy_direction(
            &mut far_read,
            ResetCause::ClientAborted,
            &mut out_write,
            ResetCause::Target,
            Some(upper),
        )
        .await
        .unwrap();
        drop(out_write);

        let mut seen = Vec::new();
        out_read.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"ABC");
    }

    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    #[tokio::test]
    async fn read_failures_blame_the_reading_side() {
        let (_keep, mut sink) = tokio::io::duplex(64);
        let (cause, err) = copy_direction(
            &mut Broken,
            ResetCause::ClientAborted,
            &mut sink,
            ResetCause::Target,
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(cause, ResetCause::ClientAborted);
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn write_failures_blame_the_writing_side() {
        let (mut source, mut source_far) = tokio::io::duplex(64);
        source.write_all(b"hello").await.unwrap();
        drop(source);

        let (sink, dropped) = tokio::io::duplex(64);
        drop(dropped);
        let (_sink_read, mut sink_write) = tokio::io::split(sink);

        let (cause, _) = copy_direction(
            &mut source_far,
            ResetCause::ClientAborted,
            &mut sink_write,
            ResetCause::Target,
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(cause, ResetCause::Target);
    }
}
