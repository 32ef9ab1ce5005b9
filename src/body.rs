use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use crate::error::{BoxError, ProxyError};

/// Tracks the last moment the client side of a dispatch showed activity.
#[derive(Debug, Clone)]
pub(crate) struct IdleTimer {
    timeout: Duration,
    started: Instant,
    last_ms: Arc<AtomicU64>,
}

impl IdleTimer {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + self.timeout
    }

    /// Resolves once no activity was seen for the configured timeout.
    pub(crate) async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Request body wrapper that counts every frame as client activity.
pub(crate) struct ActivityBody<B> {
    body: B,
    idle: IdleTimer,
}

impl<B> ActivityBody<B> {
    pub(crate) fn new(body: B, idle: IdleTimer) -> Self {
        Self { body, idle }
    }
}

impl<B> HttpBody for ActivityBody<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.body).poll_frame(cx);
        if polled.is_ready() {
            self.idle.touch();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.body.size_hint()
    }
}

/// Frames buffered per branch of a [`tee`] before the source stops being
/// polled.
const TEE_CAPACITY: usize = 8;

/// Body fed by a bounded channel.
pub(crate) struct ChannelBody {
    rx: mpsc::Receiver<Result<Bytes, BoxError>>,
}

impl HttpBody for ChannelBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|chunk| chunk.map(Frame::data)))
    }
}

/// Split `body` into two bodies carrying the same data frames.
///
/// The source is only read as fast as the slower branch consumes; a branch
/// that is dropped stops receiving without affecting the other.
pub(crate) fn tee<B>(body: B) -> (ChannelBody, ChannelBody)
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: fmt::Display + Send,
{
    let (left_tx, left_rx) = mpsc::channel(TEE_CAPACITY);
    let (right_tx, right_rx) = mpsc::channel(TEE_CAPACITY);

    tokio::spawn(async move {
        let mut body = body;
        while let Some(frame) = body.frame().await {
            let data = match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => data,
                    Err(_) => continue,
                },
                Err(e) => {
                    let reason = e.to_string();
                    let _ = left_tx.send(Err(reason.clone().into())).await;
                    let _ = right_tx.send(Err(reason.into())).await;
                    return;
                }
            };
            let left = left_tx.send(Ok(data.clone())).await;
            let right = right_tx.send(Ok(data)).await;
            if left.is_err() && right.is_err() {
                return;
            }
        }
    });

    (ChannelBody { rx: left_rx }, ChannelBody { rx: right_rx })
}

type EndHook = Box<dyn FnOnce() + Send>;
type IdleHook = Box<dyn FnOnce(&ProxyError) + Send>;

/// Response body relayed from the target to the client.
///
/// Fires `on_end` once the target's body is exhausted and fails the stream
/// when the client side stays idle past the inbound timeout.
pub(crate) struct RelayBody<B> {
    body: B,
    idle: Option<(Duration, Pin<Box<Sleep>>)>,
    on_end: Option<EndHook>,
    on_idle: Option<IdleHook>,
}

impl<B> RelayBody<B> {
    pub(crate) fn new(body: B) -> Self {
        Self {
            body,
            idle: None,
            on_end: None,
            on_idle: None,
        }
    }

    pub(crate) fn idle_timeout(mut self, timeout: Duration, on_idle: IdleHook) -> Self {
        self.idle = Some((timeout, Box::pin(tokio::time::sleep(timeout))));
        self.on_idle = Some(on_idle);
        self
    }

    pub(crate) fn on_end(mut self, hook: EndHook) -> Self {
        self.on_end = Some(hook);
        self
    }

    fn finish(&mut self) {
        self.idle = None;
        if let Some(hook) = self.on_end.take() {
            hook();
        }
    }
}

impl<B> HttpBody for RelayBody<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.body).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some((timeout, sleep)) = this.idle.as_mut() {
                    sleep.as_mut().reset(Instant::now() + *timeout);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.idle = None;
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => {
                let Some((timeout, sleep)) = this.idle.as_mut() else {
                    return Poll::Pending;
                };
                if sleep.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                let error = ProxyError::InboundIdleTimeout { after: *timeout };
                this.idle = None;
                if let Some(hook) = this.on_idle.take() {
                    hook(&error);
                }
                Poll::Ready(Some(Err(Box::new(error))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.body.size_hint()
    }
}
