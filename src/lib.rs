//! An embeddable HTTP and WebSocket reverse proxy core for axum and hyper.
//!
//! A [`ProxyServer`] runs every request through an ordered pipeline of named
//! passes. The web pipeline prepares the outbound request, streams it to the
//! target and shapes the target's response; the websocket pipeline checks the
//! handshake, dials the target and splices both connections. Passes can be
//! inserted next to any existing pass by name, and named events report what
//! happens along the way.
//!
//! # Example
//!
//! ```rust,no_run
//! use axum_pass_proxy::{EventKind, ProxyEvent, ProxyOptions, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let proxy = ProxyServer::new(
//!         ProxyOptions::new()
//!             .with_target("http://127.0.0.1:3000")
//!             .with_xfwd(true)
//!             .with_ws(true),
//!     );
//!     proxy.on(EventKind::Error, |event: &mut ProxyEvent<'_>| {
//!         if let ProxyEvent::Error { error, req, .. } = event {
//!             eprintln!("{} {} failed: {}", req.method, req.uri, error);
//!         }
//!     });
//!
//!     let listening = proxy.listen("127.0.0.1:8080").await?;
//!     tokio::signal::ctrl_c().await?;
//!     listening.close().await;
//!     Ok(())
//! }
//! ```
//!
//! Requests can also be dispatched directly, with per-call overrides:
//!
//! ```rust,no_run
//! use axum::body::Body;
//! use axum_pass_proxy::{ProxyOptions, ProxyServer};
//! use http::Request;
//!
//! # async fn run() {
//! let proxy = ProxyServer::new(ProxyOptions::new().with_target("http://127.0.0.1:3000"));
//! let overrides = ProxyOptions::new().with_target("http://127.0.0.1:3001");
//! let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
//! match proxy.dispatch_web(req, Some(&overrides), None).await {
//!     Ok(outcome) => println!("status {}", outcome.into_response().status()),
//!     Err(e) => eprintln!("{} (handled: {})", e.code(), e.handled),
//! }
//! # }
//! ```

mod body;
mod client;
mod cookie;
mod danger;
mod error;
mod events;
mod options;
mod outgoing;
mod pass;
mod proxy;
mod response;
mod router;
mod target;
mod web;
mod websocket;

pub use client::{Resolve, ResolveFuture, TokioResolver};
pub use cookie::CookieRewrite;
pub use error::{BoxError, DispatchError, ProxyError, ResetCause};
pub use events::{EventDispatcher, EventKind, Listener, ProxyEvent};
pub use options::{
    normalize, FollowRedirects, ProxyOptions, ResolvedOptions, SelfHandleResponse, TargetSpec,
    TransformFactory,
};
pub use pass::{pass_fn, Flow, FnPass, Pass, PassContext, PassFuture, Pipeline, Placement};
pub use proxy::{ClientInfo, ErrorCallback, ProxyServer};
pub use router::Listening;
pub use target::{ProxyTarget, Scheme, TargetParseError};
pub use web::{WebContext, WebOutcome};
pub use websocket::{StreamTransform, WsContext};
