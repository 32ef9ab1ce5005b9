//! Named proxy events and their dispatcher.
//!
//! Listeners are plain synchronous closures. Emitting reports whether at
//! least one listener saw the event, which is how a dispatch decides whether
//! its failure was handled.

use arc_swap::ArcSwap;
use http::{request, response};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ProxyError;
use crate::options::ProxyOptions;
use crate::target::ProxyTarget;

/// The name of an event, used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    EconnReset,
    ProxyReq,
    ProxyRes,
    Start,
    End,
    Open,
    Close,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Error => "error",
            EventKind::EconnReset => "econnreset",
            EventKind::ProxyReq => "proxyReq",
            EventKind::ProxyRes => "proxyRes",
            EventKind::Start => "start",
            EventKind::End => "end",
            EventKind::Open => "open",
            EventKind::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event together with the objects that triggered it.
///
/// `req` is always the inbound request (or upgrade request) head.
pub enum ProxyEvent<'a> {
    /// A dispatch failed.
    Error {
        error: &'a ProxyError,
        req: &'a request::Parts,
        target: Option<&'a ProxyTarget>,
    },
    /// A dispatch failed because a connection was reset or the client went
    /// idle or away.
    EconnReset {
        error: &'a ProxyError,
        req: &'a request::Parts,
        target: Option<&'a ProxyTarget>,
    },
    /// The outbound request head is about to be sent. Listeners may mutate
    /// it.
    ProxyReq {
        proxy_req: &'a mut request::Parts,
        req: &'a request::Parts,
        options: &'a ProxyOptions,
    },
    /// The target answered with a response head.
    ProxyRes {
        proxy_res: &'a response::Parts,
        req: &'a request::Parts,
    },
    /// The web pipeline is about to contact `target`.
    Start {
        req: &'a request::Parts,
        target: &'a ProxyTarget,
    },
    /// The target's response body was fully relayed.
    End {
        req: &'a request::Parts,
        proxy_res: &'a response::Parts,
    },
    /// A websocket connection to the target was established.
    Open {
        req: &'a request::Parts,
        target: &'a ProxyTarget,
        proxy_res: &'a response::Parts,
    },
    /// A spliced websocket connection was torn down.
    Close {
        req: &'a request::Parts,
        target: &'a ProxyTarget,
        proxy_res: &'a response::Parts,
    },
}

impl ProxyEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::Error { .. } => EventKind::Error,
            ProxyEvent::EconnReset { .. } => EventKind::EconnReset,
            ProxyEvent::ProxyReq { .. } => EventKind::ProxyReq,
            ProxyEvent::ProxyRes { .. } => EventKind::ProxyRes,
            ProxyEvent::Start { .. } => EventKind::Start,
            ProxyEvent::End { .. } => EventKind::End,
            ProxyEvent::Open { .. } => EventKind::Open,
            ProxyEvent::Close { .. } => EventKind::Close,
        }
    }
}

/// A registered event listener.
pub type Listener = Arc<dyn Fn(&mut ProxyEvent<'_>) + Send + Sync>;

type ListenerMap = HashMap<EventKind, Vec<Listener>>;

/// Fans events out to registered listeners.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: ArcSwap<ListenerMap>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`. Listeners run in registration order.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&mut ProxyEvent<'_>) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.listeners.rcu(|current| {
            let mut next = ListenerMap::clone(current);
            next.entry(kind).or_default().push(listener.clone());
            next
        });
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.load().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to its listeners. Returns `false` when nobody was
    /// listening.
    pub fn emit(&self, event: &mut ProxyEvent<'_>) -> bool {
        let listeners = self.listeners.load_full();
        match listeners.get(&event.kind()) {
            Some(registered) if !registered.is_empty() => {
                for listener in registered {
                    listener(&mut *event);
                }
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.load();
        let mut map = f.debug_map();
        for (kind, registered) in listeners.iter() {
            map.entry(kind, &registered.len());
        }
        map.finish()
    }
}
