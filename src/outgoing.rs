//! Construction of the outbound request head.
//!
//! Nothing here touches the network: given the inbound head, the merged
//! options and the resolved target, it produces the head that the upstream
//! client will send.

use base64::{engine::general_purpose::STANDARD, Engine};
use http::{header, request, HeaderValue, Request, Uri};
use tracing::{trace, warn};

use crate::error::ProxyError;
use crate::options::ProxyOptions;
use crate::target::ProxyTarget;

const HOP_HEADERS: [&str; 3] = ["connection", "keep-alive", "proxy-connection"];

/// Join path fragments with single slashes. The query string of the last
/// fragment is kept as-is.
pub(crate) fn url_join(fragments: &[&str]) -> String {
    let Some((last, rest)) = fragments.split_last() else {
        return String::new();
    };
    let mut last_segments = last.split('?');
    let last_path = last_segments.next().unwrap_or_default();

    let joined = rest
        .iter()
        .copied()
        .chain(std::iter::once(last_path))
        .filter(|fragment| !fragment.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    let mut collapsed = String::with_capacity(joined.len());
    for c in joined.chars() {
        if c == '/' && collapsed.ends_with('/') {
            continue;
        }
        collapsed.push(c);
    }
    let mut out = collapsed
        .replacen("http:/", "http://", 1)
        .replacen("https:/", "https://", 1);

    for query in last_segments {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Path (and query) the outbound request is sent to.
pub(crate) fn outbound_path(
    req: &request::Parts,
    target: &ProxyTarget,
    options: &ProxyOptions,
) -> String {
    let target_path = if options.prepend_path() {
        target.path.as_str()
    } else {
        ""
    };

    let inbound = if options.ignore_path() {
        String::new()
    } else if options.to_proxy() {
        req.uri.to_string()
    } else {
        req.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default()
    };

    let path = url_join(&[target_path, &inbound]);
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

/// Build the outbound request head for `target`.
///
/// Upgrade requests keep their `connection`/`upgrade` pair; everything else
/// has hop-by-hop headers removed so the client can manage its own
/// connections.
pub(crate) fn outbound_head(
    req: &request::Parts,
    target: &ProxyTarget,
    options: &ProxyOptions,
    upgrade: bool,
) -> Result<request::Parts, ProxyError> {
    let path = outbound_path(req, target, options);
    let uri: Uri = target.uri_for(&path).parse().map_err(http::Error::from)?;
    let method = options.method().unwrap_or(&req.method).clone();

    let (mut head, ()) = Request::builder()
        .method(method)
        .uri(uri)
        .body(())?
        .into_parts();

    head.headers = req.headers.clone();
    if upgrade {
        head.headers
            .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        head.headers
            .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    } else {
        for name in HOP_HEADERS {
            head.headers.remove(name);
        }
    }

    if !head.headers.contains_key(header::HOST) {
        if let Some(authority) = req.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                head.headers.insert(header::HOST, value);
            }
        }
    }

    if let Some(extra) = options.headers() {
        for name in extra.keys() {
            head.headers.remove(name);
        }
        for (name, value) in extra {
            head.headers.append(name, value.clone());
        }
    }

    if let Some(auth) = options.auth() {
        let encoded = STANDARD.encode(auth);
        match HeaderValue::from_str(&format!("Basic {encoded}")) {
            Ok(value) => {
                head.headers.insert(header::AUTHORIZATION, value);
            }
            Err(e) => warn!("dropping unusable auth credential: {e}"),
        }
    }

    if options.change_origin() {
        match HeaderValue::from_str(&target.host_header()) {
            Ok(value) => {
                head.headers.insert(header::HOST, value);
            }
            Err(e) => warn!("cannot use target host as Host header: {e}"),
        }
    }

    if let Some(outgoing) = options.outgoing_headers() {
        for (name, value) in outgoing {
            head.headers.insert(name, value.clone());
        }
    }

    trace!(
        "Outbound request method={} uri={} headers={:?}",
        head.method,
        head.uri,
        head.headers
    );
    Ok(head)
}
