//! Passes shaping the client response from the target's response.

use http::{header, HeaderValue, Response, StatusCode, Version};
use tracing::{trace, warn};
use url::{Position, Url};

use crate::cookie::{remove_secure, rewrite_cookie_property};
use crate::options::ProxyOptions;
use crate::pass::{Flow, PassFuture};
use crate::proxy::ProxyServer;
use crate::target::ProxyTarget;
use crate::web::{empty_head, WebContext, WebOutcome};

pub(crate) fn remove_chunked<'a>(
    ctx: &'a mut WebContext,
    _proxy: &'a ProxyServer,
) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        if ctx.req.version == Version::HTTP_10 {
            if let Some(res) = ctx.proxy_res.as_mut() {
                res.headers.remove(header::TRANSFER_ENCODING);
            }
        }
        Ok(Flow::Continue)
    })
}

pub(crate) fn set_connection<'a>(
    ctx: &'a mut WebContext,
    _proxy: &'a ProxyServer,
) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        let Some(res) = ctx.proxy_res.as_mut() else {
            return Ok(Flow::Continue);
        };
        let inbound = ctx.req.headers.get(header::CONNECTION).cloned();
        match ctx.req.version {
            Version::HTTP_10 => {
                let value = inbound.unwrap_or_else(|| HeaderValue::from_static("close"));
                res.headers.insert(header::CONNECTION, value);
            }
            Version::HTTP_2 | Version::HTTP_3 => {}
            _ => {
                if !res.headers.contains_key(header::CONNECTION) {
                    let value = inbound.unwrap_or_else(|| HeaderValue::from_static("keep-alive"));
                    res.headers.insert(header::CONNECTION, value);
                }
            }
        }
        Ok(Flow::Continue)
    })
}

fn is_rewritable_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 307 | 308)
}

/// `host[:port]` of a location URL, omitting default ports the way
/// [`ProxyTarget::host_header`] does.
fn location_host(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Rewrite a redirect location that points at `target`.
pub(crate) fn rewrite_location(
    location: &str,
    target: &ProxyTarget,
    inbound_host: Option<&str>,
    options: &ProxyOptions,
) -> Option<String> {
    let url = Url::parse(location).ok()?;
    if location_host(&url)? != target.host_header() {
        return None;
    }

    let host = match (options.host_rewrite(), options.auto_rewrite()) {
        (Some(host), _) => host.to_string(),
        (None, true) => inbound_host?.to_string(),
        (None, false) => location_host(&url)?,
    };
    let scheme = options.protocol_rewrite().unwrap_or(url.scheme());
    let scheme = scheme.trim_end_matches(':');

    Some(format!("{scheme}://{host}{}", &url[Position::BeforePath..]))
}

pub(crate) fn set_redirect_host_rewrite<'a>(
    ctx: &'a mut WebContext,
    _proxy: &'a ProxyServer,
) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        let options = &ctx.options;
        let wants_rewrite = options.host_rewrite().is_some()
            || options.auto_rewrite()
            || options.protocol_rewrite().is_some();
        let (Some(res), Some(target)) = (ctx.proxy_res.as_mut(), ctx.target.as_ref()) else {
            return Ok(Flow::Continue);
        };
        if !wants_rewrite || !is_rewritable_redirect(res.status) {
            return Ok(Flow::Continue);
        }
        let Some(location) = res.headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
            return Ok(Flow::Continue);
        };

        let inbound_host = ctx
            .req
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok());
        if let Some(rewritten) = rewrite_location(location, target, inbound_host, options) {
            match HeaderValue::from_str(&rewritten) {
                Ok(value) => {
                    trace!("Rewrote redirect location={}", rewritten);
                    res.headers.insert(header::LOCATION, value);
                }
                Err(e) => warn!("keeping original location, rewrite is not a valid header: {e}"),
            }
        }
        Ok(Flow::Continue)
    })
}

fn rewrite_set_cookie(value: &HeaderValue, options: &ProxyOptions) -> HeaderValue {
    let domain = options.cookie_domain_rewrite();
    let path = options.cookie_path_rewrite();
    let strip_secure = options.cookie_remove_secure();
    if domain.is_none() && path.is_none() && !strip_secure {
        return value.clone();
    }
    let Ok(original) = value.to_str() else {
        return value.clone();
    };

    let mut cookie = original.to_string();
    if let Some(rewrite) = domain {
        cookie = rewrite_cookie_property(&cookie, rewrite, "domain");
    }
    if let Some(rewrite) = path {
        cookie = rewrite_cookie_property(&cookie, rewrite, "path");
    }
    if strip_secure {
        cookie = remove_secure(&cookie);
    }
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| value.clone())
}

pub(crate) fn write_headers<'a>(
    ctx: &'a mut WebContext,
    _proxy: &'a ProxyServer,
) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        let Some(proxy_res) = ctx.proxy_res.as_ref() else {
            return Ok(Flow::Continue);
        };
        let merge_cookies = ctx.options.merge_cookies();

        for name in proxy_res.headers.keys() {
            let is_cookie = name == header::SET_COOKIE;
            let mut values: Vec<HeaderValue> = if is_cookie && merge_cookies {
                ctx.res.headers.get_all(name).iter().cloned().collect()
            } else {
                Vec::new()
            };
            ctx.res.headers.remove(name);

            for value in proxy_res.headers.get_all(name) {
                if is_cookie {
                    values.push(rewrite_set_cookie(value, &ctx.options));
                } else {
                    values.push(value.clone());
                }
            }
            for value in values {
                ctx.res.headers.append(name.clone(), value);
            }
        }

        if ctx.options.preserve_header_key_case() {
            ctx.res.extensions = proxy_res.extensions.clone();
        }
        Ok(Flow::Continue)
    })
}

pub(crate) fn write_status_code<'a>(
    ctx: &'a mut WebContext,
    _proxy: &'a ProxyServer,
) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        if let Some(proxy_res) = ctx.proxy_res.as_ref() {
            ctx.res.status = proxy_res.status;
        }
        Ok(Flow::Continue)
    })
}

pub(crate) fn pipe<'a>(ctx: &'a mut WebContext, proxy: &'a ProxyServer) -> PassFuture<'a, WebOutcome> {
    Box::pin(async move {
        let (Some(proxy_res), Some(body)) = (ctx.proxy_res.take(), ctx.proxy_body.take()) else {
            return Ok(Flow::Continue);
        };
        let body = ctx.relay_body(proxy, &proxy_res, body);
        let head = std::mem::replace(&mut ctx.res, empty_head());
        let response = Response::from_parts(head, body);

        Ok(Flow::Done(if ctx.self_handled {
            WebOutcome::SelfHandled(response)
        } else {
            WebOutcome::Response(response)
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::CookieRewrite;

    fn target() -> ProxyTarget {
        ProxyTarget::parse("http://backend:9000").unwrap()
    }

    #[test]
    fn host_rewrite_wins() {
        let options = ProxyOptions::new().with_host_rewrite("public.example");
        assert_eq!(
            rewrite_location("http://backend:9000/login?x=1", &target(), None, &options).as_deref(),
            Some("http://public.example/login?x=1")
        );
    }

    #[test]
    fn auto_rewrite_uses_inbound_host() {
        let options = ProxyOptions::new().with_auto_rewrite(true);
        assert_eq!(
            rewrite_location("http://backend:9000/a", &target(), Some("front:8080"), &options)
                .as_deref(),
            Some("http://front:8080/a")
        );
    }

    #[test]
    fn protocol_rewrite_keeps_host() {
        let options = ProxyOptions::new().with_protocol_rewrite("https");
        assert_eq!(
            rewrite_location("http://backend:9000/a", &target(), None, &options).as_deref(),
            Some("https://backend:9000/a")
        );
    }

    #[test]
    fn foreign_locations_are_left_alone() {
        let options = ProxyOptions::new().with_host_rewrite("public.example");
        assert!(rewrite_location("http://elsewhere:9000/a", &target(), None, &options).is_none());
        assert!(rewrite_location("/relative", &target(), None, &options).is_none());
    }

    #[test]
    fn only_redirect_statuses_are_rewritten() {
        for status in [301, 302, 307, 308] {
            assert!(is_rewritable_redirect(StatusCode::from_u16(status).unwrap()));
        }
        assert!(!is_rewritable_redirect(StatusCode::OK));
        assert!(!is_rewritable_redirect(StatusCode::SEE_OTHER));
    }

    #[test]
    fn set_cookie_rewrites_compose() {
        let options = ProxyOptions::new()
            .with_cookie_domain_rewrite("front.example")
            .with_cookie_path_rewrite(CookieRewrite::new().rule("/api", "/"))
            .with_cookie_remove_secure(true);
        let value = HeaderValue::from_static("sid=1; Domain=backend; Path=/api; Secure");
        assert_eq!(
            rewrite_set_cookie(&value, &options),
            "sid=1; Domain=front.example; Path=/"
        );
    }
}
