use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use axum_pass_proxy::{CookieRewrite, EventKind, ProxyEvent, ProxyOptions, ProxyServer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

async fn echo_headers(req: Request<Body>) -> Json<Value> {
    let headers = req.headers().clone();
    Json(json!({ "headers": headers.iter().map(|(k, v)| {
        (k.as_str().to_string(), v.to_str().unwrap().to_string())
    }).collect::<HashMap<String, String>>() }))
}

async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn headers_seen(proxy: &ProxyServer, req: Request<Body>) -> HashMap<String, String> {
    let res = proxy
        .dispatch_web(req, None, None)
        .await
        .unwrap()
        .into_response();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    serde_json::from_value(body["headers"].clone()).unwrap()
}

fn request(host: &str) -> Request<Body> {
    Request::builder()
        .uri("/headers")
        .header("host", host)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_proxy_header_handling() {
    let addr = spawn_upstream(Router::new().route("/headers", get(echo_headers))).await;
    let proxy = ProxyServer::new(ProxyOptions::new().with_target(format!("http://{addr}")));

    let mut req = request("front.local");
    for i in 0..10 {
        req.headers_mut().insert(
            axum::http::HeaderName::from_bytes(format!("x-test-{i}").as_bytes()).unwrap(),
            HeaderValue::from_str(&format!("value-{i}")).unwrap(),
        );
    }
    req.headers_mut()
        .insert("connection", HeaderValue::from_static("keep-alive"));

    let seen = headers_seen(&proxy, req).await;
    for i in 0..10 {
        assert_eq!(seen[&format!("x-test-{i}")], format!("value-{i}"));
    }
    assert_eq!(seen["host"], "front.local");
}

#[tokio::test]
async fn test_change_origin_sets_target_host() {
    let addr = spawn_upstream(Router::new().route("/headers", get(echo_headers))).await;
    let proxy = ProxyServer::new(
        ProxyOptions::new()
            .with_target(format!("http://{addr}"))
            .with_change_origin(true),
    );

    let seen = headers_seen(&proxy, request("front.local")).await;
    assert_eq!(seen["host"], format!("127.0.0.1:{}", addr.port()));
}

#[tokio::test]
async fn test_auth_and_configured_headers() {
    let addr = spawn_upstream(Router::new().route("/headers", get(echo_headers))).await;

    let mut extra = HeaderMap::new();
    extra.insert("x-team", HeaderValue::from_static("configured"));
    let mut outgoing = HeaderMap::new();
    outgoing.insert("x-last", HeaderValue::from_static("wins"));

    let proxy = ProxyServer::new(
        ProxyOptions::new()
            .with_target(format!("http://{addr}"))
            .with_auth("user:secret")
            .with_headers(extra)
            .with_outgoing_headers(outgoing),
    );

    let mut req = request("front.local");
    req.headers_mut()
        .insert("x-team", HeaderValue::from_static("inbound"));
    req.headers_mut()
        .insert("x-last", HeaderValue::from_static("inbound"));

    let seen = headers_seen(&proxy, req).await;
    assert_eq!(seen["authorization"], "Basic dXNlcjpzZWNyZXQ=");
    assert_eq!(seen["x-team"], "configured");
    assert_eq!(seen["x-last"], "wins");
}

#[tokio::test]
async fn test_proxy_req_listener_can_edit_outbound_request() {
    let addr = spawn_upstream(Router::new().route("/headers", get(echo_headers))).await;
    let proxy = ProxyServer::new(ProxyOptions::new().with_target(format!("http://{addr}")));
    let fired = Arc::new(Mutex::new(0));
    let counter = fired.clone();
    proxy.on(EventKind::ProxyReq, move |event| {
        if let ProxyEvent::ProxyReq { proxy_req, .. } = event {
            proxy_req
                .headers
                .insert("x-added-by-listener", HeaderValue::from_static("yes"));
            *counter.lock().unwrap() += 1;
        }
    });

    let seen = headers_seen(&proxy, request("front.local")).await;
    assert_eq!(seen["x-added-by-listener"], "yes");
    assert_eq!(*fired.lock().unwrap(), 1);

    let mut expecting = request("front.local");
    expecting
        .headers_mut()
        .insert("expect", HeaderValue::from_static("100-continue"));
    let seen = headers_seen(&proxy, expecting).await;
    assert!(!seen.contains_key("x-added-by-listener"));
    assert_eq!(*fired.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_xfwd_reflects_the_client_socket() {
    let addr = spawn_upstream(Router::new().route("/headers", get(echo_headers))).await;
    let proxy = ProxyServer::new(
        ProxyOptions::new()
            .with_target(format!("http://{addr}"))
            .with_xfwd(true),
    );
    let listening = proxy.listen("127.0.0.1:0").await.unwrap();

    let response = reqwest::Client::new()
        .get(format!("http://{}/headers", listening.local_addr()))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let headers = &body["headers"];

    assert_eq!(headers["x-forwarded-for"], "127.0.0.1");
    assert_eq!(headers["x-forwarded-proto"], "http");
    let port: u16 = headers["x-forwarded-port"].as_str().unwrap().parse().unwrap();
    assert_ne!(port, listening.local_addr().port());
    assert_eq!(
        headers["x-forwarded-host"],
        listening.local_addr().to_string()
    );

    listening.close().await;
}

#[tokio::test]
async fn test_set_cookie_rewrites() {
    let app = Router::new().route(
        "/login",
        get(|| async {
            let mut headers = HeaderMap::new();
            headers.append(
                "set-cookie",
                HeaderValue::from_static("sid=1; Domain=backend.internal; Path=/app; Secure"),
            );
            headers.append(
                "set-cookie",
                HeaderValue::from_static("theme=dark; Path=/app/prefs"),
            );
            (StatusCode::OK, headers, "ok").into_response()
        }),
    );
    let addr = spawn_upstream(app).await;
    let proxy = ProxyServer::new(
        ProxyOptions::new()
            .with_target(format!("http://{addr}"))
            .with_cookie_domain_rewrite(CookieRewrite::new().rule("backend.internal", "front.example"))
            .with_cookie_path_rewrite(CookieRewrite::new().rule("/app", "/"))
            .with_cookie_remove_secure(true),
    );

    let req = Request::builder().uri("/login").body(Body::empty()).unwrap();
    let res = proxy
        .dispatch_web(req, None, None)
        .await
        .unwrap()
        .into_response();

    let cookies: Vec<_> = res
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(
        cookies,
        vec![
            "sid=1; Domain=front.example; Path=/".to_string(),
            "theme=dark; Path=/app/prefs".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_redirects_to_target_are_rewritten() {
    let app = Router::new().fallback(|req: Request<Body>| async move {
        let host = req.headers()["host"].to_str().unwrap().to_string();
        (
            StatusCode::FOUND,
            [("location", format!("http://{host}/next?step=2"))],
        )
    });
    let addr = spawn_upstream(app).await;
    let proxy = ProxyServer::new(
        ProxyOptions::new()
            .with_target(format!("http://{addr}"))
            .with_change_origin(true)
            .with_auto_rewrite(true)
            .with_protocol_rewrite("https"),
    );

    let req = request("public.example:8443");
    let res = proxy
        .dispatch_web(req, None, None)
        .await
        .unwrap()
        .into_response();
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(
        res.headers()["location"],
        "https://public.example:8443/next?step=2"
    );
}
