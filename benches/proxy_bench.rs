use axum::{
    routing::{get, post},
    Router,
};
use axum_pass_proxy::{pass_fn, Flow, Placement, ProxyOptions, ProxyServer, WebContext};
use criterion::{criterion_group, criterion_main, Criterion};
use http::HeaderValue;
use hyper::StatusCode;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

async fn create_test_server() -> String {
    let app = Router::new()
        .route("/test", get(|| async { "Hello from test server!" }))
        .route("/echo", post(|body: String| async move { body }));

    let test_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let test_addr = test_listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(test_listener, app).await.unwrap();
    });
    test_addr
}

/// Start `proxy` on an ephemeral port. The listener is leaked for the
/// lifetime of the benchmark.
fn serve(rt: &Runtime, proxy: ProxyServer) -> SocketAddr {
    rt.block_on(async move {
        let listening = proxy.listen("127.0.0.1:0").await.unwrap();
        let addr = listening.local_addr();
        std::mem::forget(listening);
        addr
    })
}

fn bench_http1_get(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let test_addr = rt.block_on(create_test_server());
    let client = reqwest::Client::new();

    let plain = serve(
        &rt,
        ProxyServer::new(ProxyOptions::new().with_target(format!("http://{test_addr}"))),
    );
    c.bench_function("http1_get_default_passes", |b| {
        b.to_async(&rt).iter(|| async {
            let response = client
                .get(format!("http://{plain}/test"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), StatusCode::OK.as_u16());
        });
    });

    // Every header option turned on plus one inserted pass.
    let shaped = ProxyServer::new(
        ProxyOptions::new()
            .with_target(format!("http://{test_addr}"))
            .with_xfwd(true)
            .with_change_origin(true)
            .with_auth("bench:bench"),
    );
    shaped
        .insert_web_pass(
            Placement::Before("stream"),
            pass_fn("tag", |ctx: &mut WebContext, _proxy: &ProxyServer| {
                ctx.req
                    .headers
                    .insert("x-bench", HeaderValue::from_static("1"));
                Ok(Flow::Continue)
            }),
        )
        .unwrap();
    let shaped = serve(&rt, shaped);
    c.bench_function("http1_get_shaped", |b| {
        b.to_async(&rt).iter(|| async {
            let response = client
                .get(format!("http://{shaped}/test"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), StatusCode::OK.as_u16());
        });
    });
}

fn bench_large_payload(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let test_addr = rt.block_on(create_test_server());
    let client = reqwest::Client::new();
    let large_data = "x".repeat(1024 * 1024); // 1MB payload

    let streaming = serve(
        &rt,
        ProxyServer::new(ProxyOptions::new().with_target(format!("http://{test_addr}"))),
    );
    c.bench_function("large_payload_streaming", |b| {
        b.to_async(&rt).iter(|| async {
            let response = client
                .post(format!("http://{streaming}/echo"))
                .body(large_data.clone())
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), StatusCode::OK.as_u16());
        });
    });

    // The idle timer wraps both bodies.
    let idle_guarded = serve(
        &rt,
        ProxyServer::new(
            ProxyOptions::new()
                .with_target(format!("http://{test_addr}"))
                .with_timeout(Duration::from_secs(30)),
        ),
    );
    c.bench_function("large_payload_idle_timeout", |b| {
        b.to_async(&rt).iter(|| async {
            let response = client
                .post(format!("http://{idle_guarded}/echo"))
                .body(large_data.clone())
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), StatusCode::OK.as_u16());
        });
    });
}

fn bench_concurrent_requests(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let test_addr = rt.block_on(create_test_server());
    let proxy_addr = serve(
        &rt,
        ProxyServer::new(ProxyOptions::new().with_target(format!("http://{test_addr}"))),
    );
    let client = reqwest::Client::new();

    c.bench_function("concurrent_requests", |b| {
        b.to_async(&rt).iter(|| async {
            let mut handles = Vec::new();
            for _ in 0..10 {
                let client = client.clone();
                handles.push(tokio::spawn(async move {
                    let response = client
                        .get(format!("http://{proxy_addr}/test"))
                        .send()
                        .await
                        .unwrap();
                    assert_eq!(response.status().as_u16(), StatusCode::OK.as_u16());
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(10);
    targets = bench_http1_get, bench_large_payload, bench_concurrent_requests
);
criterion_main!(benches);
