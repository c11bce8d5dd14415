#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::Request,
    http::{HeaderMap, StatusCode},
};
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use lb_proxy::{HttpHandler, HyperForwarderFactory, InMemoryStats, ProxyServer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

/// A mock upstream answering every path with a JSON echo of what it saw.
pub struct Backend {
    pub name: &'static str,
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    pub healthy: Arc<AtomicBool>,
}

impl Backend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

fn header(headers: &HeaderMap, name: &str) -> serde_json::Value {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map_or(serde_json::Value::Null, |v| v.into())
}

pub async fn spawn_backend(name: &'static str) -> Backend {
    spawn_slow_backend(name, Duration::ZERO).await
}

/// Like [`spawn_backend`] but every proxied request waits `delay` before answering.
pub async fn spawn_slow_backend(name: &'static str, delay: Duration) -> Backend {
    let hits = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicBool::new(true));

    let health_flag = healthy.clone();
    let hit_counter = hits.clone();
    let app = Router::new()
        .route(
            "/health",
            axum::routing::get(move || {
                let healthy = health_flag.load(Ordering::SeqCst);
                async move {
                    if healthy {
                        StatusCode::OK
                    } else {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                }
            }),
        )
        .fallback(move |req: Request| {
            hit_counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let headers = req.headers();
                serde_json::json!({
                    "backend": name,
                    "method": req.method().as_str(),
                    "uri": req.uri().to_string(),
                    "host": header(headers, "host"),
                    "x_forwarded_for": header(headers, "x-forwarded-for"),
                    "x_real_ip": header(headers, "x-real-ip"),
                    "x_forwarded_proto": header(headers, "x-forwarded-proto"),
                    "forwarded": header(headers, "forwarded"),
                    "x_tenant": header(headers, "x-tenant"),
                })
                .to_string()
            }
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Backend {
        name,
        addr,
        hits,
        healthy,
    }
}

/// WebSocket server echoing every text and binary message.
pub async fn spawn_ws_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Server that answers one request with `101` and then echoes raw bytes.
pub async fn spawn_upgrade_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_none() {
                    return;
                }
                let head = "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Read an HTTP head byte by byte so nothing after it is consumed.
pub async fn read_head<S: AsyncReadExt + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    String::from_utf8(head).ok()
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn proxy_server() -> (Arc<ProxyServer>, Arc<InMemoryStats>) {
    let stats = Arc::new(InMemoryStats::new());
    let server = ProxyServer::new(stats.clone(), Arc::new(HyperForwarderFactory))
        .with_access_log(true);
    (Arc::new(server), stats)
}

pub async fn spawn_proxy(server: Arc<ProxyServer>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = HttpHandler::new(server).router();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

pub async fn send(req: hyper::Request<AxumBody>) -> (StatusCode, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<AxumBody>();
    let response = client.request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

pub async fn get(proxy: SocketAddr, path: &str) -> (StatusCode, String) {
    let req = hyper::Request::builder()
        .uri(format!("http://{proxy}{path}"))
        .body(AxumBody::empty())
        .unwrap();
    send(req).await
}

pub async fn get_json(proxy: SocketAddr, path: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = get(proxy, path).await;
    let json = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}
