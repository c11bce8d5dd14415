mod common;

use std::{collections::HashMap, time::Duration};

use axum::{body::Body as AxumBody, http::StatusCode};
use common::*;
use hyper::header::{HeaderName, HeaderValue};
use lb_proxy::{
    HandlerDefinition, HandlerSettings, ProxyError, RequestContext, StatsCollector, TargetSpec,
};

#[tokio::test(flavor = "multi_thread")]
async fn test_unrouted_request_gets_json_404() {
    let (server, _) = proxy_server();
    let proxy = spawn_proxy(server).await;

    let (status, body) = get_json(proxy, "/nowhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], true);
    assert_eq!(body["code"], 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_round_robin_alternates_between_backends() {
    let a = spawn_backend("a").await;
    let b = spawn_backend("b").await;
    let (server, stats) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api/*")
                .with_target(TargetSpec::new(a.url()))
                .with_target(TargetSpec::new(b.url())),
        )
        .unwrap();
    let proxy = spawn_proxy(server.clone()).await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        let (status, body) = get_json(proxy, "/api/items?page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uri"], "/api/items?page=2");
        seen.push(body["backend"].as_str().unwrap().to_string());
    }
    assert_ne!(seen[0], seen[1]);
    assert_eq!(seen[0], seen[2]);
    assert_eq!(seen[1], seen[3]);
    assert_eq!(a.hits(), 2);
    assert_eq!(b.hits(), 2);

    assert_eq!(stats.get_increment("requests.api"), 4);
    assert_eq!(stats.get_increment(&format!("{}.2xx", a.url())), 2);
    assert_eq!(stats.timings(&a.url()).len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forwarding_headers_reach_the_backend() {
    let backend = spawn_backend("only").await;
    let (server, _) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/")
                .with_route("/*")
                .with_target(TargetSpec::new(backend.url())),
        )
        .unwrap();
    let proxy = spawn_proxy(server).await;

    let req = hyper::Request::builder()
        .uri(format!("http://{proxy}/whoami"))
        .header("x-forwarded-for", "203.0.113.9")
        .body(AxumBody::empty())
        .unwrap();
    let (status, body) = send(req).await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();

    assert_eq!(body["x_forwarded_for"], "203.0.113.9, 127.0.0.1");
    assert_eq!(body["x_real_ip"], "127.0.0.1");
    assert_eq!(body["x_forwarded_proto"], "http");
    assert_eq!(body["forwarded"], "for=127.0.0.1; proto=http");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_middleware_can_halt_and_rewrite() {
    let backend = spawn_backend("tenant").await;
    let (server, _) = proxy_server();
    server.use_middleware("deny-anonymous", |ctx: &mut RequestContext| {
        if !ctx.request().headers().contains_key("authorization") {
            ctx.unauthorized();
        }
    });
    server.use_middleware("tenant-header", |ctx: &mut RequestContext| {
        if let Some(value) = ctx
            .param("tenant")
            .and_then(|t| HeaderValue::from_str(t).ok())
        {
            ctx.request_mut()
                .headers_mut()
                .insert(HeaderName::from_static("x-tenant"), value);
        }
    });
    server
        .put_handler(
            HandlerDefinition::new("tenants")
                .with_route("/t/:tenant/*")
                .with_middleware("deny-anonymous")
                .with_middleware("tenant-header")
                .with_target(TargetSpec::new(backend.url())),
        )
        .unwrap();
    let proxy = spawn_proxy(server).await;

    let (status, body) = get_json(proxy, "/t/acme/orders").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);
    assert_eq!(backend.hits(), 0);

    let req = hyper::Request::builder()
        .uri(format!("http://{proxy}/t/acme/orders"))
        .header("authorization", "Bearer token")
        .body(AxumBody::empty())
        .unwrap();
    let (status, body) = send(req).await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["x_tenant"], "acme");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_available_targets_is_503() {
    let a = spawn_backend("a").await;
    let b = spawn_backend("b").await;
    let (server, _) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api")
                .with_target(TargetSpec::new(a.url()).with_down(true))
                .with_target(TargetSpec::new(b.url())),
        )
        .unwrap();
    let proxy = spawn_proxy(server.clone()).await;

    // the remaining target takes everything
    for _ in 0..3 {
        let (_, body) = get_json(proxy, "/api").await;
        assert_eq!(body["backend"], "b");
    }

    server.set_target_down("api", &b.url(), true).unwrap();
    let (status, body) = get_json(proxy, "/api").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], 503);
    assert_eq!(a.hits(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_backend_is_502_and_counted() {
    let dead = closed_port().await;
    let dead_url = format!("http://{dead}");
    let (server, stats) = proxy_server();
    let handler = server
        .put_handler(
            HandlerDefinition::new("dead")
                .with_route("/dead")
                .with_target(TargetSpec::new(dead_url.clone()))
                .with_settings(HandlerSettings {
                    dial_timeout: Some(Duration::from_secs(1)),
                    ..HandlerSettings::default()
                }),
        )
        .unwrap();
    let proxy = spawn_proxy(server).await;

    let (status, body) = get_json(proxy, "/dead").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], 502);

    let target = &handler.targets()[0];
    assert_eq!(target.failed_requests(), 1);
    assert_eq!(stats.get_increment(&format!("{dead_url}.5xx")), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_targets_can_be_added_at_runtime() {
    let a = spawn_backend("a").await;
    let b = spawn_backend("b").await;
    let (server, _) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api")
                .with_target(TargetSpec::new(a.url())),
        )
        .unwrap();
    let proxy = spawn_proxy(server.clone()).await;

    get(proxy, "/api").await;
    assert_eq!(a.hits(), 1);

    server.add_target("api", &TargetSpec::new(b.url())).unwrap();
    assert!(matches!(
        server.add_target("api", &TargetSpec::new(b.url())),
        Err(ProxyError::DuplicateTarget { .. })
    ));

    for _ in 0..4 {
        get(proxy, "/api").await;
    }
    assert!(b.hits() >= 2);

    server.remove_target("api", &a.url()).unwrap();
    let before = a.hits();
    for _ in 0..3 {
        let (_, body) = get_json(proxy, "/api").await;
        assert_eq!(body["backend"], "b");
    }
    assert_eq!(a.hits(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_removed_handler_drains_then_disappears() {
    let backend = spawn_backend("a").await;
    let (server, _) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api")
                .with_target(TargetSpec::new(backend.url()))
                .with_settings(HandlerSettings {
                    shutdown_wait: Duration::from_millis(300),
                    ..HandlerSettings::default()
                }),
        )
        .unwrap();
    let proxy = spawn_proxy(server.clone()).await;
    assert_eq!(get(proxy, "/api").await.0, StatusCode::OK);

    let removal = {
        let server = server.clone();
        tokio::spawn(async move { server.remove_handler("api").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // still routed while draining, but refuses new work
    assert_eq!(get(proxy, "/api").await.0, StatusCode::SERVICE_UNAVAILABLE);

    removal.await.unwrap().unwrap();
    assert_eq!(get(proxy, "/api").await.0, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_in_flight_request_survives_handler_removal() {
    let backend = spawn_slow_backend("slow", Duration::from_millis(500)).await;
    let (server, _) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api")
                .with_target(TargetSpec::new(backend.url()))
                .with_settings(HandlerSettings {
                    shutdown_wait: Duration::from_millis(100),
                    ..HandlerSettings::default()
                }),
        )
        .unwrap();
    let proxy = spawn_proxy(server.clone()).await;

    let in_flight = tokio::spawn(async move { get_json(proxy, "/api").await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.hits(), 1);

    // closes the handler while the backend is still answering
    server.remove_handler("api").await.unwrap();
    assert!(server.handler("api").is_none());

    let (status, body) = in_flight.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backend"], "slow");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_in_flight_request_survives_handler_replacement() {
    let backend = spawn_slow_backend("slow", Duration::from_millis(500)).await;
    let (server, _) = proxy_server();
    let definition = HandlerDefinition::new("api")
        .with_route("/api")
        .with_target(TargetSpec::new(backend.url()));
    let old = server.put_handler(definition.clone()).unwrap();
    let proxy = spawn_proxy(server.clone()).await;

    let in_flight = tokio::spawn(async move { get_json(proxy, "/api").await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.hits(), 1);

    server
        .put_handler(definition.with_strategy("wrr"))
        .unwrap();
    assert!(old.is_closed());

    let (status, body) = in_flight.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backend"], "slow");

    // later requests go through the replacement
    let (status, _) = get_json(proxy, "/api").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(backend.hits(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_default_handler_catches_unrouted_paths() {
    let backend = spawn_backend("fallback").await;
    let (server, _) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("fallback")
                .with_route("/fallback")
                .with_target(TargetSpec::new(backend.url())),
        )
        .unwrap();
    server.set_default_handler("fallback").unwrap();
    let proxy = spawn_proxy(server).await;

    let (status, body) = get_json(proxy, "/some/other/path").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backend"], "fallback");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_diagnostics_dump() {
    let backend = spawn_backend("a").await;
    let (server, _) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api/*")
                .with_strategy("wrr")
                .with_target(TargetSpec::new(backend.url()).with_weight(3)),
        )
        .unwrap();
    let proxy = spawn_proxy(server).await;
    get(proxy, "/api/x").await;

    let (status, dump) = get_json(proxy, "/_lb/handlers").await;
    assert_eq!(status, StatusCode::OK);
    let api = &dump["api"];
    assert_eq!(api["strategy"], "wrr");
    assert_eq!(api["routes"][0], "/api/*");
    assert_eq!(api["targets"][0]["weight"], 3);
    assert_eq!(api["targets"][0]["requests"], 1);
    assert_eq!(api["targets"][0]["healthy"], true);
}

#[tokio::test]
async fn test_unparsable_remote_address_is_500() {
    let backend = spawn_backend("a").await;
    let (server, _) = proxy_server();
    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api")
                .with_target(TargetSpec::new(backend.url())),
        )
        .unwrap();

    let req = hyper::Request::builder()
        .uri("/api")
        .body(AxumBody::empty())
        .unwrap();
    let response = server.serve_request(req, "not-an-address").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn test_reconcile_from_definitions() {
    let a = spawn_backend("a").await;
    let (server, _) = proxy_server();
    let defs = |keys: &[&str]| -> Vec<HandlerDefinition> {
        keys.iter()
            .map(|key| {
                HandlerDefinition::new(*key)
                    .with_route(format!("/{key}"))
                    .with_target(TargetSpec::new(a.url()))
            })
            .collect()
    };

    server.reconcile(defs(&["one", "two"])).await.unwrap();
    assert_eq!(server.handler_keys(), vec!["one", "two"]);

    server.reconcile(defs(&["two", "three"])).await.unwrap();
    assert_eq!(server.handler_keys(), vec!["three", "two"]);

    let dump: HashMap<String, _> = server.diagnostics();
    assert!(dump.contains_key("three"));
}
