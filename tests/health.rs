mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use lb_proxy::{
    HandlerDefinition, HealthChecker, HttpClientAdapter, HyperForwarderFactory, InMemoryStats,
    ProxyServer, TargetSpec,
};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unhealthy_backend_is_skipped_until_it_recovers() {
    let a = spawn_backend("a").await;
    let b = spawn_backend("b").await;

    let checker = HealthChecker::new(Arc::new(HttpClientAdapter::new()), Duration::from_millis(100));
    let server = Arc::new(
        ProxyServer::new(Arc::new(InMemoryStats::new()), Arc::new(HyperForwarderFactory))
            .with_monitor(Arc::new(checker)),
    );
    let handler = server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api")
                .with_target(TargetSpec::new(a.url()).with_health(a.health_url()))
                .with_target(TargetSpec::new(b.url()).with_health(b.health_url())),
        )
        .unwrap();
    let proxy = spawn_proxy(server.clone()).await;

    wait_until(|| handler.targets().iter().all(|t| t.last_checked() > 0)).await;

    a.set_healthy(false);
    wait_until(|| handler.status() == 0.5).await;
    assert!(!handler.targets()[0].is_healthy());
    assert!(handler.is_available());

    for _ in 0..4 {
        let (_, body) = get_json(proxy, "/api").await;
        assert_eq!(body["backend"], "b");
    }

    let (_, dump) = get_json(proxy, "/_lb/handlers").await;
    assert_eq!(dump["api"]["targets"][0]["healthy"], false);
    assert_eq!(dump["api"]["status"], 0.5);

    a.set_healthy(true);
    wait_until(|| handler.status() == 1.0).await;

    let mut backends = Vec::new();
    for _ in 0..4 {
        let (_, body) = get_json(proxy, "/api").await;
        backends.push(body["backend"].as_str().unwrap_or_default().to_string());
    }
    assert!(backends.iter().any(|name| name == "a"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replaced_handler_stops_probing() {
    let a = spawn_backend("a").await;
    let b = spawn_backend("b").await;
    let checker = HealthChecker::new(Arc::new(HttpClientAdapter::new()), Duration::from_millis(50));
    let server = Arc::new(
        ProxyServer::new(Arc::new(InMemoryStats::new()), Arc::new(HyperForwarderFactory))
            .with_monitor(Arc::new(checker)),
    );

    let old = server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api")
                .with_target(TargetSpec::new(a.url()).with_health(a.health_url()))
                .with_target(TargetSpec::new(b.url())),
        )
        .unwrap();
    wait_until(|| old.targets()[0].last_checked() > 0).await;

    server
        .put_handler(
            HandlerDefinition::new("api")
                .with_route("/api")
                .with_target(TargetSpec::new(b.url()).with_health(b.health_url())),
        )
        .unwrap();
    assert!(old.is_closed());

    // the old loop must not flip state on the stale target list any more
    a.set_healthy(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(old.targets()[0].is_healthy());
}
