use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::time::{MissedTickBehavior, interval};

use crate::{
    core::handler::Handler,
    ports::{http_client::HttpClient, monitor::HandlerMonitor},
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

/// Health checker adapter: one probing loop per handler.
///
/// Every tick probes each target that has a health URL, stores the result on
/// the target and republishes the handler's healthy set. Targets without a
/// health URL are never probed. The loop ends as soon as the handler's
/// shutdown token is cancelled, including in the middle of a sweep.
#[derive(Clone)]
pub struct HealthChecker {
    http_client: Arc<dyn HttpClient>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(http_client: Arc<dyn HttpClient>, interval: Duration) -> Self {
        Self {
            http_client,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the loop for `handler` on the runtime.
    pub fn spawn(&self, handler: Arc<Handler>) -> tokio::task::JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move { checker.run(handler).await })
    }

    /// Run the health checker loop until the handler closes.
    pub async fn run(&self, handler: Arc<Handler>) {
        let token = handler.shutdown_token();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            handler = %handler.key(),
            "Starting health checker with interval: {:?}",
            self.interval
        );

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                () = token.cancelled() => break,
                _ = self.sweep(&handler) => {}
            }
        }

        tracing::info!(handler = %handler.key(), "health checker stopped");
    }

    /// Probe every target once and republish. Returns the available count.
    pub async fn sweep(&self, handler: &Handler) -> usize {
        let targets = handler.targets();
        let probes = targets.iter().filter_map(|target| {
            let url = target.health_url()?;
            Some(async move {
                let healthy = match self
                    .http_client
                    .health_check(url, target.health_timeout())
                    .await
                {
                    Ok(healthy) => healthy,
                    Err(err) => {
                        tracing::debug!(target_id = %target.id(), "Health check failed: {}", err);
                        false
                    }
                };
                if target.is_healthy() != healthy {
                    tracing::warn!(target_id = %target.id(), healthy, "target health changed");
                }
                target.record_health(healthy);
            })
        });
        join_all(probes).await;

        let healthy = handler.republish_health();
        tracing::info!(
            key = "proxy.healthcheck",
            handler = %handler.key(),
            available = handler.is_available(),
            healthy_targets = healthy,
            status = handler.status(),
            "health check cycle completed"
        );
        healthy
    }
}

impl HandlerMonitor for HealthChecker {
    fn watch(&self, handler: Arc<Handler>) {
        self.spawn(handler);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        adapters::forwarder::HyperForwarderFactory,
        core::{
            handler::HandlerDefinition,
            stats::NoopStats,
            strategy::{RoundRobinStrategy, Strategy},
            target::TargetSpec,
        },
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    // Mock HTTP client: URLs in `down` fail, everything else is healthy
    #[derive(Default)]
    struct MockHttpClient {
        down: Mutex<HashSet<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn health_check(&self, url: &str, _timeout: Duration) -> HttpClientResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.lock().unwrap().contains(url) {
                Err(HttpClientError::ConnectionError("refused".to_string()))
            } else {
                Ok(true)
            }
        }
    }

    fn handler() -> Arc<Handler> {
        let def = HandlerDefinition::new("api")
            .with_target(TargetSpec::new("http://10.0.0.1:80").with_health("http://10.0.0.1:80/health"))
            .with_target(TargetSpec::new("http://10.0.0.2:80").with_health("http://10.0.0.2:80/health"))
            .with_target(TargetSpec::new("http://10.0.0.3:80"));
        Arc::new(
            Handler::new(
                def,
                RoundRobinStrategy.shared(),
                Vec::new(),
                Arc::new(NoopStats),
                Arc::new(HyperForwarderFactory),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_sweep_marks_failures_unhealthy() {
        let client = Arc::new(MockHttpClient::default());
        client
            .down
            .lock()
            .unwrap()
            .insert("http://10.0.0.1:80/health".to_string());
        let checker = HealthChecker::new(client.clone(), DEFAULT_INTERVAL);
        let handler = handler();

        let healthy = checker.sweep(&handler).await;
        assert_eq!(healthy, 2);
        // the target without a health url is never probed
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);

        let targets = handler.targets();
        assert!(!targets[0].is_healthy());
        assert!(targets[0].last_checked() > 0);
        assert!(targets[1].is_healthy());
        assert!(targets[2].is_healthy());
        assert_eq!(targets[2].last_checked(), 0);
    }

    #[tokio::test]
    async fn test_sweep_restores_recovered_targets() {
        let client = Arc::new(MockHttpClient::default());
        client
            .down
            .lock()
            .unwrap()
            .insert("http://10.0.0.2:80/health".to_string());
        let checker = HealthChecker::new(client.clone(), DEFAULT_INTERVAL);
        let handler = handler();

        checker.sweep(&handler).await;
        assert!(!handler.targets()[1].is_healthy());

        client.down.lock().unwrap().clear();
        assert_eq!(checker.sweep(&handler).await, 3);
        assert!(handler.targets()[1].is_healthy());
        assert!(handler.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_handler_closes() {
        let client = Arc::new(MockHttpClient::default());
        let checker = HealthChecker::new(client.clone(), Duration::from_secs(15));
        let handler = handler();

        let task = checker.spawn(handler.clone());
        tokio::time::sleep(Duration::from_secs(31)).await;
        let calls = client.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 6);

        handler.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("health loop did not stop")
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), calls);
    }
}
