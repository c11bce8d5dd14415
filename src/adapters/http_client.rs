use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use http_body_util::BodyExt;
use hyper::{Request, StatusCode, Version, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Wrap `http_connector` with rustls using the platform's native roots.
///
/// Shared by the health-check client and the per-target forwarding
/// transports so both trust the same certificates.
pub fn https_connector(mut http_connector: HttpConnector) -> HttpsConnector<HttpConnector> {
    // Install default crypto provider for rustls if not already set
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    http_connector.enforce_http(false);

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = load_native_certs();
    for cert in native_certs.certs {
        if root_cert_store.add(cert).is_err() {
            tracing::warn!("Failed to add native certificate to rustls RootCertStore");
        }
    }
    if !native_certs.errors.is_empty() {
        tracing::warn!(
            "Some native certificates failed to load: {:?}",
            native_certs.errors
        );
    }
    tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector)
}

/// Health-probe client using Hyper with Rustls.
///
/// Probes are plain `GET` requests; only `200 OK` counts as healthy. The
/// response body is drained so the pooled connection can be reused.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Self {
        let client =
            Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector(
                HttpConnector::new(),
            ));
        Self { client }
    }
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn health_check(&self, url: &str, probe_timeout: Duration) -> HttpClientResult<bool> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .header(header::USER_AGENT, "lb-proxy-healthcheck/1.0")
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        tracing::debug!("Health checking URL: {}", url);

        match timeout(probe_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let healthy = response.status() == StatusCode::OK;
                let _ = response.into_body().collect().await;
                tracing::debug!("Health check for {} result: {}", url, healthy);
                Ok(healthy)
            }
            Ok(Err(err)) => {
                tracing::debug!("Health check error for {}: {}", url, err);
                Err(HttpClientError::ConnectionError(err.to_string()))
            }
            Err(_) => {
                tracing::debug!("Health check timeout for {}", url);
                Err(HttpClientError::Timeout(probe_timeout))
            }
        }
    }
}
