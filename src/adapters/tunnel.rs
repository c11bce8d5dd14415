//! Raw TCP and WebSocket tunnels.
//!
//! Both tunnels take over the inbound connection through hyper's upgrade
//! mechanism and then relay traffic until one direction finishes. Whichever
//! direction ends first tears down the other.
use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use futures_util::{SinkExt, StreamExt};
use hyper::{
    Request, Response, StatusCode, Uri,
    header::{self, HeaderValue},
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::{
        self, client::IntoClientRequest, handshake::derive_accept_key, protocol::Role,
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::forwarder::{authority, socket_authority},
    core::{handler::HandlerSettings, target::Target},
    ports::forwarder::{ForwardError, ForwardResult, Forwarder},
};

/// Run `fut` unless `cancel` fires first, bounded by `limit` when set.
async fn bounded<T, E>(
    cancel: &CancellationToken,
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, E>>,
    map_err: impl FnOnce(E) -> ForwardError,
) -> ForwardResult<T> {
    let attempt = async {
        match limit {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| ForwardError::Timeout(limit))?
                .map_err(map_err),
            None => fut.await.map_err(map_err),
        }
    };
    tokio::select! {
        () = cancel.cancelled() => Err(ForwardError::Closed),
        result = attempt => result,
    }
}

/// Copy bytes both ways between `inbound` and `upstream` until one side is done.
pub async fn splice<A, B>(inbound: A, upstream: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut inbound_read, mut inbound_write) = tokio::io::split(inbound);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut to_upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut inbound_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });
    let mut to_inbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut inbound_write).await;
        let _ = inbound_write.shutdown().await;
        copied
    });

    let finished = tokio::select! {
        result = &mut to_upstream => {
            to_inbound.abort();
            result
        }
        result = &mut to_inbound => {
            to_upstream.abort();
            result
        }
    };

    match finished {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(join) => Err(io::Error::other(join)),
    }
}

/// Opaque pass-through for handlers flagged `raw_proxy`.
///
/// The request head is re-sent on a dedicated HTTP/1 connection to the
/// target. A `101 Switching Protocols` answer turns both connections into a
/// byte splice; any other answer is relayed as-is.
pub struct RawTunnel {
    dial_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl RawTunnel {
    pub fn new(settings: &HandlerSettings, cancel: CancellationToken) -> Self {
        Self {
            dial_timeout: settings.dial_timeout,
            cancel,
        }
    }
}

#[async_trait]
impl Forwarder for RawTunnel {
    async fn forward(
        &self,
        target: &Target,
        mut req: Request<AxumBody>,
        _client: SocketAddr,
    ) -> ForwardResult<Response<AxumBody>> {
        let inbound_upgrade = hyper::upgrade::on(&mut req);

        let address = socket_authority(target.url());
        let stream = bounded(
            &self.cancel,
            self.dial_timeout,
            TcpStream::connect(address.as_str()),
            ForwardError::Dial,
        )
        .await?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;
        let target_id = target.id().to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                tracing::debug!(target_id = %target_id, error = %e, "raw tunnel connection ended");
            }
        });

        let origin_form = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .parse::<Uri>()
            .map_err(|e| ForwardError::Transport(e.to_string()))?;
        *req.uri_mut() = origin_form;
        if !req.headers().contains_key(header::HOST) {
            if let Ok(host) = HeaderValue::from_str(&authority(target.url())) {
                req.headers_mut().insert(header::HOST, host);
            }
        }

        let mut response = sender
            .send_request(req)
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            let target_id = target.id().to_string();
            tokio::spawn(async move {
                match tokio::try_join!(inbound_upgrade, upstream_upgrade) {
                    Ok((inbound, upstream)) => {
                        if let Err(e) = splice(TokioIo::new(inbound), TokioIo::new(upstream)).await
                        {
                            tracing::info!(target_id = %target_id, error = %e, "raw tunnel error");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target_id = %target_id, error = %e, "raw tunnel upgrade failed");
                    }
                }
            });
        }

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, AxumBody::new(body)))
    }
}

/// WebSocket relay.
///
/// The inbound handshake is answered locally, then a client connection is
/// opened to `ws://<target host><request uri>` carrying the original `Origin`
/// header and messages are pumped in both directions.
pub struct WebSocketTunnel {
    dial_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl WebSocketTunnel {
    pub fn new(settings: &HandlerSettings, cancel: CancellationToken) -> Self {
        Self {
            dial_timeout: settings.dial_timeout,
            cancel,
        }
    }
}

#[async_trait]
impl Forwarder for WebSocketTunnel {
    async fn forward(
        &self,
        target: &Target,
        mut req: Request<AxumBody>,
        _client: SocketAddr,
    ) -> ForwardResult<Response<AxumBody>> {
        let key = req
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .ok_or_else(|| ForwardError::BadUpgrade("missing Sec-WebSocket-Key".to_string()))?;
        let accept = derive_accept_key(key.as_bytes());

        let upstream_url = format!(
            "ws://{}{}",
            authority(target.url()),
            req.uri().path_and_query().map_or("/", |pq| pq.as_str())
        );
        let mut upstream_request = upstream_url
            .as_str()
            .into_client_request()
            .map_err(|e| ForwardError::WebSocket(e.to_string()))?;
        if let Some(origin) = req.headers().get(header::ORIGIN) {
            upstream_request
                .headers_mut()
                .insert(header::ORIGIN, origin.clone());
        }

        let inbound_upgrade = hyper::upgrade::on(&mut req);
        let cancel = self.cancel.clone();
        let dial_timeout = self.dial_timeout;
        let target_id = target.id().to_string();

        tokio::spawn(async move {
            let upgraded = match inbound_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(target_id = %target_id, error = %e, "websocket upgrade failed");
                    return;
                }
            };
            let inbound =
                WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

            let upstream = match bounded(
                &cancel,
                dial_timeout,
                connect_async(upstream_request),
                |e| ForwardError::WebSocket(e.to_string()),
            )
            .await
            {
                Ok((upstream, _)) => upstream,
                Err(e) => {
                    tracing::info!(target_id = %target_id, error = %e, "websocket dial failed");
                    return;
                }
            };

            if let Err(e) = relay(inbound, upstream).await {
                tracing::info!(target_id = %target_id, error = %e, "websocket tunnel error");
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept)
            .body(AxumBody::empty())
            .map_err(|e| ForwardError::Upgrade(e.to_string()))
    }
}

/// Pump messages both ways between two websocket streams.
async fn relay<A, B>(inbound: WebSocketStream<A>, upstream: WebSocketStream<B>) -> ForwardResult<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut inbound_tx, mut inbound_rx) = inbound.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let mut to_upstream = tokio::spawn(async move {
        while let Some(message) = inbound_rx.next().await {
            upstream_tx.send(message?).await?;
        }
        upstream_tx.close().await
    });
    let mut to_inbound = tokio::spawn(async move {
        while let Some(message) = upstream_rx.next().await {
            inbound_tx.send(message?).await?;
        }
        inbound_tx.close().await
    });

    let finished = tokio::select! {
        result = &mut to_upstream => {
            to_inbound.abort();
            result
        }
        result = &mut to_inbound => {
            to_upstream.abort();
            result
        }
    };

    match finished {
        Ok(Ok(()))
        | Ok(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
            Ok(())
        }
        Ok(Err(e)) => Err(ForwardError::WebSocket(e.to_string())),
        Err(join) => Err(ForwardError::WebSocket(join.to_string())),
    }
}
