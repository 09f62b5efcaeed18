//! HTTP client that sends requests through one upstream backend

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::error::{Result, RotaError};
use crate::models::ProxyBackend;
use crate::proxy::connection_pool::PooledConnection;
use crate::proxy::transport::{proxy_authorization, ProxyTransport};

/// A live transport to one backend that can carry requests
#[async_trait]
pub trait Upstream: PooledConnection {
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Full<Bytes>>>;
}

/// Creates upstream transports for backends on demand
pub trait UpstreamFactory: Send + Sync {
    fn create(&self, backend: &Arc<ProxyBackend>) -> Arc<dyn Upstream>;
}

/// Builds [`UpstreamClient`]s with fixed timeouts
#[derive(Debug, Clone)]
pub struct DefaultUpstreamFactory {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl UpstreamFactory for DefaultUpstreamFactory {
    fn create(&self, backend: &Arc<ProxyBackend>) -> Arc<dyn Upstream> {
        Arc::new(UpstreamClient::new(
            backend.clone(),
            self.connect_timeout,
            self.request_timeout,
        ))
    }
}

/// Plain-HTTP client bound to one backend
///
/// HTTP proxies get a kept-alive connection carrying absolute-form requests.
/// SOCKS proxies get a fresh tunnel to the target per request. `https`
/// targets are rejected; TLS origination belongs to a custom [`Upstream`].
pub struct UpstreamClient {
    backend: Arc<ProxyBackend>,
    connect_timeout: Duration,
    request_timeout: Duration,
    idle: Mutex<Option<(SendRequest<Full<Bytes>>, JoinHandle<()>)>>,
    closed: AtomicBool,
}

impl UpstreamClient {
    pub fn new(backend: Arc<ProxyBackend>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            backend,
            connect_timeout,
            request_timeout,
            idle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<ProxyBackend> {
        &self.backend
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn handshake<T>(&self, io: T) -> Result<(SendRequest<Full<Bytes>>, JoinHandle<()>)>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| RotaError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

        let backend = self.backend.id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(backend = %backend, "Upstream connection ended: {}", e);
            }
        });
        Ok((sender, task))
    }

    /// An idle kept-alive sender, or a new connection to the proxy
    async fn checkout(&self) -> Result<(SendRequest<Full<Bytes>>, JoinHandle<()>)> {
        let idle = self.idle.lock().take();
        if let Some((sender, task)) = idle {
            if !sender.is_closed() {
                return Ok((sender, task));
            }
            task.abort();
        }

        let stream = tokio::time::timeout(self.connect_timeout, ProxyTransport::connect_proxy(&self.backend))
            .await
            .map_err(|_| RotaError::Timeout)??;
        self.handshake(stream).await
    }

    fn checkin(&self, sender: SendRequest<Full<Bytes>>, task: JoinHandle<()>) {
        if self.is_closed() || sender.is_closed() {
            task.abort();
            return;
        }
        if let Some((_, old)) = self.idle.lock().replace((sender, task)) {
            old.abort();
        }
    }

    async fn roundtrip(
        &self,
        sender: &mut SendRequest<Full<Bytes>>,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Full<Bytes>>> {
        let exchange = async {
            sender
                .ready()
                .await
                .map_err(|e| RotaError::ProxyConnectionFailed(format!("Connection not ready: {}", e)))?;
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| RotaError::ProxyConnectionFailed(format!("Request failed: {}", e)))?;

            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| RotaError::ProxyConnectionFailed(format!("Failed to read response: {}", e)))?
                .to_bytes();
            Ok(Response::from_parts(parts, Full::new(body)))
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| RotaError::Timeout)?
    }

    async fn send_via_http_proxy(
        &self,
        mut request: Request<Full<Bytes>>,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(auth) = proxy_authorization(&self.backend) {
            let value = HeaderValue::from_str(&auth)
                .map_err(|e| RotaError::InvalidRequest(format!("Invalid proxy credentials: {}", e)))?;
            request.headers_mut().insert(PROXY_AUTHORIZATION, value);
        }

        let (mut sender, task) = self.checkout().await?;
        let result = self.roundtrip(&mut sender, request).await;
        match &result {
            Ok(_) => self.checkin(sender, task),
            Err(_) => task.abort(),
        }
        result
    }

    async fn send_via_socks(&self, mut request: Request<Full<Bytes>>) -> Result<Response<Full<Bytes>>> {
        let (host, port) = ProxyTransport::parse_target(request.uri())?;

        let stream = tokio::time::timeout(
            self.connect_timeout,
            ProxyTransport::connect(&self.backend, &host, port),
        )
        .await
        .map_err(|_| RotaError::Timeout)??;

        // Origin servers expect origin-form once the tunnel is up
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let origin: Uri = path
            .parse()
            .map_err(|e| RotaError::InvalidRequest(format!("Invalid request path: {}", e)))?;
        *request.uri_mut() = origin;

        let (mut sender, task) = self.handshake(stream).await?;
        let result = self.roundtrip(&mut sender, request).await;
        task.abort();
        result
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    #[instrument(skip(self, request), fields(backend = %self.backend.id, uri = %request.uri()))]
    async fn send(&self, mut request: Request<Full<Bytes>>) -> Result<Response<Full<Bytes>>> {
        if self.is_closed() {
            return Err(RotaError::ProxyConnectionFailed("connection closed".to_string()));
        }

        match request.uri().scheme_str() {
            Some("http") => {}
            Some("https") => {
                return Err(RotaError::InvalidRequest(
                    "https targets require a TLS-capable upstream".to_string(),
                ))
            }
            _ => {
                return Err(RotaError::InvalidRequest(format!(
                    "Request URI must be absolute http: {}",
                    request.uri()
                )))
            }
        }

        if !request.headers().contains_key(HOST) {
            let authority = request
                .uri()
                .authority()
                .map(|a| a.as_str().to_string())
                .ok_or_else(|| RotaError::InvalidRequest("Missing host in URI".to_string()))?;
            let value = HeaderValue::from_str(&authority)
                .map_err(|e| RotaError::InvalidRequest(format!("Invalid host: {}", e)))?;
            request.headers_mut().insert(HOST, value);
        }

        if self.backend.protocol.is_socks() {
            self.send_via_socks(request).await
        } else {
            self.send_via_http_proxy(request).await
        }
    }
}

impl PooledConnection for UpstreamClient {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some((_, task)) = self.idle.lock().take() {
            task.abort();
        }
    }
}

impl Drop for UpstreamClient {
    fn drop(&mut self) {
        if let Some((_, task)) = self.idle.get_mut().take() {
            task.abort();
        }
    }
}
