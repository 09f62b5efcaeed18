//! Proxy transport layer for HTTP and SOCKS protocols
//!
//! Establishes raw TCP tunnels to a target through one upstream backend.

use std::net::Ipv4Addr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument};

use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, ProxyProtocol};

/// Opens tunnels through upstream proxies
pub struct ProxyTransport;

impl ProxyTransport {
    /// Connect to `target_host:target_port` through `backend`
    #[instrument(skip(backend), fields(backend = %backend.id, target = %target_host))]
    pub async fn connect(
        backend: &ProxyBackend,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        match backend.protocol {
            ProxyProtocol::Http | ProxyProtocol::Https => {
                Self::connect_http(backend, target_host, target_port).await
            }
            ProxyProtocol::Socks4 => Self::connect_socks4(backend, target_host, target_port).await,
            ProxyProtocol::Socks4a => Self::connect_socks4a(backend, target_host, target_port).await,
            ProxyProtocol::Socks5 => Self::connect_socks5(backend, target_host, target_port).await,
        }
    }

    /// Plain TCP connection to the proxy itself
    pub async fn connect_proxy(backend: &ProxyBackend) -> Result<TcpStream> {
        TcpStream::connect(backend.address())
            .await
            .map_err(|e| RotaError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))
    }

    /// Tunnel through HTTP CONNECT
    async fn connect_http(
        backend: &ProxyBackend,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to HTTP proxy at {}", backend.address());

        let mut stream = Self::connect_proxy(backend).await?;

        let connect_request = Self::build_connect_request(backend, target_host, target_port);
        stream.write_all(connect_request.as_bytes()).await.map_err(|e| {
            RotaError::ProxyConnectionFailed(format!("Failed to send CONNECT: {}", e))
        })?;

        let mut response = vec![0u8; 1024];
        let n = stream.read(&mut response).await.map_err(|e| {
            RotaError::ProxyConnectionFailed(format!("Failed to read CONNECT response: {}", e))
        })?;

        let response_str = String::from_utf8_lossy(&response[..n]);
        let status_line = response_str.lines().next().unwrap_or("");
        match parse_status_code(status_line) {
            Some(200) => {
                debug!("HTTP CONNECT tunnel established");
                Ok(stream)
            }
            Some(status @ (401 | 407)) => Err(RotaError::AuthenticationRequired {
                backend: backend.id.clone(),
                status,
            }),
            _ => Err(RotaError::ProxyConnectionFailed(format!(
                "CONNECT failed: {}",
                if status_line.is_empty() { "empty response" } else { status_line }
            ))),
        }
    }

    /// Build HTTP CONNECT request
    fn build_connect_request(backend: &ProxyBackend, target_host: &str, target_port: u16) -> String {
        let mut request = format!(
            "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
            target_host, target_port, target_host, target_port
        );

        if let Some(auth) = proxy_authorization(backend) {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }

        request.push_str("\r\n");
        request
    }

    /// SOCKS4 carries only IPv4 targets; hostnames need SOCKS4a or SOCKS5
    async fn connect_socks4(
        backend: &ProxyBackend,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS4 proxy at {}", backend.address());

        let target_ip: Ipv4Addr = target_host.parse().map_err(|_| {
            RotaError::ProxyConnectionFailed(
                "SOCKS4 requires IP address, not hostname. Use SOCKS4a or SOCKS5 for DNS resolution"
                    .to_string(),
            )
        })?;

        let stream = match &backend.username {
            Some(user) => {
                Socks4Stream::connect_with_userid(
                    backend.address().as_str(),
                    (target_ip, target_port),
                    user,
                )
                .await
            }
            None => Socks4Stream::connect(backend.address().as_str(), (target_ip, target_port)).await,
        }
        .map_err(|e| RotaError::ProxyConnectionFailed(format!("SOCKS4 connect failed: {}", e)))?;

        debug!("SOCKS4 connection established");
        Ok(stream.into_inner())
    }

    /// SOCKS4a lets the proxy resolve the target hostname
    async fn connect_socks4a(
        backend: &ProxyBackend,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS4a proxy at {}", backend.address());

        let stream = match &backend.username {
            Some(user) => {
                Socks4Stream::connect_with_userid(
                    backend.address().as_str(),
                    (target_host, target_port),
                    user,
                )
                .await
            }
            None => {
                Socks4Stream::connect(backend.address().as_str(), (target_host, target_port)).await
            }
        }
        .map_err(|e| RotaError::ProxyConnectionFailed(format!("SOCKS4a connect failed: {}", e)))?;

        debug!("SOCKS4a connection established");
        Ok(stream.into_inner())
    }

    async fn connect_socks5(
        backend: &ProxyBackend,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 proxy at {}", backend.address());

        let stream = match (&backend.username, &backend.password) {
            (Some(username), Some(password)) => {
                Socks5Stream::connect_with_password(
                    backend.address().as_str(),
                    (target_host, target_port),
                    username,
                    password,
                )
                .await
            }
            _ => Socks5Stream::connect(backend.address().as_str(), (target_host, target_port)).await,
        }
        .map_err(|e| RotaError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }

    /// Parse host and port from a URI
    pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
        let host = uri
            .host()
            .ok_or_else(|| RotaError::InvalidRequest("Missing host in URI".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Ok((host, port))
    }
}

/// `Basic` credentials for the Proxy-Authorization header, if the backend has any
pub fn proxy_authorization(backend: &ProxyBackend) -> Option<String> {
    let username = backend.username.as_deref()?;
    let password = backend.password.as_deref().unwrap_or("");
    let encoded = BASE64.encode(format!("{}:{}", username, password).as_bytes());
    Some(format!("Basic {}", encoded))
}

fn parse_status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
