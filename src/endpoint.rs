//! Hook endpoint validation and delivery.
//!
//! Hooks carry a list of endpoint URLs; the delivery loop tries them in
//! order until one accepts the payload. This module owns URL validation at
//! `SETHOOK` time and the physical send at delivery time.
//!
//! Accepted schemes:
//! - `http://host[:port][/path]` — payload POSTed as a JSON body
//! - `https://host[:port][/path]` — validated, but delivery reports an
//!   error until a TLS stack is wired in
//! - `tcp://host:port` — payload written as a single line
//!
//! Every send uses a fresh connection with a hard timeout; a hook endpoint
//! that hangs must not stall the delivery loop past the timeout.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// How long one endpoint attempt may take, connect included.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("endpoint timeout")]
    Timeout,

    #[error("endpoint rejected payload: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed endpoint target.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scheme {
    Http,
    Https,
    Tcp,
}

impl Endpoint {
    /// Parses and validates an endpoint URL.
    pub fn parse(url: &str) -> Result<Endpoint, EndpointError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| EndpointError::InvalidUrl(url.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "tcp" => Scheme::Tcp,
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(EndpointError::InvalidUrl(url.to_string()));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| EndpointError::InvalidUrl(url.to_string()))?;
                (h.to_string(), port)
            }
            None => {
                let default = match scheme {
                    Scheme::Http => 80,
                    Scheme::Https => 443,
                    Scheme::Tcp => return Err(EndpointError::InvalidUrl(url.to_string())),
                };
                (authority.to_string(), default)
            }
        };
        if host.is_empty() {
            return Err(EndpointError::InvalidUrl(url.to_string()));
        }
        Ok(Endpoint {
            scheme,
            host,
            port,
            path: path.to_string(),
        })
    }
}

/// Validates and delivers hook payloads.
#[derive(Debug, Default)]
pub struct Manager;

impl Manager {
    pub fn new() -> Self {
        Manager
    }

    /// Checks that a URL is well-formed and its scheme supported. Called at
    /// `SETHOOK` time so a bad endpoint rejects the command up front.
    pub fn validate(&self, url: &str) -> Result<(), EndpointError> {
        Endpoint::parse(url).map(|_| ())
    }

    /// Attempts one delivery. Returns `Ok(())` only when the endpoint
    /// positively accepted the payload.
    pub async fn send(&self, url: &str, payload: &str) -> Result<(), EndpointError> {
        let ep = Endpoint::parse(url)?;
        let result = tokio::time::timeout(SEND_TIMEOUT, self.send_inner(&ep, payload)).await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(EndpointError::Timeout),
        }
    }

    async fn send_inner(&self, ep: &Endpoint, payload: &str) -> Result<(), EndpointError> {
        match ep.scheme {
            Scheme::Https => Err(EndpointError::UnsupportedScheme("https".to_string())),
            Scheme::Tcp => {
                let mut stream = TcpStream::connect((ep.host.as_str(), ep.port)).await?;
                stream.write_all(payload.as_bytes()).await?;
                stream.write_all(b"\n").await?;
                stream.flush().await?;
                Ok(())
            }
            Scheme::Http => {
                let mut stream = TcpStream::connect((ep.host.as_str(), ep.port)).await?;
                let request = format!(
                    "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    ep.path,
                    ep.host,
                    payload.len(),
                    payload
                );
                stream.write_all(request.as_bytes()).await?;
                stream.flush().await?;

                let mut buf = [0u8; 512];
                let n = stream.read(&mut buf).await?;
                let head = String::from_utf8_lossy(&buf[..n]);
                let status = head
                    .split_whitespace()
                    .nth(1)
                    .and_then(|s| s.parse::<u16>().ok())
                    .unwrap_or(0);
                debug!(url = %ep.host, status = status, "endpoint response");
                if (200..300).contains(&status) {
                    Ok(())
                } else {
                    Err(EndpointError::Rejected(format!("status {}", status)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_http() {
        let ep = Endpoint::parse("http://example.com/hooks/a").unwrap();
        assert_eq!(ep.scheme, Scheme::Http);
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 80);
        assert_eq!(ep.path, "/hooks/a");
    }

    #[test]
    fn test_parse_with_port() {
        let ep = Endpoint::parse("http://10.0.0.1:8080").unwrap();
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.path, "/");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Endpoint::parse("notaurl").is_err());
        assert!(Endpoint::parse("ftp://example.com").is_err());
        assert!(Endpoint::parse("tcp://example.com").is_err()); // tcp requires a port
        assert!(Endpoint::parse("http://").is_err());
    }

    #[test]
    fn test_validate() {
        let m = Manager::new();
        assert!(m.validate("http://localhost:8080/x").is_ok());
        assert!(m.validate("tcp://localhost:7777").is_ok());
        assert!(m.validate("gopher://x").is_err());
    }

    #[tokio::test]
    async fn test_http_send_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            req
        });

        let m = Manager::new();
        let url = format!("http://127.0.0.1:{}/hook", addr.port());
        m.send(&url, r#"{"detect":"inside"}"#).await.unwrap();

        let req = server.await.unwrap();
        assert!(req.starts_with("POST /hook HTTP/1.1"));
        assert!(req.contains(r#"{"detect":"inside"}"#));
    }

    #[tokio::test]
    async fn test_http_send_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\n\r\n")
                .await
                .unwrap();
        });

        let m = Manager::new();
        let url = format!("http://127.0.0.1:{}/", addr.port());
        assert!(matches!(
            m.send(&url, "{}").await,
            Err(EndpointError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_send_connection_refused() {
        let m = Manager::new();
        // port 1 is essentially never listening
        assert!(m.send("http://127.0.0.1:1/", "{}").await.is_err());
    }
}
