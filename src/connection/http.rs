//! Minimal HTTP/1.1 request handling for the JSON surface.
//!
//! Commands arrive as `GET /cmd/arg1/arg2` (path segments are
//! percent-decoded tokens) or `POST /` with the command line in the body.
//! Responses are always JSON with status 200 — command failures are
//! signaled by `ok:false` in the body, not by the status code — and the
//! connection closes after one exchange.
//!
//! The detection problem: an inline RESP command like `GET fleet truck1`
//! and an HTTP request line both start with a method word, so a line is
//! treated as HTTP only when it ends with an `HTTP/1.x` version tag.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed http request: {0}")]
    Malformed(String),

    #[error("request too large")]
    TooLarge,
}

/// Maximum accepted request size (headers + body).
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// A parsed HTTP request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// True when this request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

/// Decides whether the buffered bytes begin an HTTP request. Returns
/// `None` when no complete first line has arrived yet.
pub fn looks_like_http(buf: &[u8]) -> Option<bool> {
    let line_end = find_crlf(buf)?;
    let line = &buf[..line_end];
    let Ok(line) = std::str::from_utf8(line) else {
        return Some(false);
    };
    let is_method = ["GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS "]
        .iter()
        .any(|m| line.starts_with(m));
    Some(is_method && (line.ends_with("HTTP/1.1") || line.ends_with("HTTP/1.0")))
}

/// Incrementally parses one request. `Ok(None)` means more bytes are
/// needed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>, HttpError> {
    if buf.len() > MAX_REQUEST_SIZE {
        return Err(HttpError::TooLarge);
    }
    let head_end = match find_double_crlf(buf) {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| HttpError::Malformed("non-utf8 header".to_string()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| HttpError::Malformed("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("missing method".to_string()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("missing path".to_string()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("bad header line: {}", line)))?;
        headers.push((name.trim().to_lowercase(), value.trim().to_string()));
    }

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_SIZE {
        return Err(HttpError::TooLarge);
    }
    let body_start = head_end + 4;
    if buf.len() < body_start + content_length {
        return Ok(None);
    }
    let body = buf[body_start..body_start + content_length].to_vec();
    Ok(Some((
        HttpRequest {
            method,
            path,
            headers,
            body,
        },
        body_start + content_length,
    )))
}

/// Splits an HTTP path into command tokens: `/set/fleet/truck1` →
/// `["set", "fleet", "truck1"]`, with percent-decoding and `+`-as-space.
pub fn path_tokens(path: &str) -> Vec<String> {
    let path = path.split('?').next().unwrap_or(path);
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(url_decode)
        .collect()
}

/// Reads one query parameter from a path.
pub fn query_param(path: &str, name: &str) -> Option<String> {
    let query = path.split_once('?')?.1;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=')?;
        if k == name {
            return Some(url_decode(v));
        }
    }
    None
}

/// Wraps a JSON body in a complete HTTP response.
pub fn response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: application/json; charset=utf-8\r\n\r\n{}\r\n",
        body.len() + 2,
        body
    )
    .into_bytes()
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                }) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_http() {
        assert_eq!(
            looks_like_http(b"GET /set/fleet/truck1 HTTP/1.1\r\n"),
            Some(true)
        );
        // an inline RESP command also starts with GET but has no version
        assert_eq!(looks_like_http(b"GET fleet truck1\r\n"), Some(false));
        assert_eq!(looks_like_http(b"GET fleet"), None);
        assert_eq!(looks_like_http(b"*2\r\n$3\r\nGET\r\n"), Some(false));
    }

    #[test]
    fn test_parse_get_request() {
        let raw = b"GET /get/fleet/truck1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/get/fleet/truck1");
        assert_eq!(req.header("host"), Some("localhost"));
    }

    #[test]
    fn test_parse_post_with_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 20\r\n\r\nset fleet t point 12";
        let (req, _) = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.body, b"set fleet t point 12");
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n")
            .unwrap()
            .is_none());
        assert!(
            parse_request(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_path_tokens() {
        assert_eq!(
            path_tokens("/set/fleet/truck1/point/33.5/-112.1"),
            vec!["set", "fleet", "truck1", "point", "33.5", "-112.1"]
        );
        assert_eq!(path_tokens("/get/my%20key/x?auth=pw"), vec!["get", "my key", "x"]);
        assert_eq!(path_tokens("/"), Vec::<String>::new());
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param("/get/k/v?auth=secret", "auth"),
            Some("secret".to_string())
        );
        assert_eq!(query_param("/get/k/v", "auth"), None);
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let raw = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let (req, _) = parse_request(raw).unwrap().unwrap();
        assert!(req.is_websocket_upgrade());
    }

    #[test]
    fn test_response_framing() {
        let resp = response("{\"ok\":true}");
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("{\"ok\":true}\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
    }
}
