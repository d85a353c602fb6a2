use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::message::ChatRequest;
use crate::session::{cookie_value, resolve_session, set_cookie_value, SESSION_COOKIE};
use crate::ChatRelay;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const CHAT_PATH: &str = "/api/chat";

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Bind and run the relay server.
pub async fn serve(bind: &str, port: u16, relay: ChatRelay) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind, port)).await?;
    tracing::info!("chat relay listening on http://{}:{}{}", bind, port, CHAT_PATH);
    serve_on(listener, relay).await
}

/// Run the relay server on an already-bound listener. Each connection is an
/// independent task; nothing a connection does can take the loop down.
pub async fn serve_on(listener: TcpListener, relay: ChatRelay) -> std::io::Result<()> {
    let relay = Arc::new(relay);
    loop {
        let (stream, peer) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, relay).await {
                tracing::warn!(%peer, error = %e, "connection error");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub cookie: Option<String>,
    pub content_length: usize,
}

#[derive(Debug, PartialEq)]
pub enum HeadParse {
    /// Head parsed; the payload starts at the given buffer offset.
    Complete(RequestHead, usize),
    /// More bytes needed.
    Partial,
    /// Not HTTP.
    Invalid,
}

/// Parse the request head out of the bytes read so far.
pub fn parse_request_head(buf: &[u8]) -> HeadParse {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let method = req.method.unwrap_or("").to_string();
            // The endpoint takes no query parameters; strip any that arrive.
            let path = req
                .path
                .unwrap_or("/")
                .split('?')
                .next()
                .unwrap_or("/")
                .to_string();
            let mut cookie = None;
            let mut content_length = 0usize;
            for header in req.headers.iter() {
                if header.name.eq_ignore_ascii_case("cookie") {
                    cookie = Some(String::from_utf8_lossy(header.value).to_string());
                } else if header.name.eq_ignore_ascii_case("content-length") {
                    content_length = String::from_utf8_lossy(header.value)
                        .trim()
                        .parse()
                        .unwrap_or(0);
                }
            }
            HeadParse::Complete(
                RequestHead {
                    method,
                    path,
                    cookie,
                    content_length,
                },
                head_len,
            )
        }
        Ok(httparse::Status::Partial) => HeadParse::Partial,
        Err(_) => HeadParse::Invalid,
    }
}

// ---------------------------------------------------------------------------
// Response assembly
// ---------------------------------------------------------------------------

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

pub fn cors_headers(allow_origin: &str) -> String {
    format!(
        "Access-Control-Allow-Origin: {}\r\nAccess-Control-Allow-Methods: POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type, Authorization, Cookie\r\n",
        allow_origin
    )
}

async fn write_json_error(
    stream: &mut TcpStream,
    status: u16,
    message: &str,
    session_id: Option<&str>,
    allow_origin: &str,
) -> std::io::Result<()> {
    let body = serde_json::json!({ "error": message }).to_string();
    let cookie_line = session_id
        .map(|id| format!("Set-Cookie: {}\r\n", set_cookie_value(id)))
        .unwrap_or_default();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n{}",
        status,
        status_text(status),
        body.len(),
        cookie_line,
        cors_headers(allow_origin),
        body,
    );
    stream.write_all(response.as_bytes()).await
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    relay: Arc<ChatRelay>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let allow_origin = relay.config().allow_origin.clone();

    // Read until the full request head is in.
    let mut buf = Vec::with_capacity(4096);
    let (head, body_start) = loop {
        match parse_request_head(&buf) {
            HeadParse::Complete(head, offset) => break (head, offset),
            HeadParse::Invalid => {
                write_json_error(&mut stream, 400, "Malformed request", None, &allow_origin)
                    .await?;
                return Ok(());
            }
            HeadParse::Partial => {
                if buf.len() > MAX_HEAD_BYTES {
                    write_json_error(
                        &mut stream,
                        400,
                        "Request head too large",
                        None,
                        &allow_origin,
                    )
                    .await?;
                    return Ok(());
                }
                let mut tmp = [0u8; 4096];
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&tmp[..n]);
            }
        }
    };

    tracing::debug!(method = %head.method, path = %head.path, "request");

    // CORS preflight: 200, no body.
    if head.method == "OPTIONS" {
        let response = format!(
            "HTTP/1.1 200 OK\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
            cors_headers(&allow_origin)
        );
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    if head.method != "POST" {
        let response = format!(
            "HTTP/1.1 405 Method Not Allowed\r\nAllow: POST, OPTIONS\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
            cors_headers(&allow_origin)
        );
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    if head.path != CHAT_PATH {
        write_json_error(&mut stream, 404, "Not found", None, &allow_origin).await?;
        return Ok(());
    }

    if head.content_length > MAX_BODY_BYTES {
        write_json_error(
            &mut stream,
            413,
            "Request body too large",
            None,
            &allow_origin,
        )
        .await?;
        return Ok(());
    }

    // The rest of the body may trail the head bytes already read.
    let mut body = buf[body_start..].to_vec();
    while body.len() < head.content_length {
        let mut tmp = [0u8; 4096];
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(head.content_length);

    // The session cookie rides on every response from here on, error paths
    // included, so a retry stays in the same upstream conversation.
    let session_id = resolve_session(
        head.cookie
            .as_deref()
            .and_then(|h| cookie_value(h, SESSION_COOKIE)),
    );

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable request body");
            write_json_error(
                &mut stream,
                400,
                "Invalid request body",
                Some(&session_id),
                &allow_origin,
            )
            .await?;
            return Ok(());
        }
    };

    let question = match relay.preflight(&request.messages) {
        Ok(q) => q,
        Err(e) => {
            write_json_error(
                &mut stream,
                e.preflight_status(),
                &e.to_string(),
                Some(&session_id),
                &allow_origin,
            )
            .await?;
            return Ok(());
        }
    };

    // Commit the streaming headers. From this point every failure is
    // reported in-band; the status can no longer change.
    let response_head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\nSet-Cookie: {}\r\n{}\r\n",
        set_cookie_value(&session_id),
        cors_headers(&allow_origin),
    );
    stream.write_all(response_head.as_bytes()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let turn = {
        let relay = relay.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            relay.run_turn(&question, &session_id, &tx).await;
        })
    };

    loop {
        match rx.recv().await {
            Some(frame) => {
                if stream.write_all(frame.encode_line().as_bytes()).await.is_err() {
                    tracing::debug!("client disconnected mid-stream");
                    break;
                }
            }
            None => break,
        }
    }

    // Dropping the receiver lets a still-pacing turn wind down immediately.
    drop(rx);
    let _ = turn.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_head_basic_post() {
        let raw = b"POST /api/chat HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\n\r\n{\"messages\":";
        match parse_request_head(raw) {
            HeadParse::Complete(head, offset) => {
                assert_eq!(head.method, "POST");
                assert_eq!(head.path, "/api/chat");
                assert_eq!(head.content_length, 12);
                assert!(head.cookie.is_none());
                assert_eq!(&raw[offset..], b"{\"messages\":");
            }
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_request_head_extracts_cookie() {
        let raw =
            b"POST /api/chat HTTP/1.1\r\nCookie: a=b; chat_session_id=chat-5\r\nContent-Length: 0\r\n\r\n";
        match parse_request_head(raw) {
            HeadParse::Complete(head, _) => {
                let cookie = head.cookie.expect("cookie header");
                assert_eq!(cookie_value(&cookie, SESSION_COOKIE), Some("chat-5"));
            }
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_request_head_strips_query() {
        let raw = b"GET /api/chat?x=1 HTTP/1.1\r\n\r\n";
        match parse_request_head(raw) {
            HeadParse::Complete(head, _) => assert_eq!(head.path, "/api/chat"),
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_request_head_partial() {
        assert_eq!(
            parse_request_head(b"POST /api/chat HTTP/1.1\r\nHost:"),
            HeadParse::Partial
        );
        assert_eq!(parse_request_head(b""), HeadParse::Partial);
    }

    #[test]
    fn test_parse_request_head_invalid() {
        assert_eq!(parse_request_head(b"\0\0garbage\0\0\r\n\r\n"), HeadParse::Invalid);
    }

    #[test]
    fn test_parse_request_head_bad_content_length_defaults_zero() {
        let raw = b"POST /api/chat HTTP/1.1\r\nContent-Length: many\r\n\r\n";
        match parse_request_head(raw) {
            HeadParse::Complete(head, _) => assert_eq!(head.content_length, 0),
            other => panic!("expected complete parse, got {:?}", other),
        }
    }

    #[test]
    fn test_cors_headers_cover_required_surface() {
        let cors = cors_headers("*");
        assert!(cors.contains("Access-Control-Allow-Origin: *"));
        assert!(cors.contains("POST, OPTIONS"));
        assert!(cors.contains("Content-Type, Authorization, Cookie"));
    }

    #[test]
    fn test_cors_headers_respect_configured_origin() {
        let cors = cors_headers("https://clinic.example");
        assert!(cors.contains("Access-Control-Allow-Origin: https://clinic.example"));
    }

    #[test]
    fn test_status_text_known_codes() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(405), "Method Not Allowed");
        assert_eq!(status_text(502), "Bad Gateway");
    }
}
