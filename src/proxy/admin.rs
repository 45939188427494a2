//! Minimal same-port HTTP status surface. GETs that reach the proxy
//! port are answered with a JSON session listing or a health line; the
//! responder is deliberately tiny, one request per connection.

use std::io;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::proxy::registry::SessionRegistry;

const MAX_REQUEST_BYTES: usize = 8192;

pub async fn serve_http(
    mut stream: TcpStream,
    registry: Arc<SessionRegistry>,
) -> io::Result<()> {
    let mut request = Vec::with_capacity(512);
    let mut buf = [0u8; 512];
    loop {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        request.extend_from_slice(&buf[..read]);
        if request.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        if request.len() > MAX_REQUEST_BYTES {
            return write_response(
                &mut stream,
                431,
                "Request Header Fields Too Large",
                "text/plain; charset=utf-8",
                b"request too large\n",
            )
            .await;
        }
    }

    let request_line = request
        .split(|b| *b == b'\r' || *b == b'\n')
        .next()
        .unwrap_or_default();
    let request_line = String::from_utf8_lossy(request_line);
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");
    let path = path.split('?').next().unwrap_or("/");

    if method != "GET" && method != "HEAD" {
        return write_response(
            &mut stream,
            405,
            "Method Not Allowed",
            "text/plain; charset=utf-8",
            b"only GET is supported\n",
        )
        .await;
    }

    match path {
        "/healthz" => {
            write_response(
                &mut stream,
                200,
                "OK",
                "text/plain; charset=utf-8",
                b"ok\n",
            )
            .await
        }
        "/" | "/sessions" => {
            let statuses = registry.statuses().await;
            let body = json!(statuses
                .iter()
                .map(|status| {
                    json!({
                        "test_id": status.test_id,
                        "active": status.active,
                        "level": status.level,
                        "created_at": status.created_at,
                    })
                })
                .collect::<Vec<_>>());
            let rendered = serde_json::to_vec_pretty(&body).unwrap_or_else(|_| b"[]".to_vec());
            write_response(
                &mut stream,
                200,
                "OK",
                "application/json; charset=utf-8",
                &rendered,
            )
            .await
        }
        _ => {
            write_response(
                &mut stream,
                404,
                "Not Found",
                "text/plain; charset=utf-8",
                b"not found\n",
            )
            .await
        }
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    status_text: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let header = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}
