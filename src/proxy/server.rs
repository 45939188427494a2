//! TCP listener and dispatcher. Accepted connections are peeked to spot
//! same-port HTTP admin requests; everything else is handed to the
//! frontend protocol engine.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::proxy::admin;
use crate::proxy::frontend;
use crate::proxy::registry::SessionRegistry;

/// How many bytes the dispatcher peeks to sniff HTTP.
const PEEK_SIZE: usize = 8;
const PEEK_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ProxyServer {
    registry: Arc<SessionRegistry>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    /// Binds the listener. Port 0 asks the kernel for a free port; use
    /// `local_addr` to discover it.
    pub async fn bind(
        listen_host: &str,
        listen_port: u16,
        registry: Arc<SessionRegistry>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((listen_host, listen_port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "pgrollback listening");
        Ok(Self {
            registry,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept loop. Returns when `shutdown` fires; in-flight connection
    /// handlers are aborted and the sessions rolled back by the caller's
    /// registry teardown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let registry = self.registry.clone();
                            handlers.spawn(dispatch(stream, registry));
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    }
                }
            }
        }
        drop(self.listener);
        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
        info!("listener stopped");
    }
}

async fn dispatch(stream: TcpStream, registry: Arc<SessionRegistry>) {
    let mut peeked = [0u8; PEEK_SIZE];
    let looks_like_http =
        match tokio::time::timeout(PEEK_TIMEOUT, stream.peek(&mut peeked)).await {
            Ok(Ok(read)) if read > 0 => is_http_peek(&peeked[..read]),
            // No bytes yet: PostgreSQL clients speak first, but a slow
            // one still deserves the protocol engine.
            _ => false,
        };
    if looks_like_http {
        if let Err(err) = admin::serve_http(stream, registry).await {
            debug!(error = %err, "admin request failed");
        }
    } else {
        frontend::serve(stream, registry).await;
    }
}

/// Whether the first bytes of a connection look like an HTTP request
/// line: a known method followed by a space, as far as the peek reaches.
pub fn is_http_peek(bytes: &[u8]) -> bool {
    const METHODS: [&[u8]; 7] = [
        b"GET ", b"POST ", b"HEAD ", b"PUT ", b"DELETE ", b"OPTIONS ", b"PATCH ",
    ];
    METHODS.iter().any(|method| {
        let check = method.len().min(bytes.len());
        check > 0 && bytes[..check] == method[..check]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_method_prefixes_are_detected() {
        assert!(is_http_peek(b"GET / HT"));
        assert!(is_http_peek(b"POST /se"));
        assert!(is_http_peek(b"OPTIONS "));
        assert!(is_http_peek(b"DELETE /"));
    }

    #[test]
    fn postgres_startup_bytes_are_not_http() {
        // Startup packets begin with a big-endian length; the first byte
        // of any sane length is 0.
        assert!(!is_http_peek(&[0, 0, 0, 8, 4, 210, 22, 47]));
        assert!(!is_http_peek(b"Q\x00\x00\x00\x0cSELECT 1"));
        assert!(!is_http_peek(b""));
    }

    #[test]
    fn short_peeks_match_on_available_bytes() {
        assert!(is_http_peek(b"GET "));
        // "GET" without the space could still be a method prefix, but the
        // dispatcher only ever sees at least 4 bytes from real requests;
        // a 3-byte prefix of "GET " matches the method prefix rule.
        assert!(is_http_peek(b"GET"));
        assert!(!is_http_peek(b"GE_"));
    }
}
