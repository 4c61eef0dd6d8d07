//! Loopback HTTP forward proxy
//!
//! Each accepted connection gets its own tunnel session. The request head is checked here
//! (CONNECT for TLS, absolute `http://` URIs for plain HTTP) and then sent through the tunnel
//! verbatim; the far end hands the stream to an ordinary HTTP proxy.

use crate::session::{Session, SessionTable, TunnelContext};
use crate::Result;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Largest request head accepted
pub const MAX_HEAD_LEN: usize = 16 * 1024;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
const HEAD_TOO_LARGE: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Parsed request line of a proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRequest {
    /// `CONNECT host:port`
    Connect { authority: String },
    /// Any other method with an absolute `http://` URI
    Forward { method: String, uri: String },
}

impl std::fmt::Display for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect { authority } => write!(f, "CONNECT {}", authority),
            Self::Forward { method, uri } => write!(f, "{} {}", method, uri),
        }
    }
}

/// Validate a request head (everything up to and including the blank line)
pub fn parse_request_head(head: &[u8]) -> std::result::Result<ProxyRequest, &'static str> {
    let head = std::str::from_utf8(head).map_err(|_| "request head is not UTF-8")?;
    let request_line = head.split("\r\n").next().ok_or("empty request")?;

    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err("malformed request line"),
    };

    if !version.starts_with("HTTP/1.") {
        return Err("unsupported HTTP version");
    }
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err("malformed method");
    }

    if method == "CONNECT" {
        let (host, port) = target.rsplit_once(':').ok_or("CONNECT target without port")?;
        if host.is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
            return Err("bad CONNECT target");
        }
        return Ok(ProxyRequest::Connect {
            authority: target.to_string(),
        });
    }

    let rest = target
        .get(..7)
        .filter(|scheme| scheme.eq_ignore_ascii_case("http://"))
        .map(|_| &target[7..])
        .ok_or("not an absolute http:// URI")?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err("URI without host");
    }

    Ok(ProxyRequest::Forward {
        method: method.to_string(),
        uri: target.to_string(),
    })
}

enum Head {
    /// Request bytes read so far; the head ends at `head_len`
    Complete { buf: BytesMut, head_len: usize },
    TooLarge,
    /// Client went away before finishing the head
    Eof,
}

async fn read_head(socket: &mut TcpStream) -> Result<Head> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut searched = 0;

    loop {
        if let Some(pos) = buf[searched..].windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(Head::Complete {
                head_len: searched + pos + 4,
                buf,
            });
        }
        if buf.len() > MAX_HEAD_LEN {
            return Ok(Head::TooLarge);
        }
        searched = buf.len().saturating_sub(3);

        if socket.read_buf(&mut buf).await? == 0 {
            return Ok(Head::Eof);
        }
    }
}

/// Loopback listener creating one session per connection
pub struct ProxyFrontEnd {
    ctx: TunnelContext,
    sessions: Arc<SessionTable>,
}

impl ProxyFrontEnd {
    pub fn new(ctx: TunnelContext) -> Self {
        Self {
            ctx,
            sessions: Arc::new(SessionTable::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Bind `addr` and serve until the context is cancelled
    pub async fn listen(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        log::info!("HTTP proxy listening on {}", listener.local_addr()?);

        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            log::debug!("Accepted connection from {}", peer_addr);

            let ctx = self.ctx.clone();
            let sessions = Arc::clone(&self.sessions);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, peer_addr, ctx, sessions).await {
                    log::debug!("Connection from {} ended: {}", peer_addr, e);
                }
            });
        }

        log::info!("HTTP proxy stopped");
        self.sessions.close_all();
        Ok(())
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    ctx: TunnelContext,
    sessions: Arc<SessionTable>,
) -> Result<()> {
    let (buf, head_len) = match read_head(&mut socket).await? {
        Head::Complete { buf, head_len } => (buf, head_len),
        Head::TooLarge => {
            log::warn!("Request head from {} too large", peer_addr);
            socket.write_all(HEAD_TOO_LARGE).await?;
            return Ok(());
        }
        Head::Eof => return Ok(()),
    };

    let request = match parse_request_head(&buf[..head_len]) {
        Ok(request) => request,
        Err(reason) => {
            log::warn!("Bad proxy request from {}: {}", peer_addr, reason);
            socket.write_all(BAD_REQUEST).await?;
            return Ok(());
        }
    };

    let session = sessions.open(&ctx)?;
    log::info!("{} from {} (session {:04x})", request, peer_addr, session.id());

    let result = tunnel(&mut socket, &session, &buf).await;
    session.close();
    sessions.remove(session.id());
    result
}

/// Shuttle bytes between the client and the session until the session ends or fails
async fn tunnel(socket: &mut TcpStream, session: &Session, request: &[u8]) -> Result<()> {
    if session.wait_established().await.is_err() {
        socket.write_all(BAD_GATEWAY).await?;
        return Ok(());
    }

    session.write(request).await?;

    let (reader, writer) = socket.split();
    let upstream = client_to_session(reader, session);
    let downstream = session_to_client(session, writer);
    tokio::pin!(upstream, downstream);

    // A client half-close still waits for the rest of the response
    tokio::select! {
        result = &mut upstream => {
            result?;
            downstream.await
        }
        result = &mut downstream => result,
    }
}

async fn client_to_session(mut reader: ReadHalf<'_>, session: &Session) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        session.write(&buf[..n]).await?;
    }
}

async fn session_to_client(session: &Session, mut writer: WriteHalf<'_>) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match session.read(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.is_closed() => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n]).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let head = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        assert_eq!(
            parse_request_head(head),
            Ok(ProxyRequest::Connect {
                authority: "example.com:443".into()
            })
        );

        let v6 = b"CONNECT [2001:db8::1]:8443 HTTP/1.1\r\n\r\n";
        assert!(parse_request_head(v6).is_ok());
    }

    #[test]
    fn test_parse_absolute_uri() {
        let head = b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(
            parse_request_head(head),
            Ok(ProxyRequest::Forward {
                method: "GET".into(),
                uri: "http://example.com/index.html".into()
            })
        );
        assert!(parse_request_head(b"POST HTTP://example.com HTTP/1.0\r\n\r\n").is_ok());
    }

    #[test]
    fn test_reject_malformed() {
        let bad: &[&[u8]] = &[
            b"GET /relative HTTP/1.1\r\n\r\n",
            b"GET https://example.com/ HTTP/1.1\r\n\r\n",
            b"GET http:/// HTTP/1.1\r\n\r\n",
            b"CONNECT example.com HTTP/1.1\r\n\r\n",
            b"CONNECT example.com:0 HTTP/1.1\r\n\r\n",
            b"CONNECT :443 HTTP/1.1\r\n\r\n",
            b"CONNECT example.com:443 HTTP/2\r\n\r\n",
            b"get http://example.com/ HTTP/1.1\r\n\r\n",
            b"GET http://example.com/\r\n\r\n",
            b"\xff\xfe\r\n\r\n",
            b"\r\n\r\n",
        ];
        for head in bad {
            assert!(
                parse_request_head(head).is_err(),
                "{:?} accepted",
                String::from_utf8_lossy(head)
            );
        }
    }
}
