//! TCP transport to a negotiated server, plus LSP message framing.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{LspError, LspResult};
use crate::handshake::Handshake;
use crate::process::ProcessHandle;

/// A byte stream to a running server.
///
/// Closing the transport (dropping it) interrupts the server process it was
/// negotiated with.
#[derive(Debug)]
pub struct ServerTransport {
    stream: TcpStream,
    addr: String,
    server: Option<ProcessHandle>,
}

impl ServerTransport {
    /// Wrap a connected stream; `server` is interrupted on close.
    pub fn new(stream: TcpStream, addr: impl Into<String>, server: Option<ProcessHandle>) -> Self {
        Self {
            stream,
            addr: addr.into(),
            server,
        }
    }

    /// Address the transport is connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Handle of the server bound to this transport.
    pub fn server(&self) -> Option<&ProcessHandle> {
        self.server.as_ref()
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            debug!(addr = %self.addr, pid = ?server.pid(), "transport closed, interrupting server");
            server.interrupt();
        }
    }
}

impl AsyncRead for ServerTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ServerTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Open a TCP transport to the address in `handshake`.
///
/// If the connection fails the server is interrupted before returning.
pub async fn connect(handshake: Handshake) -> LspResult<ServerTransport> {
    let (record, server) = handshake.into_parts();
    let addr = record.address();

    match TcpStream::connect(&addr).await {
        Ok(stream) => {
            debug!(%addr, "connected to hi-friend");
            Ok(ServerTransport::new(stream, addr, Some(server)))
        }
        Err(source) => {
            server.interrupt();
            Err(LspError::Connect { addr, source })
        }
    }
}

/// JSON-RPC notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Method name of a message, if it is a request or notification.
pub fn message_method(content: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Probe {
        method: Option<String>,
    }
    serde_json::from_slice::<Probe>(content).ok()?.method
}

/// Write one message with a `Content-Length` header.
pub async fn write_message<W>(writer: &mut W, content: &[u8]) -> LspResult<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", content.len());
    trace!(bytes = content.len(), "writing LSP message");

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(content).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message body.
///
/// Returns `None` on a clean end of stream between messages.
pub async fn read_message<R>(reader: &mut R) -> LspResult<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            if saw_header {
                return Err(LspError::protocol("stream closed inside message headers"));
            }
            return Ok(None);
        }
        saw_header = true;

        let line = line.trim();
        if line.is_empty() {
            break;
        }

        if let Some(len_str) = line.strip_prefix("Content-Length:") {
            content_length = Some(
                len_str
                    .trim()
                    .parse()
                    .map_err(|_| LspError::protocol("invalid Content-Length"))?,
            );
        }
    }

    let content_length =
        content_length.ok_or_else(|| LspError::protocol("missing Content-Length header"))?;

    let mut content = vec![0u8; content_length];
    reader.read_exact(&mut content).await?;
    trace!(bytes = content_length, "read LSP message");

    Ok(Some(content))
}
