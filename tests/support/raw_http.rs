//! A one-response-per-connection HTTP server over a raw `TcpListener`.
//!
//! wiremock always frames bodies correctly, so mid-body stalls need this.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::socket_guard::should_skip_socket_bound_test;

/// What the server does after writing the canned bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// Shut the connection down cleanly.
    Close,
    /// Keep the connection open without sending anything else.
    Stall,
}

/// Serves `response` verbatim to every connection. Stops when dropped.
pub struct RawServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RawServer {
    /// Starts the server, or returns `None` when sockets are unavailable.
    pub async fn start(response: Vec<u8>, ending: Ending) -> Option<Self> {
        if should_skip_socket_bound_test() {
            return None;
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.ok()?;
        let addr = listener.local_addr().ok()?;
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                serve(stream, &response, ending).await;
            }
        });
        Some(Self { addr, task })
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for RawServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, response: &[u8], ending: Ending) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    if stream.write_all(response).await.is_err() || stream.flush().await.is_err() {
        return;
    }
    match ending {
        Ending::Close => {
            let _ = stream.shutdown().await;
        }
        Ending::Stall => std::future::pending::<()>().await,
    }
}

/// Status line and headers followed by `body`.
#[must_use]
pub fn response(head: &str, body: &[u8]) -> Vec<u8> {
    let mut bytes = format!("{head}\r\n\r\n").into_bytes();
    bytes.extend_from_slice(body);
    bytes
}
