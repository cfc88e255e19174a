//! The remote listener: one attached session at a time.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpListener;

use super::session::Session;
use super::ControlPlaneError;

#[derive(Debug)]
pub struct RemoteListener {
    inner: TcpListener,
    addr: SocketAddr,
}

impl RemoteListener {
    /// Bind exactly `addr`. There is no fallback port.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ControlPlaneError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ControlPlaneError::Listener { addr, source })?;
        let addr = inner
            .local_addr()
            .map_err(|source| ControlPlaneError::Listener { addr, source })?;
        Ok(Self { inner, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept sessions forever, serving each to completion before the next.
    /// Connection errors are logged and the listener keeps going.
    pub async fn serve(self, session: Arc<Session>) {
        loop {
            let (stream, peer) = match self.inner.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!("accept failed on {}: {err}", self.addr);
                    continue;
                }
            };
            tracing::info!(%peer, "remote session attached");
            let (read, write) = stream.into_split();
            if let Err(err) = session.serve_lines(BufReader::new(read), write).await {
                tracing::warn!(%peer, "remote session ended with error: {err}");
            }
            tracing::info!(%peer, "remote session detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogHandle, LogLevel};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_occupied_port_is_listener_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let err = RemoteListener::bind(addr).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Listener { addr: a, .. } if a == addr));
    }

    #[tokio::test]
    async fn test_sessions_are_served_one_after_another() {
        let listener = RemoteListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let session = Arc::new(Session::new(LogHandle::detached(LogLevel::Info), addr, None));
        let server = tokio::spawn(listener.serve(session));

        for _ in 0..2 {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"ping\nquit\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("pong"));
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("bye"));
            assert_eq!(lines.next_line().await.unwrap(), None);
        }

        server.abort();
    }
}
