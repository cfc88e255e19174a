//! The control-plane session: the line commands both surfaces share.
//!
//! The session owns the backend connection. Nothing else holds it, and it is
//! released only by [`Session::shutdown`].

use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::backend::BackendConnection;
use super::osc::OscArg;
use crate::logging::LogHandle;

const HELP: &str = "\
commands:
  ping                       check the shell is alive
  status                     log level, listener and backend state
  level                      the process log level
  send <address> [args..]    send an OSC message to the backend
  help                       this text
  quit                       close this session";

/// Answer to one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// The surface should close after writing `text`.
    pub close: bool,
}

impl Reply {
    fn line(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            close: false,
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self::line(format!("error: {}", text.into()))
    }
}

#[derive(Debug)]
pub struct Session {
    log: LogHandle,
    listener_addr: SocketAddr,
    backend: Mutex<Option<BackendConnection>>,
    started: Instant,
}

impl Session {
    pub fn new(log: LogHandle, listener_addr: SocketAddr, backend: Option<BackendConnection>) -> Self {
        Self {
            log,
            listener_addr,
            backend: Mutex::new(backend),
            started: Instant::now(),
        }
    }

    pub fn log(&self) -> LogHandle {
        self.log
    }

    pub fn listener_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    pub async fn has_backend(&self) -> bool {
        self.backend.lock().await.is_some()
    }

    /// Handle one command line. Blank lines get no reply.
    pub async fn handle(&self, line: &str) -> Option<Reply> {
        let mut words = line.split_whitespace();
        let command = words.next()?;
        tracing::debug!(command, "command");

        let reply = match command {
            "ping" => Reply::line("pong"),
            "level" => Reply::line(self.log.level().as_str()),
            "status" => Reply::line(self.status().await),
            "help" => Reply::line(HELP),
            "quit" => Reply {
                text: "bye".into(),
                close: true,
            },
            "send" => {
                let Some(address) = words.next() else {
                    return Some(Reply::error("usage: send <address> [args..]"));
                };
                let args: Vec<OscArg> = words.map(OscArg::parse).collect();
                self.send(address, &args).await
            }
            other => Reply::error(format!("unknown command '{}'; try 'help'", other)),
        };
        if reply.text.starts_with("error: ") {
            tracing::warn!("{}", reply.text);
        }
        Some(reply)
    }

    async fn status(&self) -> String {
        let backend = match self.backend.lock().await.as_ref() {
            Some(conn) => format!("connected {}", conn.addr()),
            None => "disconnected".to_string(),
        };
        format!(
            "log-level={} listener={} backend={} uptime={}s",
            self.log.level(),
            self.listener_addr,
            backend,
            self.started.elapsed().as_secs()
        )
    }

    async fn send(&self, address: &str, args: &[OscArg]) -> Reply {
        let guard = self.backend.lock().await;
        let Some(conn) = guard.as_ref() else {
            return Reply::error("no backend connection");
        };
        match conn.send(address, args).await {
            Ok(bytes) => Reply::line(format!("sent {} ({} bytes)", address, bytes)),
            Err(err) => Reply::error(format!("{err:#}")),
        }
    }

    /// Serve commands from one reader/writer pair until EOF or `quit`.
    pub async fn serve_lines<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let Some(reply) = self.handle(&line).await else {
                continue;
            };
            writer.write_all(reply.text.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            if reply.close {
                break;
            }
        }
        Ok(())
    }

    /// Release the backend connection.
    pub async fn shutdown(&self) {
        if let Some(conn) = self.backend.lock().await.take() {
            tracing::info!(backend = %conn.addr(), "closing backend connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use tokio::io::BufReader;
    use tokio::net::UdpSocket;

    fn session(backend: Option<BackendConnection>) -> Session {
        Session::new(
            LogHandle::detached(LogLevel::Debug),
            "127.0.0.1:4005".parse().unwrap(),
            backend,
        )
    }

    #[tokio::test]
    async fn test_basic_commands() {
        let session = session(None);
        assert_eq!(session.handle("ping").await.unwrap().text, "pong");
        assert_eq!(session.handle("  level ").await.unwrap().text, "debug");
        assert!(session.handle("").await.is_none());
        let status = session.handle("status").await.unwrap().text;
        assert!(status.contains("backend=disconnected"));
        assert!(status.contains("listener=127.0.0.1:4005"));
        assert!(session.handle("quit").await.unwrap().close);
        assert!(session
            .handle("frobnicate")
            .await
            .unwrap()
            .text
            .starts_with("error: unknown command"));
    }

    #[tokio::test]
    async fn test_send_without_backend_is_answered() {
        let session = session(None);
        let reply = session.handle("send /status").await.unwrap();
        assert_eq!(reply.text, "error: no backend connection");
        assert!(!reply.close);
    }

    #[tokio::test]
    async fn test_send_and_shutdown() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = BackendConnection::connect(server.local_addr().unwrap())
            .await
            .unwrap();
        let session = session(Some(conn));

        let reply = session.handle("send /n_free 1001").await.unwrap();
        assert_eq!(reply.text, "sent /n_free (16 bytes)");
        let mut buf = [0u8; 32];
        assert_eq!(server.recv(&mut buf).await.unwrap(), 16);

        session.shutdown().await;
        assert!(!session.has_backend().await);
    }

    #[tokio::test]
    async fn test_serve_lines_stops_at_quit() {
        let session = session(None);
        let input = BufReader::new(&b"ping\n\nquit\nping\n"[..]);
        let mut output = Vec::new();
        session.serve_lines(input, &mut output).await.unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "pong\nbye\n");
    }
}
