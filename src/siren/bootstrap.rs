//! Startup sequence and the long-lived command handler.
//!
//! ```text
//! Start → ParseOptions → ConfigureLogging → StartRemoteListener → RunCommandHandler
//! ```
//!
//! [`start`] runs the first three phases and fails fast with a
//! [`ControlPlaneError`]; nothing is logged and no socket is opened when
//! option parsing fails. [`run_command_handler`] owns everything after that.

use anyhow::Result;
use std::ffi::OsString;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};

use super::backend::BackendConnection;
use super::listener::RemoteListener;
use super::options::{self, Parsed, SirenOptions};
use super::session::Session;
use super::{ControlPlaneError, BACKEND_ADDR, REMOTE_LISTENER_ADDR};
use crate::logging::{self, LogHandle, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    ParseOptions,
    ConfigureLogging,
    StartRemoteListener,
    RunCommandHandler,
}

/// Fixed contact points. Only tests change them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub listener_addr: SocketAddr,
    pub backend_addr: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listener_addr: REMOTE_LISTENER_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 4005))),
            backend_addr: BACKEND_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 57110))),
        }
    }
}

/// A control plane with logging configured and the listener open.
#[derive(Debug)]
pub struct Started {
    pub options: SirenOptions,
    pub log: LogHandle,
    pub listener: RemoteListener,
    pub settings: Settings,
    /// Phases completed, in order.
    pub phases: Vec<Phase>,
}

#[derive(Debug)]
pub enum Startup {
    Ready(Started),
    /// `--help`/`--version` output; nothing was started.
    Print(String),
}

/// Parse options, install the process-wide logger and open the listener.
pub async fn start<I, T>(args: I, settings: Settings) -> Result<Startup, ControlPlaneError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    start_with(args, settings, |level| {
        logging::init(level).map_err(|err| ControlPlaneError::Logging(format!("{err:#}")))
    })
    .await
}

/// [`start`] with a caller-supplied logging installer.
pub async fn start_with<I, T, F>(
    args: I,
    settings: Settings,
    configure_logging: F,
) -> Result<Startup, ControlPlaneError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    F: FnOnce(LogLevel) -> Result<LogHandle, ControlPlaneError>,
{
    let mut phases = vec![Phase::Start];

    let options = match options::parse(args)? {
        Parsed::Run(options) => options,
        Parsed::Print(text) => return Ok(Startup::Print(text)),
    };
    phases.push(Phase::ParseOptions);

    let log = configure_logging(options.log_level)?;
    phases.push(Phase::ConfigureLogging);
    tracing::debug!(level = %log.level(), "logging configured");

    let listener = RemoteListener::bind(settings.listener_addr).await?;
    phases.push(Phase::StartRemoteListener);
    tracing::info!(addr = %listener.local_addr(), "remote listener open");

    Ok(Startup::Ready(Started {
        options,
        log,
        listener,
        settings,
        phases,
    }))
}

/// Serve the remote listener and stdin until SIGINT or SIGTERM.
pub async fn run_command_handler(started: Started) -> Result<()> {
    run_command_handler_until(
        started,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await
}

/// Connect the backend once, then serve the remote listener and the local
/// surface until `shutdown` resolves. The local surface reaching EOF does not
/// end the handler.
pub async fn run_command_handler_until<R, W, S>(
    started: Started,
    local_in: R,
    local_out: W,
    shutdown: S,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    tracing::debug!(phase = ?Phase::RunCommandHandler, "entering command handler");
    let backend = match BackendConnection::connect(started.settings.backend_addr).await {
        Ok(conn) => {
            tracing::info!(backend = %conn.addr(), "backend connected");
            Some(conn)
        }
        Err(err) => {
            tracing::warn!("backend unavailable, continuing without it: {err:#}");
            None
        }
    };

    let session = Arc::new(Session::new(
        started.log,
        started.listener.local_addr(),
        backend,
    ));

    let remote = tokio::spawn(started.listener.serve(Arc::clone(&session)));
    let local = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(err) = session.serve_lines(local_in, local_out).await {
                tracing::warn!("local session ended with error: {err}");
            }
            tracing::debug!("local session closed; remote listener still open");
        })
    };

    shutdown.await;
    tracing::info!("shutting down");
    remote.abort();
    local.abort();
    session.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(err) => {
                tracing::warn!("cannot watch SIGTERM: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::capture::Captured;
    use std::cell::Cell;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UdpSocket};

    fn ephemeral(backend_addr: SocketAddr) -> Settings {
        Settings {
            listener_addr: "127.0.0.1:0".parse().unwrap(),
            backend_addr,
        }
    }

    async fn start_captured(
        args: &[&str],
        settings: Settings,
    ) -> (Result<Startup, ControlPlaneError>, Captured, Option<tracing::subscriber::DefaultGuard>) {
        let sink = Captured::default();
        let mut guard = None;
        let result = start_with(
            std::iter::once("siren").chain(args.iter().copied()),
            settings,
            |level| {
                let (handle, g) = logging::init_scoped(level, sink.clone());
                guard = Some(g);
                Ok(handle)
            },
        )
        .await;
        (result, sink, guard)
    }

    #[tokio::test]
    async fn test_bogus_level_fails_before_logging_and_listener() {
        let configured = Cell::new(false);
        let result = start_with(
            ["siren", "--log-level=bogus"],
            ephemeral(Settings::default().backend_addr),
            |level| {
                configured.set(true);
                Ok(LogHandle::detached(level))
            },
        )
        .await;
        assert!(matches!(result, Err(ControlPlaneError::Parse { .. })));
        assert!(!configured.get());
    }

    #[tokio::test]
    async fn test_debug_level_emits_debug_lines() {
        let (result, sink, _guard) =
            start_captured(&["--log-level", "debug"], ephemeral(Settings::default().backend_addr)).await;
        let Ok(Startup::Ready(started)) = result else {
            panic!("startup failed");
        };
        assert_eq!(
            started.phases,
            vec![
                Phase::Start,
                Phase::ParseOptions,
                Phase::ConfigureLogging,
                Phase::StartRemoteListener
            ]
        );
        assert!(sink.text().contains("logging configured"));
        assert!(sink.text().contains("remote listener open"));
    }

    #[tokio::test]
    async fn test_info_level_suppresses_debug_lines() {
        let (result, sink, _guard) =
            start_captured(&["--log-level=info"], ephemeral(Settings::default().backend_addr)).await;
        assert!(matches!(result, Ok(Startup::Ready(_))));
        assert!(!sink.text().contains("logging configured"));
        assert!(sink.text().contains("remote listener open"));
    }

    #[tokio::test]
    async fn test_occupied_port_stops_before_command_handler() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let settings = Settings {
            listener_addr: taken.local_addr().unwrap(),
            ..Settings::default()
        };
        let (result, _sink, _guard) = start_captured(&[], settings).await;
        let err = result.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Listener { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_command_handler_serves_remote_until_shutdown() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (result, _sink, _guard) =
            start_captured(&[], ephemeral(backend.local_addr().unwrap())).await;
        let Ok(Startup::Ready(started)) = result else {
            panic!("startup failed");
        };
        let addr = started.listener.local_addr();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handler = tokio::spawn(run_command_handler_until(
            started,
            BufReader::new(tokio::io::empty()),
            tokio::io::sink(),
            async {
                let _ = stop_rx.await;
            },
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"send /status\nquit\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("sent /status (12 bytes)")
        );
        let mut buf = [0u8; 16];
        assert_eq!(backend.recv(&mut buf).await.unwrap(), 12);

        stop_tx.send(()).unwrap();
        handler.await.unwrap().unwrap();
    }
}
