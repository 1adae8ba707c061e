//! Single-client TCP streaming server

pub mod session;

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::camera::{RecordingRequest, SharedCamera};
use crate::utils;

pub use session::{SessionEnd, SessionError, StreamingSession, POLL_INTERVAL};

/// A client that accepts no video for this long is treated as gone
pub const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. while out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Couldn't start server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Streaming session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Accepts one client at a time and streams the camera to it.
///
/// `accept` is not called again until the current session has torn down,
/// so a second client waits in the listen backlog.
pub struct StreamingServer {
    listener: TcpListener,
    camera: SharedCamera,
    request: RecordingRequest,
    fatal_session_errors: bool,
    poll_interval: Duration,
    stall_timeout: Duration,
}

impl StreamingServer {
    /// Bind with `SO_REUSEADDR` and the platform default backlog
    pub fn bind(addr: SocketAddr, camera: SharedCamera) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(libc::SOMAXCONN as u32).map_err(bind_err)?;

        let request = RecordingRequest::h264(camera.settings().video);
        Ok(Self {
            listener,
            camera,
            request,
            fatal_session_errors: true,
            poll_interval: POLL_INTERVAL,
            stall_timeout: STALL_TIMEOUT,
        })
    }

    /// When false, an unexpected session error ends only that session
    pub fn with_fatal_session_errors(mut self, fatal: bool) -> Self {
        self.fatal_session_errors = fatal;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Write timeout on the client socket. Must be non-zero.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and stream until `shutdown` fires. The listener is closed on
    /// return.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let settings = self.camera.settings();
        info!(
            "Server starting on {}, will stream at {} @ {} fps",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into()),
            settings.video,
            settings.framerate
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Closing listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!("Connected by {peer}");
                    self.handle_connection(stream, peer, &shutdown).await?;
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) -> Result<(), ServerError> {
        let (connection, control, unblock) = match blocking_handles(stream, self.stall_timeout) {
            Ok(handles) => handles,
            Err(e) => {
                warn!(%peer, error = %e, "Connection error");
                return Ok(());
            }
        };

        let session = StreamingSession::new(
            self.camera.clone(),
            connection,
            self.request.clone(),
            peer,
        )
        .with_poll_interval(self.poll_interval);
        // Shutting the socket down fails a write that is stuck on a client
        // which stopped reading, so the session sees the cancellation
        let watcher = tokio::spawn(unblock_on_shutdown(unblock, peer, shutdown.clone()));
        let token = shutdown.clone();
        let outcome = tokio::task::spawn_blocking(move || session.run(&token)).await;
        watcher.abort();
        let outcome = outcome?;

        close_connection(&control, peer);

        match outcome {
            Ok(end) => {
                debug!(%peer, ?end, "Session ended");
                Ok(())
            }
            Err(e) if self.fatal_session_errors => {
                error!(%peer, error = %e, "Unexpected session error");
                Err(e.into())
            }
            Err(e) => {
                error!(%peer, error = %e, "Unexpected session error, continuing to serve");
                Ok(())
            }
        }
    }
}

type BlockingHandles = (std::net::TcpStream, std::net::TcpStream, std::net::TcpStream);

/// A blocking socket for the encoder, a handle for the final close and one
/// for the shutdown watcher
fn blocking_handles(stream: TcpStream, stall_timeout: Duration) -> io::Result<BlockingHandles> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(stall_timeout))?;
    let control = stream.try_clone()?;
    let unblock = stream.try_clone()?;
    Ok((stream, control, unblock))
}

async fn unblock_on_shutdown(
    conn: std::net::TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    shutdown.cancelled().await;
    debug!(%peer, "Shutdown requested, releasing the connection");
    close_connection(&conn, peer);
}

fn close_connection(conn: &std::net::TcpStream, peer: SocketAddr) {
    match conn.shutdown(Shutdown::Both) {
        Ok(()) => debug!(%peer, "Connection closed"),
        Err(e) if utils::is_not_connected(&e) => debug!(%peer, "Connection already closed"),
        Err(e) => warn!(%peer, error = %e, "Error while closing connection"),
    }
}
