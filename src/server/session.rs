//! One client connection's recording lifecycle

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::camera::{CameraError, RecordingRequest, SharedCamera};
use crate::utils;

/// How long each encoder pump blocks before the session re-checks shutdown
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client went away
    Disconnected,
    /// The process is shutting down
    Shutdown,
}

/// Anything other than the client disconnecting
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Couldn't start recording: {0}")]
    Start(#[source] CameraError),
    #[error("Error while streaming: {0}")]
    Streaming(#[source] CameraError),
    #[error("Error while tidying up: {0}")]
    Teardown(#[source] CameraError),
}

/// Binds the camera's recording to a single accepted connection.
///
/// Runs on a blocking thread: the encoder writes straight into the socket and
/// a failed write is the only signal that the client has gone.
pub struct StreamingSession {
    camera: SharedCamera,
    connection: TcpStream,
    request: RecordingRequest,
    peer: SocketAddr,
    poll_interval: Duration,
}

impl StreamingSession {
    pub fn new(
        camera: SharedCamera,
        connection: TcpStream,
        request: RecordingRequest,
        peer: SocketAddr,
    ) -> Self {
        Self {
            camera,
            connection,
            request,
            peer,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Stream until the client disconnects or `shutdown` fires. Recording is
    /// always stopped before returning.
    #[instrument(skip_all, fields(peer = %self.peer))]
    pub fn run(self, shutdown: &CancellationToken) -> Result<SessionEnd, SessionError> {
        let Self {
            camera,
            connection,
            request,
            peer: _,
            poll_interval,
        } = self;

        // A refused start leaves the recording flag untouched, so there is
        // nothing of ours to tear down
        camera
            .start_recording(Box::new(connection), &request)
            .map_err(SessionError::Start)?;

        let streamed = pump(&camera, poll_interval, shutdown);
        let tidied = teardown(&camera);

        match (streamed, tidied) {
            (Ok(end), Ok(())) => Ok(end),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_err)) => {
                error!(error = %teardown_err, "Error (tidying up)");
                Err(e)
            }
        }
    }
}

fn pump(
    camera: &SharedCamera,
    poll_interval: Duration,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, SessionError> {
    loop {
        if shutdown.is_cancelled() {
            debug!("Shutdown requested, ending stream");
            return Ok(SessionEnd::Shutdown);
        }

        match camera.wait_recording(poll_interval) {
            Ok(()) => {}
            Err(CameraError::SinkBroken(e)) => {
                debug!(error = %e, "Client dropped connection");
                return Ok(SessionEnd::Disconnected);
            }
            Err(e) => return Err(SessionError::Streaming(e)),
        }
    }
}

/// Stop recording, then close the sink. A sink that is already broken is
/// expected here.
fn teardown(camera: &SharedCamera) -> Result<(), SessionError> {
    let sink = camera.stop_recording().map_err(SessionError::Teardown)?;

    if let Some(mut sink) = sink {
        match sink.flush() {
            Ok(()) => {}
            Err(e) if utils::is_disconnect(&e) || utils::is_stalled(&e) => {}
            Err(e) => return Err(SessionError::Teardown(CameraError::Sink(e))),
        }
    }
    Ok(())
}
