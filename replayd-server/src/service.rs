//! Replay services: the transport side of a connection.
//!
//! A [`ReplayService`] delivers the typed request stream to a session and
//! carries signals back to whoever is driving the replay. Two
//! implementations exist: [`SocketReplayService`] for live connections
//! and [`ArchiveReplayService`] for offline archive replay, where the
//! "client" is a directory on disk.

use crate::protocol::{self, Frame, Request, WireResource};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use replayd_core::crash::CrashReport;
use replayd_core::error::{ReplayError, Result};
use replayd_core::loader::ResourceProvider;
use replayd_core::types::{Resource, ResourceId, StateId};
use std::fs;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a connection may sit on an outstanding resource fetch before
/// the replay is abandoned.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The transport contract a session runs against.
pub trait ReplayService: ResourceProvider {
    /// Receive the next request. `None` means end of stream: the peer
    /// closed, the transport broke, or the idle timeout expired.
    fn next_request(&self) -> Option<Request>;

    /// Tell the client the current replay has finished. Sent
    /// unconditionally once interpretation returns, success or not.
    fn send_replay_finished(&self) -> Result<()>;

    /// Fire-and-forget directive asking this connection to prime itself.
    /// Modeled as an injected prewarm request on the connection's own
    /// inbound queue, so it is handled on the connection's own thread
    /// under the normal lock discipline.
    fn prime_now(&self, state: StateId, cleanup: StateId);

    /// Ship a captured crash report to the client.
    fn send_crash_report(&self, report: &CrashReport) -> Result<()>;
}

enum Inbound {
    Request(Request),
    /// The reader side is gone; drain nothing further.
    Closed,
}

/// A live connection over a TCP stream.
///
/// A dedicated reader thread decodes frames and feeds the inbound queue;
/// `prime_now` injects into the same queue. Writes share a mutexed
/// stream handle.
pub struct SocketReplayService {
    writer: Mutex<TcpStream>,
    inbound_rx: Receiver<Inbound>,
    inbound_tx: Sender<Inbound>,
    resources_rx: Receiver<Vec<WireResource>>,
    idle_timeout: Option<Duration>,
}

impl SocketReplayService {
    /// Take ownership of an authenticated stream and start its reader
    /// thread. `idle_timeout` of `None` waits forever between requests.
    pub fn start(stream: TcpStream, idle_timeout: Option<Duration>) -> Result<Self> {
        let reader = stream.try_clone().map_err(|e| ReplayError::TransportIo {
            cause: e.to_string(),
        })?;
        let (inbound_tx, inbound_rx) = unbounded();
        let (resources_tx, resources_rx) = unbounded();

        let request_tx = inbound_tx.clone();
        std::thread::Builder::new()
            .name("replay-reader".into())
            .spawn(move || read_loop(reader, request_tx, resources_tx))
            .map_err(|e| ReplayError::TransportIo {
                cause: e.to_string(),
            })?;

        Ok(Self {
            writer: Mutex::new(stream),
            inbound_rx,
            inbound_tx,
            resources_rx,
            idle_timeout,
        })
    }

    fn write(&self, frame: &Frame) -> Result<()> {
        protocol::write_frame(&mut *self.writer.lock(), frame)
    }
}

fn read_loop(
    mut reader: TcpStream,
    request_tx: Sender<Inbound>,
    resources_tx: Sender<Vec<WireResource>>,
) {
    loop {
        match protocol::read_frame(&mut reader) {
            Ok(Some(Frame::Request { request })) => {
                if request_tx.send(Inbound::Request(request)).is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Resources { resources })) => {
                if resources_tx.send(resources).is_err() {
                    break;
                }
            }
            Ok(Some(other)) => {
                debug!(frame = ?other, "ignoring unexpected frame from client");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "connection reader failed");
                break;
            }
        }
    }
    let _ = request_tx.send(Inbound::Closed);
}

impl ReplayService for SocketReplayService {
    fn next_request(&self) -> Option<Request> {
        let inbound = match self.idle_timeout {
            Some(timeout) => match self.inbound_rx.recv_timeout(timeout) {
                Ok(inbound) => inbound,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("idle timeout expired");
                    return None;
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            },
            None => self.inbound_rx.recv().ok()?,
        };
        match inbound {
            Inbound::Request(request) => Some(request),
            Inbound::Closed => None,
        }
    }

    fn send_replay_finished(&self) -> Result<()> {
        self.write(&Frame::ReplayFinished)
    }

    fn prime_now(&self, state: StateId, cleanup: StateId) {
        let request = Request::Prewarm {
            prerun_id: state,
            cleanup_id: cleanup,
        };
        let _ = self.inbound_tx.send(Inbound::Request(request));
    }

    fn send_crash_report(&self, report: &CrashReport) -> Result<()> {
        self.write(&Frame::CrashReport {
            report: report.clone(),
        })
    }
}

impl ResourceProvider for SocketReplayService {
    fn fetch_resources(&self, ids: &[ResourceId]) -> Result<Vec<Resource>> {
        self.write(&Frame::FetchResources { ids: ids.to_vec() })?;
        let resources = self
            .resources_rx
            .recv_timeout(FETCH_TIMEOUT)
            .map_err(|_| ReplayError::TransportIo {
                cause: "timed out waiting for resources".into(),
            })?;
        if resources.len() != ids.len() {
            return Err(ReplayError::TransportIo {
                cause: format!(
                    "asked for {} resources, client sent {}",
                    ids.len(),
                    resources.len()
                ),
            });
        }
        Ok(resources.into_iter().map(Resource::from).collect())
    }
}

/// The offline "connection": requests never arrive, the payload comes
/// from `payload.bin`, and outputs land in the postback directory.
pub struct ArchiveReplayService {
    payload_path: PathBuf,
    postback_dir: Option<PathBuf>,
}

impl ArchiveReplayService {
    /// The resource id under which the archive payload is served.
    pub const PAYLOAD_ID: &'static str = "payload";

    /// Create a service over an archive payload file.
    pub fn new(payload_path: PathBuf, postback_dir: Option<PathBuf>) -> Self {
        Self {
            payload_path,
            postback_dir,
        }
    }

    fn postback(&self, name: &str, contents: &[u8]) -> Result<()> {
        let Some(dir) = &self.postback_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir).map_err(|e| ReplayError::TransportIo {
            cause: e.to_string(),
        })?;
        fs::write(dir.join(name), contents).map_err(|e| ReplayError::TransportIo {
            cause: e.to_string(),
        })
    }
}

impl ReplayService for ArchiveReplayService {
    fn next_request(&self) -> Option<Request> {
        None
    }

    fn send_replay_finished(&self) -> Result<()> {
        self.postback("replay_finished", b"ok\n")
    }

    fn prime_now(&self, state: StateId, _cleanup: StateId) {
        warn!(state = %state, "prime directive ignored in archive mode");
    }

    fn send_crash_report(&self, report: &CrashReport) -> Result<()> {
        let body = serde_json::to_vec_pretty(report).map_err(|e| ReplayError::FrameCodec {
            cause: e.to_string(),
        })?;
        self.postback("crash_report.json", &body)
    }
}

impl ResourceProvider for ArchiveReplayService {
    fn fetch_resources(&self, ids: &[ResourceId]) -> Result<Vec<Resource>> {
        // Everything except the payload itself must already sit in the
        // exported cache; there is no client to fall back to.
        ids.iter()
            .map(|id| {
                if id.as_str() != Self::PAYLOAD_ID {
                    return Err(ReplayError::ResourceNotFound { id: id.clone() });
                }
                let data =
                    fs::read(&self.payload_path).map_err(|e| ReplayError::ResourceNotFound {
                        id: ResourceId::from(format!("{id} ({e})")),
                    })?;
                Ok(Resource::new(id.clone(), data))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn archive_service_serves_only_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let payload_path = dir.path().join("payload.bin");
        fs::File::create(&payload_path)
            .unwrap()
            .write_all(b"stream")
            .unwrap();

        let service = ArchiveReplayService::new(payload_path, None);
        let fetched = service
            .fetch_resources(&[ResourceId::from(ArchiveReplayService::PAYLOAD_ID)])
            .unwrap();
        assert_eq!(fetched[0].data, b"stream");

        assert!(service.fetch_resources(&["tex/1".into()]).is_err());
    }

    #[test]
    fn archive_service_is_end_of_stream() {
        let service = ArchiveReplayService::new(PathBuf::from("payload.bin"), None);
        assert!(service.next_request().is_none());
    }

    #[test]
    fn archive_postbacks_land_in_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let service = ArchiveReplayService::new(
            dir.path().join("payload.bin"),
            Some(dir.path().join("postback")),
        );
        service.send_replay_finished().unwrap();
        assert!(dir.path().join("postback/replay_finished").exists());
    }
}
