//! Wire protocol.
//!
//! Frames are length-prefixed JSON: a little-endian `u32` byte count
//! followed by the serialized frame. The instruction stream inside a
//! payload is opaque to this layer; only the session-level request kinds
//! are typed here.
//!
//! A client always opens with an [`Frame::Auth`] frame (empty token when
//! the deployment is tokenless); the server verifies it against its
//! configured token before serving any request.

use replayd_core::crash::CrashReport;
use replayd_core::error::{ReplayError, Result};
use replayd_core::types::{Resource, ResourceId, StateId};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Upper bound on a single frame, resources included.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A typed request from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Replay a captured state, optionally depending on a predecessor
    /// state being active first.
    Replay {
        /// The state to replay.
        replay_id: StateId,
        /// The state that must already be active, or empty.
        dependent_id: StateId,
    },
    /// Prime a standby context into a state for later reuse.
    Prewarm {
        /// The state to prime into.
        prerun_id: StateId,
        /// The id used to clean the primed state up when it is replaced.
        cleanup_id: StateId,
    },
    /// A request kind this daemon does not understand. Ignored by the
    /// session loop so old daemons tolerate newer clients.
    #[serde(other)]
    Unknown,
}

/// A resource blob on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResource {
    /// The resource identifier.
    pub id: ResourceId,
    /// The resource payload.
    pub data: Vec<u8>,
}

impl From<WireResource> for Resource {
    fn from(wire: WireResource) -> Self {
        Resource::new(wire.id, wire.data)
    }
}

/// One frame in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Client hello carrying the pre-shared credential.
    Auth {
        /// The presented token, possibly empty.
        token: Vec<u8>,
    },
    /// A session request.
    Request {
        /// The request.
        request: Request,
    },
    /// Client response to [`Frame::FetchResources`].
    Resources {
        /// The requested blobs, in request order.
        resources: Vec<WireResource>,
    },
    /// Server signal that a replay has finished (success or not).
    ReplayFinished,
    /// Server asks the client for uncached resources.
    FetchResources {
        /// The resources to fetch.
        ids: Vec<ResourceId>,
    },
    /// Server ships a captured crash back to the client.
    CrashReport {
        /// The captured report.
        report: CrashReport,
    },
}

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = serde_json::to_vec(frame).map_err(|e| ReplayError::FrameCodec {
        cause: e.to_string(),
    })?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ReplayError::FrameTooLarge {
            size: body.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    let len = (body.len() as u32).to_le_bytes();
    writer
        .write_all(&len)
        .and_then(|()| writer.write_all(&body))
        .and_then(|()| writer.flush())
        .map_err(|e| ReplayError::TransportIo {
            cause: e.to_string(),
        })
}

/// Read one frame. `Ok(None)` is a clean end of stream (the peer closed
/// between frames).
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(ReplayError::TransportIo {
                cause: e.to_string(),
            });
        }
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ReplayError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| ReplayError::TransportIo {
            cause: e.to_string(),
        })?;
    let frame = serde_json::from_slice(&body).map_err(|e| ReplayError::FrameCodec {
        cause: e.to_string(),
    })?;
    Ok(Some(frame))
}
