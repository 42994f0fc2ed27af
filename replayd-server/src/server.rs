//! The replay server.
//!
//! Accepts connections on a loopback TCP port, authenticates each one
//! against the pre-shared token, and runs one [`Session`] per connection
//! on its own thread. The memory arena, crash handler, resource cache,
//! and prewarm record are shared by every session; the device lock keeps
//! their critical sections mutually exclusive.

use crate::prewarm::SharedReplayState;
use crate::protocol::{self, Frame};
use crate::service::SocketReplayService;
use crate::session::Session;
use replayd_core::auth::AuthToken;
use replayd_core::cache::ResourceCache;
use replayd_core::context::ContextFactory;
use replayd_core::crash::CrashHandler;
use replayd_core::error::{ReplayError, Result};
use replayd_core::loader::{CachedLoader, PassThroughLoader, ResourceLoader, ResourceProvider};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// How long an accepted connection gets to present its auth frame.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Default)]
pub struct ServerConfig {
    /// Port to listen on; 0 asks the OS for a free port.
    pub port: u16,
    /// Idle timeout between requests; `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Pre-shared credential; `None` accepts any client.
    pub auth_token: Option<AuthToken>,
}

struct ServerShared {
    factory: Arc<dyn ContextFactory>,
    cache: Option<Arc<dyn ResourceCache>>,
    crash: CrashHandler,
    state: Arc<SharedReplayState>,
    auth_token: Option<AuthToken>,
    idle_timeout: Option<Duration>,
    next_connection: AtomicU64,
}

/// A bound, not-yet-serving replay server.
pub struct Server {
    listener: TcpListener,
    port: u16,
    shared: Arc<ServerShared>,
}

impl Server {
    /// Bind the listen socket. No connection is accepted until
    /// [`Server::run`].
    pub fn bind(
        config: ServerConfig,
        factory: Arc<dyn ContextFactory>,
        cache: Option<Arc<dyn ResourceCache>>,
        crash: CrashHandler,
    ) -> Result<Self> {
        let addr = ("127.0.0.1", config.port);
        let listener = TcpListener::bind(addr).map_err(|e| ReplayError::Bind {
            addr: format!("127.0.0.1:{}", config.port),
            cause: e.to_string(),
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| ReplayError::Bind {
                addr: format!("127.0.0.1:{}", config.port),
                cause: e.to_string(),
            })?
            .port();
        info!(port, "replay server bound");
        Ok(Self {
            listener,
            port,
            shared: Arc::new(ServerShared {
                factory,
                cache,
                crash,
                state: SharedReplayState::new(),
                auth_token: config.auth_token,
                idle_timeout: config.idle_timeout,
                next_connection: AtomicU64::new(0),
            }),
        })
    }

    /// The bound port.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Print the port announcement. Launch tooling parses this exact
    /// text to discover the selected port; do not change it.
    pub fn announce(&self) {
        println!("Bound on port '{}'", self.port);
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }

    /// Accept and serve connections until the listener fails.
    pub fn run(self) -> Result<()> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let shared = Arc::clone(&self.shared);
            let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
            let spawned = std::thread::Builder::new()
                .name(format!("replay-conn-{id}"))
                .spawn(move || serve_connection(stream, shared, id));
            if let Err(e) = spawned {
                error!(error = %e, "failed to spawn connection thread");
            }
        }
        Ok(())
    }
}

fn serve_connection(stream: TcpStream, shared: Arc<ServerShared>, id: u64) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    info!(connection = id, peer = %peer, "connection accepted");

    let stream = match authenticate(stream, shared.auth_token.as_ref()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(connection = id, peer = %peer, error = %e, "authentication failed");
            return;
        }
    };

    let service = match SocketReplayService::start(stream, shared.idle_timeout) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!(connection = id, error = %e, "failed to start replay service");
            return;
        }
    };

    let provider: Arc<dyn ResourceProvider> = Arc::clone(&service) as _;
    let loader: Box<dyn ResourceLoader> = match &shared.cache {
        Some(cache) => Box::new(CachedLoader::new(
            Arc::clone(cache),
            Some(Box::new(PassThroughLoader::new(provider))),
        )),
        None => Box::new(PassThroughLoader::new(provider)),
    };

    let context = match shared.factory.create_context(loader) {
        Ok(context) => context,
        Err(e) => {
            error!(connection = id, error = %e, "loading context failed");
            return;
        }
    };

    let session = Session::new(
        service,
        context,
        shared.cache.clone(),
        Arc::clone(&shared.state),
        shared.crash.clone(),
    );
    session.run();
    info!(connection = id, "connection closed");
}

/// Read the client's opening auth frame and verify it against the
/// configured token. A tokenless deployment still expects the frame but
/// accepts any credential.
fn authenticate(stream: TcpStream, token: Option<&AuthToken>) -> Result<TcpStream> {
    stream
        .set_read_timeout(Some(AUTH_TIMEOUT))
        .map_err(|e| ReplayError::TransportIo {
            cause: e.to_string(),
        })?;
    let mut reader = stream.try_clone().map_err(|e| ReplayError::TransportIo {
        cause: e.to_string(),
    })?;
    let frame = protocol::read_frame(&mut reader)?;
    let presented = match frame {
        Some(Frame::Auth { token }) => token,
        Some(_) | None => return Err(ReplayError::AuthRejected),
    };
    if let Some(expected) = token {
        if !expected.matches(&presented) {
            return Err(ReplayError::AuthRejected);
        }
    }
    stream
        .set_read_timeout(None)
        .map_err(|e| ReplayError::TransportIo {
            cause: e.to_string(),
        })?;
    Ok(stream)
}
