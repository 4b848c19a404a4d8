use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pjb_core::config::{ContextServerConfig, TransportKind};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::{Context, ContextRegistry};
use crate::channel::{FcgiStream, LOCAL_HOST};
use crate::error::ContextError;

/// Tells the PHP peer where the direct channel listens.
pub const REDIRECT_HEADER: &str = "X_JAVABRIDGE_REDIRECT";
/// Tells the PHP peer which context to claim on that channel.
pub const CONTEXT_HEADER: &str = "X_JAVABRIDGE_CONTEXT";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A peer connection whose context has been claimed.
#[derive(Debug)]
pub struct ContextChannel {
    name: String,
    short_path: bool,
    stream: FcgiStream,
}

impl ContextChannel {
    /// Name of the server the peer connected to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The peer asked for the abbreviated protocol.
    pub fn short_path(&self) -> bool {
        self.short_path
    }

    pub fn stream_mut(&mut self) -> &mut FcgiStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> FcgiStream {
        self.stream
    }
}

/// Serves a claimed context over its channel until the peer is done.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, channel: ContextChannel, context: Arc<Context>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Socket,
    Pipe,
}

/// The redirect hint handed to the PHP peer for one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelName {
    kind: ChannelKind,
    name: String,
    context_id: String,
}

impl ChannelName {
    /// `host:port` (or the bare port when listening on every interface)
    /// for sockets, the socket path for pipes.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Headers the PHP side reads to open the direct channel.
    pub fn redirect_headers(&self) -> [(&'static str, String); 2] {
        [
            (REDIRECT_HEADER, self.name.clone()),
            (CONTEXT_HEADER, self.context_id.clone()),
        ]
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ChannelKind::Socket => write!(f, "Socket:{}", self.name),
            ChannelKind::Pipe => write!(f, "Pipe:{}", self.name),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Where the accept loop takes its peers from.
#[async_trait]
trait PeerSource: Send + Sync {
    async fn accept(&self) -> io::Result<(FcgiStream, String)>;
}

#[async_trait]
impl PeerSource for Listener {
    async fn accept(&self) -> io::Result<(FcgiStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((FcgiStream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((FcgiStream::Unix(stream), "unix".to_string()))
            }
        }
    }
}

/// The one shared listener behind a [`ContextServer`].
struct SocketContextServer {
    kind: ChannelKind,
    name: String,
    socket_path: Option<PathBuf>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SocketContextServer {
    async fn bind(
        config: &ContextServerConfig,
        registry: ContextRegistry,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Self> {
        let (kind, listener, name, socket_path) = match config.transport {
            TransportKind::Auto | TransportKind::Socket => {
                let host = if config.promiscuous { "0.0.0.0" } else { LOCAL_HOST };
                let listener = TcpListener::bind((host, 0)).await?;
                let addr: SocketAddr = listener.local_addr()?;
                let name = if config.promiscuous {
                    addr.port().to_string()
                } else {
                    format!("{}:{}", LOCAL_HOST, addr.port())
                };
                (ChannelKind::Socket, Listener::Tcp(listener), name, None)
            }
            TransportKind::Pipe => bind_pipe()?,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            name.clone(),
            config.max_workers.max(1),
            registry,
            handler,
            shutdown_rx,
        ));
        info!(channel = %name, workers = config.max_workers, "context server listening");
        Ok(Self {
            kind,
            name,
            socket_path,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            debug!(error = %e, "context server task ended abnormally");
        }
        if let Some(path) = self.socket_path.as_ref() {
            let _ = std::fs::remove_file(path);
        }
        info!(channel = %self.name, "context server stopped");
    }
}

#[cfg(unix)]
fn bind_pipe() -> Result<(ChannelKind, Listener, String, Option<PathBuf>)> {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::temp_dir().join(format!(
        "JavaBridgeContext{:016x}.socket",
        rand::random::<u64>()
    ));
    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    let name = path.display().to_string();
    Ok((ChannelKind::Pipe, Listener::Unix(listener), name, Some(path)))
}

#[cfg(not(unix))]
fn bind_pipe() -> Result<(ChannelKind, Listener, String, Option<PathBuf>)> {
    Err(anyhow!("pipe channels are not supported on this platform"))
}

async fn accept_loop<L: PeerSource>(
    listener: L,
    name: String,
    max_workers: usize,
    registry: ContextRegistry,
    handler: Arc<dyn ChannelHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(max_workers));
    let mut runners = JoinSet::new();
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(_) = runners.join_next(), if !runners.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "context server accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let permits = Arc::clone(&permits);
                let registry = registry.clone();
                let handler = Arc::clone(&handler);
                let name = name.clone();
                runners.spawn(async move {
                    // Peers beyond max_workers queue here until a runner frees up.
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    if let Err(e) = serve_peer(stream, name, registry, handler).await {
                        warn!(peer = %peer, error = %e, "context channel error");
                    }
                });
            }
        }
    }
    runners.shutdown().await;
}

/// Reads the hand-shake, claims the named context and hands the channel over.
async fn serve_peer(
    mut stream: FcgiStream,
    name: String,
    registry: ContextRegistry,
    handler: Arc<dyn ChannelHandler>,
) -> Result<()> {
    let (short_path, id) = timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream))
        .await
        .map_err(|_| anyhow!("context hand-shake timed out"))??;
    let context = registry.claim(&id)?;
    debug!(context = %id, short_path, "context channel accepted");
    handler
        .handle(
            ContextChannel {
                name,
                short_path,
                stream,
            },
            context,
        )
        .await
}

/// `[ignored][short path][ack 0 from us][u16 LE length][id]`.
async fn read_handshake(stream: &mut FcgiStream) -> Result<(bool, String)> {
    let _ = stream.read_u8().await?;
    let short_path = stream.read_u8().await? != 0;
    stream.write_all(&[0]).await?;
    stream.flush().await?;
    let len = stream.read_u16_le().await? as usize;
    let mut id = vec![0u8; len];
    stream.read_exact(&mut id).await?;
    let id = String::from_utf8(id).map_err(|_| anyhow!("context id is not valid UTF-8"))?;
    Ok((short_path, id))
}

#[derive(Default)]
struct Backend {
    attempted: bool,
    server: Option<SocketContextServer>,
}

/// Hands out direct-channel redirects and runs the shared listener that
/// serves them. The listener is started on first use, at most once until
/// [`ContextServer::destroy`].
pub struct ContextServer {
    config: ContextServerConfig,
    registry: ContextRegistry,
    handler: Arc<dyn ChannelHandler>,
    backend: Mutex<Backend>,
}

impl fmt::Debug for ContextServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextServer")
            .field("name", &self.config.name)
            .field("transport", &self.config.transport)
            .field("promiscuous", &self.config.promiscuous)
            .finish_non_exhaustive()
    }
}

impl ContextServer {
    pub fn new(
        config: ContextServerConfig,
        registry: ContextRegistry,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        Self {
            config,
            registry,
            handler,
            backend: Mutex::new(Backend::default()),
        }
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn is_promiscuous(&self) -> bool {
        self.config.promiscuous
    }

    /// Starts the listener if needed; a failed start is not retried.
    async fn backend(&self) -> tokio::sync::MutexGuard<'_, Backend> {
        let mut backend = self.backend.lock().await;
        if self.config.enabled && !backend.attempted {
            backend.attempted = true;
            match SocketContextServer::bind(
                &self.config,
                self.registry.clone(),
                Arc::clone(&self.handler),
            )
            .await
            {
                Ok(server) => backend.server = Some(server),
                Err(e) => warn!(error = %e, "local communication channel not available"),
            }
        }
        backend
    }

    pub async fn is_available(&self) -> bool {
        self.backend().await.server.is_some()
    }

    /// The redirect for `context`, or `None` when no listener is running.
    pub async fn channel_name(&self, context: &Context) -> Option<ChannelName> {
        let backend = self.backend().await;
        backend.server.as_ref().map(|server| ChannelName {
            kind: server.kind,
            name: server.name.clone(),
            context_id: context.id().to_string(),
        })
    }

    /// Checks that `channel` still names the running listener.
    pub async fn start(&self, channel: &ChannelName) -> Result<(), ContextError> {
        let backend = self.backend().await;
        match backend.server.as_ref() {
            Some(server) if server.name == channel.name => Ok(()),
            Some(_) => Err(ContextError::ServerUnavailable {
                reason: format!("{channel} is not served here"),
            }),
            None => Err(ContextError::ServerUnavailable {
                reason: "context server not available".into(),
            }),
        }
    }

    /// Stops the listener and destroys every context.
    pub async fn destroy(&self) {
        let server = {
            let mut backend = self.backend.lock().await;
            backend.attempted = false;
            backend.server.take()
        };
        if let Some(server) = server {
            server.stop().await;
        }
        self.registry.destroy_all();
    }
}
