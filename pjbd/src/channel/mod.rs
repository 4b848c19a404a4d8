//! Physical channels to the PHP FastCGI worker and the worker's lifecycle.

pub mod process;

use pjb_core::config::{FastCgiConfig, TransportKind};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::ConnectError;
pub use process::{CommandLauncher, LaunchSpec, ProcessLauncher, WorkerProcess};

pub const LOCAL_HOST: &str = "127.0.0.1";
const PORT_SCAN_WINDOW: u16 = 100;
const PIPE_PREFIX: &str = "JavaBridge";
const PIPE_SUFFIX: &str = ".socket";

/// A connected channel to the worker.
#[derive(Debug)]
pub enum FcgiStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for FcgiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FcgiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Where the worker listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Socket { host: String, port: u16 },
    #[cfg(unix)]
    Pipe { path: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket { host, port } => write!(f, "{}:{}", host, port),
            #[cfg(unix)]
            Self::Pipe { path } => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
enum Transport {
    Socket {
        host: String,
        default_port: u16,
        promiscuous: bool,
    },
    #[cfg(unix)]
    Pipe { default_path: PathBuf },
}

impl Transport {
    fn from_config(config: &FastCgiConfig) -> Self {
        match config.transport {
            #[cfg(unix)]
            TransportKind::Pipe => Transport::Pipe {
                default_path: config
                    .pipe_path
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join(format!("{PIPE_PREFIX}{PIPE_SUFFIX}"))),
            },
            _ => Transport::Socket {
                host: config.host.clone(),
                default_port: config.port,
                promiscuous: config.promiscuous,
            },
        }
    }

    fn default_endpoint(&self) -> Endpoint {
        match self {
            Transport::Socket {
                host, default_port, ..
            } => Endpoint::Socket {
                host: host.clone(),
                port: *default_port,
            },
            #[cfg(unix)]
            Transport::Pipe { default_path } => Endpoint::Pipe {
                path: default_path.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DaemonWait {
    attempts: u32,
    interval: Duration,
    ceiling: Duration,
}

#[derive(Default)]
struct ServerState {
    started: bool,
    available: bool,
    worker: Option<Box<dyn WorkerProcess>>,
}

/// Connects to the worker and, when a php binary is configured, starts and
/// stops it.
pub struct ChannelFactory {
    transport: Transport,
    endpoint: Mutex<Endpoint>,
    reservation: Mutex<Option<StdTcpListener>>,
    php: Option<PathBuf>,
    select_port: bool,
    children: usize,
    max_requests: usize,
    include_java: bool,
    env: BTreeMap<String, String>,
    daemon_wait: DaemonWait,
    connect_timeout: Duration,
    shutdown_timeout: Duration,
    launcher: Arc<dyn ProcessLauncher>,
    server: tokio::sync::Mutex<ServerState>,
    last_start_error: Mutex<Option<String>>,
}

impl ChannelFactory {
    pub fn from_config(config: &FastCgiConfig) -> Self {
        Self::with_launcher(config, Arc::new(CommandLauncher))
    }

    pub fn with_launcher(config: &FastCgiConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let transport = Transport::from_config(config);
        let endpoint = transport.default_endpoint();
        Self {
            transport,
            endpoint: Mutex::new(endpoint),
            reservation: Mutex::new(None),
            php: config.php.clone(),
            select_port: config.select_port,
            children: config.children,
            max_requests: config.max_requests,
            include_java: config.include_java,
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            daemon_wait: DaemonWait {
                attempts: config.daemon_wait.attempts,
                interval: Duration::from_millis(config.daemon_wait.interval_ms),
                ceiling: Duration::from_millis(config.daemon_wait.ceiling_ms),
            },
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            launcher,
            server: tokio::sync::Mutex::new(ServerState::default()),
            last_start_error: Mutex::new(None),
        }
    }

    /// True when the bridge owns the worker process.
    pub fn can_start(&self) -> bool {
        self.php.is_some()
    }

    /// Picks the endpoint used from now on: a freshly probed one when the
    /// bridge starts the worker itself, the configured default otherwise.
    pub fn initialize(&self) {
        self.find_free_port(self.can_start() && self.select_port);
        debug!(endpoint = %self.endpoint(), "FastCGI channel initialized");
    }

    /// With `select`, probes the ports after the default one (or a fresh
    /// socket path) and reserves the first usable one until the worker binds
    /// it. Without `select`, falls back to the default endpoint.
    pub fn find_free_port(&self, select: bool) {
        let mut reservation = None;
        let endpoint = match &self.transport {
            Transport::Socket {
                host, default_port, ..
            } => {
                let mut port = *default_port;
                if select {
                    let first = default_port.saturating_add(1);
                    let last = default_port.saturating_add(PORT_SCAN_WINDOW);
                    for candidate in first..last {
                        if let Ok(listener) = StdTcpListener::bind((LOCAL_HOST, candidate)) {
                            port = candidate;
                            reservation = Some(listener);
                            break;
                        }
                    }
                }
                Endpoint::Socket {
                    host: host.clone(),
                    port,
                }
            }
            #[cfg(unix)]
            Transport::Pipe { default_path } => {
                let path = if select {
                    std::env::temp_dir().join(format!(
                        "{PIPE_PREFIX}{:016x}{PIPE_SUFFIX}",
                        rand::random::<u64>()
                    ))
                } else {
                    default_path.clone()
                };
                Endpoint::Pipe { path }
            }
        };
        *self.reservation.lock().expect("reservation mutex") = reservation;
        *self.endpoint.lock().expect("endpoint mutex") = endpoint;
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.lock().expect("endpoint mutex").clone()
    }

    /// Channel name handed to PHP peers.
    pub fn channel_name(&self) -> String {
        self.endpoint().to_string()
    }

    pub async fn connect(&self) -> Result<FcgiStream, ConnectError> {
        let endpoint = self.endpoint();
        self.connect_to(&endpoint)
            .await
            .map_err(|source| ConnectError::Unreachable {
                endpoint: endpoint.to_string(),
                source,
                start_error: None,
            })
    }

    /// Probes the backend; the error carries the last worker start failure.
    pub async fn test(&self) -> Result<(), ConnectError> {
        let endpoint = self.endpoint();
        match self.connect_to(&endpoint).await {
            Ok(_) => Ok(()),
            Err(source) => Err(ConnectError::Unreachable {
                endpoint: endpoint.to_string(),
                source,
                start_error: self
                    .last_start_error
                    .lock()
                    .expect("start error mutex")
                    .clone(),
            }),
        }
    }

    async fn connect_to(&self, endpoint: &Endpoint) -> io::Result<FcgiStream> {
        let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
        match endpoint {
            Endpoint::Socket { host, port } => {
                let stream = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| timed_out())??;
                let _ = stream.set_nodelay(true);
                Ok(FcgiStream::Tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Pipe { path } => {
                let stream = timeout(self.connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| timed_out())??;
                Ok(FcgiStream::Unix(stream))
            }
        }
    }

    /// Starts the worker at most once. Later calls return the outcome of the
    /// first attempt, failed or not, until [`ChannelFactory::destroy`].
    pub async fn start_server(&self) -> bool {
        let mut server = self.server.lock().await;
        if server.started {
            return server.available;
        }
        server.started = true;

        server.available = if self.can_start() {
            match self.bind().await {
                Ok(worker) => {
                    server.worker = Some(worker);
                    self.wait_for_daemon().await;
                    true
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "could not start FastCGI server");
                    *self.last_start_error.lock().expect("start error mutex") =
                        Some(format!("{e:#}"));
                    false
                }
            }
        } else {
            match self.test().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        error = %e,
                        "FastCGI server not reachable; start it with:\n{}",
                        self.start_command_hint()
                    );
                    false
                }
            }
        };
        server.available
    }

    async fn bind(&self) -> anyhow::Result<Box<dyn WorkerProcess>> {
        let php = self
            .php
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no php binary configured"))?;
        // Hand the reserved port over to the worker.
        drop(self.reservation.lock().expect("reservation mutex").take());
        let spec = self.launch_spec(php);
        remove_socket_file(&self.endpoint());
        self.launcher.launch(spec).await
    }

    /// Command line and environment used to start the worker.
    pub fn launch_spec(&self, php: &Path) -> LaunchSpec {
        let bind = match (&self.transport, self.endpoint()) {
            (Transport::Socket { promiscuous, .. }, Endpoint::Socket { port, .. }) => {
                if *promiscuous {
                    port.to_string()
                } else {
                    format!("{LOCAL_HOST}:{port}")
                }
            }
            (_, endpoint) => endpoint.to_string(),
        };
        let mut args = Vec::with_capacity(3);
        if self.include_java {
            args.push("-C".to_string());
        }
        args.push("-b".to_string());
        args.push(bind);

        LaunchSpec {
            program: php.to_path_buf(),
            args,
            env: self.worker_env().into_iter().collect(),
            current_dir: php
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf),
        }
    }

    fn worker_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("REDIRECT_STATUS".into(), "200".into());
        // Keeps php from trying to start a VM of its own; the real value
        // arrives with each request.
        env.insert("X_JAVABRIDGE_OVERRIDE_HOSTS".into(), "/".into());
        env.insert("PHP_FCGI_CHILDREN".into(), self.children.to_string());
        env.insert("PHP_FCGI_MAX_REQUESTS".into(), self.max_requests.to_string());
        env
    }

    /// Polls the endpoint until the worker answers, giving up after the
    /// configured number of attempts or the wall-clock ceiling.
    pub async fn wait_for_daemon(&self) -> bool {
        let endpoint = self.endpoint();
        let started = Instant::now();
        let wait = self.daemon_wait;
        debug!(endpoint = %endpoint, "waiting for PHP FastCGI daemon");
        for attempt in 1..=wait.attempts {
            if self.connect_to(&endpoint).await.is_ok() {
                debug!(endpoint = %endpoint, attempt, "PHP FastCGI daemon is ready");
                return true;
            }
            if started.elapsed() >= wait.ceiling || attempt == wait.attempts {
                break;
            }
            sleep(wait.interval).await;
        }
        error!(
            endpoint = %endpoint,
            attempts = wait.attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "timeout waiting for PHP FastCGI daemon"
        );
        false
    }

    /// Shell snippet that starts a matching worker by hand.
    pub fn start_command_hint(&self) -> String {
        let php = self
            .php
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/usr/bin/php-cgi".to_string());
        let bind = match self.endpoint() {
            Endpoint::Socket { port, .. } => format!("{LOCAL_HOST}:{port}"),
            #[cfg(unix)]
            Endpoint::Pipe { path } => path.display().to_string(),
        };
        format!(
            "REDIRECT_STATUS=200 X_JAVABRIDGE_OVERRIDE_HOSTS=\"/\" PHP_FCGI_CHILDREN=\"{}\" PHP_FCGI_MAX_REQUESTS=\"{}\" {} -b {}",
            self.children, self.max_requests, php, bind
        )
    }

    /// Stops the worker if one was started. Safe to call repeatedly.
    pub async fn destroy(&self) {
        let mut server = self.server.lock().await;
        server.started = false;
        server.available = false;
        if let Some(mut worker) = server.worker.take() {
            let pid = worker.id();
            if let Err(e) = worker.shutdown(self.shutdown_timeout).await {
                warn!(pid, error = %e, "FastCGI worker shutdown failed");
            } else {
                info!(pid, "FastCGI worker stopped");
            }
            remove_socket_file(&self.endpoint());
        }
        drop(self.reservation.lock().expect("reservation mutex").take());
    }
}

fn remove_socket_file(endpoint: &Endpoint) {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Pipe { path } => {
            let _ = std::fs::remove_file(path);
        }
        _ => {}
    }
}

impl fmt::Debug for ChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFactory")
            .field("endpoint", &self.endpoint())
            .field("php", &self.php)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLauncher {
        launched: AtomicUsize,
        stopped: Arc<AtomicUsize>,
        specs: Mutex<Vec<LaunchSpec>>,
    }

    struct FakeWorker {
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerProcess for FakeWorker {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn shutdown(&mut self, _grace: Duration) -> anyhow::Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ProcessLauncher for CountingLauncher {
        async fn launch(&self, spec: LaunchSpec) -> anyhow::Result<Box<dyn WorkerProcess>> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().unwrap().push(spec);
            Ok(Box::new(FakeWorker {
                stopped: self.stopped.clone(),
            }))
        }
    }

    struct FailingLauncher;

    #[async_trait]
    impl ProcessLauncher for FailingLauncher {
        async fn launch(&self, _spec: LaunchSpec) -> anyhow::Result<Box<dyn WorkerProcess>> {
            Err(anyhow::anyhow!("php-cgi: not found"))
        }
    }

    fn unused_port() -> u16 {
        StdTcpListener::bind((LOCAL_HOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn quick_config(port: u16) -> FastCgiConfig {
        let mut config = FastCgiConfig {
            port,
            select_port: false,
            connect_timeout_ms: 200,
            ..FastCgiConfig::default()
        };
        config.daemon_wait.attempts = 2;
        config.daemon_wait.interval_ms = 10;
        config.daemon_wait.ceiling_ms = 100;
        config
    }

    #[test]
    fn find_free_port_reserves_a_port_after_the_default() {
        let config = FastCgiConfig {
            port: 39667,
            ..FastCgiConfig::default()
        };
        let factory = ChannelFactory::from_config(&config);
        factory.find_free_port(true);
        let Endpoint::Socket { port, .. } = factory.endpoint() else {
            panic!("expected socket endpoint");
        };
        assert!(port > 39667 && port < 39667 + PORT_SCAN_WINDOW);
        assert!(StdTcpListener::bind((LOCAL_HOST, port)).is_err());

        factory.find_free_port(false);
        assert_eq!(factory.channel_name(), "127.0.0.1:39667");
    }

    #[test]
    fn launch_spec_carries_worker_environment() {
        let mut config = FastCgiConfig {
            port: 9667,
            php: Some(PathBuf::from("/opt/php/bin/php-cgi")),
            children: 3,
            max_requests: 42,
            include_java: true,
            ..FastCgiConfig::default()
        };
        config.env.insert("APP_ENV".into(), "test".into());
        config.env.insert("REDIRECT_STATUS".into(), "404".into());
        let factory = ChannelFactory::from_config(&config);

        let spec = factory.launch_spec(Path::new("/opt/php/bin/php-cgi"));
        assert_eq!(spec.args, vec!["-C", "-b", "127.0.0.1:9667"]);
        assert_eq!(spec.current_dir.as_deref(), Some(Path::new("/opt/php/bin")));
        let env: BTreeMap<_, _> = spec.env.into_iter().collect();
        assert_eq!(env["APP_ENV"], "test");
        assert_eq!(env["REDIRECT_STATUS"], "200");
        assert_eq!(env["X_JAVABRIDGE_OVERRIDE_HOSTS"], "/");
        assert_eq!(env["PHP_FCGI_CHILDREN"], "3");
        assert_eq!(env["PHP_FCGI_MAX_REQUESTS"], "42");
    }

    #[test]
    fn promiscuous_worker_binds_all_interfaces() {
        let config = FastCgiConfig {
            port: 9667,
            promiscuous: true,
            ..FastCgiConfig::default()
        };
        let factory = ChannelFactory::from_config(&config);
        let spec = factory.launch_spec(Path::new("php-cgi"));
        assert_eq!(spec.args, vec!["-b", "9667"]);
        assert_eq!(spec.current_dir, None);
    }

    #[tokio::test]
    async fn start_server_runs_once_until_destroyed() {
        let launcher = Arc::new(CountingLauncher::default());
        let config = FastCgiConfig {
            php: Some(PathBuf::from("/usr/bin/php-cgi")),
            ..quick_config(unused_port())
        };
        let factory = ChannelFactory::with_launcher(&config, launcher.clone());

        assert!(factory.start_server().await);
        assert!(factory.start_server().await);
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);

        factory.destroy().await;
        factory.destroy().await;
        assert_eq!(launcher.stopped.load(Ordering::SeqCst), 1);

        assert!(factory.start_server().await);
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_start_is_cached_and_reported_by_test() {
        let config = FastCgiConfig {
            php: Some(PathBuf::from("/nonexistent/php-cgi")),
            ..quick_config(unused_port())
        };
        let factory = ChannelFactory::with_launcher(&config, Arc::new(FailingLauncher));

        assert!(!factory.start_server().await);
        assert!(!factory.start_server().await);

        let err = factory.test().await.unwrap_err();
        assert!(err.to_string().contains("php-cgi: not found"), "{err}");
    }

    #[tokio::test]
    async fn start_server_without_php_probes_existing_backend() {
        let listener = tokio::net::TcpListener::bind((LOCAL_HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let factory = ChannelFactory::from_config(&quick_config(port));
        factory.initialize();
        assert_eq!(factory.endpoint(), Endpoint::Socket { host: LOCAL_HOST.into(), port });
        assert!(factory.start_server().await);
        assert!(factory.test().await.is_ok());
        assert!(factory.connect().await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_backend_fails_connect_and_daemon_wait() {
        let factory = ChannelFactory::from_config(&quick_config(unused_port()));
        assert!(matches!(
            factory.connect().await,
            Err(ConnectError::Unreachable { .. })
        ));
        assert!(!factory.wait_for_daemon().await);
        assert!(!factory.start_server().await);
    }

    #[test]
    fn start_command_hint_names_the_endpoint() {
        let factory = ChannelFactory::from_config(&quick_config(9667));
        let hint = factory.start_command_hint();
        assert!(hint.contains("PHP_FCGI_MAX_REQUESTS=\"5000\""), "{hint}");
        assert!(hint.ends_with("/usr/bin/php-cgi -b 127.0.0.1:9667"), "{hint}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_transport_uses_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fcgi.socket");
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        let config = FastCgiConfig {
            transport: TransportKind::Pipe,
            pipe_path: Some(path.clone()),
            ..quick_config(9667)
        };
        let factory = ChannelFactory::from_config(&config);
        factory.initialize();
        assert_eq!(factory.channel_name(), path.display().to_string());
        assert!(matches!(factory.connect().await, Ok(FcgiStream::Unix(_))));

        factory.find_free_port(true);
        let name = factory.channel_name();
        assert!(name.contains("JavaBridge") && name.ends_with(".socket"), "{name}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn destroy_stops_a_real_worker_once() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let php = dir.path().join("php-cgi");
        std::fs::write(&php, "#!/bin/sh\necho \"bound to $2\" >&2\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&php, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = FastCgiConfig {
            php: Some(php),
            shutdown_timeout_ms: 200,
            ..quick_config(unused_port())
        };
        let factory = ChannelFactory::from_config(&config);
        assert!(factory.start_server().await);
        let pid = factory
            .server
            .lock()
            .await
            .worker
            .as_ref()
            .and_then(|w| w.id())
            .unwrap();
        let running = |pid: u32| {
            std::process::Command::new("kill")
                .args(["-0", &pid.to_string()])
                .stderr(std::process::Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        };
        assert!(running(pid));

        factory.destroy().await;
        assert!(!running(pid));
        assert!(factory.server.lock().await.worker.is_none());
        factory.destroy().await;
    }
}
