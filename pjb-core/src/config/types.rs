use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use super::defaults::*;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub system_log: SystemLogConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub fastcgi: FastCgiConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub context_server: ContextServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemLogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text`, `compact` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// `stdout`, `stderr` or `file`.
    #[serde(default = "default_log_output")]
    pub output: String,
    /// Required when `output: file`.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for SystemLogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

/// Channel used to talk to the PHP FastCGI worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Loopback socket.
    #[default]
    Auto,
    Socket,
    /// Unix domain socket.
    Pipe,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FastCgiConfig {
    #[serde(default)]
    pub transport: TransportKind,
    /// Let the worker bind all interfaces instead of loopback only.
    #[serde(default)]
    pub promiscuous: bool,
    /// php-cgi binary. Without it the bridge never spawns a worker and expects
    /// one to be listening already.
    #[serde(default)]
    pub php: Option<PathBuf>,
    #[serde(default = "default_fastcgi_host")]
    pub host: String,
    #[serde(default = "default_fastcgi_port")]
    pub port: u16,
    #[serde(default)]
    pub pipe_path: Option<PathBuf>,
    /// Probe for a free port/pipe name instead of using the default one.
    #[serde(default = "default_true")]
    pub select_port: bool,
    /// Pool limit, also exported to the worker as PHP_FCGI_CHILDREN.
    #[serde(default = "default_children")]
    pub children: usize,
    /// Requests served per physical connection, also PHP_FCGI_MAX_REQUESTS.
    /// 0 never recycles, which php-cgi reads as unlimited too.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    /// 0 waits forever.
    #[serde(default)]
    pub pool_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub include_java: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub daemon_wait: DaemonWaitConfig,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for FastCgiConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            promiscuous: false,
            php: None,
            host: default_fastcgi_host(),
            port: default_fastcgi_port(),
            pipe_path: None,
            select_port: true,
            children: default_children(),
            max_requests: default_max_requests(),
            pool_timeout_ms: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            include_java: false,
            env: HashMap::new(),
            daemon_wait: DaemonWaitConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonWaitConfig {
    #[serde(default = "default_daemon_wait_attempts")]
    pub attempts: u32,
    #[serde(default = "default_daemon_wait_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_daemon_wait_ceiling_ms")]
    pub ceiling_ms: u64,
}

impl Default for DaemonWaitConfig {
    fn default() -> Self {
        Self {
            attempts: default_daemon_wait_attempts(),
            interval_ms: default_daemon_wait_interval_ms(),
            ceiling_ms: default_daemon_wait_ceiling_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Age after which an unclaimed context is reclaimed.
    #[serde(default = "default_orphan_timeout_ms")]
    pub orphan_timeout_ms: u64,
    /// How often the reaper scans for orphans.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            orphan_timeout_ms: default_orphan_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `pipe` serves the hand-off channel on a Unix domain socket.
    #[serde(default)]
    pub transport: TransportKind,
    /// Web context name folded into every context id.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub promiscuous: bool,
    #[serde(default = "default_context_server_workers")]
    pub max_workers: usize,
}

impl Default for ContextServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportKind::default(),
            name: String::new(),
            promiscuous: false,
            max_workers: default_context_server_workers(),
        }
    }
}
