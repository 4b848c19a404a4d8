pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> String {
    "text".to_string()
}

pub(super) fn default_log_output() -> String {
    "stderr".to_string()
}

pub(super) fn default_fastcgi_host() -> String {
    "127.0.0.1".to_string()
}

pub(super) fn default_fastcgi_port() -> u16 {
    9667
}

pub(super) fn default_children() -> usize {
    5
}

pub(super) fn default_max_requests() -> usize {
    5000
}

pub(super) fn default_connect_timeout_ms() -> u64 {
    5_000
}

pub(super) fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

pub(super) fn default_daemon_wait_attempts() -> u32 {
    15
}

pub(super) fn default_daemon_wait_interval_ms() -> u64 {
    1_000
}

pub(super) fn default_daemon_wait_ceiling_ms() -> u64 {
    16_000
}

pub(super) fn default_orphan_timeout_ms() -> u64 {
    15_000
}

pub(super) fn default_sweep_interval_ms() -> u64 {
    10_000
}

pub(super) fn default_context_server_workers() -> usize {
    20
}
