use anyhow::{anyhow, Result};

use super::types::*;

pub(super) fn validate_config(config: &Config) -> Result<()> {
    if config.version != 1 {
        return Err(anyhow!(
            "unsupported config.version {} (expected 1)",
            config.version
        ));
    }
    validate_system_log_config(&config.system_log)?;
    validate_runtime_config(&config.runtime)?;
    validate_fastcgi_config(&config.fastcgi)?;
    validate_context_config(&config.context)?;
    validate_context_server_config(&config.context_server)?;
    Ok(())
}

fn validate_system_log_config(log: &SystemLogConfig) -> Result<()> {
    if log.level.trim().is_empty() {
        return Err(anyhow!("system_log.level must not be empty"));
    }
    match log.format.to_ascii_lowercase().as_str() {
        "text" | "compact" | "json" => {}
        other => {
            return Err(anyhow!(
                "system_log.format must be one of text, compact, json (got {other})"
            ))
        }
    }
    match log.output.to_ascii_lowercase().as_str() {
        "stdout" | "stderr" => {}
        "file" => {
            if log.file.is_none() {
                return Err(anyhow!("system_log.file is required when output is file"));
            }
        }
        other => {
            return Err(anyhow!(
                "system_log.output must be one of stdout, stderr, file (got {other})"
            ))
        }
    }
    Ok(())
}

fn validate_runtime_config(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.worker_threads == Some(0) {
        return Err(anyhow!("runtime.worker_threads must be >= 1"));
    }
    Ok(())
}

fn validate_fastcgi_config(fastcgi: &FastCgiConfig) -> Result<()> {
    if fastcgi.children == 0 {
        return Err(anyhow!("fastcgi.children must be >= 1"));
    }
    if fastcgi.host.trim().is_empty() {
        return Err(anyhow!("fastcgi.host must not be empty"));
    }
    if fastcgi.port == 0 {
        return Err(anyhow!("fastcgi.port must not be 0"));
    }
    if fastcgi.connect_timeout_ms == 0 {
        return Err(anyhow!("fastcgi.connect_timeout_ms must be >= 1"));
    }
    if fastcgi.transport == TransportKind::Pipe && !cfg!(unix) {
        return Err(anyhow!(
            "fastcgi.transport: pipe is only supported on unix platforms"
        ));
    }
    if let Some(php) = fastcgi.php.as_ref() {
        if php.as_os_str().is_empty() {
            return Err(anyhow!("fastcgi.php must not be empty when set"));
        }
    }
    if let Some(path) = fastcgi.pipe_path.as_ref() {
        if path.as_os_str().is_empty() {
            return Err(anyhow!("fastcgi.pipe_path must not be empty when set"));
        }
    }
    for key in fastcgi.env.keys() {
        if key.is_empty() || key.contains('=') {
            return Err(anyhow!("fastcgi.env has invalid variable name {key:?}"));
        }
    }
    let wait = &fastcgi.daemon_wait;
    if wait.attempts == 0 {
        return Err(anyhow!("fastcgi.daemon_wait.attempts must be >= 1"));
    }
    if wait.ceiling_ms < wait.interval_ms {
        return Err(anyhow!(
            "fastcgi.daemon_wait.ceiling_ms must be >= interval_ms"
        ));
    }
    Ok(())
}

fn validate_context_config(context: &ContextConfig) -> Result<()> {
    if context.orphan_timeout_ms == 0 {
        return Err(anyhow!("context.orphan_timeout_ms must be >= 1"));
    }
    if context.sweep_interval_ms == 0 {
        return Err(anyhow!("context.sweep_interval_ms must be >= 1"));
    }
    Ok(())
}

fn validate_context_server_config(server: &ContextServerConfig) -> Result<()> {
    if server.enabled && server.max_workers == 0 {
        return Err(anyhow!("context_server.max_workers must be >= 1"));
    }
    if server.transport == TransportKind::Pipe && !cfg!(unix) {
        return Err(anyhow!(
            "context_server.transport: pipe is only supported on unix platforms"
        ));
    }
    Ok(())
}
