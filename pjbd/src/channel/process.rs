use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Command line and environment of a FastCGI worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

/// Starts worker processes. The default implementation runs them as child
/// processes; tests substitute their own.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerProcess>>;
}

#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Closes stdin, waits up to `grace` for the process to exit, then kills it.
    async fn shutdown(&mut self, grace: Duration) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerProcess>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            // Anything the worker prints on stdout would be taken for protocol data.
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = spec.current_dir.as_ref() {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|e| {
            anyhow!(
                "failed to spawn FastCGI worker {}: {}",
                spec.program.display(),
                e
            )
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("FastCGI worker stderr unavailable"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => info!(target: "php_stderr", pid, "{}", line),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(pid, error = %e, "FastCGI worker stderr closed");
                        break;
                    }
                }
            }
        });
        info!(
            pid,
            program = %spec.program.display(),
            args = ?spec.args,
            "FastCGI worker started"
        );

        Ok(Box::new(ChildWorker {
            child,
            stdin,
            stderr_task: Some(stderr_task),
        }))
    }
}

struct ChildWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        let pid = self.child.id();
        drop(self.stdin.take());
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid, %status, "FastCGI worker exited"),
            Ok(Err(e)) => warn!(pid, error = %e, "FastCGI worker wait failed"),
            Err(_) => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "FastCGI worker did not exit, killing");
                let _ = self.child.start_kill();
                let _ = timeout(Duration::from_secs(5), self.child.wait()).await;
            }
        }
        if let Some(task) = self.stderr_task.take() {
            // Let the drain task flush what the worker wrote before exiting.
            let _ = timeout(Duration::from_secs(1), task).await;
        }
        Ok(())
    }
}
