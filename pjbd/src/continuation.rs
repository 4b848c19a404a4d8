//! A PHP script suspended inside a host callback.
//!
//! The runner side executes the script. When the script calls back into the
//! host it publishes itself with [`Continuation::call`] and stays suspended
//! until the host side is done with it and calls [`Continuation::release`].

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ContinuationError;

#[derive(Debug, Clone)]
enum ScriptState<T> {
    Pending,
    Ready(T),
    Failed(String),
    Finished,
}

#[derive(Debug)]
pub struct Continuation<T> {
    script: watch::Sender<ScriptState<T>>,
    released: watch::Sender<bool>,
    finished: watch::Sender<bool>,
}

impl<T> Default for Continuation<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Continuation<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            script: watch::channel(ScriptState::Pending).0,
            released: watch::channel(false).0,
            finished: watch::channel(false).0,
        }
    }

    /// Runs the script to completion, recording a failure for the host side.
    pub async fn run<F>(&self, script: F)
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        if let Err(e) = script.await {
            debug!(error = %e, "script runner failed");
            self.script.send_replace(ScriptState::Failed(format!("{e:#}")));
        }
        self.script.send_if_modified(|state| {
            if matches!(state, ScriptState::Pending) {
                *state = ScriptState::Finished;
                true
            } else {
                false
            }
        });
        self.finished.send_replace(true);
    }

    /// [`Self::run`] on a new task.
    pub fn spawn<F>(self: &Arc<Self>, script: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(script).await })
    }

    /// Called from the script: hands `script` to the host and waits until the
    /// host releases it.
    pub async fn call(&self, script: T) {
        self.script.send_replace(ScriptState::Ready(script));
        let mut released = self.released.subscribe();
        let _ = released.wait_for(|r| *r).await;
    }

    /// Waits for the script to call back. Fails with the runner's error if it
    /// broke off first.
    pub async fn script(&self) -> Result<T, ContinuationError> {
        let mut rx = self.script.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, ScriptState::Pending))
            .await
            .map_err(|_| ContinuationError::Finished)?;
        match &*state {
            ScriptState::Ready(script) => Ok(script.clone()),
            ScriptState::Failed(msg) => Err(ContinuationError::Runner(msg.clone())),
            ScriptState::Pending | ScriptState::Finished => Err(ContinuationError::Finished),
        }
    }

    /// Lets the suspended script continue and waits for the runner to end.
    pub async fn release(&self) {
        self.released.send_replace(true);
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|f| *f).await;
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }
}
