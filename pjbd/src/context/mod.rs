//! Per-exchange contexts and their hand-off between the host and the
//! remote PHP peer.
//!
//! A context is minted before the peer is known to come back for it. It
//! sits in the ephemeral map until the peer claims it, which moves it to the
//! live map exactly once. Ephemeral contexts nobody claims are reaped after
//! a configurable threshold.

pub mod server;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, warn};

use crate::error::ContextError;

pub use server::{ChannelHandler, ChannelName, ContextChannel, ContextServer};

/// Form-encoding of the web context name; space becomes `+` afterwards.
const CONTEXT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'*')
    .remove(b'_')
    .remove(b' ');

/// The session state a context carries.
pub trait ContextVisitor: Send + Sync {
    /// Called when the state is attached to a context that takes over.
    fn initialize(&self) {}

    /// Called when the state leaves the context that minted it.
    fn release(&self) {}

    /// Called exactly once when the owning context is destroyed.
    fn invalidate(&self);

    /// True once the underlying bridge has nothing left to hand over.
    fn is_empty(&self) -> bool {
        false
    }
}

pub struct Context {
    id: String,
    web_context: String,
    created: Instant,
    visitor: Mutex<Arc<dyn ContextVisitor>>,
    claimed: AtomicBool,
}

impl Context {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn web_context(&self) -> &str {
        &self.web_context
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn visitor(&self) -> Arc<dyn ContextVisitor> {
        self.visitor.lock().expect("context visitor mutex").clone()
    }

    /// Replaces the session state with `visitor`.
    pub fn accept(&self, visitor: Arc<dyn ContextVisitor>) {
        *self.visitor.lock().expect("context visitor mutex") = visitor;
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("web_context", &self.web_context)
            .field("claimed", &self.is_claimed())
            .finish_non_exhaustive()
    }
}

/// Encodes the opaque id handed to the PHP peer: `<hex counter>@<name>`.
pub fn context_id(counter: u64, web_context: &str) -> String {
    let name = utf8_percent_encode(web_context, CONTEXT_NAME)
        .to_string()
        .replace(' ', "+");
    format!("{counter:x}@{name}")
}

#[derive(Default)]
struct RegistryState {
    counter: u64,
    ephemeral: HashMap<String, Arc<Context>>,
    live: HashMap<String, Arc<Context>>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    shutdown: watch::Sender<bool>,
}

/// Owns every context of one bridge instance.
#[derive(Clone)]
pub struct ContextRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().expect("context registry mutex");
        f.debug_struct("ContextRegistry")
            .field("ephemeral", &state.ephemeral.len())
            .field("live", &state.live.len())
            .finish()
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                shutdown,
            }),
        }
    }

    /// Mints a context. Managed contexts go live right away; the others
    /// wait in the ephemeral map for their peer.
    pub fn create(
        &self,
        web_context: &str,
        managed: bool,
        visitor: Arc<dyn ContextVisitor>,
    ) -> Arc<Context> {
        let mut state = self.inner.state.lock().expect("context registry mutex");
        state.counter += 1;
        let ctx = Arc::new(Context {
            id: context_id(state.counter, web_context),
            web_context: web_context.to_string(),
            created: Instant::now(),
            visitor: Mutex::new(visitor),
            claimed: AtomicBool::new(false),
        });
        let map = if managed {
            &mut state.live
        } else {
            &mut state.ephemeral
        };
        map.insert(ctx.id.clone(), ctx.clone());
        debug!(context = %ctx.id, managed, "context created");
        ctx
    }

    /// Hands the context to its one consumer. A second claim of the same id
    /// is refused.
    pub fn claim(&self, id: &str) -> Result<Arc<Context>, ContextError> {
        let ctx = {
            let mut state = self.inner.state.lock().expect("context registry mutex");
            match state.live.get(id).cloned() {
                Some(ctx) => ctx,
                None => {
                    let ctx = state
                        .ephemeral
                        .remove(id)
                        .ok_or_else(|| ContextError::Unknown { id: id.to_string() })?;
                    state.live.insert(ctx.id.clone(), ctx.clone());
                    ctx
                }
            }
        };
        if ctx.claimed.swap(true, Ordering::AcqRel) {
            warn!(context = %id, "context claimed twice");
            return Err(ContextError::AlreadyClaimed { id: id.to_string() });
        }
        debug!(context = %id, "context claimed");
        Ok(ctx)
    }

    /// Moves the session state of the freshly minted context `fresh_id` onto
    /// `persistent`. The fresh context goes back to the ephemeral map, where
    /// release or the reaper disposes of it. Unknown ids and self-switches
    /// are no-ops.
    pub fn switch_context(&self, fresh_id: &str, persistent: &Context) -> Result<(), ContextError> {
        let mut state = self.inner.state.lock().expect("context registry mutex");
        let (fresh, was_live) = match state.live.get(fresh_id).cloned() {
            Some(ctx) => (ctx, true),
            None => match state.ephemeral.get(fresh_id).cloned() {
                Some(ctx) => (ctx, false),
                None => return Ok(()),
            },
        };
        if fresh.id == persistent.id {
            return Ok(());
        }
        let visitor = fresh.visitor();
        if visitor.is_empty() {
            return Err(ContextError::EmptyContext {
                id: fresh_id.to_string(),
            });
        }
        if was_live {
            state.live.remove(fresh_id);
            state.ephemeral.insert(fresh.id.clone(), fresh.clone());
        }
        visitor.release();
        persistent.accept(visitor);
        persistent.visitor().initialize();
        debug!(fresh = %fresh_id, persistent = %persistent.id, "context switched");
        Ok(())
    }

    /// Drops a context that was never claimed. Live contexts are left alone.
    pub fn release(&self, id: &str) -> Option<Arc<Context>> {
        self.inner
            .state
            .lock()
            .expect("context registry mutex")
            .ephemeral
            .remove(id)
    }

    /// Removes the context from whichever map holds it and invalidates its
    /// state.
    pub fn destroy(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().expect("context registry mutex");
            state.live.remove(id).or_else(|| state.ephemeral.remove(id))
        };
        match removed {
            Some(ctx) => {
                ctx.visitor().invalidate();
                debug!(context = %id, "context destroyed");
                true
            }
            None => false,
        }
    }

    /// Invalidates and removes every ephemeral context older than
    /// `threshold`. Returns how many were reaped.
    pub fn reap_orphans(&self, threshold: Duration) -> usize {
        let orphans: Vec<Arc<Context>> = {
            let mut state = self.inner.state.lock().expect("context registry mutex");
            let expired: Vec<String> = state
                .ephemeral
                .values()
                .filter(|ctx| ctx.age() >= threshold)
                .map(|ctx| ctx.id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|id| state.ephemeral.remove(id))
                .collect()
        };
        for ctx in &orphans {
            ctx.visitor().invalidate();
            warn!(
                context = %ctx.id,
                age_ms = ctx.age().as_millis() as u64,
                "orphaned context destroyed, the PHP peer never claimed it"
            );
        }
        orphans.len()
    }

    /// Invalidates and drops every context.
    pub fn destroy_all(&self) {
        let all: Vec<Arc<Context>> = {
            let mut state = self.inner.state.lock().expect("context registry mutex");
            let live = std::mem::take(&mut state.live);
            let ephemeral = std::mem::take(&mut state.ephemeral);
            live.into_values().chain(ephemeral.into_values()).collect()
        };
        for ctx in &all {
            ctx.visitor().invalidate();
        }
        if !all.is_empty() {
            debug!(count = all.len(), "all contexts destroyed");
        }
    }

    /// Sweeps the ephemeral map every `period` until [`Self::shutdown`].
    pub fn spawn_reaper(&self, period: Duration, threshold: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.reap_orphans(threshold);
                    }
                    res = shutdown.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("context reaper stopped");
        })
    }

    /// Stops the reaper and destroys every context.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.destroy_all();
    }

    pub fn is_ephemeral(&self, id: &str) -> bool {
        self.inner
            .state
            .lock()
            .expect("context registry mutex")
            .ephemeral
            .contains_key(id)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.inner
            .state
            .lock()
            .expect("context registry mutex")
            .live
            .contains_key(id)
    }

    /// `(ephemeral, live)` counts.
    pub fn len(&self) -> (usize, usize) {
        let state = self.inner.state.lock().expect("context registry mutex");
        (state.ephemeral.len(), state.live.len())
    }
}
