//! Bounded pool of FastCGI connections.
//!
//! A [`Connection`] is the pooled object; its physical channel may be torn
//! down and re-established many times while the object itself keeps cycling
//! through the free list. Permits of a FIFO semaphore bound the number of
//! connections handed out at any time.

use pjb_core::config::FastCgiConfig;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::channel::{ChannelFactory, FcgiStream};
use crate::error::ConnectError;

const INPUT: u8 = 1;
const OUTPUT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of connections, idle or in use.
    pub limit: usize,
    /// Exchanges served by one physical channel before it is replaced;
    /// 0 disables recycling.
    pub max_requests: usize,
    /// Default acquire timeout; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl PoolSettings {
    pub fn from_config(config: &FastCgiConfig) -> Self {
        Self {
            limit: config.children,
            max_requests: config.max_requests,
            timeout: (config.pool_timeout_ms > 0)
                .then(|| Duration::from_millis(config.pool_timeout_ms)),
        }
    }
}

/// A pooled connection to the worker.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    stream: Option<FcgiStream>,
    max_requests: usize,
    requests_remaining: usize,
    closed: bool,
    /// Halves handed out during the current checkout.
    opened: u8,
    /// Halves finished during the current checkout.
    finished: u8,
}

impl Connection {
    fn new(id: u64, max_requests: usize) -> Self {
        Self {
            id,
            stream: None,
            max_requests,
            requests_remaining: max_requests,
            closed: true,
            opened: 0,
            finished: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn requests_remaining(&self) -> usize {
        self.requests_remaining
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn reset(&mut self) {
        self.opened = 0;
        self.finished = 0;
    }

    fn init(&mut self) {
        self.requests_remaining = self.max_requests;
        self.reset();
    }

    async fn reopen(&mut self, factory: &ChannelFactory) -> Result<(), ConnectError> {
        if self.closed || self.stream.is_none() {
            self.stream = Some(factory.connect().await?);
            self.closed = false;
            debug!(connection = self.id, "FastCGI connection opened");
        }
        Ok(())
    }

    /// Drops the physical channel; the object stays usable.
    fn destroy(&mut self) {
        if self.stream.take().is_some() {
            debug!(connection = self.id, "FastCGI connection closed");
        }
    }

    /// Counts one finished checkout and decides whether the physical
    /// channel survives it.
    fn close(&mut self, clean: bool) {
        if !clean || self.finished != self.opened {
            self.closed = true;
        }
        if self.max_requests > 0 {
            self.requests_remaining = self.requests_remaining.saturating_sub(1);
            if self.requests_remaining == 0 {
                self.closed = true;
            }
        }
        if self.closed {
            self.destroy();
            self.init();
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<Connection>,
    created: usize,
    shut_down: bool,
}

#[derive(Debug)]
struct PoolInner {
    factory: Arc<ChannelFactory>,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn put_back(&self, conn: Connection) {
        let mut state = self.state.lock().expect("pool mutex");
        if state.shut_down {
            debug!(connection = conn.id, "pool shut down, dropping returned connection");
            return;
        }
        state.free.push_back(conn);
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates the pool after checking that the backend answers.
    pub async fn new(
        factory: Arc<ChannelFactory>,
        settings: PoolSettings,
    ) -> Result<Self, ConnectError> {
        factory.test().await?;
        Ok(Self::new_unchecked(factory, settings))
    }

    pub fn new_unchecked(factory: Arc<ChannelFactory>, settings: PoolSettings) -> Self {
        let limit = settings.limit.max(1);
        debug!(
            endpoint = %factory.endpoint(),
            limit,
            max_requests = settings.max_requests,
            "creating FastCGI connection pool"
        );
        Self {
            inner: Arc::new(PoolInner {
                factory,
                settings: PoolSettings { limit, ..settings },
                permits: Arc::new(Semaphore::new(limit)),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.inner.settings
    }

    pub fn factory(&self) -> &Arc<ChannelFactory> {
        &self.inner.factory
    }

    /// Connections currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.settings.limit - self.inner.permits.available_permits()
    }

    /// Connection objects created so far; never exceeds the limit.
    pub fn created(&self) -> usize {
        self.inner.state.lock().expect("pool mutex").created
    }

    pub fn idle(&self) -> usize {
        self.inner.state.lock().expect("pool mutex").free.len()
    }

    /// Acquires with the pool's default timeout.
    pub async fn acquire(&self) -> Result<Lease, ConnectError> {
        self.acquire_timeout(self.inner.settings.timeout).await
    }

    /// Takes a free connection, or creates one while under the limit, or
    /// waits for one to come back. `None` or a zero duration waits forever.
    pub async fn acquire_timeout(&self, wait: Option<Duration>) -> Result<Lease, ConnectError> {
        let permits = self.inner.permits.clone();
        let permit = match wait.filter(|d| !d.is_zero()) {
            Some(limit) => timeout(limit, permits.acquire_owned())
                .await
                .map_err(|_| ConnectError::PoolTimeout { waited: limit })?,
            None => permits.acquire_owned().await,
        }
        .map_err(|_| ConnectError::PoolClosed)?;

        let conn = {
            let mut state = self.inner.state.lock().expect("pool mutex");
            if state.shut_down {
                return Err(ConnectError::PoolClosed);
            }
            match state.free.pop_front() {
                Some(mut conn) => {
                    conn.reset();
                    conn
                }
                None => {
                    state.created += 1;
                    debug_assert!(state.created <= self.inner.settings.limit);
                    Connection::new(state.created as u64, self.inner.settings.max_requests)
                }
            }
        };

        let mut lease = Lease {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        };
        let reopened = match lease.conn.as_mut() {
            Some(conn) => conn.reopen(&self.inner.factory).await,
            None => Ok(()),
        };
        if let Err(e) = reopened {
            // Back to the free list untouched; the next checkout retries.
            if let Some(conn) = lease.conn.take() {
                self.inner.put_back(conn);
            }
            return Err(e);
        }
        Ok(lease)
    }

    /// Closes idle connections, refuses further acquires and stops the
    /// worker. Connections still checked out are closed when they return.
    pub async fn destroy(&self) {
        let free = {
            let mut state = self.inner.state.lock().expect("pool mutex");
            state.shut_down = true;
            std::mem::take(&mut state.free)
        };
        self.inner.permits.close();
        for mut conn in free {
            if let Some(mut stream) = conn.stream.take() {
                if let Err(e) = stream.shutdown().await {
                    debug!(connection = conn.id, error = %e, "closing FastCGI connection failed");
                }
            }
        }
        self.inner.factory.destroy().await;
        info!("FastCGI connection pool destroyed");
    }
}

/// A checked-out connection. Give it back with [`Lease::release`]; dropping
/// it instead marks the physical channel as unusable.
#[derive(Debug)]
pub struct Lease {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    // Released after the connection is back on the free list.
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(Connection::id).unwrap_or_default()
    }

    pub fn requests_remaining(&self) -> usize {
        self.conn
            .as_ref()
            .map(Connection::requests_remaining)
            .unwrap_or_default()
    }

    fn stream(&mut self, half: u8) -> io::Result<&mut FcgiStream> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection released"))?;
        conn.opened |= half;
        conn.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))
    }

    /// The request side of the channel.
    pub fn writer(&mut self) -> io::Result<&mut FcgiStream> {
        self.stream(OUTPUT)
    }

    /// The response side of the channel.
    pub fn reader(&mut self) -> io::Result<&mut FcgiStream> {
        self.stream(INPUT)
    }

    pub fn finish_output(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.finished |= OUTPUT;
        }
    }

    pub fn finish_input(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.finished |= INPUT;
        }
    }

    /// Forces a reconnect on the next checkout.
    pub fn set_closed(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.closed = true;
        }
    }

    /// Returns the connection to the pool. A half that was handed out but
    /// never finished leaves the physical channel closed.
    pub fn release(mut self) {
        self.give_back(true);
    }

    fn give_back(&mut self, clean: bool) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        conn.close(clean);
        self.pool.put_back(conn);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.give_back(false);
    }
}
