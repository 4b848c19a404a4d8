use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::fastcgi::FrameError;

/// The FastCGI backend could not be reached, or no connection could be
/// handed out by the pool.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(
        "could not connect to FastCGI server at {endpoint}: {source}{}",
        .start_error
            .as_deref()
            .map(|e| format!(" (worker start failed: {e})"))
            .unwrap_or_default()
    )]
    Unreachable {
        endpoint: String,
        #[source]
        source: io::Error,
        start_error: Option<String>,
    },
    #[error("pool timeout exceeded after {waited:?}")]
    PoolTimeout { waited: Duration },
    #[error("connection pool is shut down")]
    PoolClosed,
}

impl ConnectError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PoolTimeout { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    Io,
    Protocol,
}

/// Failure in the middle of an exchange on a pooled connection.
#[derive(Debug, Error)]
#[error("FastCGI connection #{connection} failed: {source}")]
pub struct ConnectionError {
    pub connection: u64,
    #[source]
    pub source: FrameError,
}

impl ConnectionError {
    pub fn new(connection: u64, source: impl Into<FrameError>) -> Self {
        Self {
            connection,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ConnectionErrorKind {
        match self.source {
            FrameError::Io(_) => ConnectionErrorKind::Io,
            _ => ConnectionErrorKind::Protocol,
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("illegal access: context {id} has already been claimed")]
    AlreadyClaimed { id: String },
    #[error("unknown context {id}")]
    Unknown { id: String },
    #[error("recycle empty context {id}")]
    EmptyContext { id: String },
    #[error("context server unavailable: {reason}")]
    ServerUnavailable { reason: String },
}

/// Errors surfaced by a full request/response exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("invalid CGI response header: {0}")]
    Header(String),
    #[error("request body: {0}")]
    Body(#[source] io::Error),
    #[error("response sink: {0}")]
    Sink(#[source] io::Error),
    #[error("PHP error: {0}")]
    Php(String),
}

/// Why a suspended script never handed itself back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContinuationError {
    #[error("script runner failed: {0}")]
    Runner(String),
    #[error("script runner finished without calling back")]
    Finished,
}
