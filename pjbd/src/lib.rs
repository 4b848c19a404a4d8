//! FastCGI plumbing between a host process and PHP workers: the record
//! codec, worker supervision, a bounded connection pool, and the context
//! hand-off that lets a PHP script call back into the host.

pub mod channel;
pub mod context;
pub mod continuation;
pub mod error;
pub mod exchange;
pub mod fastcgi;
pub mod pool;

pub use channel::{ChannelFactory, Endpoint, FcgiStream};
pub use context::{Context, ContextRegistry, ContextServer, ContextVisitor};
pub use continuation::Continuation;
pub use error::{ConnectError, ConnectionError, ContextError, ContinuationError, ExchangeError};
pub use exchange::{run_exchange, ExchangeOutcome};
pub use pool::{ConnectionPool, Lease, PoolSettings};
