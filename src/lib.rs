//! # connections_pool
//!
//! Bounded async pool for expensive, reusable connections shared by
//! concurrent consumers.
//!
//! ## Features
//!
//! - Lazy creation through a caller-supplied async factory, up to a hard limit
//! - In-flight creations count against the limit, so bursts never overshoot it
//! - Idle connections are reused oldest first
//! - Queued requests are served strictly FIFO; a released connection goes
//!   straight to the oldest one
//! - Explicit acquire / release / remove / close lifecycle, with release on drop
//! - Optional non-blocking acquisition
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use connections_pool::{Connectable, ConnectionPool, PoolConfiguration};
//!
//! struct Session {
//!     peer: String,
//! }
//!
//! #[async_trait]
//! impl Connectable for Session {
//!     async fn close(&self) {}
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = PoolConfiguration::new().with_connection_limit(2);
//! let pool = ConnectionPool::new(
//!     || async { Ok::<_, std::io::Error>(Session { peer: "127.0.0.1:7000".into() }) },
//!     config,
//! )
//! .unwrap();
//!
//! {
//!     let conn = pool.get_connection().await.unwrap();
//!     println!("Talking to {}", conn.peer);
//!     // returned to the pool when `conn` goes out of scope
//! }
//!
//! assert_eq!(pool.status().free, 1);
//! pool.close().await;
//! # }
//! ```

mod config;
mod connection;
mod errors;
mod pool;
mod state;
mod status;

pub use config::PoolConfiguration;
pub use connection::{Connectable, ConnectionId, PoolConnection};
pub use errors::{PoolError, PoolResult};
pub use pool::ConnectionPool;
pub use state::ConnectionState;
pub use status::PoolStatus;
