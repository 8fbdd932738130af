//! Reactive execution over PostgreSQL connections.
//!
//! Queries and row streams are exposed as `futures::Stream` sequences which
//! acquire a connection when first polled, and release it exactly once as they
//! complete, fail, or are cancelled (dropped). Transactions run a list of
//! steps in order over a single connection, within BEGIN and COMMIT, and roll
//! back if any step fails.
mod client;
mod config;
mod error;
mod postgres;
mod provider;

pub mod query;
pub mod sequence;
pub mod stream;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use client::Database;
pub use config::{ConnectConfig, PoolOptions, APPLICATION_NAME};
pub use error::{Error, TransactionError};
pub use postgres::Dedicated;
pub use provider::{Connection, ConnectionHandle, ConnectionProvider};
pub use query::{Query, QueryResult, QuerySequence, Row, Statement};
pub use sequence::SingleShot;
pub use stream::{RowSequence, StreamOptions};
pub use transaction::{Step, TransactionSequence, TransactionState};
