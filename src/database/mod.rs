//! Transactional data access: backend abstraction, pool, transactions.

pub mod backend;
#[cfg(test)]
pub mod mock;
pub mod pool;
pub mod postgres;
pub mod result;
pub mod transaction;

pub use backend::{Backend, BackendSession, SqlValue};
pub use pool::{ConnectionPool, PoolConfig, PoolConnection, PoolStatus};
pub use postgres::PostgresBackend;
pub use result::{CellValue, Column, QueryResult, Row};
pub use transaction::{Transaction, TransactionManager, TxState};
