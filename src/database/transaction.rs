//! Transaction lifecycle over pooled sessions.
//!
//! Read-only statements run on an auto-commit path that never enters the
//! write lifecycle. Writes outside an explicit transaction run as implicit
//! single-statement transactions. Any statement error inside an active
//! transaction rolls back before the error reaches the caller.

use crate::database::backend::SqlValue;
use crate::database::pool::{ConnectionPool, PoolConnection};
use crate::database::result::QueryResult;
use crate::error::{DatabaseError, DbResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Leading keywords that cannot write. Anything else takes the write path.
const READ_ONLY_KEYWORDS: [&str; 5] = ["SELECT", "WITH", "EXPLAIN", "SHOW", "VALUES"];

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Active,
    Committed,
    RolledBack,
}

impl TxState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        }
    }
}

/// Issues statements against the pool with commit/rollback semantics.
pub struct TransactionManager {
    pool: Arc<ConnectionPool>,
    statement_timeout: Duration,
}

impl TransactionManager {
    pub fn new(pool: Arc<ConnectionPool>, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Conservative whitelist check on the first meaningful token.
    pub fn is_read_only(sql: &str) -> bool {
        let head = sql
            .lines()
            .map(str::trim_start)
            .find(|line| !line.is_empty() && !line.starts_with("--"))
            .and_then(|line| line.split_whitespace().next())
            .map(|token| token.to_ascii_uppercase());

        match head {
            Some(token) => READ_ONLY_KEYWORDS.contains(&token.as_str()),
            None => false,
        }
    }

    /// Executes one statement outside an explicit transaction.
    ///
    /// Read-only statements auto-commit; writes run inside an implicit
    /// transaction that commits on success and rolls back on error.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        let mut conn = self.pool.acquire().await?;

        if Self::is_read_only(sql) {
            return run_statement(&mut conn, sql, params, self.statement_timeout).await;
        }

        conn.session().begin().await?;
        match run_statement(&mut conn, sql, params, self.statement_timeout).await {
            Ok(result) => {
                if let Err(e) = conn.session().commit().await {
                    conn.mark_fatal();
                    return Err(e);
                }
                Ok(result)
            }
            Err(e) => {
                rollback_or_discard(&mut conn).await;
                Err(e)
            }
        }
    }

    /// Starts an explicit transaction on a freshly acquired connection.
    pub async fn begin(&self) -> DbResult<Transaction> {
        let mut conn = self.pool.acquire().await?;
        conn.session().begin().await?;
        debug!("Transaction started on session {}", conn.id());
        Ok(Transaction {
            conn,
            state: TxState::Active,
            started_at: Instant::now(),
            statement_timeout: self.statement_timeout,
        })
    }
}

/// An explicit unit of work over one borrowed connection.
///
/// At most one transaction exists per checked-out connection, enforced by
/// ownership of the guard. [`commit`](Self::commit) and
/// [`rollback`](Self::rollback) consume the transaction; the connection
/// returns to the pool when the transaction drops.
pub struct Transaction {
    conn: PoolConnection,
    state: TxState,
    started_at: Instant,
    statement_timeout: Duration,
}

impl Transaction {
    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Executes a statement inside the transaction.
    ///
    /// # Errors
    ///
    /// A failing statement rolls the transaction back before the error is
    /// returned; the transaction is never left active after a reported
    /// failure. Statements after that fail with
    /// [`DatabaseError::TransactionClosed`].
    pub async fn execute_statement(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<QueryResult> {
        if self.state != TxState::Active {
            return Err(DatabaseError::TransactionClosed(self.state.name()));
        }

        match run_statement(&mut self.conn, sql, params, self.statement_timeout).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.state = TxState::RolledBack;
                rollback_or_discard(&mut self.conn).await;
                Err(e)
            }
        }
    }

    /// Commits and returns the connection to the pool.
    pub async fn commit(mut self) -> DbResult<()> {
        if self.state != TxState::Active {
            return Err(DatabaseError::TransactionClosed(self.state.name()));
        }
        match self.conn.session().commit().await {
            Ok(()) => {
                self.state = TxState::Committed;
                debug!(
                    "Transaction committed after {:?} on session {}",
                    self.started_at.elapsed(),
                    self.conn.id()
                );
                Ok(())
            }
            Err(e) => {
                self.state = TxState::RolledBack;
                self.conn.mark_fatal();
                Err(e)
            }
        }
    }

    /// Rolls back and returns the connection to the pool.
    pub async fn rollback(mut self) -> DbResult<()> {
        if self.state != TxState::Active {
            return Err(DatabaseError::TransactionClosed(self.state.name()));
        }
        self.state = TxState::RolledBack;
        match self.conn.session().rollback().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.conn.mark_fatal();
                Err(e)
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            // Dropped mid-transaction: the session state is unknown, so the
            // pool must not recycle it.
            warn!(
                "Transaction on session {} dropped while active; discarding session",
                self.conn.id()
            );
            self.conn.mark_fatal();
        }
    }
}

async fn run_statement(
    conn: &mut PoolConnection,
    sql: &str,
    params: &[SqlValue],
    statement_timeout: Duration,
) -> DbResult<QueryResult> {
    match tokio::time::timeout(statement_timeout, conn.session().execute(sql, params)).await {
        Ok(result) => result,
        Err(_) => {
            // Mid-statement session; unusable after cancellation.
            conn.mark_fatal();
            Err(DatabaseError::Timeout(statement_timeout.as_millis() as u64))
        }
    }
}

/// Best-effort rollback; a connection that cannot roll back is discarded.
async fn rollback_or_discard(conn: &mut PoolConnection) {
    if conn.session().is_broken() || conn.session().rollback().await.is_err() {
        conn.mark_fatal();
    }
}
