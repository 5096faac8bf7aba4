//! Scriptable in-memory backend for pool, transaction and catalog tests.

use crate::database::backend::{Backend, BackendSession, SqlValue};
use crate::database::result::{CellValue, Column, QueryResult, Row};
use crate::error::{DatabaseError, DbResult};
use crate::schema::{ColumnDef, SchemaEntry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Shared script driving every session the backend creates.
#[derive(Default)]
pub struct MockScript {
    connects: AtomicU32,
    fail_connects: AtomicU32,
    responses: Mutex<VecDeque<DbResult<QueryResult>>>,
    executed: Mutex<Vec<String>>,
    tables: Mutex<Vec<String>>,
    describes: AtomicU32,
    describe_delay: Mutex<Duration>,
    execute_delay: Mutex<Duration>,
}

impl MockScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for the next `execute` call; unscripted calls
    /// succeed with an empty result.
    pub fn push_response(&self, response: DbResult<QueryResult>) {
        self.responses.lock().push_back(response);
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_tables(&self, tables: Vec<&str>) {
        *self.tables.lock() = tables.into_iter().map(String::from).collect();
    }

    /// Widens the cache-miss window so coalescing tests can overlap lookups.
    pub fn set_describe_delay(&self, delay: Duration) {
        *self.describe_delay.lock() = delay;
    }

    /// Stalls every `execute` call, for statement-timeout tests.
    pub fn set_execute_delay(&self, delay: Duration) {
        *self.execute_delay.lock() = delay;
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn describe_count(&self) -> u32 {
        self.describes.load(Ordering::SeqCst)
    }

    /// Every statement any session has run, in execution order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// A one-row result in the shape tests expect from a read.
    pub fn sample_rows() -> QueryResult {
        let columns = vec![Column::new("id", "int8"), Column::new("name", "text")];
        let mut row = Row::new();
        row.insert("id".into(), CellValue::Int(1));
        row.insert("name".into(), CellValue::String("Steven King".into()));
        QueryResult::new(columns, vec![row], 1)
    }
}

pub struct MockBackend {
    script: Arc<MockScript>,
}

impl MockBackend {
    pub fn new(script: Arc<MockScript>) -> Self {
        Self { script }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> DbResult<Box<dyn BackendSession>> {
        let remaining = self.script.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.script.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(DatabaseError::ConnectionFailed("scripted failure".into()));
        }
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            script: Arc::clone(&self.script),
            broken: AtomicBool::new(false),
        }))
    }
}

pub struct MockSession {
    script: Arc<MockScript>,
    broken: AtomicBool,
}

#[async_trait]
impl BackendSession for MockSession {
    async fn execute(&mut self, sql: &str, _params: &[SqlValue]) -> DbResult<QueryResult> {
        self.script.executed.lock().push(sql.to_string());
        let delay = *self.script.execute_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.script.responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(QueryResult::empty()),
        }
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.script.executed.lock().push("BEGIN".into());
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.script.executed.lock().push("COMMIT".into());
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.script.executed.lock().push("ROLLBACK".into());
        Ok(())
    }

    async fn table_names(&mut self) -> DbResult<Vec<String>> {
        Ok(self.script.tables.lock().clone())
    }

    async fn describe_table(&mut self, table: &str) -> DbResult<SchemaEntry> {
        self.script.describes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.describe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.script.tables.lock().iter().any(|t| t == table) {
            return Err(DatabaseError::TableNotFound(table.to_string()));
        }
        Ok(SchemaEntry {
            table_name: table.to_string(),
            columns: vec![
                ColumnDef {
                    name: "id".into(),
                    data_type: "bigint".into(),
                    nullable: false,
                    is_key: true,
                },
                ColumnDef {
                    name: "name".into(),
                    data_type: "text".into(),
                    nullable: true,
                    is_key: false,
                },
            ],
            constraints: vec![],
        })
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}
