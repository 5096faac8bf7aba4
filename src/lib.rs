//! Natural-language tool gateway with transactional database access.
//!
//! Routes user requests to capability-tagged tools (SQL execution, outbound
//! HTTP calls, language-model completions) and returns structured results.
//! Data tools run through a bounded connection pool with explicit
//! commit/rollback semantics; every invocation is recorded in a bounded
//! execution ledger.
//!
//! # Example
//!
//! ```no_run
//! use querypilot::{
//!     config::AgentConfig,
//!     database::{ConnectionPool, PostgresBackend, TransactionManager},
//!     dispatch::{DispatchRequest, Dispatcher},
//!     ledger::ExecutionLedger,
//!     schema::SchemaCatalog,
//!     tools::{CompletionTool, HttpCallTool, SqlQueryTool, ToolRegistry},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig::from_env()?;
//!
//!     let backend = Arc::new(PostgresBackend::new(config.database.clone()));
//!     let pool = Arc::new(ConnectionPool::new(backend, config.pool.clone()).await?);
//!     let manager = Arc::new(TransactionManager::new(
//!         Arc::clone(&pool),
//!         config.database.statement_timeout,
//!     ));
//!     let catalog = Arc::new(SchemaCatalog::new(Arc::clone(&pool), config.cache_enabled));
//!
//!     let mut registry = ToolRegistry::new();
//!     registry.register(SqlQueryTool::new(manager, Arc::clone(&catalog)))?;
//!     registry.register(HttpCallTool::new(config.http.clone()))?;
//!     registry.register(CompletionTool::new(config.completion.clone()))?;
//!
//!     let ledger = Arc::new(ExecutionLedger::new(config.ledger_capacity));
//!     let dispatcher = Dispatcher::new(
//!         Arc::new(registry),
//!         Arc::clone(&ledger),
//!         config.retry.clone(),
//!         config.request_timeout,
//!     );
//!
//!     let result = dispatcher.handle(DispatchRequest::new("list employees")).await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod schema;
pub mod tools;

pub use config::{AgentConfig, DatabaseConfig, DatabaseConfigBuilder, Environment};
pub use database::{ConnectionPool, PoolConfig, PostgresBackend, TransactionManager};
pub use dispatch::{DispatchRequest, DispatchResult, Dispatcher, ResultPayload};
pub use error::{AgentError, DatabaseError, ErrorKind, Result};
pub use ledger::{ExecutionLedger, InvocationRecord};
pub use schema::{SchemaCatalog, SchemaEntry};
pub use tools::{
    Capability, CompletionTool, HttpCallTool, SqlQueryTool, ToolHandler, ToolRegistry,
};
