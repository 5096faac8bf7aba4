//! Gateway binary: wires the core and serves a line-oriented console.

use anyhow::{Context, Result};
use querypilot::{
    config::AgentConfig,
    database::{ConnectionPool, PostgresBackend, TransactionManager},
    dispatch::{DispatchRequest, Dispatcher},
    ledger::ExecutionLedger,
    schema::SchemaCatalog,
    tools::{CompletionTool, HttpCallTool, SqlQueryTool, ToolRegistry},
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::from_env()?;
    init_tracing(&config.log_level);

    info!(
        "Starting {} v{} ({:?})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.environment
    );

    let backend = Arc::new(PostgresBackend::new(config.database.clone()));
    let pool = Arc::new(
        ConnectionPool::new(backend, config.pool.clone())
            .await
            .context("failed to open the database connection pool")?,
    );
    let manager = Arc::new(TransactionManager::new(
        Arc::clone(&pool),
        config.database.statement_timeout,
    ));
    let catalog = Arc::new(SchemaCatalog::new(Arc::clone(&pool), config.cache_enabled));

    let mut registry = ToolRegistry::new();
    registry.register(SqlQueryTool::new(manager, Arc::clone(&catalog)))?;
    registry.register(HttpCallTool::new(config.http.clone()))?;
    registry.register(CompletionTool::new(config.completion.clone()))?;

    info!("Registered {} tools", registry.len());

    let ledger = Arc::new(ExecutionLedger::new(config.ledger_capacity));
    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::clone(&ledger),
        config.retry.clone(),
        config.request_timeout,
    );

    println!("Ready. Type a request, :tables, :recent, :refresh or :quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            ":quit" | ":q" => break,
            ":recent" => {
                let records = ledger.recent(10);
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
            ":tables" => match catalog.list_tables().await {
                Ok(tables) => println!("{}", tables.join("\n")),
                Err(e) => eprintln!("error: {e}"),
            },
            ":refresh" => {
                catalog.invalidate().await;
                println!("schema cache invalidated");
            }
            text => {
                let result = dispatcher.handle(DispatchRequest::new(text)).await;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("querypilot={default_level},warn")));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
