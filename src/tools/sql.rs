//! Data-query tool: parameterized SQL against the transactional backend.

use crate::database::backend::SqlValue;
use crate::database::transaction::TransactionManager;
use crate::error::{AgentError, Result};
use crate::schema::SchemaCatalog;
use crate::tools::registry::{
    Capability, ParamSpec, ParamType, ToolDescriptor, ToolHandler, ToolInput, ToolOutput,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Leading keywords accepted as raw SQL in request text.
const SQL_KEYWORDS: [&str; 8] = [
    "SELECT", "INSERT", "UPDATE", "DELETE", "WITH", "EXPLAIN", "SHOW", "VALUES",
];

/// Validate a SQL identifier (table name) against a strict whitelist.
///
/// Only alphanumeric characters and underscores are allowed; anything else is
/// rejected rather than quoted.
fn validate_identifier(name: &str) -> Result<&str> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(name)
    } else {
        Err(AgentError::InvalidInput(format!(
            "invalid table identifier: '{name}'"
        )))
    }
}

/// Executes SQL through the transaction manager.
///
/// Single statements take the implicit path (auto-commit reads, implicit
/// single-statement transactions for writes). A `statements` script runs
/// inside one explicit transaction and rolls back at the first failure.
pub struct SqlQueryTool {
    manager: Arc<TransactionManager>,
    catalog: Arc<SchemaCatalog>,
}

impl SqlQueryTool {
    pub fn new(manager: Arc<TransactionManager>, catalog: Arc<SchemaCatalog>) -> Self {
        Self { manager, catalog }
    }

    fn bind_params(args: &Value) -> Result<Vec<SqlValue>> {
        match args.get("params") {
            None | Some(Value::Null) => Ok(vec![]),
            Some(Value::Array(values)) => Ok(values.iter().map(SqlValue::from_json).collect()),
            Some(_) => Err(AgentError::InvalidInput(
                "parameter 'params' must be an array".into(),
            )),
        }
    }

    async fn run_script(&self, statements: &[Value]) -> Result<ToolOutput> {
        if statements.is_empty() {
            return Err(AgentError::InvalidInput(
                "parameter 'statements' must not be empty".into(),
            ));
        }

        let mut tx = self.manager.begin().await.map_err(AgentError::from)?;
        let mut results = Vec::with_capacity(statements.len());

        for statement in statements {
            let sql = statement.as_str().ok_or_else(|| {
                AgentError::InvalidInput("each statement must be a string".into())
            })?;
            let result = tx.execute_statement(sql, &[]).await?;
            results.push(json!({
                "rows_affected": result.rows_affected,
                "row_count": result.row_count,
            }));
        }

        tx.commit().await?;
        Ok(ToolOutput::Scalar(json!({
            "committed": true,
            "statements": results.len(),
            "results": results,
        })))
    }
}

#[async_trait]
impl ToolHandler for SqlQueryTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "sql_query".into(),
            capability: Capability::DataQuery,
            description: "Execute SQL against the connected database. \
                          Values are always bound as parameters, never inlined."
                .into(),
            input_schema: vec![
                ParamSpec::optional("sql", ParamType::String, "SQL statement to execute"),
                ParamSpec::optional(
                    "params",
                    ParamType::Array,
                    "Positional values bound to $1, $2, ...",
                ),
                ParamSpec::optional(
                    "statements",
                    ParamType::Array,
                    "Statements to run inside one transaction",
                ),
                ParamSpec::optional(
                    "table",
                    ParamType::String,
                    "Table to read in full instead of providing SQL",
                ),
            ],
        }
    }

    async fn prepare(&self, text: &str) -> Result<Value> {
        let head = text
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        if SQL_KEYWORDS.contains(&head.as_str()) {
            return Ok(json!({ "sql": text.trim() }));
        }

        // Not raw SQL; look for a known table name mentioned in the text.
        let lowered = text.to_lowercase();
        let tables = self.catalog.list_tables().await.map_err(AgentError::from)?;
        for table in tables.iter() {
            let needle = table.to_lowercase();
            if lowered
                .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .any(|word| word == needle)
            {
                debug!("Derived table '{}' from request text", table);
                return Ok(json!({ "table": table }));
            }
        }

        Err(AgentError::InvalidInput(
            "could not derive a query from the request; name a table or provide SQL".into(),
        ))
    }

    #[instrument(skip(self, input), fields(tool = "sql_query"))]
    async fn invoke(&self, input: ToolInput) -> Result<ToolOutput> {
        if let Some(Value::Array(statements)) = input.args.get("statements") {
            return self.run_script(statements).await;
        }

        let sql = match input.str_arg("sql") {
            Some(sql) => sql.to_string(),
            None => {
                let table = input.str_arg("table").ok_or_else(|| {
                    AgentError::InvalidInput(
                        "one of 'sql', 'statements' or 'table' is required".into(),
                    )
                })?;
                format!("SELECT * FROM {}", validate_identifier(table)?)
            }
        };

        let params = Self::bind_params(&input.args)?;
        let result = self.manager.execute(&sql, &params).await?;
        Ok(ToolOutput::Rows(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mock::{MockBackend, MockScript};
    use crate::database::pool::{ConnectionPool, PoolConfig};
    use crate::error::DatabaseError;
    use std::time::Duration;

    async fn tool_with(script: &Arc<MockScript>) -> SqlQueryTool {
        let pool = Arc::new(
            ConnectionPool::new(
                Arc::new(MockBackend::new(Arc::clone(script))),
                PoolConfig::new().min_size(0).max_size(2),
            )
            .await
            .unwrap(),
        );
        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&pool),
            Duration::from_secs(5),
        ));
        let catalog = Arc::new(SchemaCatalog::new(pool, true));
        SqlQueryTool::new(manager, catalog)
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("employees").is_ok());
        assert!(validate_identifier("audit_log2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("t; DROP TABLE x").is_err());
        assert!(validate_identifier("a-b").is_err());
    }

    #[tokio::test]
    async fn test_prepare_passes_raw_sql_through() {
        let script = MockScript::new();
        let tool = tool_with(&script).await;

        let args = tool.prepare("SELECT name FROM employees").await.unwrap();
        assert_eq!(args["sql"], "SELECT name FROM employees");
    }

    #[tokio::test]
    async fn test_prepare_matches_table_name() {
        let script = MockScript::new();
        script.set_tables(vec!["departments", "employees"]);
        let tool = tool_with(&script).await;

        let args = tool.prepare("list employees").await.unwrap();
        assert_eq!(args["table"], "employees");

        let args = tool.prepare("show all Departments, please").await.unwrap();
        assert_eq!(args["table"], "departments");
    }

    #[tokio::test]
    async fn test_prepare_fails_without_a_match() {
        let script = MockScript::new();
        script.set_tables(vec!["employees"]);
        let tool = tool_with(&script).await;

        let err = tool.prepare("how is the weather").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_invoke_table_arg_reads_all_rows() {
        let script = MockScript::new();
        script.push_response(Ok(MockScript::sample_rows()));
        let tool = tool_with(&script).await;

        let output = tool
            .invoke(ToolInput::new(json!({"table": "employees"}), "list employees"))
            .await
            .unwrap();

        assert!(matches!(output, ToolOutput::Rows(ref r) if r.row_count == 1));
        assert_eq!(script.executed(), vec!["SELECT * FROM employees"]);
    }

    #[tokio::test]
    async fn test_invoke_script_runs_in_one_transaction() {
        let script = MockScript::new();
        let tool = tool_with(&script).await;

        let output = tool
            .invoke(ToolInput::new(
                json!({"statements": ["INSERT INTO t VALUES (1)", "UPDATE t SET a = 2"]}),
                "",
            ))
            .await
            .unwrap();

        assert!(matches!(output, ToolOutput::Scalar(_)));
        assert_eq!(
            script.executed(),
            vec![
                "BEGIN",
                "INSERT INTO t VALUES (1)",
                "UPDATE t SET a = 2",
                "COMMIT"
            ]
        );
    }

    #[tokio::test]
    async fn test_invoke_script_rolls_back_on_failure() {
        let script = MockScript::new();
        script.push_response(Ok(crate::database::result::QueryResult::empty()));
        script.push_response(Err(DatabaseError::QueryFailed("constraint".into())));
        let tool = tool_with(&script).await;

        let err = tool
            .invoke(ToolInput::new(
                json!({"statements": ["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (1)"]}),
                "",
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Database(_)));
        let executed = script.executed();
        assert_eq!(executed.last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_invoke_requires_some_input() {
        let script = MockScript::new();
        let tool = tool_with(&script).await;

        let err = tool
            .invoke(ToolInput::new(json!({}), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }
}
