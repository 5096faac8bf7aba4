//! PostgreSQL backend using `tokio-postgres`.

use crate::config::DatabaseConfig;
use crate::database::backend::{Backend, BackendSession, SqlValue};
use crate::database::result::{CellValue, Column, QueryResult, Row};
use crate::error::{DatabaseError, DbResult};
use crate::schema::{ColumnDef, ConstraintDef, ConstraintKind, SchemaEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Instant;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, instrument, warn};

/// Session factory for one PostgreSQL database.
pub struct PostgresBackend {
    config: DatabaseConfig,
}

impl PostgresBackend {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> DbResult<Box<dyn BackendSession>> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.database)
            .user(&self.config.username)
            .password(&self.config.password)
            .connect_timeout(self.config.connect_timeout);

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        // The connection object drives the socket; it resolves when the
        // session closes.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection closed with error: {}", e);
            }
        });

        info!(
            "Opened PostgreSQL session to {}:{}/{}",
            self.config.host, self.config.port, self.config.database
        );

        Ok(Box::new(PostgresSession { client }))
    }
}

/// One live PostgreSQL session.
pub struct PostgresSession {
    client: Client,
}

impl PostgresSession {
    fn convert_row(pg_row: &tokio_postgres::Row, columns: &[Column]) -> Row {
        let mut row = Row::new();
        for (i, col) in columns.iter().enumerate() {
            row.insert(col.name.clone(), Self::cell_value(pg_row, i));
        }
        row
    }

    /// Extract a cell by the column's wire type name.
    fn cell_value(row: &tokio_postgres::Row, index: usize) -> CellValue {
        let ty: &Type = row.columns()[index].type_();
        match ty.name() {
            "bool" => row
                .try_get::<_, Option<bool>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, CellValue::Bool),
            "int2" => row
                .try_get::<_, Option<i16>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, |v| CellValue::Int(v as i64)),
            "int4" => row
                .try_get::<_, Option<i32>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, |v| CellValue::Int(v as i64)),
            "int8" => row
                .try_get::<_, Option<i64>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, CellValue::Int),
            "float4" => row
                .try_get::<_, Option<f32>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, |v| CellValue::Float(v as f64)),
            "float8" => row
                .try_get::<_, Option<f64>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, CellValue::Float),
            "numeric" => row
                .try_get::<_, Option<Decimal>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, CellValue::Decimal),
            "timestamp" => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, |v| {
                    CellValue::DateTime(DateTime::from_naive_utc_and_offset(v, Utc))
                }),
            "timestamptz" => row
                .try_get::<_, Option<DateTime<Utc>>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, CellValue::DateTime),
            "json" | "jsonb" => row
                .try_get::<_, Option<serde_json::Value>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, CellValue::Json),
            _ => row
                .try_get::<_, Option<String>>(index)
                .ok()
                .flatten()
                .map_or(CellValue::Null, CellValue::String),
        }
    }

    fn returns_rows(sql: &str) -> bool {
        let head = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        matches!(head.as_str(), "SELECT" | "WITH" | "EXPLAIN" | "SHOW" | "VALUES")
            || sql.to_ascii_uppercase().contains("RETURNING")
    }
}

#[async_trait]
impl BackendSession for PostgresSession {
    #[instrument(skip(self, params), fields(db = "postgres"))]
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        let start = Instant::now();
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        debug!("Executing statement");

        if Self::returns_rows(sql) {
            let stmt = self
                .client
                .prepare(sql)
                .await
                .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

            let pg_rows = self
                .client
                .query(&stmt, &param_refs)
                .await
                .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

            let columns: Vec<Column> = stmt
                .columns()
                .iter()
                .map(|c| Column::new(c.name(), c.type_().name()))
                .collect();

            let rows: Vec<Row> = pg_rows
                .iter()
                .map(|r| Self::convert_row(r, &columns))
                .collect();

            Ok(QueryResult::new(
                columns,
                rows,
                start.elapsed().as_millis() as u64,
            ))
        } else {
            let affected = self
                .client
                .execute(sql, &param_refs)
                .await
                .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

            Ok(QueryResult::affected(
                affected,
                start.elapsed().as_millis() as u64,
            ))
        }
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn table_names(&mut self) -> DbResult<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[],
            )
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    #[instrument(skip(self))]
    async fn describe_table(&mut self, table: &str) -> DbResult<SchemaEntry> {
        let column_rows = self
            .client
            .query(
                "SELECT c.column_name, c.data_type, c.is_nullable = 'YES', \
                        pk.column_name IS NOT NULL \
                 FROM information_schema.columns c \
                 LEFT JOIN ( \
                     SELECT kcu.column_name \
                     FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                         ON tc.constraint_name = kcu.constraint_name \
                         AND tc.table_schema = kcu.table_schema \
                     WHERE tc.constraint_type = 'PRIMARY KEY' \
                         AND tc.table_schema = 'public' AND tc.table_name = $1 \
                 ) pk ON c.column_name = pk.column_name \
                 WHERE c.table_schema = 'public' AND c.table_name = $1 \
                 ORDER BY c.ordinal_position",
                &[&table],
            )
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        if column_rows.is_empty() {
            return Err(DatabaseError::TableNotFound(table.to_string()));
        }

        let columns = column_rows
            .iter()
            .map(|r| ColumnDef {
                name: r.get(0),
                data_type: r.get(1),
                nullable: r.get(2),
                is_key: r.get(3),
            })
            .collect();

        let constraint_rows = self
            .client
            .query(
                "SELECT tc.constraint_name, tc.constraint_type, \
                        array_agg(kcu.column_name ORDER BY kcu.ordinal_position) \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                     ON tc.constraint_name = kcu.constraint_name \
                     AND tc.table_schema = kcu.table_schema \
                 WHERE tc.table_schema = 'public' AND tc.table_name = $1 \
                 GROUP BY tc.constraint_name, tc.constraint_type \
                 ORDER BY tc.constraint_name",
                &[&table],
            )
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        let constraints = constraint_rows
            .iter()
            .map(|r| ConstraintDef {
                name: r.get(0),
                kind: ConstraintKind::parse(r.get::<_, &str>(1)),
                columns: r.get(2),
            })
            .collect();

        Ok(SchemaEntry {
            table_name: table.to_string(),
            columns,
            constraints,
        })
    }

    fn is_broken(&self) -> bool {
        self.client.is_closed()
    }
}
