//! Backend abstraction: session factory and per-session operations.

use crate::database::result::QueryResult;
use crate::error::DbResult;
use crate::schema::SchemaEntry;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

/// Factory for live backend sessions. The connection pool owns the sessions;
/// everything above the pool sees only [`BackendSession`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the backend name (e.g., "postgres").
    fn name(&self) -> &'static str;

    /// Opens a new physical session.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConnectionFailed`](crate::error::DatabaseError::ConnectionFailed)
    /// if the backend is unreachable.
    async fn connect(&self) -> DbResult<Box<dyn BackendSession>>;
}

/// A single live backend session.
///
/// Statements take parameters exclusively through [`SqlValue`]; the session
/// must bind them through the backend's parameter mechanism, never by
/// interpolating into the SQL text.
#[async_trait]
pub trait BackendSession: Send {
    /// Executes one statement with bound parameters.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult>;

    /// Starts an explicit transaction on this session.
    async fn begin(&mut self) -> DbResult<()>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> DbResult<()>;

    /// Rolls back the open transaction.
    async fn rollback(&mut self) -> DbResult<()>;

    /// Lists table names visible to the session, in name order.
    async fn table_names(&mut self) -> DbResult<Vec<String>>;

    /// Fetches column and constraint metadata for one table.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::TableNotFound`](crate::error::DatabaseError::TableNotFound)
    /// if the table does not exist.
    async fn describe_table(&mut self, table: &str) -> DbResult<SchemaEntry>;

    /// Whether the underlying connection is no longer usable.
    fn is_broken(&self) -> bool;
}

/// A bound statement parameter.
///
/// Tool inputs arrive as JSON; [`SqlValue::from_json`] maps them onto the
/// closed set of types every backend can bind.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(b) => b.to_sql(ty, out),
            Self::Int(i) if *ty == Type::INT2 => (*i as i16).to_sql(ty, out),
            Self::Int(i) if *ty == Type::INT4 => (*i as i32).to_sql(ty, out),
            Self::Int(i) => i.to_sql(ty, out),
            Self::Float(f) if *ty == Type::FLOAT4 => (*f as f32).to_sql(ty, out),
            Self::Float(f) => f.to_sql(ty, out),
            Self::Text(s) => s.to_sql(ty, out),
            Self::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Parameters are dynamically typed; mismatches surface as bind errors
        // from the concrete to_sql above.
        true
    }

    to_sql_checked!();
}
