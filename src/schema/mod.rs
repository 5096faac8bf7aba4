//! Schema catalog: lazily populated, explicitly invalidated table metadata.

use crate::database::pool::ConnectionPool;
use crate::error::DbResult;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Cached metadata for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<ConstraintDef>,
}

/// Column definition in table order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_key: bool,
}

/// Table constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintDef {
    pub name: String,
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Unique,
    Check,
    Other,
}

impl ConstraintKind {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "PRIMARY KEY" => Self::PrimaryKey,
            "FOREIGN KEY" => Self::ForeignKey,
            "UNIQUE" => Self::Unique,
            "CHECK" => Self::Check,
            _ => Self::Other,
        }
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Arc<SchemaEntry>>>>;

/// Caches table metadata from the backend.
///
/// Entries populate lazily on first lookup and live until [`invalidate`]
/// replaces the cache wholesale; there is no TTL. Concurrent lookups of the
/// same uncached table coalesce onto a single metadata fetch.
///
/// [`invalidate`]: SchemaCatalog::invalidate
pub struct SchemaCatalog {
    pool: Arc<ConnectionPool>,
    enabled: bool,
    entries: DashMap<String, Slot>,
    tables: tokio::sync::Mutex<Option<Arc<Vec<String>>>>,
}

impl SchemaCatalog {
    pub fn new(pool: Arc<ConnectionPool>, enabled: bool) -> Self {
        Self {
            pool,
            enabled,
            entries: DashMap::new(),
            tables: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns metadata for `table`, fetching it on first lookup.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::TableNotFound`](crate::error::DatabaseError::TableNotFound)
    /// for unknown tables; misses are not cached.
    pub async fn describe_table(&self, table: &str) -> DbResult<Arc<SchemaEntry>> {
        if !self.enabled {
            return Ok(Arc::new(self.fetch_entry(table).await?));
        }

        let slot: Slot = self.entries.entry(table.to_string()).or_default().clone();

        // The slot lock is the coalescing point: the first caller fetches
        // while the rest wait, then read the cached entry.
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.as_ref() {
            debug!("Schema cache hit for {}", table);
            return Ok(Arc::clone(entry));
        }

        let entry = Arc::new(self.fetch_entry(table).await?);
        *guard = Some(Arc::clone(&entry));
        debug!("Schema cache populated for {}", table);
        Ok(entry)
    }

    /// Lists table names, cached under the same invalidation as entries.
    pub async fn list_tables(&self) -> DbResult<Arc<Vec<String>>> {
        if !self.enabled {
            return Ok(Arc::new(self.fetch_tables().await?));
        }

        let mut guard = self.tables.lock().await;
        if let Some(tables) = guard.as_ref() {
            return Ok(Arc::clone(tables));
        }

        let tables = Arc::new(self.fetch_tables().await?);
        *guard = Some(Arc::clone(&tables));
        Ok(tables)
    }

    /// Drops every cached entry; the next lookups repopulate from the backend.
    pub async fn invalidate(&self) {
        self.entries.clear();
        *self.tables.lock().await = None;
        debug!("Schema cache invalidated");
    }

    /// Number of cached table entries.
    pub fn cached_tables(&self) -> usize {
        self.entries.len()
    }

    async fn fetch_entry(&self, table: &str) -> DbResult<SchemaEntry> {
        let mut conn = self.pool.acquire().await?;
        conn.session().describe_table(table).await
    }

    async fn fetch_tables(&self) -> DbResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        conn.session().table_names().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mock::{MockBackend, MockScript};
    use crate::database::pool::PoolConfig;
    use crate::error::DatabaseError;
    use std::time::Duration;

    async fn catalog_with(script: &Arc<MockScript>, enabled: bool) -> Arc<SchemaCatalog> {
        let pool = ConnectionPool::new(
            Arc::new(MockBackend::new(Arc::clone(script))),
            PoolConfig::new().min_size(0).max_size(4),
        )
        .await
        .unwrap();
        Arc::new(SchemaCatalog::new(Arc::new(pool), enabled))
    }

    #[tokio::test]
    async fn test_lazy_population_and_cache_hit() {
        let script = MockScript::new();
        script.set_tables(vec!["employees"]);
        let catalog = catalog_with(&script, true).await;

        let entry = catalog.describe_table("employees").await.unwrap();
        assert_eq!(entry.table_name, "employees");
        assert_eq!(entry.columns.len(), 2);
        assert!(entry.columns[0].is_key);

        catalog.describe_table("employees").await.unwrap();
        assert_eq!(script.describe_count(), 1);
        assert_eq!(catalog.cached_tables(), 1);
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let script = MockScript::new();
        script.set_tables(vec!["employees"]);
        let catalog = catalog_with(&script, true).await;

        let err = catalog.describe_table("missing").await.unwrap_err();
        assert!(matches!(err, DatabaseError::TableNotFound(_)));

        // Misses are not cached; a later lookup tries the backend again.
        script.set_tables(vec!["employees", "missing"]);
        assert!(catalog.describe_table("missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let script = MockScript::new();
        script.set_tables(vec!["employees"]);
        script.set_describe_delay(Duration::from_millis(50));
        let catalog = catalog_with(&script, true).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let catalog = Arc::clone(&catalog);
            handles.push(tokio::spawn(async move {
                catalog.describe_table("employees").await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(script.describe_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let script = MockScript::new();
        script.set_tables(vec!["employees"]);
        let catalog = catalog_with(&script, true).await;

        catalog.describe_table("employees").await.unwrap();
        assert_eq!(catalog.cached_tables(), 1);

        catalog.invalidate().await;
        assert_eq!(catalog.cached_tables(), 0);
        catalog.invalidate().await;
        assert_eq!(catalog.cached_tables(), 0);

        catalog.describe_table("employees").await.unwrap();
        assert_eq!(script.describe_count(), 2);
    }

    #[tokio::test]
    async fn test_list_tables_cached() {
        let script = MockScript::new();
        script.set_tables(vec!["departments", "employees"]);
        let catalog = catalog_with(&script, true).await;

        let tables = catalog.list_tables().await.unwrap();
        assert_eq!(*tables, vec!["departments", "employees"]);

        // Served from cache until invalidated.
        script.set_tables(vec!["departments"]);
        let tables = catalog.list_tables().await.unwrap();
        assert_eq!(tables.len(), 2);

        catalog.invalidate().await;
        let tables = catalog.list_tables().await.unwrap();
        assert_eq!(tables.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_fetches() {
        let script = MockScript::new();
        script.set_tables(vec!["employees"]);
        let catalog = catalog_with(&script, false).await;

        catalog.describe_table("employees").await.unwrap();
        catalog.describe_table("employees").await.unwrap();
        assert_eq!(script.describe_count(), 2);
    }

    #[test]
    fn test_constraint_kind_parse() {
        assert_eq!(ConstraintKind::parse("PRIMARY KEY"), ConstraintKind::PrimaryKey);
        assert_eq!(ConstraintKind::parse("foreign key"), ConstraintKind::ForeignKey);
        assert_eq!(ConstraintKind::parse("EXCLUSION"), ConstraintKind::Other);
    }
}
