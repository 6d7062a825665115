//! Table introspection and publication management

use crate::error::{PgError, PgResult, UNDEFINED_TABLE};
use crate::pool::PgPool;
use crate::types::element_type;
use async_trait::async_trait;
use electric_core::ident::{quote_identifier, quote_relation};
use electric_core::{Catalog, Column, TableSchema};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{debug, info};

/// Columns of a table with type, nullability, modifiers and primary key
/// position
const TABLE_COLUMNS_QUERY: &str = r#"
    SELECT a.attname::text,
           t.typname::text,
           a.attnotnull,
           a.atttypmod::int4,
           a.attndims::int4,
           array_position(i.indkey::int2[], a.attnum)::int4 AS pk_position
    FROM pg_attribute a
    JOIN pg_class c ON c.oid = a.attrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_type t ON t.oid = a.atttypid
    LEFT JOIN pg_index i ON i.indrelid = c.oid AND i.indisprimary
    WHERE n.nspname = $1
      AND c.relname = $2
      AND c.relkind IN ('r', 'p')
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

/// Catalog backed by the live database
pub struct PgCatalog {
    pool: PgPool,
    publication: String,
    /// Tables already added to the publication by this process
    published: Mutex<HashSet<(String, String)>>,
}

impl PgCatalog {
    pub fn new(pool: PgPool, publication: impl Into<String>) -> Self {
        Self {
            pool,
            publication: publication.into(),
            published: Mutex::new(HashSet::new()),
        }
    }

    pub fn publication(&self) -> &str {
        &self.publication
    }

    /// Create the publication if it does not exist yet
    pub async fn ensure_publication(&self) -> PgResult<()> {
        let client = self.pool.get().await?;
        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&self.publication],
            )
            .await?
            .is_some();
        if exists {
            debug!(publication = %self.publication, "Publication exists");
            return Ok(());
        }

        let sql = format!("CREATE PUBLICATION {}", quote_identifier(&self.publication));
        match client.batch_execute(&sql).await.map_err(PgError::from) {
            Ok(()) => {
                info!(publication = %self.publication, "Created publication");
                Ok(())
            }
            Err(e) if e.is_duplicate_object() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resolve the schema of `schema.table`
    pub async fn table_schema(&self, schema: &str, table: &str) -> PgResult<TableSchema> {
        let client = self.pool.get().await?;
        let rows = client.query(TABLE_COLUMNS_QUERY, &[&schema, &table]).await?;
        if rows.is_empty() {
            return Err(PgError::TableNotFound(quote_relation(schema, table)));
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0)?;
            let type_name: String = row.try_get(1)?;
            let not_null: bool = row.try_get(2)?;
            let type_mod: i32 = row.try_get(3)?;
            let ndims: i32 = row.try_get(4)?;
            let pk_position: Option<i32> = row.try_get(5)?;

            columns.push(describe_column(
                name,
                &type_name,
                not_null,
                type_mod,
                ndims,
                pk_position,
            ));
        }
        debug!(schema, table, columns = columns.len(), "Loaded table schema");
        Ok(TableSchema::new(schema, table, columns))
    }

    /// Add `schema.table` to the publication and make updates and deletes
    /// carry the full old row
    pub async fn publish_table(&self, schema: &str, table: &str) -> PgResult<()> {
        let key = (schema.to_string(), table.to_string());
        if self.published.lock().contains(&key) {
            return Ok(());
        }

        let relation = quote_relation(schema, table);
        let client = self.pool.get().await?;

        let add = format!(
            "ALTER PUBLICATION {} ADD TABLE {relation}",
            quote_identifier(&self.publication)
        );
        match client.batch_execute(&add).await.map_err(PgError::from) {
            Ok(()) => info!(table = %relation, "Added table to publication"),
            Err(e) if e.is_duplicate_object() => {
                debug!(table = %relation, "Table already published")
            }
            Err(e) if e.sql_state() == Some(UNDEFINED_TABLE) => {
                return Err(PgError::TableNotFound(relation))
            }
            Err(e) => return Err(e),
        }

        client
            .batch_execute(&format!("ALTER TABLE {relation} REPLICA IDENTITY FULL"))
            .await?;

        self.published.lock().insert(key);
        Ok(())
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn load_table_schema(&self, schema: &str, table: &str) -> electric_core::Result<TableSchema> {
        Ok(self.table_schema(schema, table).await?)
    }

    async fn add_to_publication(&self, schema: &str, table: &str) -> electric_core::Result<()> {
        Ok(self.publish_table(schema, table).await?)
    }
}

/// Build a column description from catalog attributes. Array types are
/// described by their element type plus dimensions.
fn describe_column(
    name: String,
    type_name: &str,
    not_null: bool,
    type_mod: i32,
    ndims: i32,
    pk_position: Option<i32>,
) -> Column {
    let (element, array_dims) = element_type(type_name);
    let dims = if array_dims > 0 {
        (ndims.max(1)) as u32
    } else {
        0
    };

    let mut column = Column::new(name, element)
        .with_not_null(not_null)
        .with_dims(dims)
        .with_type_mod(type_mod);
    if let Some(position) = pk_position.filter(|p| *p > 0) {
        column = column.with_pk_index((position - 1) as u32);
    }
    column
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_primary_key() {
        let col = describe_column("id".into(), "int8", true, -1, 0, Some(2));
        assert_eq!(col.type_name, "int8");
        assert_eq!(col.pk_index, Some(1));
        assert!(col.not_null);
        assert_eq!(col.dims, 0);
    }

    #[test]
    fn test_describe_varchar() {
        let col = describe_column("email".into(), "varchar", false, 259, 0, None);
        assert_eq!(col.max_length, 255);
        assert_eq!(col.pk_index, None);
        assert!(!col.not_null);
    }

    #[test]
    fn test_describe_numeric() {
        // numeric(10, 2)
        let typmod = ((10 << 16) | 2) + 4;
        let col = describe_column("price".into(), "numeric", false, typmod, 0, None);
        assert_eq!(col.precision, 10);
        assert_eq!(col.scale, 2);
    }

    #[test]
    fn test_describe_array() {
        let col = describe_column("tags".into(), "_text", false, -1, 0, None);
        assert_eq!(col.type_name, "text");
        assert_eq!(col.dims, 1);

        let col = describe_column("grid".into(), "_int4", false, -1, 2, None);
        assert_eq!(col.type_name, "int4");
        assert_eq!(col.dims, 2);
    }
}
