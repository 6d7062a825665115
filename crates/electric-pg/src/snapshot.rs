//! Initial snapshot queries
//!
//! Each snapshot runs in its own `REPEATABLE READ READ ONLY` transaction so
//! that the captured `pg_current_snapshot()` and the rows returned by the
//! shape query describe the same point in time.

use crate::error::{PgError, PgResult};
use crate::lsn::parse_lsn;
use crate::pool::PgPool;
use async_trait::async_trait;
use electric_core::snapshot::{snapshot_query, SNAPSHOT_INFO_QUERY, SNAPSHOT_SESSION_SETTINGS};
use electric_core::{PgSnapshot, Row, Shape, SnapshotExecutor, SnapshotResult, Value};
use tokio_postgres::IsolationLevel;
use tracing::debug;

/// Snapshot executor backed by the query pool
pub struct PgSnapshotExecutor {
    pool: PgPool,
}

impl PgSnapshotExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the snapshot of `shape`
    pub async fn snapshot(&self, shape: &Shape) -> PgResult<SnapshotResult> {
        let mut client = self.pool.get().await?;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;

        tx.batch_execute(&SNAPSHOT_SESSION_SETTINGS.join("; ")).await?;

        let info = tx.query_one(SNAPSHOT_INFO_QUERY, &[]).await?;
        let snapshot_text: String = info.try_get(0)?;
        let lsn_text: String = info.try_get(1)?;
        let pg_snapshot = PgSnapshot::parse(&snapshot_text)
            .map_err(|e| PgError::Protocol(format!("pg_current_snapshot: {e}")))?;
        let lsn = parse_lsn(&lsn_text)?;

        let sql = snapshot_query(shape);
        debug!(table = %shape.table_ref(), %sql, "Running snapshot query");
        let rows = tx.query(sql.as_str(), &[]).await?;
        tx.commit().await?;

        let rows = rows
            .iter()
            .map(|row| decode_row(shape, row))
            .collect::<PgResult<Vec<_>>>()?;
        debug!(
            table = %shape.table_ref(),
            rows = rows.len(),
            xmin = pg_snapshot.xmin,
            "Snapshot complete"
        );

        Ok(SnapshotResult {
            rows,
            pg_snapshot,
            lsn,
        })
    }
}

#[async_trait]
impl SnapshotExecutor for PgSnapshotExecutor {
    async fn execute(&self, shape: &Shape) -> electric_core::Result<SnapshotResult> {
        Ok(self.snapshot(shape).await?)
    }
}

/// Decode a text-cast result row using the shape's column types
fn decode_row(shape: &Shape, row: &tokio_postgres::Row) -> PgResult<Row> {
    let mut decoded = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let text: Option<String> = row.try_get(i)?;
        decoded.insert(column.name().to_string(), decode_value(shape, column.name(), text));
    }
    Ok(decoded)
}

fn decode_value(shape: &Shape, column: &str, text: Option<String>) -> Value {
    let Some(text) = text else {
        return Value::Null;
    };
    let type_name = shape
        .table_schema()
        .and_then(|schema| schema.column(column))
        .filter(|c| c.dims == 0)
        .map(|c| c.type_name.as_str())
        .unwrap_or("text");
    Value::decode_text(type_name, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use electric_core::{Column, TableSchema};

    fn shape() -> Shape {
        Shape::new("public", "items")
            .with_table_schema(TableSchema::new(
                "public",
                "items",
                vec![
                    Column::new("id", "int8").with_pk_index(0),
                    Column::new("price", "float8"),
                    Column::new("tags", "int4").with_dims(1),
                    Column::new("label", "text"),
                ],
            ))
            .unwrap()
    }

    #[test]
    fn test_decode_value_by_type() {
        let shape = shape();
        assert_eq!(decode_value(&shape, "id", Some("7".into())), Value::Int(7));
        assert_eq!(
            decode_value(&shape, "price", Some("1.5".into())),
            Value::Float(1.5)
        );
        assert_eq!(decode_value(&shape, "label", None), Value::Null);
    }

    #[test]
    fn test_arrays_stay_text() {
        let shape = shape();
        assert_eq!(
            decode_value(&shape, "tags", Some("{1,2}".into())),
            Value::from("{1,2}")
        );
    }

    #[test]
    fn test_query_selects_text() {
        let sql = snapshot_query(&shape());
        assert!(sql.contains("\"price\"::text AS \"price\""));
        assert!(sql.ends_with("ORDER BY \"id\""));
    }
}
