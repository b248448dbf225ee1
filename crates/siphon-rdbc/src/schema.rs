//! Schema discovery for siphon-rdbc
//!
//! Read-only introspection needed to pick a pagination key:
//! - column list in ordinal order
//! - primary key columns in key order
//! - table existence

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::types::{ColumnMetadata, TableMetadata};

/// Describe `schema.table`, or `None` when the table has no visible columns.
pub async fn describe_table(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    schema: &str,
    table: &str,
) -> Result<Option<TableMetadata>> {
    let sql = dialect.list_columns_sql(Some(schema), table);
    let rows = conn.query(&sql, &[]).await?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut meta = TableMetadata::new(table);
    meta.schema = Some(schema.to_string());

    for row in &rows {
        let name = row
            .get_by_name("column_name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let type_name = row
            .get_by_name("data_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let nullable = row
            .get_by_name("nullable")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let ordinal = row
            .get_by_name("ordinal_position")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as u32;

        let primary_key_ordinal = row
            .get_by_name("pk_ordinal")
            .and_then(|v| v.as_i64())
            .map(|v| v as u32);

        meta.columns.push(ColumnMetadata {
            name,
            type_name,
            nullable,
            primary_key_ordinal,
            ordinal,
        });
    }

    Ok(Some(meta))
}

/// Whether `schema.table` exists
pub async fn table_exists(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    schema: &str,
    table: &str,
) -> Result<bool> {
    let sql = dialect.table_exists_sql(Some(schema), table);
    let row = conn.query_one(&sql, &[]).await?;
    Ok(row
        .and_then(|r| r.get(0).and_then(|v| v.as_bool()))
        .unwrap_or(false))
}
