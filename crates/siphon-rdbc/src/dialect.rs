//! SQL dialect abstraction for siphon-rdbc
//!
//! Statement generation for the PostgreSQL backend. Generated DML goes
//! through sea-query; paging fragments and catalog lookups are rendered
//! directly.
//!
//! - SqlDialect: trait for database-specific SQL generation
//! - Identifier quoting and parameter placeholders
//! - Multi-row parameterized INSERT for destination writes, with text-form
//!   values inlined as literals

use crate::security::escape_string_literal;
use crate::types::{Row, Value};
use sea_query::{Alias, Expr, IntoIden, PostgresQueryBuilder, Query, Table, TableRef};

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a 1-based parameter index
    fn placeholder(&self, index: usize) -> String;

    /// Quoted, optionally schema-qualified table reference
    fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        }
    }

    /// Get the SQL for checking table existence
    fn table_exists_sql(&self, schema: Option<&str>, table: &str) -> String;

    /// Get the SQL for listing columns with their primary key ordinal
    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String;

    /// Get the LIMIT/OFFSET suffix
    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String;

    /// Multi-row INSERT and its positional parameters.
    ///
    /// [`Value::Literal`] values are written inline so that the target
    /// column's input function parses them; everything else is bound.
    fn insert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        rows: &[Row],
    ) -> (String, Vec<Value>);

    /// Remove every row of a table
    fn truncate_sql(&self, schema: Option<&str>, table: &str) -> String;
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn table_exists_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_schema = '{}' AND table_name = '{}') AS present",
            schema, table
        )
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.is_nullable = 'YES' AS nullable,
                c.ordinal_position::int AS ordinal_position,
                CASE WHEN pk.column_name IS NOT NULL THEN pk.ordinal_position::int END AS pk_ordinal
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT ku.column_name, ku.ordinal_position
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                    ON tc.constraint_name = ku.constraint_name
                    AND tc.table_schema = ku.table_schema
                    AND tc.table_name = ku.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = '{}'
                    AND tc.table_name = '{}'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_schema = '{}' AND c.table_name = '{}'
            ORDER BY c.ordinal_position"#,
            schema, table, schema, table
        )
    }

    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut sql = String::new();
        if let Some(l) = limit {
            sql.push_str(&format!(" LIMIT {}", l));
        }
        if let Some(o) = offset {
            sql.push_str(&format!(" OFFSET {}", o));
        }
        sql
    }

    fn insert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        rows: &[Row],
    ) -> (String, Vec<Value>) {
        let tbl = sea_table_ref(schema, table);
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();

        let mut stmt = Query::insert();
        stmt.into_table(tbl).columns(col_idens);

        let mut params = Vec::with_capacity(rows.len() * columns.len());
        for row in rows {
            let values: Vec<_> = row
                .values()
                .iter()
                .map(|value| match value {
                    Value::Literal(_) => Expr::cust(value.to_sql_literal()),
                    _ => {
                        params.push(value.clone());
                        Expr::cust(self.placeholder(params.len()))
                    }
                })
                .collect();
            stmt.values_panic(values);
        }

        (stmt.to_string(PostgresQueryBuilder), params)
    }

    fn truncate_sql(&self, schema: Option<&str>, table: &str) -> String {
        Table::truncate()
            .table(sea_table_ref(schema, table))
            .to_string(PostgresQueryBuilder)
    }
}
