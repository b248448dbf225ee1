//! Paged reads from a source database
//!
//! Provides:
//! - SourceOffset: serializable continuation token between pages
//! - SourceQuery: what is being read (a table or an arbitrary SELECT)
//! - PageQueryBuilder: renders the bounded query for the next page and
//!   advances the offset from the rows it returned

use serde::{Deserialize, Serialize};

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Alias given to a wrapped custom query
pub const CUSTOM_QUERY_ALIAS: &str = "siphon_page";

/// Physical row order used when a table has no usable key
pub const ROW_OFFSET_ORDER: &str = "ctid";

/// Position of a paged read
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceOffset {
    /// Nothing consumed yet
    #[default]
    Start,
    /// Key of the last row delivered, in key column order
    Key(Vec<Value>),
    /// Number of rows delivered so far
    Rows(u64),
}

impl SourceOffset {
    /// Whether no rows have been consumed
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }
}

/// How a table is paged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageMode {
    /// `ORDER BY key` with rows strictly greater than the last key
    Keyset {
        /// Key columns in comparison order
        columns: Vec<String>,
    },
    /// `ORDER BY ctid` with `OFFSET`; unstable under concurrent writes
    RowOffset,
}

/// What a cursor reads
#[derive(Debug, Clone, PartialEq)]
pub enum SourceQuery {
    /// All rows of a table, optionally filtered
    Table {
        /// Schema name
        schema: String,
        /// Table name
        table: String,
        /// Verbatim filter placed inside `WHERE (...)`
        where_clause: Option<String>,
        /// Pagination strategy
        mode: PageMode,
    },
    /// An opaque SELECT wrapped in an outer LIMIT/OFFSET
    Custom {
        /// Query text; may reference `$1..$n`
        query: String,
        /// Positional parameters for the query text
        params: Vec<Value>,
    },
}

impl SourceQuery {
    /// Whether pages are addressed by row offset rather than key
    pub fn uses_row_offset(&self) -> bool {
        matches!(
            self,
            Self::Custom { .. }
                | Self::Table {
                    mode: PageMode::RowOffset,
                    ..
                }
        )
    }
}

/// Remove trailing whitespace and statement terminators from a query.
pub fn strip_terminator(query: &str) -> &str {
    query.trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Query builder for paged reads
pub struct PageQueryBuilder<'a> {
    source: &'a SourceQuery,
    dialect: &'a dyn SqlDialect,
}

impl<'a> PageQueryBuilder<'a> {
    /// Create a new query builder
    pub fn new(source: &'a SourceQuery, dialect: &'a dyn SqlDialect) -> Self {
        Self { source, dialect }
    }

    /// Build the query returning at most `batch_size` rows after `offset`
    pub fn build_page_query(
        &self,
        offset: &SourceOffset,
        batch_size: u32,
    ) -> Result<(String, Vec<Value>)> {
        let limit = Some(u64::from(batch_size));

        match self.source {
            SourceQuery::Custom { query, params } => {
                let skip = match offset {
                    SourceOffset::Start => 0,
                    SourceOffset::Rows(n) => *n,
                    SourceOffset::Key(_) => {
                        return Err(Error::config("custom query cannot resume from a key offset"))
                    }
                };
                let sql = format!(
                    "SELECT * FROM (\n{}\n) AS {}{}",
                    strip_terminator(query),
                    CUSTOM_QUERY_ALIAS,
                    self.dialect.limit_offset_sql(limit, Some(skip))
                );
                Ok((sql, params.clone()))
            }
            SourceQuery::Table {
                schema,
                table,
                where_clause,
                mode,
            } => {
                let table_ref = self.dialect.qualified_table(Some(schema), table);
                let mut conditions = Vec::new();
                let mut params = Vec::new();

                if let Some(clause) = where_clause {
                    conditions.push(format!("({})", clause));
                }

                let (order_by, suffix) = match mode {
                    PageMode::Keyset { columns } => {
                        if columns.is_empty() {
                            return Err(Error::schema("keyset pagination requires a key column"));
                        }
                        let quoted: Vec<_> = columns
                            .iter()
                            .map(|c| self.dialect.quote_identifier(c))
                            .collect();
                        match offset {
                            SourceOffset::Start => {}
                            SourceOffset::Key(key) if key.len() == columns.len() => {
                                conditions.push(self.key_predicate(&quoted, key, &mut params));
                            }
                            SourceOffset::Key(key) => {
                                return Err(Error::config(format!(
                                    "offset has {} key values but table {}.{} is keyed on {} columns",
                                    key.len(),
                                    schema,
                                    table,
                                    columns.len()
                                )))
                            }
                            SourceOffset::Rows(_) => {
                                return Err(Error::config(
                                    "keyed table cannot resume from a row offset",
                                ))
                            }
                        }
                        let order = quoted
                            .iter()
                            .map(|c| format!("{} ASC", c))
                            .collect::<Vec<_>>()
                            .join(", ");
                        (order, self.dialect.limit_offset_sql(limit, None))
                    }
                    PageMode::RowOffset => {
                        let skip = match offset {
                            SourceOffset::Start => 0,
                            SourceOffset::Rows(n) => *n,
                            SourceOffset::Key(_) => {
                                return Err(Error::config(
                                    "unkeyed table cannot resume from a key offset",
                                ))
                            }
                        };
                        (
                            ROW_OFFSET_ORDER.to_string(),
                            self.dialect.limit_offset_sql(limit, Some(skip)),
                        )
                    }
                };

                let where_sql = if conditions.is_empty() {
                    String::new()
                } else {
                    format!(" WHERE {}", conditions.join(" AND "))
                };

                let sql = format!(
                    "SELECT * FROM {}{} ORDER BY {}{}",
                    table_ref, where_sql, order_by, suffix
                );
                Ok((sql, params))
            }
        }
    }

    /// Text-form key values are inlined so the server types them by column.
    fn key_predicate(&self, quoted: &[String], key: &[Value], params: &mut Vec<Value>) -> String {
        let operands: Vec<_> = key
            .iter()
            .map(|value| match value {
                Value::Literal(_) => value.to_sql_literal(),
                _ => {
                    params.push(value.clone());
                    self.dialect.placeholder(params.len())
                }
            })
            .collect();
        if quoted.len() == 1 {
            format!("{} > {}", quoted[0], operands[0])
        } else {
            format!("({}) > ({})", quoted.join(", "), operands.join(", "))
        }
    }

    /// Offset after `rows` were delivered from `offset`
    pub fn next_offset(&self, offset: &SourceOffset, rows: &[Row]) -> Result<SourceOffset> {
        if self.source.uses_row_offset() {
            let consumed = match offset {
                SourceOffset::Rows(n) => *n,
                _ => 0,
            };
            return Ok(SourceOffset::Rows(consumed + rows.len() as u64));
        }

        let columns = match self.source {
            SourceQuery::Table {
                mode: PageMode::Keyset { columns },
                ..
            } => columns,
            _ => return Ok(offset.clone()),
        };

        let Some(last) = rows.last() else {
            return Ok(offset.clone());
        };

        let mut key = Vec::with_capacity(columns.len());
        for column in columns {
            match last.get_by_name(column) {
                Some(Value::Null) => {
                    return Err(Error::schema(format!(
                        "key column '{}' is NULL; keyset pagination needs non-null keys",
                        column
                    )))
                }
                Some(v) => key.push(v.clone()),
                None => {
                    return Err(Error::schema(format!(
                        "key column '{}' missing from result set",
                        column
                    )))
                }
            }
        }
        Ok(SourceOffset::Key(key))
    }
}
