//! Normalized extraction units
//!
//! A [`SourceDescriptor`] is what the engine actually drives. It is produced
//! from configuration (see [`crate::config`]) and validated once; afterwards
//! it is immutable and shared read-only with the cursor and the sink.

use serde::{Deserialize, Serialize};
use siphon_rdbc::security::validate_sql_identifier;
use siphon_rdbc::Value;
use std::fmt;

use crate::error::{ExtractError, Result};

/// Destination of a descriptor's batches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputTarget {
    /// Output schema
    pub schema: String,
    /// Output table
    pub table: String,
}

impl OutputTarget {
    /// Create a target
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// What a descriptor reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// A whole table, optionally filtered
    TableExport {
        /// Source schema
        source_schema: String,
        /// Source table
        source_table: String,
        /// Predicate applied verbatim
        where_clause: Option<String>,
        /// Explicit ordering key; empty means discover the primary key
        key_columns: Vec<String>,
        /// Page by row offset when no key exists
        offset_fallback: bool,
    },
    /// An arbitrary SELECT, opaque to the engine
    CustomQuery {
        /// Statement text
        query: String,
        /// Positional parameters bound as `$1..$n`
        params: Vec<Value>,
    },
}

/// One configured extraction unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Stable identifier, used in logs, reports and checkpoints
    pub id: String,
    /// Source definition
    pub kind: SourceKind,
    /// Where batches go
    pub output: OutputTarget,
    /// Rows per fetch
    pub batch_size: u32,
    /// Cap on fetches; `None` means unbounded
    pub max_batches: Option<u32>,
}

impl SourceDescriptor {
    /// Table export writing to a target of the same name.
    ///
    /// Uses a batch size of 10000 and no batch cap.
    pub fn table(schema: impl Into<String>, table: impl Into<String>) -> Self {
        let schema = schema.into();
        let table = table.into();
        Self {
            id: format!("{}.{}", schema, table),
            output: OutputTarget::new(schema.clone(), table.clone()),
            kind: SourceKind::TableExport {
                source_schema: schema,
                source_table: table,
                where_clause: None,
                key_columns: Vec::new(),
                offset_fallback: true,
            },
            batch_size: crate::config::DEFAULT_BATCH_SIZE as u32,
            max_batches: None,
        }
    }

    /// Custom query writing to `output`
    pub fn custom_query(query: impl Into<String>, output: OutputTarget) -> Self {
        Self {
            id: format!("query:{}", output),
            kind: SourceKind::CustomQuery {
                query: query.into(),
                params: Vec::new(),
            },
            output,
            batch_size: crate::config::DEFAULT_BATCH_SIZE as u32,
            max_batches: None,
        }
    }

    /// Override the identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set rows per fetch
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Cap the number of fetches
    pub fn with_max_batches(mut self, max_batches: u32) -> Self {
        self.max_batches = Some(max_batches);
        self
    }

    /// Set the filter of a table export; ignored for custom queries
    pub fn with_where(mut self, predicate: impl Into<String>) -> Self {
        if let SourceKind::TableExport { where_clause, .. } = &mut self.kind {
            *where_clause = Some(predicate.into());
        }
        self
    }

    /// Set the ordering key of a table export; ignored for custom queries
    pub fn with_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let SourceKind::TableExport { key_columns, .. } = &mut self.kind {
            *key_columns = columns.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Allow or forbid row-offset paging for a keyless table
    pub fn with_offset_fallback(mut self, enabled: bool) -> Self {
        if let SourceKind::TableExport {
            offset_fallback, ..
        } = &mut self.kind
        {
            *offset_fallback = enabled;
        }
        self
    }

    /// Bind parameters of a custom query; ignored for table exports
    pub fn with_params(mut self, values: Vec<Value>) -> Self {
        if let SourceKind::CustomQuery { params, .. } = &mut self.kind {
            *params = values;
        }
        self
    }

    /// Whether this is a custom query
    pub fn is_custom_query(&self) -> bool {
        matches!(self.kind, SourceKind::CustomQuery { .. })
    }

    /// Check the structural invariants.
    ///
    /// Identifiers end up inside generated SQL, so they must satisfy
    /// [`validate_sql_identifier`]; the SQL of a `where_clause` or custom
    /// query is taken as written.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ExtractError::config(format!("{}: {}", self.id, msg)));

        if self.batch_size == 0 {
            return fail("batch_size must be greater than 0".into());
        }
        if self.max_batches == Some(0) {
            return fail("max_batches must be greater than 0".into());
        }
        if self.output.schema.is_empty() {
            return fail("output_schema must not be empty".into());
        }
        if self.output.table.is_empty() {
            return fail("output_table_name must not be empty".into());
        }
        check_identifier(&self.id, "output_schema", &self.output.schema)?;
        check_identifier(&self.id, "output_table_name", &self.output.table)?;

        match &self.kind {
            SourceKind::TableExport {
                source_schema,
                source_table,
                where_clause,
                key_columns,
                ..
            } => {
                if source_table.is_empty() {
                    return fail("table name is required".into());
                }
                check_identifier(&self.id, "schema", source_schema)?;
                check_identifier(&self.id, "name", source_table)?;
                for column in key_columns {
                    check_identifier(&self.id, "key_columns", column)?;
                }
                if where_clause.as_deref().is_some_and(|w| w.trim().is_empty()) {
                    return fail("where_clause must not be blank".into());
                }
            }
            SourceKind::CustomQuery { query, .. } => {
                if query.trim().is_empty() {
                    return fail("query is required".into());
                }
            }
        }
        Ok(())
    }
}

fn check_identifier(id: &str, field: &str, value: &str) -> Result<()> {
    validate_sql_identifier(value)
        .map_err(|e| ExtractError::config(format!("{}: invalid {} '{}': {}", id, field, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_defaults() {
        let d = SourceDescriptor::table("public", "orders");
        assert_eq!(d.id, "public.orders");
        assert_eq!(d.output, OutputTarget::new("public", "orders"));
        assert_eq!(d.batch_size, 10_000);
        assert_eq!(d.max_batches, None);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_builders_only_touch_matching_kind() {
        let q = SourceDescriptor::custom_query("SELECT 1", OutputTarget::new("public", "one"))
            .with_where("x > 1")
            .with_key_columns(["id"]);
        assert!(matches!(q.kind, SourceKind::CustomQuery { .. }));

        let t = SourceDescriptor::table("public", "t").with_params(vec![Value::Int32(1)]);
        assert!(!t.is_custom_query());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let err = SourceDescriptor::table("public", "t")
            .with_batch_size(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("batch_size"));

        let err = SourceDescriptor::table("public", "t")
            .with_max_batches(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_batches"));
    }

    #[test]
    fn test_identifiers_checked() {
        let d = SourceDescriptor::table("public", "t; DROP TABLE x");
        assert!(matches!(d.validate(), Err(ExtractError::Config(_))));

        let d = SourceDescriptor::table("public", "t").with_key_columns(["id\""]);
        assert!(d.validate().is_err());

        let d = SourceDescriptor::custom_query("  ", OutputTarget::new("public", "r"));
        assert!(d.validate().unwrap_err().to_string().contains("query is required"));
    }

    #[test]
    fn test_empty_output_rejected() {
        let d = SourceDescriptor::custom_query("SELECT 1", OutputTarget::new("", "r"));
        assert!(d.validate().unwrap_err().to_string().contains("output_schema"));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(OutputTarget::new("archive", "events").to_string(), "archive.events");
    }
}
