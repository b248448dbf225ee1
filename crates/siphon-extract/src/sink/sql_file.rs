//! Replayable SQL file sink
//!
//! One `.sql` file per descriptor, holding a header, one INSERT per row and
//! a footer that restores trigger and replication settings.

use async_trait::async_trait;
use chrono::Local;
use siphon_rdbc::prelude::{PostgresDialect, SqlDialect};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::info;

use super::{BatchSink, StreamInfo, StreamSource};
use crate::cursor::Batch;
use crate::error::SinkError;

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    qualified: String,
    rows: u64,
}

/// Writes each stream to a replayable `.sql` file of INSERT statements.
///
/// Table exports are wrapped in statements that disable triggers and
/// truncate the target first, so the file restores the table as extracted.
pub struct SqlFileSink {
    dir: PathBuf,
    dialect: PostgresDialect,
    files: Mutex<HashMap<String, OpenFile>>,
}

impl SqlFileSink {
    /// Write files into `dir`, creating it if needed
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            dialect: PostgresDialect,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of an open stream's file
    pub async fn path_of(&self, descriptor_id: &str) -> Option<PathBuf> {
        self.files
            .lock()
            .await
            .get(descriptor_id)
            .map(|f| f.path.clone())
    }

    fn file_stem(stream: &StreamInfo) -> String {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        match stream.source {
            StreamSource::Table { .. } => {
                format!("{}_{}_{}", stream.target.schema, stream.target.table, timestamp)
            }
            StreamSource::Query { .. } => format!(
                "{}_{}_{}_custom_query",
                stream.target.schema, stream.target.table, timestamp
            ),
        }
    }

    /// Create a file that does not clash with one written in the same second
    async fn create_unique(&self, stem: &str) -> Result<(PathBuf, File), SinkError> {
        let mut n = 0u32;
        loop {
            let name = if n == 0 {
                format!("{}.sql", stem)
            } else {
                format!("{}_{}.sql", stem, n)
            };
            let path = self.dir.join(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && n < 1000 => n += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn header(&self, stream: &StreamInfo, qualified: &str) -> String {
        match &stream.source {
            StreamSource::Table { .. } => {
                let mut out = format!("-- Backup of {}\n", qualified);
                if stream.resumed {
                    out.push_str(&format!("-- Resumed extraction of {}\n", stream.descriptor_id));
                }
                out.push_str("SET session_replication_role = 'replica';\n\n");
                out.push_str(&format!("ALTER TABLE {} DISABLE TRIGGER ALL;\n\n", qualified));
                if !stream.resumed {
                    out.push_str(&format!("TRUNCATE TABLE {};\n\n", qualified));
                }
                out
            }
            StreamSource::Query { query } => format!(
                "-- Custom Query Backup for {}\n-- Original Query: {}\n\n",
                qualified,
                query.trim().replace('\n', "\n-- ")
            ),
        }
    }

    fn footer(stream: &StreamInfo, qualified: &str, completed: bool) -> String {
        let mut out = String::new();
        if !completed {
            out.push_str("\n-- Extraction incomplete; rows above are a prefix of the source\n");
        }
        if let StreamSource::Table { .. } = stream.source {
            out.push_str(&format!("\nALTER TABLE {} ENABLE TRIGGER ALL;\n", qualified));
            out.push_str("\nSET session_replication_role = 'origin';\n");
        }
        out
    }

    fn render_inserts(&self, qualified: &str, batch: &Batch) -> String {
        let mut out = String::new();
        for row in &batch.rows {
            let columns: Vec<String> = row
                .columns()
                .iter()
                .map(|c| self.dialect.quote_identifier(c))
                .collect();
            let values: Vec<String> = row.values().iter().map(|v| v.to_sql_literal()).collect();
            out.push_str(&format!(
                "INSERT INTO {} ({}) VALUES ({});\n",
                qualified,
                columns.join(", "),
                values.join(", ")
            ));
        }
        out
    }
}

#[async_trait]
impl BatchSink for SqlFileSink {
    fn name(&self) -> &'static str {
        "sql-file"
    }

    async fn open_stream(&self, stream: &StreamInfo) -> Result<(), SinkError> {
        let qualified = self
            .dialect
            .qualified_table(Some(&stream.target.schema), &stream.target.table);
        let (path, file) = self.create_unique(&Self::file_stem(stream)).await?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(self.header(stream, &qualified).as_bytes())
            .await?;

        info!(descriptor = %stream.descriptor_id, path = %path.display(), "writing backup file");
        self.files.lock().await.insert(
            stream.descriptor_id.clone(),
            OpenFile {
                path,
                writer,
                qualified,
                rows: 0,
            },
        );
        Ok(())
    }

    async fn write_batch(&self, stream: &StreamInfo, batch: &Batch) -> Result<(), SinkError> {
        let mut files = self.files.lock().await;
        let file = files.get_mut(&stream.descriptor_id).ok_or_else(|| {
            SinkError::fatal(format!("stream {} is not open", stream.descriptor_id))
        })?;

        if batch.is_empty() {
            return Ok(());
        }
        let text = self.render_inserts(&file.qualified, batch);
        file.writer.write_all(text.as_bytes()).await?;
        file.rows += batch.len() as u64;
        Ok(())
    }

    async fn close_stream(&self, stream: &StreamInfo, completed: bool) -> Result<(), SinkError> {
        let Some(mut file) = self.files.lock().await.remove(&stream.descriptor_id) else {
            return Ok(());
        };
        file.writer
            .write_all(Self::footer(stream, &file.qualified, completed).as_bytes())
            .await?;
        file.writer.flush().await?;

        info!(
            descriptor = %stream.descriptor_id,
            path = %file.path.display(),
            rows = file.rows,
            completed,
            "Completed backup"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{OutputTarget, SourceDescriptor};
    use siphon_rdbc::prelude::{Row, Value};

    fn row(id: i64, name: Option<&str>) -> Row {
        Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int64(id), name.map(Value::from).unwrap_or(Value::Null)],
        )
    }

    fn batch(info: &StreamInfo, rows: Vec<Row>) -> Batch {
        Batch {
            descriptor_id: info.descriptor_id.clone(),
            target: info.target.clone(),
            sequence: 1,
            rows,
        }
    }

    #[tokio::test]
    async fn test_table_stream_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqlFileSink::new(dir.path()).await.unwrap();
        let info = StreamInfo::for_descriptor(&SourceDescriptor::table("public", "users"), false);

        sink.open_stream(&info).await.unwrap();
        let path = sink.path_of(&info.descriptor_id).await.unwrap();
        sink.write_batch(&info, &batch(&info, vec![row(1, Some("O'Brien")), row(2, None)]))
            .await
            .unwrap();
        sink.close_stream(&info, true).await.unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("public_users_") && name.ends_with(".sql"), "{name}");

        let text = std::fs::read_to_string(&path).unwrap();
        let expected_start = "-- Backup of \"public\".\"users\"\n\
            SET session_replication_role = 'replica';\n\n\
            ALTER TABLE \"public\".\"users\" DISABLE TRIGGER ALL;\n\n\
            TRUNCATE TABLE \"public\".\"users\";\n\n";
        assert!(text.starts_with(expected_start), "{text}");
        assert!(text.contains(
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES (1, 'O''Brien');\n"
        ));
        assert!(text.contains("VALUES (2, NULL);\n"));
        assert!(text.ends_with(
            "\nALTER TABLE \"public\".\"users\" ENABLE TRIGGER ALL;\n\nSET session_replication_role = 'origin';\n"
        ));
    }

    #[tokio::test]
    async fn test_custom_query_stream_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqlFileSink::new(dir.path()).await.unwrap();
        let d = SourceDescriptor::custom_query(
            "SELECT id\nFROM users",
            OutputTarget::new("public", "custom_query_result"),
        );
        let info = StreamInfo::for_descriptor(&d, false);

        sink.open_stream(&info).await.unwrap();
        let path = sink.path_of(&info.descriptor_id).await.unwrap();
        sink.close_stream(&info, true).await.unwrap();

        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_custom_query.sql"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(
            "-- Custom Query Backup for \"public\".\"custom_query_result\"\n-- Original Query: SELECT id\n-- FROM users\n"
        ));
        assert!(!text.contains("TRUNCATE"));
    }

    #[tokio::test]
    async fn test_streams_sharing_a_target_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqlFileSink::new(dir.path()).await.unwrap();
        let a = StreamInfo::for_descriptor(
            &SourceDescriptor::table("public", "events").with_id("a"),
            false,
        );
        let b = StreamInfo::for_descriptor(
            &SourceDescriptor::table("public", "events").with_id("b"),
            false,
        );

        sink.open_stream(&a).await.unwrap();
        sink.open_stream(&b).await.unwrap();
        assert_ne!(sink.path_of("a").await, sink.path_of("b").await);
    }

    #[tokio::test]
    async fn test_resumed_stream_skips_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqlFileSink::new(dir.path()).await.unwrap();
        let info = StreamInfo::for_descriptor(&SourceDescriptor::table("public", "users"), true);

        sink.open_stream(&info).await.unwrap();
        let path = sink.path_of(&info.descriptor_id).await.unwrap();
        sink.close_stream(&info, false).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("TRUNCATE"));
        assert!(text.contains("Extraction incomplete"));
        assert!(text.contains("ENABLE TRIGGER ALL"));
    }

    #[tokio::test]
    async fn test_text_form_values_are_quoted_literals() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqlFileSink::new(dir.path()).await.unwrap();
        let info = StreamInfo::for_descriptor(&SourceDescriptor::table("public", "probe"), false);
        let r = Row::new(
            vec!["id".into(), "dur".into(), "tags".into(), "addr".into()],
            vec![
                Value::Int32(1),
                Value::Literal("2 days".into()),
                Value::Literal("{a,b}".into()),
                Value::Literal("10.0.0.1".into()),
            ],
        );

        sink.open_stream(&info).await.unwrap();
        let path = sink.path_of(&info.descriptor_id).await.unwrap();
        sink.write_batch(&info, &batch(&info, vec![r])).await.unwrap();
        sink.close_stream(&info, true).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("VALUES (1, '2 days', '{a,b}', '10.0.0.1');\n"), "{text}");
    }

    #[tokio::test]
    async fn test_write_without_open_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqlFileSink::new(dir.path()).await.unwrap();
        let info = StreamInfo::for_descriptor(&SourceDescriptor::table("public", "users"), false);

        let err = sink.write_batch(&info, &batch(&info, vec![row(1, None)])).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
