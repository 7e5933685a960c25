pub mod csv_file;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::ledger::IdentifierSet;
use crate::record::Record;

pub use csv_file::CsvSink;
pub use sqlite::SqliteSink;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable, append-only store of records keyed by id.
///
/// `append` must be safe to call from several workers with disjoint batches, and must
/// never write an id that is already committed.
pub trait PersistenceSink: Send + Sync + 'static {
    fn load_known_ids(&self) -> Result<IdentifierSet, SinkError>;

    /// Returns the number of records actually written.
    fn append(&self, records: &[Record]) -> Result<usize, SinkError>;

    fn count(&self) -> Result<usize, SinkError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    /// SQLite for `.sqlite`/`.db` paths, CSV otherwise
    #[default]
    Auto,
    Csv,
    Sqlite,
}

impl SinkFormat {
    pub fn resolve(self, path: &Path) -> SinkFormat {
        match self {
            SinkFormat::Auto => match path.extension().and_then(|e| e.to_str()) {
                Some("sqlite" | "sqlite3" | "db") => SinkFormat::Sqlite,
                _ => SinkFormat::Csv,
            },
            other => other,
        }
    }
}

pub fn open(path: &Path, format: SinkFormat) -> Result<Arc<dyn PersistenceSink>, SinkError> {
    Ok(match format.resolve(path) {
        SinkFormat::Sqlite => Arc::new(SqliteSink::open(path)?),
        _ => Arc::new(CsvSink::new(path)),
    })
}
