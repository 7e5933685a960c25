use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{PersistenceSink, SinkError};
use crate::ledger::IdentifierSet;
use crate::record::Record;

/// Flat CSV file: `id,title,price,specifications,city,link`.
pub struct CsvSink {
    path: PathBuf,
    /// Ids known to be in the file. Loaded lazily; the mutex also serializes writers.
    committed: Mutex<Option<IdentifierSet>>,
}

#[derive(Serialize, Deserialize)]
struct CsvRow {
    id: String,
    title: String,
    price: Option<String>,
    /// JSON array
    specifications: String,
    city: String,
    link: Option<String>,
}

impl CsvRow {
    fn from_record(r: &Record) -> Result<Self, SinkError> {
        Ok(CsvRow {
            id: r.id.clone(),
            title: r.title.clone(),
            price: r.price.clone(),
            specifications: serde_json::to_string(&r.specifications)?,
            city: r.city.clone(),
            link: r.link.clone(),
        })
    }
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            committed: Mutex::new(None),
        }
    }

    fn read_ids(&self) -> Result<IdentifierSet, SinkError> {
        if !has_content(&self.path)? {
            return Ok(IdentifierSet::new());
        }
        let mut reader = ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        let Some(col) = reader.headers()?.iter().position(|h| h == "id") else {
            return Ok(IdentifierSet::new());
        };
        let mut ids = IdentifierSet::new();
        for row in reader.records() {
            if let Some(id) = row?.get(col).filter(|id| !id.is_empty()) {
                ids.insert(id.to_string());
            }
        }
        Ok(ids)
    }
}

impl PersistenceSink for CsvSink {
    fn load_known_ids(&self) -> Result<IdentifierSet, SinkError> {
        let ids = self.read_ids()?;
        let mut committed = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        *committed = Some(ids.clone());
        Ok(ids)
    }

    fn append(&self, records: &[Record]) -> Result<usize, SinkError> {
        let mut guard = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.read_ids()?);
        }
        let committed = guard.get_or_insert_with(IdentifierSet::new);

        let mut batch_ids = IdentifierSet::new();
        let fresh: Vec<&Record> = records
            .iter()
            .filter(|r| !committed.contains(&r.id) && batch_ids.insert(r.id.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let needs_header = !has_content(&self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        for r in &fresh {
            writer.serialize(CsvRow::from_record(r)?)?;
        }
        writer.flush()?;

        committed.extend(batch_ids);
        info!("Appended {} records to {}", fresh.len(), self.path.display());
        Ok(fresh.len())
    }

    fn count(&self) -> Result<usize, SinkError> {
        Ok(self.read_ids()?.len())
    }
}

fn has_content(path: &Path) -> Result<bool, SinkError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len() > 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
