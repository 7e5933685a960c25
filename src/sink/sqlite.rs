use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::info;

use super::{PersistenceSink, SinkError};
use crate::ledger::IdentifierSet;
use crate::record::Record;

pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn init_schema(conn: &Connection) -> Result<(), SinkError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS listings (
            id             TEXT PRIMARY KEY,
            title          TEXT NOT NULL,
            price          TEXT,
            specifications TEXT NOT NULL DEFAULT '[]',
            city           TEXT NOT NULL,
            link           TEXT,
            harvested_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_listings_city ON listings(city);
        ",
    )?;
    Ok(())
}

impl PersistenceSink for SqliteSink {
    fn load_known_ids(&self) -> Result<IdentifierSet, SinkError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM listings")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<IdentifierSet, _>>()?;
        Ok(ids)
    }

    fn append(&self, records: &[Record]) -> Result<usize, SinkError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO listings (id, title, price, specifications, city, link)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in records {
                let specs = serde_json::to_string(&r.specifications)?;
                count += stmt.execute(rusqlite::params![
                    r.id, r.title, r.price, specs, r.city, r.link,
                ])?;
            }
        }
        tx.commit()?;
        if count > 0 {
            info!("Inserted {} listings", count);
        }
        Ok(count)
    }

    fn count(&self) -> Result<usize, SinkError> {
        let n: usize = self
            .conn()
            .query_row("SELECT COUNT(*) FROM listings", [], |r| r.get(0))?;
        Ok(n)
    }
}
