//! Mapping store: source id → destination path and native id.
//!
//! A row exists if and only if the blob was fully copied. Rows are written
//! once and only ever removed by the scrubber.

use blobmigrator_common::{MappingEntry, MigrateError, Partition, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::info;

use crate::config::is_identifier;
use crate::db::{store_err, Db};

#[derive(Clone)]
pub struct MappingStore {
    db: Db,
    table: String,
}

impl MappingStore {
    /// Open (creating if needed) the mapping table `table`.
    pub fn open(db: Db, table: &str) -> Result<Self> {
        if !is_identifier(table) {
            return Err(MigrateError::Configuration(format!(
                "invalid mapping store name: {:?}",
                table
            )));
        }
        {
            let conn = db.lock()?;
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (
                    old_id            TEXT PRIMARY KEY,
                    destination_path  TEXT NOT NULL,
                    new_id            TEXT NOT NULL,
                    migrated_at       TEXT NOT NULL
                );"
            ))
            .map_err(store_err)?;
        }
        Ok(Self { db, table: table.to_string() })
    }

    pub fn exists(&self, old_id: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM \"{}\" WHERE old_id = ?1", self.table),
                params![old_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    /// Record a completed migration.
    ///
    /// The path is normalized to start with `/` and `derive_id` is applied to
    /// the normalized path. If an entry for `old_id` already exists it is
    /// returned untouched.
    pub fn put(
        &self,
        old_id: &str,
        destination_path: &str,
        derive_id: impl FnOnce(&str) -> String,
    ) -> Result<MappingEntry> {
        if old_id.is_empty() {
            return Err(MigrateError::Validation("old blob id is required".into()));
        }
        if destination_path.is_empty() {
            return Err(MigrateError::Validation("destination path is required".into()));
        }
        let path = if destination_path.starts_with('/') {
            destination_path.to_string()
        } else {
            format!("/{}", destination_path)
        };
        let new_id = derive_id(&path);

        let inserted = {
            let conn = self.db.lock()?;
            conn.execute(
                &format!(
                    "INSERT INTO \"{}\" (old_id, destination_path, new_id, migrated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(old_id) DO NOTHING",
                    self.table
                ),
                params![old_id, path, new_id, Utc::now().to_rfc3339()],
            )
            .map_err(store_err)?
        };

        if inserted == 0 {
            return self
                .get(old_id)?
                .ok_or_else(|| MigrateError::Store(format!("mapping for {} vanished", old_id)));
        }

        info!(old_id = %old_id, new_id = %new_id, path = %path, "Migrated blob");
        Ok(MappingEntry {
            old_id: old_id.to_string(),
            destination_path: path,
            new_id,
        })
    }

    pub fn get(&self, old_id: &str) -> Result<Option<MappingEntry>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!(
                "SELECT old_id, destination_path, new_id FROM \"{}\" WHERE old_id = ?1",
                self.table
            ),
            params![old_id],
            |row| {
                Ok(MappingEntry {
                    old_id: row.get(0)?,
                    destination_path: row.get(1)?,
                    new_id: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(store_err)
    }

    /// Delete one entry. Returns false if there was none.
    pub fn delete(&self, old_id: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let n = conn
            .execute(
                &format!("DELETE FROM \"{}\" WHERE old_id = ?1", self.table),
                params![old_id],
            )
            .map_err(store_err)?;
        Ok(n > 0)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.db.lock()?;
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", self.table), [], |row| row.get(0))
            .map_err(store_err)?;
        Ok(n as u64)
    }

    /// Entries with id greater than `after`, in id order.
    pub fn page(&self, after: Option<&str>, limit: usize) -> Result<Vec<MappingEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT old_id, destination_path, new_id FROM \"{}\"
                 WHERE old_id > ?1 ORDER BY old_id LIMIT ?2",
                self.table
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![after.unwrap_or(""), limit as i64], |row| {
                Ok(MappingEntry {
                    old_id: row.get(0)?,
                    destination_path: row.get(1)?,
                    new_id: row.get(2)?,
                })
            })
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    /// One page of the entries owned by `partition`, plus the resume point
    /// (`None` once the keyspace is exhausted).
    pub fn page_partition(
        &self,
        partition: Partition,
        after: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<MappingEntry>, Option<String>)> {
        let scanned = self.page(after, limit)?;
        let next_after = if scanned.len() < limit {
            None
        } else {
            scanned.last().map(|e| e.old_id.clone())
        };
        let owned = scanned
            .into_iter()
            .filter(|e| partition.contains(&e.old_id))
            .collect();
        Ok((owned, next_after))
    }
}
