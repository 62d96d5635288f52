//! SQLite-backed identity store.
//!
//! One `faces` table, one connection. Every statement runs under the
//! connection mutex; check-then-write sequences run inside a transaction.

use crate::record::{decode_vector, encode_vector, parse_timestamp, IdentityRecord, Profile};
use crate::schema;
use chrono::Utc;
use rollcall_core::{CosineMatcher, FeatureVector, GalleryEntry, IdentityMatch, Matcher};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("identity {0} already exists")]
    DuplicateId(i64),
    #[error("identity {0} not found")]
    NotFound(i64),
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
    #[error("identity {id} is unreadable: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

const RECORD_COLUMNS: &str = "id, name, gender, position, department, person_type, entry_date, \
     feature_vector, face_image, create_time";

pub struct IdentityStore {
    conn: Mutex<Connection>,
}

impl IdentityStore {
    /// Open (or create) the store at `path`, creating the parent directory
    /// and migrating older tables.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        schema::migrate(&conn)?;
        tracing::info!(path = %path.display(), "identity store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // A panic mid-transaction drops the transaction, which rolls it back.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a new identity and return its id.
    pub fn insert(
        &self,
        profile: &Profile,
        features: &FeatureVector,
        face_image: Option<&[u8]>,
    ) -> Result<i64, StoreError> {
        profile.validate().map_err(StoreError::InvalidProfile)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let id = match profile.id {
            Some(id) => {
                if row_exists(&tx, id)? {
                    return Err(StoreError::DuplicateId(id));
                }
                id
            }
            None => tx.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM faces", [], |row| {
                row.get::<_, i64>(0)
            })?,
        };

        tx.execute(
            "INSERT INTO faces (id, name, gender, position, department, person_type, \
             entry_date, feature_vector, face_image, create_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                profile.name,
                profile.gender,
                profile.position,
                profile.department,
                profile.person_type,
                profile.entry_date,
                encode_vector(features),
                face_image,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        tracing::info!(id, name = %profile.name, dim = features.dimension(), "identity enrolled");
        Ok(id)
    }

    pub fn update_name(&self, id: i64, name: &str) -> Result<(), StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidProfile("name must not be empty".into()));
        }
        let changed = self
            .lock()
            .execute("UPDATE faces SET name = ?1 WHERE id = ?2", params![name, id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        tracing::info!(id, name, "identity renamed");
        Ok(())
    }

    /// Move a record to a new id. A no-op when both ids are equal.
    pub fn update_id(&self, old_id: i64, new_id: i64) -> Result<(), StoreError> {
        if new_id <= 0 {
            return Err(StoreError::InvalidProfile(format!(
                "id must be positive, got {new_id}"
            )));
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if !row_exists(&tx, old_id)? {
            return Err(StoreError::NotFound(old_id));
        }
        if old_id == new_id {
            return Ok(());
        }
        if row_exists(&tx, new_id)? {
            return Err(StoreError::DuplicateId(new_id));
        }
        tx.execute(
            "UPDATE faces SET id = ?1 WHERE id = ?2",
            params![new_id, old_id],
        )?;
        tx.commit()?;

        tracing::info!(old_id, new_id, "identity reassigned");
        Ok(())
    }

    /// Remove a record. Returns whether a row was deleted.
    pub fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let removed = self
            .lock()
            .execute("DELETE FROM faces WHERE id = ?1", params![id])?;
        if removed > 0 {
            tracing::info!(id, "identity removed");
        } else {
            tracing::debug!(id, "delete of unknown identity");
        }
        Ok(removed > 0)
    }

    pub fn exists(&self, id: i64) -> Result<bool, StoreError> {
        Ok(row_exists(&self.lock(), id)?)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Every readable record in ascending id order.
    pub fn all_records(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM faces ORDER BY id"))?;
        let rows = stmt.query_map([], RawRecord::from_row)?;

        let mut records = Vec::new();
        for raw in rows {
            match raw?.into_record() {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable identity"),
            }
        }
        Ok(records)
    }

    pub fn get(&self, id: i64) -> Result<IdentityRecord, StoreError> {
        let raw = self
            .lock()
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM faces WHERE id = ?1"),
                params![id],
                RawRecord::from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound(id))?;
        raw.into_record()
    }

    /// Closest stored identity whose cosine similarity is at least
    /// `threshold`. Ties resolve to the lowest id.
    pub fn find_match(
        &self,
        query: &FeatureVector,
        threshold: f32,
    ) -> Result<Option<IdentityMatch>, StoreError> {
        let gallery = self.gallery()?;
        Ok(CosineMatcher.compare(query, &gallery, threshold))
    }

    /// Ids, names and vectors only; unreadable vectors are skipped.
    fn gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, name, feature_vector FROM faces ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut gallery = Vec::new();
        for row in rows {
            let (id, name, blob) = row?;
            match decode_vector(&blob) {
                Ok(features) => gallery.push(GalleryEntry { id, name, features }),
                Err(reason) => tracing::warn!(id, %reason, "skipping identity with bad vector"),
            }
        }
        Ok(gallery)
    }

    /// Release the connection, reporting any error from SQLite.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        tracing::debug!("identity store closed");
        Ok(())
    }
}

fn row_exists(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM faces WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )
}

/// A row as stored, before vector and timestamp decoding.
struct RawRecord {
    id: i64,
    name: String,
    gender: Option<String>,
    position: Option<String>,
    department: Option<String>,
    person_type: Option<String>,
    entry_date: Option<String>,
    feature_vector: Vec<u8>,
    face_image: Option<Vec<u8>>,
    create_time: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            gender: row.get(2)?,
            position: row.get(3)?,
            department: row.get(4)?,
            person_type: row.get(5)?,
            entry_date: row.get(6)?,
            feature_vector: row.get(7)?,
            face_image: row.get(8)?,
            create_time: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<IdentityRecord, StoreError> {
        let id = self.id;
        let features =
            decode_vector(&self.feature_vector).map_err(|reason| StoreError::Corrupt { id, reason })?;
        let stamp = self.create_time.unwrap_or_default();
        let create_time = parse_timestamp(&stamp).ok_or_else(|| StoreError::Corrupt {
            id,
            reason: format!("bad create_time {stamp:?}"),
        })?;

        Ok(IdentityRecord {
            id,
            name: self.name,
            gender: self.gender.unwrap_or_default(),
            position: self.position.unwrap_or_default(),
            department: self.department.unwrap_or_default(),
            person_type: self.person_type.unwrap_or_default(),
            entry_date: self.entry_date.unwrap_or_default(),
            features,
            face_image: self.face_image,
            create_time,
        })
    }
}
