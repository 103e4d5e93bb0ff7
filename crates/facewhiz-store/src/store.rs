//! SQLite descriptor store.
//!
//! All writes touching more than one row run inside an `IMMEDIATE`
//! transaction, and every multi-statement read runs inside a deferred
//! one, so a descriptor is never observed without its person.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use facewhiz_core::{
    Descriptor, DescriptorError, EuclideanMatcher, GalleryEntry, MatchError, Matcher, NewPerson,
    Person, PersonProfile, Recognition,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::schema;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("person not found: {0}")]
    NotFound(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("descriptor length mismatch: stored={stored}, provided={query}")]
    DimensionMismatch { stored: usize, query: usize },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("descriptor encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// True for failures of the persistence layer itself, as opposed to
    /// client errors (unknown person, bad vector, wrong dimensionality).
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::Io(_) | Self::Encode(_))
    }
}

impl From<MatchError> for StoreError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::InvalidDescriptor(e) => Self::InvalidDescriptor(e),
            MatchError::DimensionMismatch { stored, query } => {
                Self::DimensionMismatch { stored, query }
            }
        }
    }
}

/// Row counts, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub people_count: u64,
    pub descriptors_count: u64,
}

const PERSON_COLUMNS: &str =
    "id, name, email, phone, department, role, image_url, created_at";

/// Owned handle to the registry database.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        schema::init(&conn, true)?;

        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        let stats = store.stats()?;
        tracing::info!(
            path = %path.display(),
            people = stats.people_count,
            descriptors = stats.descriptors_count,
            "descriptor store opened"
        );
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn, false)?;
        Ok(Self { conn, path: None })
    }

    /// Database file path, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flush and close the underlying connection.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        tracing::info!("descriptor store closed");
        Ok(())
    }

    /// Register a person, optionally attaching one descriptor.
    ///
    /// Best-effort biometric attach: an invalid descriptor, or a failure
    /// to write it, is logged and the person is still created. Only a
    /// failure to write the person row itself is returned.
    pub fn create_person(
        &mut self,
        attrs: NewPerson,
        descriptor: Option<Vec<f32>>,
    ) -> Result<Person, StoreError> {
        let person = attrs.into_person(Uuid::new_v4().to_string(), now());

        let descriptor = descriptor.and_then(|values| match Descriptor::new(values) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(error = %e, "registration descriptor dropped");
                None
            }
        });

        self.conn.execute(
            "INSERT INTO people (id, name, email, phone, department, role, image_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                person.id,
                person.name,
                person.email,
                person.phone,
                person.department,
                person.role,
                person.image_url,
                format_timestamp(&person.created_at),
            ],
        )?;
        tracing::info!(person_id = %person.id, name = %person.name, "person registered");

        if let Some(descriptor) = descriptor {
            match insert_descriptor(&self.conn, &person.id, &descriptor) {
                Ok(descriptor_id) => tracing::info!(
                    person_id = %person.id,
                    %descriptor_id,
                    dims = descriptor.len(),
                    "descriptor attached at registration"
                ),
                Err(e) => tracing::warn!(
                    person_id = %person.id,
                    error = %e,
                    "descriptor save skipped; person kept"
                ),
            }
        }

        Ok(person)
    }

    /// Attach an additional descriptor to an existing person.
    pub fn add_descriptor(
        &mut self,
        person_id: &str,
        values: Vec<f32>,
    ) -> Result<String, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !person_exists(&tx, person_id)? {
            return Err(StoreError::NotFound(person_id.to_string()));
        }
        let descriptor = Descriptor::new(values)?;
        let descriptor_id = insert_descriptor(&tx, person_id, &descriptor)?;
        tx.commit()?;

        tracing::info!(
            person_id,
            %descriptor_id,
            dims = descriptor.len(),
            "descriptor added"
        );
        Ok(descriptor_id)
    }

    /// Fetch a person with every valid descriptor attached to them.
    pub fn get_person(&self, person_id: &str) -> Result<PersonProfile, StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        let person = tx
            .query_row(
                &format!("SELECT {PERSON_COLUMNS} FROM people WHERE id = ?1"),
                params![person_id],
                map_person_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(person_id.to_string()))?;

        let mut stmt = tx.prepare(
            "SELECT id, descriptor FROM descriptors WHERE person_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![person_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut descriptors = Vec::new();
        for row in rows {
            let (descriptor_id, raw) = row?;
            if let Some(descriptor) = decode_descriptor(&descriptor_id, &raw) {
                descriptors.push(descriptor.into_values());
            }
        }
        drop(stmt);
        tx.finish()?;

        Ok(PersonProfile {
            person,
            descriptors,
        })
    }

    /// All people, most recently created first.
    pub fn list_people(&self) -> Result<Vec<Person>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PERSON_COLUMNS} FROM people ORDER BY created_at DESC, rowid DESC"
        ))?;
        let people = stmt
            .query_map([], map_person_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(people)
    }

    /// Delete a person and, in the same transaction, all their descriptors.
    pub fn delete_person(&mut self, person_id: &str) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !person_exists(&tx, person_id)? {
            return Err(StoreError::NotFound(person_id.to_string()));
        }
        let removed = tx.execute(
            "DELETE FROM descriptors WHERE person_id = ?1",
            params![person_id],
        )?;
        tx.execute("DELETE FROM people WHERE id = ?1", params![person_id])?;
        tx.commit()?;

        tracing::info!(person_id, descriptors = removed, "person deleted");
        Ok(())
    }

    pub fn stats(&self) -> Result<RegistryStats, StoreError> {
        let (people, descriptors): (i64, i64) = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM people), (SELECT COUNT(*) FROM descriptors)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(RegistryStats {
            people_count: people.max(0) as u64,
            descriptors_count: descriptors.max(0) as u64,
        })
    }

    /// Snapshot of every stored descriptor with its owner, in insertion order.
    ///
    /// Rows whose vector cannot be decoded are skipped.
    pub fn scan(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let gallery = scan_gallery(&tx)?;
        tx.finish()?;
        Ok(gallery)
    }

    /// Identify `query` with the default brute-force matcher.
    pub fn recognize(
        &self,
        query: &[f32],
        threshold: Option<f32>,
    ) -> Result<Recognition, StoreError> {
        self.recognize_with(&EuclideanMatcher, query, threshold)
    }

    /// Identify `query` against a consistent snapshot of the store.
    pub fn recognize_with<M: Matcher + ?Sized>(
        &self,
        matcher: &M,
        query: &[f32],
        threshold: Option<f32>,
    ) -> Result<Recognition, StoreError> {
        // Reject a malformed query before paying for the scan.
        Descriptor::new(query.to_vec())?;

        let gallery = self.scan()?;
        tracing::debug!(candidates = gallery.len(), "recognition scan");
        Ok(facewhiz_core::recognize(matcher, query, threshold, &gallery)?)
    }
}

fn scan_gallery(conn: &Connection) -> Result<Vec<GalleryEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.descriptor,
                p.id, p.name, p.email, p.phone, p.department, p.role, p.image_url, p.created_at
         FROM descriptors d
         JOIN people p ON p.id = d.person_id
         ORDER BY d.rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        let descriptor_id: String = row.get(0)?;
        let raw: String = row.get(1)?;
        let person = person_from_row(row, 2)?;
        Ok((descriptor_id, raw, person))
    })?;

    let mut gallery = Vec::new();
    for row in rows {
        let (descriptor_id, raw, person) = row?;
        if let Some(descriptor) = decode_descriptor(&descriptor_id, &raw) {
            gallery.push(GalleryEntry {
                descriptor_id,
                person,
                values: descriptor.into_values(),
            });
        }
    }
    Ok(gallery)
}

fn insert_descriptor(
    conn: &Connection,
    person_id: &str,
    descriptor: &Descriptor,
) -> Result<String, StoreError> {
    let id = Uuid::new_v4().to_string();
    let encoded = serde_json::to_string(descriptor.values())?;
    conn.execute(
        "INSERT INTO descriptors (id, person_id, descriptor, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, person_id, encoded, format_timestamp(&now())],
    )?;
    Ok(id)
}

fn person_exists(conn: &Connection, person_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM people WHERE id = ?1",
        params![person_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Decode and re-validate a stored JSON vector.
///
/// Rows that do not parse, or parse to something that is not a valid
/// descriptor, yield `None` and never reach callers or the matcher.
fn decode_descriptor(descriptor_id: &str, raw: &str) -> Option<Descriptor> {
    let values = match serde_json::from_str::<Vec<f32>>(raw) {
        Ok(values) => values,
        Err(e) => {
            tracing::debug!(descriptor_id, error = %e, "skipping unparseable stored descriptor");
            return None;
        }
    };
    match Descriptor::new(values) {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            tracing::debug!(descriptor_id, error = %e, "skipping malformed stored descriptor");
            None
        }
    }
}

fn map_person_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
    person_from_row(row, 0)
}

/// Read the person columns in `PERSON_COLUMNS` order starting at `offset`.
fn person_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Person> {
    let created_idx = offset + 7;
    let created_raw: String = row.get(created_idx)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(created_idx, Type::Text, Box::new(e))
        })?;

    Ok(Person {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        email: row.get(offset + 2)?,
        phone: row.get(offset + 3)?,
        department: row.get(offset + 4)?,
        role: row.get(offset + 5)?,
        image_url: row.get(offset + 6)?,
        created_at,
    })
}

/// Current time at the precision timestamps are stored with.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so lexicographic order is chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
