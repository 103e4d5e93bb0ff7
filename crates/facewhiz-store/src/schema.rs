use rusqlite::Connection;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idempotent schema. Descriptor rows cascade with their person.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS people (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    email       TEXT,
    phone       TEXT,
    department  TEXT,
    role        TEXT,
    image_url   TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS descriptors (
    id          TEXT PRIMARY KEY,
    person_id   TEXT NOT NULL,
    descriptor  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    FOREIGN KEY (person_id) REFERENCES people(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_descriptors_person_id ON descriptors(person_id);
CREATE INDEX IF NOT EXISTS idx_people_created_at ON people(created_at);
";

/// Apply connection pragmas and create tables.
///
/// WAL is only requested for file-backed databases; in-memory
/// connections keep SQLite's default journal.
pub(crate) fn init(conn: &Connection, file_backed: bool) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if file_backed {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "journal mode set");
    }
    conn.execute_batch(SCHEMA)
}
