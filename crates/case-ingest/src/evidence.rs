//! Content-addressed, deduplicated storage for raw snapshots and documents.
//!
//! Files live at `<root>/<source>/<unit>/<kind>/<filename>`. Identity is
//! `(unit_key, kind, sha256)`: identical bytes are stored once, and different
//! bytes arriving under an existing filename are written beside it with a hash
//! prefix. Nothing already on disk is ever overwritten.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::store::{decode_ts, encode_ts, Database};
use crate::types::{EvidenceRecord, IngestError, IngestResult};

const EVIDENCE_COLUMNS: &str = "id, source_id, unit_key, kind, family, filename, path, content_hash, size_bytes, run_id, captured_at";
const HASH_PREFIX_LEN: usize = 12;

/// Result of an insert: freshly stored, or an identical copy was already present.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Stored(EvidenceRecord),
    AlreadyPresent(EvidenceRecord),
}

impl PutOutcome {
    pub fn record(&self) -> &EvidenceRecord {
        match self {
            PutOutcome::Stored(r) | PutOutcome::AlreadyPresent(r) => r,
        }
    }

    pub fn into_record(self) -> EvidenceRecord {
        match self {
            PutOutcome::Stored(r) | PutOutcome::AlreadyPresent(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, PutOutcome::Stored(_))
    }
}

struct Draft<'a> {
    source: &'a str,
    unit_key: &'a str,
    kind: &'a str,
    family: Option<&'a str>,
    filename: &'a str,
    run_id: Option<&'a str>,
    bytes: &'a [u8],
}

/// Evidence directory plus its SQLite index.
pub struct EvidenceStore {
    db: Arc<Database>,
    root: PathBuf,
    clock: Arc<dyn Clock>,
    // Serializes the check-name/write/index sequence so concurrent runs cannot race on a filename.
    write_lock: Mutex<()>,
}

impl EvidenceStore {
    pub fn new(db: Arc<Database>, root: PathBuf, clock: Arc<dyn Clock>) -> IngestResult<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            db,
            root,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store an HTML snapshot of a page, named `<kind>.html`.
    pub fn put_snapshot(
        &self,
        source: &str,
        unit_key: &str,
        kind: &str,
        run_id: Option<&str>,
        html: &[u8],
    ) -> IngestResult<PutOutcome> {
        let filename = format!("{kind}.html");
        self.put(Draft {
            source,
            unit_key,
            kind,
            family: None,
            filename: &filename,
            run_id,
            bytes: html,
        })
    }

    /// Store a downloaded document under its original filename.
    pub fn put_document(
        &self,
        source: &str,
        unit_key: &str,
        family: &str,
        filename: &str,
        run_id: Option<&str>,
        bytes: &[u8],
    ) -> IngestResult<PutOutcome> {
        self.put(Draft {
            source,
            unit_key,
            kind: "document",
            family: Some(family),
            filename,
            run_id,
            bytes,
        })
    }

    fn put(&self, draft: Draft<'_>) -> IngestResult<PutOutcome> {
        let hash = content_hash(draft.bytes);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = self.find(draft.unit_key, draft.kind, &hash)? {
            debug!(
                unit_key = draft.unit_key,
                kind = draft.kind,
                hash = %hash,
                "Evidence already present"
            );
            return Ok(PutOutcome::AlreadyPresent(existing));
        }

        let dir = self
            .root
            .join(sanitize_component(draft.source))
            .join(sanitize_component(draft.unit_key))
            .join(sanitize_component(draft.kind));
        std::fs::create_dir_all(&dir)?;

        let original = sanitize_component(draft.filename);
        let (filename, path) = self.place(&dir, &original, &hash, draft.bytes)?;

        let now = self.clock.now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO evidence
                    (source_id, unit_key, kind, family, filename, path, content_hash, size_bytes, run_id, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    draft.source,
                    draft.unit_key,
                    draft.kind,
                    draft.family,
                    filename,
                    path.to_string_lossy().into_owned(),
                    hash,
                    draft.bytes.len() as i64,
                    draft.run_id,
                    encode_ts(now),
                ],
            )
        })?;

        let record = self
            .find(draft.unit_key, draft.kind, &hash)?
            .ok_or(IngestError::Storage(rusqlite::Error::QueryReturnedNoRows))?;
        info!(
            unit_key = draft.unit_key,
            kind = draft.kind,
            file = %record.filename,
            bytes = record.size_bytes,
            "Evidence stored"
        );
        Ok(PutOutcome::Stored(record))
    }

    /// Pick the on-disk name and write the bytes unless an identical file is already there.
    fn place(
        &self,
        dir: &Path,
        original: &str,
        hash: &str,
        bytes: &[u8],
    ) -> IngestResult<(String, PathBuf)> {
        let prefixed = format!("{}_{original}", &hash[..HASH_PREFIX_LEN]);
        for name in [original.to_string(), prefixed] {
            let path = dir.join(&name);
            if !path.exists() {
                write_atomic(dir, &path, hash, bytes)?;
                return Ok((name, path));
            }
            // Left behind by a crash between write and index insert.
            if content_hash(&std::fs::read(&path)?) == hash {
                return Ok((name, path));
            }
        }
        // Hash-prefixed name taken by different bytes: fall back to the full hash.
        let name = format!("{hash}_{original}");
        let path = dir.join(&name);
        if !path.exists() {
            write_atomic(dir, &path, hash, bytes)?;
        }
        Ok((name, path))
    }

    fn find(&self, unit_key: &str, kind: &str, hash: &str) -> IngestResult<Option<EvidenceRecord>> {
        let sql = format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence
             WHERE unit_key = ?1 AND kind = ?2 AND content_hash = ?3"
        );
        self.db.with_conn(|conn| {
            conn.query_row(&sql, params![unit_key, kind, hash], evidence_from_row)
                .optional()
        })
    }

    pub fn get(&self, id: i64) -> IngestResult<Option<EvidenceRecord>> {
        let sql = format!("SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE id = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, params![id], evidence_from_row).optional())
    }

    /// Every evidence record captured for a unit, oldest first.
    pub fn list_for_unit(&self, unit_key: &str) -> IngestResult<Vec<EvidenceRecord>> {
        let sql = format!("SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE unit_key = ?1 ORDER BY id");
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![unit_key], evidence_from_row)?;
            rows.collect()
        })
    }

    pub fn read_bytes(&self, record: &EvidenceRecord) -> IngestResult<Vec<u8>> {
        Ok(std::fs::read(&record.path)?)
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn write_atomic(dir: &Path, path: &Path, hash: &str, bytes: &[u8]) -> IngestResult<()> {
    let tmp = dir.join(format!(".{hash}.tmp"));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Make a string safe to use as a single path component.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

fn evidence_from_row(row: &Row<'_>) -> rusqlite::Result<EvidenceRecord> {
    let path: String = row.get(6)?;
    let size: i64 = row.get(8)?;
    let captured_at: String = row.get(10)?;
    Ok(EvidenceRecord {
        id: row.get(0)?,
        source: row.get(1)?,
        unit_key: row.get(2)?,
        kind: row.get(3)?,
        family: row.get(4)?,
        filename: row.get(5)?,
        path: PathBuf::from(path),
        content_hash: row.get(7)?,
        size_bytes: size.max(0) as u64,
        run_id: row.get(9)?,
        captured_at: decode_ts(10, &captured_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn store(dir: &tempfile::TempDir) -> EvidenceStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        EvidenceStore::new(db, dir.path().join("evidence"), Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn test_identical_snapshot_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let first = store
            .put_snapshot("alpha", "CASE-001", "detail", Some("run-1"), b"<html>a</html>")
            .unwrap();
        let second = store
            .put_snapshot("alpha", "CASE-001", "detail", Some("run-2"), b"<html>a</html>")
            .unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.record().id, second.record().id);
        assert_eq!(second.record().run_id.as_deref(), Some("run-1"));
        assert_eq!(store.list_for_unit("CASE-001").unwrap().len(), 1);
    }

    #[test]
    fn test_changed_bytes_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let v1 = store
            .put_snapshot("alpha", "CASE-001", "detail", None, b"version one")
            .unwrap()
            .into_record();
        let v2 = store
            .put_snapshot("alpha", "CASE-001", "detail", None, b"version two")
            .unwrap()
            .into_record();

        assert_ne!(v1.id, v2.id);
        assert_eq!(v1.filename, "detail.html");
        assert!(v2.filename.ends_with("_detail.html"));
        assert!(v2.filename.starts_with(&v2.content_hash[..HASH_PREFIX_LEN]));
        assert_eq!(store.read_bytes(&v1).unwrap(), b"version one");
        assert_eq!(store.read_bytes(&v2).unwrap(), b"version two");
        assert_eq!(store.list_for_unit("CASE-001").unwrap().len(), 2);
    }

    #[test]
    fn test_document_layout_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let doc = store
            .put_document("alpha", "CASE/001", "pdf", "../petição inicial.pdf", None, b"%PDF-1.7")
            .unwrap()
            .into_record();

        assert_eq!(doc.kind, "document");
        assert_eq!(doc.family.as_deref(), Some("pdf"));
        assert_eq!(doc.size_bytes, 8);
        assert!(doc.path.starts_with(store.root().join("alpha").join("CASE_001").join("document")));
        assert!(!doc.filename.contains('/'));
        assert_eq!(store.get(doc.id).unwrap().unwrap(), doc);
    }

    #[test]
    fn test_orphan_file_from_crash_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let target = store.root().join("alpha").join("CASE-9").join("detail");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("detail.html"), b"same bytes").unwrap();

        let rec = store
            .put_snapshot("alpha", "CASE-9", "detail", None, b"same bytes")
            .unwrap()
            .into_record();
        assert_eq!(rec.filename, "detail.html");
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 1);
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_component("..."), "_");
        assert_eq!(sanitize_component("0001234-56.2023"), "0001234-56.2023");
    }
}
