//! Durable per-file index state: `file_records` and `code_units` in sqlite.
//!
//! A record and its units are always written together in one transaction, so
//! `unit_ids` on a record matches the stored units for that file. Every row is
//! keyed by the indexed root as well as the relative path.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;

use crate::category::Category;
use crate::change::FileMeta;
use crate::error::{IndexError, Result};
use crate::languages::Lang;
use crate::lexical::UnitDoc;
use crate::unit::UnitType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIndexRecord {
    /// Canonical path of the indexed root.
    pub root: String,
    /// Path relative to `root`, `/`-separated.
    pub file_path: String,
    pub fingerprint: String,
    pub mtime_ns: i64,
    pub size: u64,
    pub language: Lang,
    pub unit_ids: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    root: String,
    file_path: String,
    fingerprint: String,
    mtime_ns: i64,
    size_bytes: i64,
    language: String,
    unit_ids: String,
}

impl TryFrom<RecordRow> for FileIndexRecord {
    type Error = IndexError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let language = Lang::from_id(&row.language)
            .ok_or_else(|| IndexError::Other(format!("unknown language {}", row.language)))?;
        Ok(Self {
            root: row.root,
            file_path: row.file_path,
            fingerprint: row.fingerprint,
            mtime_ns: row.mtime_ns,
            size: u64::try_from(row.size_bytes)?,
            language,
            unit_ids: serde_json::from_str(&row.unit_ids)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UnitRow {
    unit_id: String,
    root: String,
    file_path: String,
    unit_type: String,
    name: String,
    language: String,
    category: String,
    project: String,
    start_line: i64,
    end_line: i64,
    content: String,
}

impl TryFrom<UnitRow> for UnitDoc {
    type Error = IndexError;

    fn try_from(row: UnitRow) -> Result<Self> {
        let bad = |what: &str, value: &str| IndexError::Other(format!("unknown {what} {value}"));
        Ok(Self {
            unit_type: UnitType::parse(&row.unit_type).ok_or_else(|| bad("unit type", &row.unit_type))?,
            language: Lang::from_id(&row.language).ok_or_else(|| bad("language", &row.language))?,
            category: Category::parse(&row.category).ok_or_else(|| bad("category", &row.category))?,
            start_line: usize::try_from(row.start_line)?,
            end_line: usize::try_from(row.end_line)?,
            unit_id: row.unit_id,
            root: row.root,
            file_path: row.file_path,
            name: row.name,
            project: row.project,
            content: row.content,
        })
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every record under `root`, keyed by relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn load_all(&self, root: &str) -> Result<HashMap<String, FileIndexRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT root, file_path, fingerprint, mtime_ns, size_bytes, language, unit_ids \
             FROM file_records WHERE root = ?",
        )
        .bind(root)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| FileIndexRecord::try_from(row).map(|r| (r.file_path.clone(), r)))
            .collect()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn get(&self, root: &str, file_path: &str) -> Result<Option<FileIndexRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT root, file_path, fingerprint, mtime_ns, size_bytes, language, unit_ids \
             FROM file_records WHERE root = ? AND file_path = ?",
        )
        .bind(root)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FileIndexRecord::try_from).transpose()
    }

    /// Write `record` and replace the file's units with `docs`, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is written in that case.
    pub async fn commit_file(&self, record: &FileIndexRecord, docs: &[UnitDoc]) -> Result<()> {
        let unit_ids = serde_json::to_string(&record.unit_ids)?;
        let size = i64::try_from(record.size)?;
        let mut tx = self.pool.begin().await?;

        // An upsert keeps the row, so the cascade on code_units does not fire.
        sqlx::query(
            "INSERT INTO file_records \
             (root, file_path, fingerprint, mtime_ns, size_bytes, language, unit_ids, indexed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(root, file_path) DO UPDATE SET \
             fingerprint = excluded.fingerprint, mtime_ns = excluded.mtime_ns, \
             size_bytes = excluded.size_bytes, language = excluded.language, \
             unit_ids = excluded.unit_ids, indexed_at = excluded.indexed_at",
        )
        .bind(&record.root)
        .bind(&record.file_path)
        .bind(&record.fingerprint)
        .bind(record.mtime_ns)
        .bind(size)
        .bind(record.language.id())
        .bind(&unit_ids)
        .bind(now_secs())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM code_units WHERE root = ? AND file_path = ?")
            .bind(&record.root)
            .bind(&record.file_path)
            .execute(&mut *tx)
            .await?;

        for (ordinal, doc) in docs.iter().enumerate() {
            sqlx::query(
                "INSERT INTO code_units \
                 (unit_id, root, file_path, ordinal, unit_type, name, language, category, \
                  project, start_line, end_line, content) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(unit_id) DO UPDATE SET \
                 root = excluded.root, file_path = excluded.file_path, ordinal = excluded.ordinal, \
                 unit_type = excluded.unit_type, name = excluded.name, \
                 language = excluded.language, category = excluded.category, \
                 project = excluded.project, start_line = excluded.start_line, \
                 end_line = excluded.end_line, content = excluded.content",
            )
            .bind(&doc.unit_id)
            .bind(&record.root)
            .bind(&record.file_path)
            .bind(i64::try_from(ordinal)?)
            .bind(doc.unit_type.as_str())
            .bind(&doc.name)
            .bind(doc.language.id())
            .bind(doc.category.as_str())
            .bind(&doc.project)
            .bind(i64::try_from(doc.start_line)?)
            .bind(i64::try_from(doc.end_line)?)
            .bind(&doc.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Refresh mtime and size after a content-identical rewrite.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn touch(&self, root: &str, file_path: &str, meta: FileMeta) -> Result<()> {
        sqlx::query(
            "UPDATE file_records SET mtime_ns = ?, size_bytes = ? \
             WHERE root = ? AND file_path = ?",
        )
        .bind(meta.mtime_ns)
        .bind(i64::try_from(meta.size)?)
        .bind(root)
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a record; its units go with it through the foreign-key cascade.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn remove_file(&self, root: &str, file_path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_records WHERE root = ? AND file_path = ?")
            .bind(root)
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All stored units, ordered by file and position within the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn load_docs(&self) -> Result<Vec<UnitDoc>> {
        let rows: Vec<UnitRow> = sqlx::query_as(
            "SELECT unit_id, root, file_path, unit_type, name, language, category, project, \
             start_line, end_line, content FROM code_units ORDER BY root, file_path, ordinal",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(UnitDoc::try_from).collect()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn unit_count_for(&self, root: &str, file_path: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM code_units WHERE root = ? AND file_path = ?",
        )
        .bind(root)
        .bind(file_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(n)?)
    }

    /// Number of indexed files and units.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn counts(&self) -> Result<(u64, u64)> {
        let (files, units): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM file_records), (SELECT COUNT(*) FROM code_units)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((u64::try_from(files)?, u64::try_from(units)?))
    }
}

#[cfg(test)]
mod tests {
    use quarry_memory::SqliteStore;

    use super::*;
    use crate::unit::SemanticUnit;

    async fn store() -> (RecordStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let sqlite = SqliteStore::new(path.to_str().unwrap()).await.unwrap();
        (RecordStore::new(sqlite.pool().clone()), dir)
    }

    const ROOT: &str = "/repo";

    fn docs_for(root: &str, path: &str, names: &[&str]) -> (FileIndexRecord, Vec<UnitDoc>) {
        let docs: Vec<UnitDoc> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let unit = SemanticUnit::new(
                    path,
                    UnitType::Function,
                    *name,
                    format!("def {name}(): pass"),
                    (i + 1, i + 1),
                    Lang::Python,
                )
                .in_root(root);
                UnitDoc::from_unit(&unit, "demo", root)
            })
            .collect();
        let record = FileIndexRecord {
            root: root.into(),
            file_path: path.into(),
            fingerprint: format!("fp-{}", names.join("-")),
            mtime_ns: 42,
            size: 100,
            language: Lang::Python,
            unit_ids: docs.iter().map(|d| d.unit_id.clone()).collect(),
        };
        (record, docs)
    }

    #[tokio::test]
    async fn commit_then_load_round_trips() {
        let (store, _dir) = store().await;
        let (record, docs) = docs_for(ROOT, "a.py", &["f", "g"]);
        store.commit_file(&record, &docs).await.unwrap();

        let all = store.load_all(ROOT).await.unwrap();
        assert_eq!(all.get("a.py"), Some(&record));
        assert_eq!(store.load_docs().await.unwrap(), docs);
        assert_eq!(store.counts().await.unwrap(), (1, 2));
    }

    #[tokio::test]
    async fn recommit_replaces_units_without_cascade_loss() {
        let (store, _dir) = store().await;
        let (first, first_docs) = docs_for(ROOT, "a.py", &["f", "g"]);
        store.commit_file(&first, &first_docs).await.unwrap();
        let (second, second_docs) = docs_for(ROOT, "a.py", &["h"]);
        store.commit_file(&second, &second_docs).await.unwrap();

        assert_eq!(store.get(ROOT, "a.py").await.unwrap(), Some(second));
        assert_eq!(store.unit_count_for(ROOT, "a.py").await.unwrap(), 1);
        assert_eq!(store.load_docs().await.unwrap()[0].name, "h");
    }

    #[tokio::test]
    async fn remove_file_cascades_to_units() {
        let (store, _dir) = store().await;
        let (a, a_docs) = docs_for(ROOT, "a.py", &["f"]);
        let (b, b_docs) = docs_for(ROOT, "b.py", &["g", "h"]);
        store.commit_file(&a, &a_docs).await.unwrap();
        store.commit_file(&b, &b_docs).await.unwrap();

        assert!(store.remove_file(ROOT, "b.py").await.unwrap());
        assert!(!store.remove_file(ROOT, "b.py").await.unwrap());
        assert_eq!(store.unit_count_for(ROOT, "b.py").await.unwrap(), 0);
        assert_eq!(store.counts().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn touch_updates_only_metadata() {
        let (store, _dir) = store().await;
        let (record, docs) = docs_for(ROOT, "a.py", &["f"]);
        store.commit_file(&record, &docs).await.unwrap();
        store
            .touch(ROOT, "a.py", FileMeta { mtime_ns: 7, size: 9 })
            .await
            .unwrap();

        let loaded = store.get(ROOT, "a.py").await.unwrap().unwrap();
        assert_eq!((loaded.mtime_ns, loaded.size), (7, 9));
        assert_eq!(loaded.fingerprint, record.fingerprint);
        assert_eq!(loaded.unit_ids, record.unit_ids);
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let (store, _dir) = store().await;
        assert!(store.get(ROOT, "nope.py").await.unwrap().is_none());
        assert!(store.load_all(ROOT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn roots_do_not_see_each_others_records() {
        let (store, _dir) = store().await;
        let (mine, mine_docs) = docs_for(ROOT, "a.py", &["f"]);
        let (theirs, theirs_docs) = docs_for("/other", "a.py", &["f"]);
        assert_ne!(mine.unit_ids, theirs.unit_ids);
        store.commit_file(&mine, &mine_docs).await.unwrap();
        store.commit_file(&theirs, &theirs_docs).await.unwrap();

        assert_eq!(store.load_all(ROOT).await.unwrap().len(), 1);
        assert_eq!(store.get("/other", "a.py").await.unwrap(), Some(theirs));
        assert_eq!(store.counts().await.unwrap(), (2, 2));

        assert!(store.remove_file(ROOT, "a.py").await.unwrap());
        assert_eq!(store.unit_count_for("/other", "a.py").await.unwrap(), 1);
        assert!(store.load_all(ROOT).await.unwrap().is_empty());
    }
}
