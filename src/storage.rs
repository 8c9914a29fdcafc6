use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;

use crate::core::Author;
use crate::core::AuthorId;
use crate::core::ComponentEdgeRow;
use crate::core::EntityId;
use crate::core::EntityKind;
use crate::core::EntityRecord;
use crate::core::RelationshipRow;
use crate::core::SnapshotId;
use crate::core::Stage;
use crate::core::TaskId;
use crate::core::TaskState;
use crate::validation::ValidationEntry;

pub const SCHEMA_VERSION: i64 = 1;

pub const DB_FILENAME: &str = "code-intel.sqlite";

const PRAGMAS: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;
"#;

const TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_info (
        version INTEGER NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS repo_meta (
        key TEXT NOT NULL PRIMARY KEY,
        value TEXT NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS authors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        UNIQUE (name, email)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS entities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        qualified_name TEXT NOT NULL,
        language TEXT,
        parent_id INTEGER REFERENCES entities (id),
        total_commits INTEGER NOT NULL DEFAULT 0,
        insertions INTEGER NOT NULL DEFAULT 0,
        deletions INTEGER NOT NULL DEFAULT 0,
        first_change_ts INTEGER,
        last_change_ts INTEGER,
        exists_at_head INTEGER NOT NULL DEFAULT 0,
        UNIQUE (kind, qualified_name)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS entity_authors (
        entity_id INTEGER NOT NULL REFERENCES entities (id),
        author_id INTEGER NOT NULL REFERENCES authors (id),
        commit_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (entity_id, author_id)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS file_lineage (
        old_entity_id INTEGER NOT NULL REFERENCES entities (id),
        new_entity_id INTEGER NOT NULL REFERENCES entities (id),
        commit_oid TEXT NOT NULL,
        similarity REAL NOT NULL,
        PRIMARY KEY (old_entity_id, new_entity_id, commit_oid)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS relationships (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL,
        source_type TEXT NOT NULL,
        kind TEXT NOT NULL,
        src_id INTEGER NOT NULL REFERENCES entities (id),
        dst_id INTEGER NOT NULL REFERENCES entities (id),
        weight REAL NOT NULL,
        support_src INTEGER NOT NULL,
        support_dst INTEGER NOT NULL,
        pair_count INTEGER NOT NULL,
        p_dst_given_src REAL NOT NULL,
        p_src_given_dst REAL NOT NULL,
        jaccard_weighted REAL NOT NULL,
        decayed_weight REAL,
        UNIQUE (source_type, kind, src_id, dst_id),
        CHECK (src_id < dst_id)
    ) STRICT;

    CREATE INDEX IF NOT EXISTS ix_relationships_src ON relationships (src_id);
    CREATE INDEX IF NOT EXISTS ix_relationships_dst ON relationships (dst_id);

    CREATE TABLE IF NOT EXISTS component_edges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL,
        src_id INTEGER NOT NULL REFERENCES entities (id),
        dst_id INTEGER NOT NULL REFERENCES entities (id),
        pair_count INTEGER NOT NULL,
        cooccurrence INTEGER NOT NULL,
        jaccard REAL NOT NULL,
        file_edge_count INTEGER NOT NULL,
        UNIQUE (src_id, dst_id),
        CHECK (src_id < dst_id)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS analysis_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        analyzer_type TEXT NOT NULL,
        config TEXT NOT NULL,
        state TEXT NOT NULL,
        stage TEXT NOT NULL,
        progress REAL NOT NULL DEFAULT 0,
        processed INTEGER NOT NULL DEFAULT 0,
        total INTEGER NOT NULL DEFAULT 0,
        entity_count INTEGER NOT NULL DEFAULT 0,
        relationship_count INTEGER NOT NULL DEFAULT 0,
        started_at INTEGER,
        finished_at INTEGER,
        error TEXT
    ) STRICT;

    CREATE TABLE IF NOT EXISTS clustering_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        algorithm TEXT NOT NULL,
        parameters TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        repo_head_oid TEXT NOT NULL,
        cluster_count INTEGER NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS validation_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER,
        commit_oid TEXT,
        stage TEXT NOT NULL,
        reason TEXT NOT NULL,
        severity TEXT NOT NULL,
        detail TEXT
    ) STRICT;
"#;

/// Paths under `data/repos/{repo_id}/`. Removing the directory is a clean
/// uninstall.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new<P: AsRef<Path>>(data_root: P, repo_id: &str) -> Self {
        Self { root: data_root.as_ref().join("repos").join(repo_id) }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.parquet_dir())?;
        std::fs::create_dir_all(self.snapshots_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILENAME)
    }

    pub fn parquet_dir(&self) -> PathBuf {
        self.root.join("parquet")
    }

    pub fn commits_parquet(&self) -> PathBuf {
        self.parquet_dir().join("commits.parquet")
    }

    pub fn changes_parquet(&self) -> PathBuf {
        self.parquet_dir().join("changes.parquet")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn snapshot_json(&self, id: SnapshotId) -> PathBuf {
        self.snapshots_dir().join(format!("{}.json", id))
    }
}

/// Stable identifier for a repository, derived from its canonical root path.
pub fn repo_id<P: AsRef<Path>>(repo_root: P) -> Result<String> {
    let canonical = std::fs::canonicalize(repo_root.as_ref())
        .with_context(|| format!("repository not found: {}", repo_root.as_ref().display()))?;
    let oid = git2::Oid::hash_object(git2::ObjectType::Blob, canonical.to_string_lossy().as_bytes())?;
    Ok(oid.to_string()[..12].to_string())
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LineageRow {
    pub old_entity_id: EntityId,
    pub new_entity_id: EntityId,
    pub commit_oid: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub analyzer_type: String,
    pub config: String,
    pub state: TaskState,
    pub stage: Stage,
    pub progress: f64,
    pub processed: i64,
    pub total: i64,
    pub entity_count: i64,
    pub relationship_count: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub elapsed_seconds: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SnapshotMetaRow {
    pub id: SnapshotId,
    pub name: String,
    pub tags: Vec<String>,
    pub algorithm: String,
    pub created_at: i64,
    pub repo_head_oid: String,
    pub cluster_count: i64,
}

/// The single write-serialized handle to a repository's SQLite database.
/// Concurrent readers (task pollers, the query layer) open their own
/// connections and read through WAL snapshots.
pub struct Store {
    conn: Connection,
    entity_ids: HashMap<(EntityKind, String), EntityId>,
    author_ids: HashMap<(String, String), AuthorId>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(TABLES)?;

        let version: Option<i64> =
            conn.query_row("SELECT version FROM schema_info", [], |row| row.get(0)).optional()?;

        match version {
            None => {
                conn.execute("INSERT INTO schema_info (version) VALUES (?)", [SCHEMA_VERSION])?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                bail!(
                    "schema version mismatch (found {}, engine expects {}); delete the repo data \
                     directory and rebuild",
                    v,
                    SCHEMA_VERSION
                );
            }
        }

        Ok(Self { conn, entity_ids: HashMap::new(), author_ids: HashMap::new() })
    }

    /// Open a second, read-oriented connection to the same database.
    pub fn open_reader<P: AsRef<Path>>(path: P) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Group many small writes into one transaction. Paired with
    /// [`Self::commit_batch`]; used at stage batch boundaries where holding
    /// a `Transaction` borrow across entity-cache lookups is impractical.
    pub fn begin_batch(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit_batch(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    // ---- repo meta ----

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .prepare_cached("INSERT INTO repo_meta (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value")?
            .execute(params![key, value])?;
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .prepare_cached("SELECT value FROM repo_meta WHERE key = ?")?
            .query_row(params![key], |row| row.get(0))
            .optional()?)
    }

    // ---- authors ----

    pub fn get_or_create_author(&mut self, name: &str, email: &str) -> Result<AuthorId> {
        let key = (name.to_string(), email.to_string());

        if let Some(&id) = self.author_ids.get(&key) {
            return Ok(id);
        }

        let existing: Option<AuthorId> = self
            .conn
            .prepare_cached("SELECT id FROM authors WHERE name = ? AND email = ?")?
            .query_row(params![name, email], |row| row.get(0))
            .optional()?;

        let id = match existing {
            Some(id) => id,
            None => {
                self.conn
                    .prepare_cached("INSERT INTO authors (name, email) VALUES (?, ?)")?
                    .execute(params![name, email])?;
                self.conn.last_insert_rowid()
            }
        };

        self.author_ids.insert(key, id);
        Ok(id)
    }

    pub fn author(&self, id: AuthorId) -> Result<Option<Author>> {
        Ok(self
            .conn
            .prepare_cached("SELECT id, name, email FROM authors WHERE id = ?")?
            .query_row(params![id], |row| {
                Ok(Author { id: row.get(0)?, name: row.get(1)?, email: row.get(2)? })
            })
            .optional()?)
    }

    // ---- entities ----

    pub fn get_or_create_entity(
        &mut self,
        kind: EntityKind,
        qualified_name: &str,
        language: Option<&str>,
        parent_id: Option<EntityId>,
    ) -> Result<EntityId> {
        let key = (kind, qualified_name.to_string());

        if let Some(&id) = self.entity_ids.get(&key) {
            return Ok(id);
        }

        let existing: Option<EntityId> = self
            .conn
            .prepare_cached("SELECT id FROM entities WHERE kind = ? AND qualified_name = ?")?
            .query_row(params![kind.to_string(), qualified_name], |row| row.get(0))
            .optional()?;

        let id = match existing {
            Some(id) => id,
            None => {
                self.conn
                    .prepare_cached(
                        "INSERT INTO entities (kind, qualified_name, language, parent_id) \
                         VALUES (?, ?, ?, ?)",
                    )?
                    .execute(params![kind.to_string(), qualified_name, language, parent_id])?;
                self.conn.last_insert_rowid()
            }
        };

        self.entity_ids.insert(key, id);
        Ok(id)
    }

    /// Entity rows and their ids persist across runs; the per-entity stats
    /// are derived from the walked history and recomputed by every run.
    pub fn reset_entity_stats(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE entities SET total_commits = 0, insertions = 0, deletions = 0, \
             first_change_ts = NULL, last_change_ts = NULL",
            [],
        )?;
        tx.execute("DELETE FROM entity_authors", [])?;
        tx.commit()?;
        Ok(())
    }

    pub fn bump_entity_stats(
        &self,
        id: EntityId,
        commits: i64,
        insertions: i64,
        deletions: i64,
        ts: i64,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "UPDATE entities SET \
                   total_commits = total_commits + ?2, \
                   insertions = insertions + ?3, \
                   deletions = deletions + ?4, \
                   first_change_ts = MIN(COALESCE(first_change_ts, ?5), ?5), \
                   last_change_ts = MAX(COALESCE(last_change_ts, ?5), ?5) \
                 WHERE id = ?1",
            )?
            .execute(params![id, commits, insertions, deletions, ts])?;
        Ok(())
    }

    pub fn bump_entity_author(&self, entity_id: EntityId, author_id: AuthorId) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO entity_authors (entity_id, author_id, commit_count) VALUES (?, ?, 1) \
                 ON CONFLICT (entity_id, author_id) DO UPDATE SET commit_count = commit_count + 1",
            )?
            .execute(params![entity_id, author_id])?;
        Ok(())
    }

    /// Mark exactly the given set of entities as present at HEAD.
    pub fn set_exists_at_head(&mut self, ids: &[EntityId]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("UPDATE entities SET exists_at_head = 0", [])?;
        {
            let mut stmt = tx.prepare_cached("UPDATE entities SET exists_at_head = 1 WHERE id = ?")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn entity(&self, id: EntityId) -> Result<Option<EntityRecord>> {
        Ok(self
            .conn
            .prepare_cached(&format!("{} WHERE id = ?", SELECT_ENTITY))?
            .query_row(params![id], entity_from_row)
            .optional()?)
    }

    pub fn entity_by_name(&self, kind: EntityKind, name: &str) -> Result<Option<EntityRecord>> {
        Ok(self
            .conn
            .prepare_cached(&format!("{} WHERE kind = ? AND qualified_name = ?", SELECT_ENTITY))?
            .query_row(params![kind.to_string(), name], entity_from_row)
            .optional()?)
    }

    pub fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{} WHERE kind = ? ORDER BY id", SELECT_ENTITY))?;
        let rows = stmt.query_map(params![kind.to_string()], entity_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn entity_count(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?)
    }

    // ---- lineage ----

    pub fn insert_lineage(
        &self,
        old_entity_id: EntityId,
        new_entity_id: EntityId,
        commit_oid: &str,
        similarity: f64,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO file_lineage \
                 (old_entity_id, new_entity_id, commit_oid, similarity) VALUES (?, ?, ?, ?)",
            )?
            .execute(params![old_entity_id, new_entity_id, commit_oid, similarity])?;
        Ok(())
    }

    pub fn load_lineage(&self) -> Result<Vec<LineageRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT old_entity_id, new_entity_id, commit_oid, similarity FROM file_lineage",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(LineageRow {
                old_entity_id: row.get(0)?,
                new_entity_id: row.get(1)?,
                commit_oid: row.get(2)?,
                similarity: row.get(3)?,
            })
        })?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- relationships ----

    /// The single unit of durability for a successful run: replace the git
    /// co-change rows, replace the component edges, and complete the task,
    /// all in one transaction. A failed run never reaches this point, which
    /// is exactly how the previous rows survive for inspection.
    pub fn commit_run(
        &mut self,
        task_id: TaskId,
        relationships: &[RelationshipRow],
        component_edges: &[ComponentEdgeRow],
        entity_count: i64,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM relationships WHERE source_type = 'git'", [])?;
        tx.execute("DELETE FROM component_edges", [])?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO relationships \
                 (run_id, source_type, kind, src_id, dst_id, weight, support_src, support_dst, \
                  pair_count, p_dst_given_src, p_src_given_dst, jaccard_weighted, decayed_weight) \
                 VALUES (?, 'git', 'CO_CHANGED', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for rel in relationships {
                stmt.execute(params![
                    task_id,
                    rel.src_id,
                    rel.dst_id,
                    rel.weight,
                    rel.support_src,
                    rel.support_dst,
                    rel.pair_count,
                    rel.p_dst_given_src,
                    rel.p_src_given_dst,
                    rel.jaccard_weighted,
                    rel.decayed_weight,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO component_edges \
                 (run_id, src_id, dst_id, pair_count, cooccurrence, jaccard, file_edge_count) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;

            for edge in component_edges {
                stmt.execute(params![
                    task_id,
                    edge.src_id,
                    edge.dst_id,
                    edge.pair_count,
                    edge.cooccurrence,
                    edge.jaccard,
                    edge.file_edge_count,
                ])?;
            }
        }

        tx.execute(
            "UPDATE analysis_tasks SET state = 'completed', stage = 'completed', progress = 1.0, \
             entity_count = ?2, relationship_count = ?3, finished_at = ?4 WHERE id = ?1",
            params![task_id, entity_count, relationships.len() as i64, now_ts()],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn relationship_count(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM relationships WHERE source_type = 'git'",
            [],
            |row| row.get(0),
        )?)
    }

    // ---- tasks ----

    pub fn create_task(&self, analyzer_type: &str, config_json: &str) -> Result<TaskId> {
        self.conn
            .prepare_cached(
                "INSERT INTO analysis_tasks (analyzer_type, config, state, stage, started_at) \
                 VALUES (?, ?, 'queued', 'queued', ?)",
            )?
            .execute(params![analyzer_type, config_json, now_ts()])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn task(&self, id: TaskId) -> Result<Option<TaskRow>> {
        Ok(self
            .conn
            .prepare_cached(&format!("{} WHERE id = ?", SELECT_TASK))?
            .query_row(params![id], task_from_row)
            .optional()?)
    }

    pub fn latest_task(&self) -> Result<Option<TaskRow>> {
        Ok(self
            .conn
            .prepare_cached(&format!("{} ORDER BY id DESC LIMIT 1", SELECT_TASK))?
            .query_row([], task_from_row)
            .optional()?)
    }

    pub fn running_task(&self) -> Result<Option<TaskRow>> {
        Ok(self
            .conn
            .prepare_cached(&format!(
                "{} WHERE state IN ('queued', 'running') ORDER BY id DESC LIMIT 1",
                SELECT_TASK
            ))?
            .query_row([], task_from_row)
            .optional()?)
    }

    pub fn fail_task(&self, id: TaskId, stage: Stage, error: &str) -> Result<()> {
        self.conn
            .prepare_cached(
                "UPDATE analysis_tasks SET state = 'failed', stage = 'failed', error = ?, \
                 finished_at = ? WHERE id = ? AND state != 'completed'",
            )?
            .execute(params![format!("{} (at stage: {})", error, stage), now_ts(), id])?;
        Ok(())
    }

    // ---- validation log ----

    pub fn append_validation(&mut self, run_id: Option<TaskId>, entries: &[ValidationEntry]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO validation_log (run_id, commit_oid, stage, reason, severity, detail) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;

            for entry in entries {
                stmt.execute(params![
                    run_id,
                    entry.commit_oid,
                    entry.stage,
                    entry.reason,
                    entry.severity.to_string(),
                    entry.detail,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---- snapshots (index rows; bodies live in snapshots/{id}.json) ----

    pub fn insert_snapshot_row(
        &self,
        name: &str,
        tags: &[String],
        algorithm: &str,
        parameters_json: &str,
        created_at: i64,
        repo_head_oid: &str,
        cluster_count: i64,
    ) -> Result<SnapshotId> {
        self.conn
            .prepare_cached(
                "INSERT INTO clustering_snapshots \
                 (name, tags, algorithm, parameters, created_at, repo_head_oid, cluster_count) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                name,
                serde_json::to_string(tags)?,
                algorithm,
                parameters_json,
                created_at,
                repo_head_oid,
                cluster_count,
            ])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn snapshot_row(&self, id: SnapshotId) -> Result<Option<SnapshotMetaRow>> {
        Ok(self
            .conn
            .prepare_cached(&format!("{} WHERE id = ?", SELECT_SNAPSHOT))?
            .query_row(params![id], snapshot_from_row)
            .optional()?)
    }

    pub fn list_snapshot_rows(
        &self,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SnapshotMetaRow>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{} WHERE (?1 IS NULL OR name LIKE '%' || ?1 || '%') \
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            SELECT_SNAPSHOT
        ))?;

        let rows = stmt.query_map(params![search, limit, offset], snapshot_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Snapshots are immutable apart from their name and tags.
    pub fn update_snapshot_meta(
        &self,
        id: SnapshotId,
        name: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<bool> {
        let tags_json = tags.map(|t| serde_json::to_string(t)).transpose()?;
        let updated = self
            .conn
            .prepare_cached(
                "UPDATE clustering_snapshots SET \
                   name = COALESCE(?2, name), \
                   tags = COALESCE(?3, tags) \
                 WHERE id = ?1",
            )?
            .execute(params![id, name, tags_json])?;
        Ok(updated > 0)
    }

    pub fn delete_snapshot_row(&self, id: SnapshotId) -> Result<bool> {
        Ok(self.conn.execute("DELETE FROM clustering_snapshots WHERE id = ?", params![id])? > 0)
    }
}

const SELECT_ENTITY: &str = "SELECT id, kind, qualified_name, language, parent_id, \
    total_commits, insertions, deletions, first_change_ts, last_change_ts, exists_at_head \
    FROM entities";

pub(crate) fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
    let kind: String = row.get(1)?;
    Ok(EntityRecord {
        id: row.get(0)?,
        kind: kind.parse().unwrap_or(EntityKind::External),
        qualified_name: row.get(2)?,
        language: row.get(3)?,
        parent_id: row.get(4)?,
        total_commits: row.get(5)?,
        insertions: row.get(6)?,
        deletions: row.get(7)?,
        first_change_ts: row.get(8)?,
        last_change_ts: row.get(9)?,
        exists_at_head: row.get::<_, i64>(10)? != 0,
    })
}

const SELECT_TASK: &str = "SELECT id, analyzer_type, config, state, stage, progress, processed, \
    total, entity_count, relationship_count, started_at, finished_at, error FROM analysis_tasks";

pub(crate) fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    let state: String = row.get(3)?;
    let stage: String = row.get(4)?;
    let started_at: Option<i64> = row.get(10)?;
    let finished_at: Option<i64> = row.get(11)?;
    let elapsed_seconds = started_at.map(|s| finished_at.unwrap_or_else(now_ts) - s);

    Ok(TaskRow {
        id: row.get(0)?,
        analyzer_type: row.get(1)?,
        config: row.get(2)?,
        state: state.parse().unwrap_or(TaskState::Failed),
        stage: stage.parse().unwrap_or(Stage::Failed),
        progress: row.get(5)?,
        processed: row.get(6)?,
        total: row.get(7)?,
        entity_count: row.get(8)?,
        relationship_count: row.get(9)?,
        started_at,
        finished_at,
        elapsed_seconds,
        error: row.get(12)?,
    })
}

const SELECT_SNAPSHOT: &str = "SELECT id, name, tags, algorithm, created_at, repo_head_oid, \
    cluster_count FROM clustering_snapshots";

pub(crate) fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotMetaRow> {
    let tags: String = row.get(2)?;
    Ok(SnapshotMetaRow {
        id: row.get(0)?,
        name: row.get(1)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        algorithm: row.get(3)?,
        created_at: row.get(4)?,
        repo_head_oid: row.get(5)?,
        cluster_count: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(dir.path().join(DB_FILENAME)).unwrap();
        (dir, store)
    }

    #[test]
    fn entity_ids_are_stable_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DB_FILENAME);

        let id = {
            let mut store = Store::open(&path).unwrap();
            store.get_or_create_entity(EntityKind::File, "src/a.rs", Some("rust"), None).unwrap()
        };

        let mut store = Store::open(&path).unwrap();
        let again =
            store.get_or_create_entity(EntityKind::File, "src/a.rs", Some("rust"), None).unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn entity_stats_accumulate() {
        let (_dir, mut store) = open_temp_store();
        let id = store.get_or_create_entity(EntityKind::File, "src/a.rs", None, None).unwrap();

        store.bump_entity_stats(id, 1, 10, 2, 500).unwrap();
        store.bump_entity_stats(id, 1, 3, 1, 100).unwrap();

        let entity = store.entity(id).unwrap().unwrap();
        assert_eq!(entity.total_commits, 2);
        assert_eq!(entity.insertions, 13);
        assert_eq!(entity.deletions, 3);
        assert_eq!(entity.first_change_ts, Some(100));
        assert_eq!(entity.last_change_ts, Some(500));
        assert_eq!(entity.churn(), 16);
    }

    #[test]
    fn lineage_rows_are_unique_per_commit() {
        let (_dir, mut store) = open_temp_store();
        let a = store.get_or_create_entity(EntityKind::File, "a.py", None, None).unwrap();
        let b = store.get_or_create_entity(EntityKind::File, "b.py", None, None).unwrap();

        store.insert_lineage(a, b, "deadbeef", 0.9).unwrap();
        store.insert_lineage(a, b, "deadbeef", 0.9).unwrap();

        assert_eq!(store.load_lineage().unwrap().len(), 1);
    }

    #[test]
    fn commit_run_replaces_relationships_wholesale() {
        let (_dir, mut store) = open_temp_store();
        let a = store.get_or_create_entity(EntityKind::File, "a.rs", None, None).unwrap();
        let b = store.get_or_create_entity(EntityKind::File, "b.rs", None, None).unwrap();
        let c = store.get_or_create_entity(EntityKind::File, "c.rs", None, None).unwrap();

        let rel = |src, dst| RelationshipRow {
            src_id: src,
            dst_id: dst,
            weight: 0.5,
            support_src: 4,
            support_dst: 4,
            pair_count: 2,
            p_dst_given_src: 0.5,
            p_src_given_dst: 0.5,
            jaccard_weighted: 0.5,
            decayed_weight: None,
        };

        let task1 = store.create_task("git", "{}").unwrap();
        store.commit_run(task1, &[rel(a, b), rel(a, c)], &[], 3).unwrap();
        assert_eq!(store.relationship_count().unwrap(), 2);

        let task2 = store.create_task("git", "{}").unwrap();
        store.commit_run(task2, &[rel(b, c)], &[], 3).unwrap();
        assert_eq!(store.relationship_count().unwrap(), 1);

        let task = store.task(task2).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.relationship_count, 1);
    }

    #[test]
    fn failed_task_keeps_previous_relationships() {
        let (_dir, mut store) = open_temp_store();
        let a = store.get_or_create_entity(EntityKind::File, "a.rs", None, None).unwrap();
        let b = store.get_or_create_entity(EntityKind::File, "b.rs", None, None).unwrap();

        let rel = RelationshipRow {
            src_id: a,
            dst_id: b,
            weight: 0.5,
            support_src: 4,
            support_dst: 4,
            pair_count: 2,
            p_dst_given_src: 0.5,
            p_src_given_dst: 0.5,
            jaccard_weighted: 0.5,
            decayed_weight: None,
        };

        let task1 = store.create_task("git", "{}").unwrap();
        store.commit_run(task1, &[rel], &[], 2).unwrap();

        let task2 = store.create_task("git", "{}").unwrap();
        store.fail_task(task2, Stage::BuildingEdges, "disk full").unwrap();

        assert_eq!(store.relationship_count().unwrap(), 1);
        let task = store.task(task2).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().contains("building_edges"));
    }

    #[test]
    fn snapshot_meta_is_editable_but_nothing_else() {
        let (_dir, store) = open_temp_store();
        let id = store
            .insert_snapshot_row("run 1", &[], "louvain", "{}", 1000, "abc123", 4)
            .unwrap();

        let tags = vec!["baseline".to_string()];
        assert!(store.update_snapshot_meta(id, Some("renamed"), Some(&tags)).unwrap());

        let row = store.snapshot_row(id).unwrap().unwrap();
        assert_eq!(row.name, "renamed");
        assert_eq!(row.tags, tags);
        assert_eq!(row.algorithm, "louvain");
        assert_eq!(row.cluster_count, 4);

        assert!(store.delete_snapshot_row(id).unwrap());
        assert!(store.snapshot_row(id).unwrap().is_none());
    }

    #[test]
    fn validation_log_appends() {
        let (_dir, mut store) = open_temp_store();
        let entries = vec![ValidationEntry::warn(
            Some("deadbeef".to_string()),
            "extracting",
            "email_as_path",
            Some("user@example.com".to_string()),
        )];
        store.append_validation(Some(1), &entries).unwrap();

        let count: i64 =
            store.conn().query_row("SELECT COUNT(*) FROM validation_log", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
