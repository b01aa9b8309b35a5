//! SQLite-backed provenance store.
//!
//! One database file holds the whole analysis record. The store enforces
//! the durability contract: a task is "run" only once its enclosing
//! transaction commits, and a committed task always has all of its input
//! edges and output rows.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use weir_model::{
    flag, Argument, FileId, FileResource, NodeRef, OutputRef, Pipe, PipeId, PipeIdentity,
    Resource, ResourceId, Task, TaskId, Value,
};

use crate::error::{Result, StoreError};
use crate::schema::{SCHEMA, SCHEMA_VERSION};

/// Provenance store backed by a single SQLite file.
///
/// Thread-safe via an internal `Mutex<Connection>`; WAL mode is enabled
/// for file-backed databases.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Create a fresh database at `path`. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.display().to_string()));
        }
        Self::open(path)
    }

    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        info!(path = %path.display(), "provenance store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA)?;

        let version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |r| {
                r.get(0)
            })
            .optional()?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('database_id', ?1)",
                    params![Uuid::new_v4().to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(StoreError::Corrupt(format!(
                    "schema version {v} is not supported (expected {SCHEMA_VERSION})"
                )));
            }
        }
        Ok(())
    }

    /// The uuid minted when this database was created.
    pub fn database_id(&self) -> Result<String> {
        Ok(self.connection().query_row(
            "SELECT value FROM meta WHERE key = 'database_id'",
            [],
            |r| r.get(0),
        )?)
    }

    /// Lock the connection for use.
    pub(crate) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Execute `f` within a transaction; rolls back if `f` errors.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // ── Pipes ───────────────────────────────────────────────────────

    /// Insert a pipe row together with its captured source text, if any.
    pub fn insert_pipe(
        &self,
        pipe: &Pipe,
        source: Option<&str>,
        output_source: Option<&str>,
    ) -> Result<()> {
        let signature = serde_json::to_string(&pipe.signature)?;
        let (module, name, source_hash) = match &pipe.identity {
            PipeIdentity::Named { module, name } => {
                (Some(module.as_str()), Some(name.as_str()), None)
            }
            PipeIdentity::Anonymous { source_hash } => (None, None, Some(source_hash.as_str())),
        };

        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO pipes (id, module, name, source_hash, signature, return_volatile,
                                    is_deterministic, has_output_func, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    pipe.id.as_str(),
                    module,
                    name,
                    source_hash,
                    signature,
                    pipe.return_volatile as i32,
                    pipe.is_deterministic as i32,
                    pipe.has_output_func as i32,
                    pipe.description,
                    pipe.created_at.to_rfc3339(),
                ],
            )?;
            if let Some(text) = source {
                set_flag(tx, "pipe", pipe.id.as_str(), flag::SOURCECODE, Some(text))?;
            }
            if let Some(text) = output_source {
                set_flag(
                    tx,
                    "pipe",
                    pipe.id.as_str(),
                    flag::OUTPUTFUNC_SOURCECODE,
                    Some(text),
                )?;
            }
            Ok(())
        })?;
        debug!(pipe_id = %pipe.id, identity = %pipe.identity, "pipe registered");
        Ok(())
    }

    pub fn get_pipe(&self, id: &PipeId) -> Result<Pipe> {
        self.connection()
            .query_row(
                "SELECT id, module, name, source_hash, signature, return_volatile,
                        is_deterministic, has_output_func, description, created_at
                 FROM pipes WHERE id = ?1",
                params![id.as_str()],
                row_to_pipe,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("pipe {id}")))
    }

    /// Look up a pipe by identity key, if one is registered.
    pub fn get_pipe_by_identity(&self, identity: &PipeIdentity) -> Result<Option<Pipe>> {
        let conn = self.connection();
        let row = match identity {
            PipeIdentity::Named { module, name } => conn
                .query_row(
                    "SELECT id, module, name, source_hash, signature, return_volatile,
                            is_deterministic, has_output_func, description, created_at
                     FROM pipes WHERE module = ?1 AND name = ?2",
                    params![module, name],
                    row_to_pipe,
                )
                .optional()?,
            PipeIdentity::Anonymous { source_hash } => conn
                .query_row(
                    "SELECT id, module, name, source_hash, signature, return_volatile,
                            is_deterministic, has_output_func, description, created_at
                     FROM pipes WHERE source_hash = ?1",
                    params![source_hash],
                    row_to_pipe,
                )
                .optional()?,
        };
        Ok(row)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Atomically write a task, its input edges, its owned outputs, and
    /// the `overwritten` flags for files it displaced.
    pub fn put_task(
        &self,
        task: &Task,
        resources: &[Resource],
        files: &[FileResource],
        overwritten: &[FileId],
    ) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO tasks (id, pipe_id, fingerprint, started_at, finished_at, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task.id.as_str(),
                    task.pipe_id.as_str(),
                    task.fingerprint,
                    task.started_at.to_rfc3339(),
                    task.finished_at.to_rfc3339(),
                    task.description,
                ],
            )?;

            for (position, input) in task.inputs.iter().enumerate() {
                let (kind, node_id, literal) = match input {
                    Argument::Value(value) => {
                        ("literal", None, Some(serde_json::to_string(value)?))
                    }
                    Argument::Resource(id) => ("resource", Some(id.as_str().to_string()), None),
                    Argument::File(id) => ("file", Some(id.as_str().to_string()), None),
                    Argument::Virtual(id) => {
                        return Err(StoreError::Corrupt(format!(
                            "task {} binds unresolved virtual resource {id}",
                            task.id
                        )));
                    }
                };
                tx.execute(
                    "INSERT INTO task_inputs (task_id, position, kind, node_id, literal)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![task.id.as_str(), position as i64, kind, node_id, literal],
                )?;
            }

            for (position, output) in task.outputs.iter().enumerate() {
                let (kind, node_id) = match output {
                    OutputRef::Resource(id) => ("resource", id.as_str()),
                    OutputRef::File(id) => ("file", id.as_str()),
                };
                tx.execute(
                    "INSERT INTO task_outputs (task_id, position, kind, node_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![task.id.as_str(), position as i64, kind, node_id],
                )?;
            }

            for resource in resources {
                tx.execute(
                    "INSERT INTO resources (id, task_id, ordinal, vault_hash, volatile, description)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        resource.id.as_str(),
                        resource.task_id.as_str(),
                        resource.ordinal,
                        resource.vault_hash,
                        resource.volatile as i32,
                        resource.description,
                    ],
                )?;
            }

            for file in files {
                insert_file(tx, file)?;
            }

            let displaced_at = task.finished_at.to_rfc3339();
            for old in overwritten {
                set_flag(tx, "file", old.as_str(), flag::OVERWRITTEN, Some(&displaced_at))?;
            }
            Ok(())
        })?;
        debug!(task_id = %task.id, fingerprint = %task.fingerprint, "task committed");
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        let conn = self.connection();
        let header = conn
            .query_row(
                "SELECT pipe_id, fingerprint, started_at, finished_at, description
                 FROM tasks WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        parse_dt(row.get::<_, String>(2)?)?,
                        parse_dt(row.get::<_, String>(3)?)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;

        let mut inputs = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT kind, node_id, literal FROM task_inputs
                 WHERE task_id = ?1 ORDER BY position",
            )?;
            let rows = stmt.query_map(params![id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            for row in rows {
                let (kind, node_id, literal) = row?;
                inputs.push(decode_input(&kind, node_id, literal)?);
            }
        }

        let mut outputs = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT kind, node_id FROM task_outputs
                 WHERE task_id = ?1 ORDER BY position",
            )?;
            let rows = stmt.query_map(params![id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (kind, node_id) = row?;
                outputs.push(match kind.as_str() {
                    "resource" => OutputRef::Resource(node_id.into()),
                    "file" => OutputRef::File(node_id.into()),
                    other => {
                        return Err(StoreError::Corrupt(format!(
                            "unknown output kind `{other}` on task {id}"
                        )));
                    }
                });
            }
        }

        let (pipe_id, fingerprint, started_at, finished_at, description) = header;
        Ok(Task {
            id: id.clone(),
            pipe_id: pipe_id.into(),
            fingerprint,
            inputs,
            outputs,
            started_at,
            finished_at,
            description,
        })
    }

    /// The most recent task with this fingerprint that has not been
    /// retired (`obsolete` or `deprecated`). This is the dedup lookup.
    pub fn get_task_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Task>> {
        let id: Option<String> = self
            .connection()
            .query_row(
                "SELECT id FROM tasks
                 WHERE fingerprint = ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM info_flags
                        WHERE kind = 'task' AND node_id = tasks.id
                          AND flag IN ('obsolete', 'deprecated'))
                 ORDER BY finished_at DESC
                 LIMIT 1",
                params![fingerprint],
                |r| r.get(0),
            )
            .optional()?;
        match id {
            Some(id) => Ok(Some(self.get_task(&TaskId::from(id))?)),
            None => Ok(None),
        }
    }

    pub fn count_tasks(&self) -> Result<u64> {
        Ok(self
            .connection()
            .query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get::<_, i64>(0))? as u64)
    }

    // ── Resources and files ─────────────────────────────────────────

    pub fn get_resource(&self, id: &ResourceId) -> Result<Resource> {
        self.connection()
            .query_row(
                "SELECT id, task_id, ordinal, vault_hash, volatile, description
                 FROM resources WHERE id = ?1",
                params![id.as_str()],
                row_to_resource,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))
    }

    pub fn get_file(&self, id: &FileId) -> Result<FileResource> {
        self.connection()
            .query_row(
                "SELECT id, task_id, path, size, md5, registered_at, description
                 FROM files WHERE id = ?1",
                params![id.as_str()],
                row_to_file,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("file resource {id}")))
    }

    /// Register an external file, flagging the file it displaces (if any)
    /// in the same transaction.
    pub fn put_file(&self, file: &FileResource, overwrites: Option<&FileId>) -> Result<()> {
        self.with_transaction(|tx| {
            insert_file(tx, file)?;
            if let Some(old) = overwrites {
                let now = Utc::now().to_rfc3339();
                set_flag(tx, "file", old.as_str(), flag::OVERWRITTEN, Some(&now))?;
            }
            Ok(())
        })
    }

    /// The one file resource at `path` that has not been overwritten.
    pub fn current_file_at(&self, path: &Path) -> Result<Option<FileResource>> {
        Ok(self
            .connection()
            .query_row(
                "SELECT f.id, f.task_id, f.path, f.size, f.md5, f.registered_at, f.description
                 FROM files f
                 WHERE f.path = ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM info_flags i
                        WHERE i.kind = 'file' AND i.node_id = f.id AND i.flag = 'overwritten')
                 ORDER BY f.registered_at DESC
                 LIMIT 1",
                params![path.display().to_string()],
                row_to_file,
            )
            .optional()?)
    }

    /// Every file resource ever registered at `path`, oldest first.
    pub fn files_at_path(&self, path: &Path) -> Result<Vec<FileResource>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, path, size, md5, registered_at, description
             FROM files WHERE path = ?1 ORDER BY registered_at",
        )?;
        let rows = stmt.query_map(params![path.display().to_string()], row_to_file)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// All file resources that have not been overwritten.
    pub fn current_files(&self) -> Result<Vec<FileResource>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT f.id, f.task_id, f.path, f.size, f.md5, f.registered_at, f.description
             FROM files f
             WHERE NOT EXISTS (
                 SELECT 1 FROM info_flags i
                  WHERE i.kind = 'file' AND i.node_id = f.id AND i.flag = 'overwritten')
             ORDER BY f.registered_at",
        )?;
        let rows = stmt.query_map([], row_to_file)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// The task that produced `node`, if any.
    pub fn producing_task(&self, node: &NodeRef) -> Result<Option<TaskId>> {
        match node {
            NodeRef::Resource(id) => Ok(Some(self.get_resource(id)?.task_id)),
            NodeRef::File(id) => Ok(self.get_file(id)?.task_id),
            NodeRef::Task(_) | NodeRef::Pipe(_) => Ok(None),
        }
    }

    /// Tasks that consume `node` as an input.
    pub fn consumers(&self, node: &NodeRef) -> Result<Vec<TaskId>> {
        let kind = match node {
            NodeRef::Resource(_) => "resource",
            NodeRef::File(_) => "file",
            NodeRef::Task(_) | NodeRef::Pipe(_) => return Ok(Vec::new()),
        };
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT task_id FROM task_inputs WHERE kind = ?1 AND node_id = ?2",
        )?;
        let rows = stmt.query_map(params![kind, node.id_str()], |r| r.get::<_, String>(0))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(TaskId::from(row?));
        }
        Ok(tasks)
    }

    // ── Info flags ──────────────────────────────────────────────────

    pub fn mark_info(&self, node: &NodeRef, flag: &str, value: Option<&str>) -> Result<()> {
        let conn = self.connection();
        set_flag(&conn, node.kind(), node.id_str(), flag, value)
    }

    /// Set the same flag on many nodes in one transaction.
    pub fn mark_info_all(&self, nodes: &[NodeRef], flag: &str, value: Option<&str>) -> Result<()> {
        self.with_transaction(|tx| {
            for node in nodes {
                set_flag(tx, node.kind(), node.id_str(), flag, value)?;
            }
            Ok(())
        })
    }

    pub fn clear_info(&self, node: &NodeRef, flag: &str) -> Result<()> {
        self.connection().execute(
            "DELETE FROM info_flags WHERE kind = ?1 AND node_id = ?2 AND flag = ?3",
            params![node.kind(), node.id_str(), flag],
        )?;
        Ok(())
    }

    pub fn has_flag(&self, node: &NodeRef, flag: &str) -> Result<bool> {
        let found: Option<i64> = self
            .connection()
            .query_row(
                "SELECT 1 FROM info_flags WHERE kind = ?1 AND node_id = ?2 AND flag = ?3",
                params![node.kind(), node.id_str(), flag],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The full `info` set of a node: flag name to optional value.
    pub fn info_flags(&self, node: &NodeRef) -> Result<BTreeMap<String, Option<String>>> {
        let conn = self.connection();
        let mut stmt =
            conn.prepare("SELECT flag, value FROM info_flags WHERE kind = ?1 AND node_id = ?2")?;
        let rows = stmt.query_map(params![node.kind(), node.id_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut flags = BTreeMap::new();
        for row in rows {
            let (flag, value) = row?;
            flags.insert(flag, value);
        }
        Ok(flags)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Vault hashes referenced by any resource row.
    pub fn referenced_vault_hashes(&self) -> Result<HashSet<String>> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare("SELECT DISTINCT vault_hash FROM resources WHERE vault_hash IS NOT NULL")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut hashes = HashSet::new();
        for row in rows {
            hashes.insert(row?);
        }
        Ok(hashes)
    }

    /// Delete entities. Refuses if anything outside the set still depends
    /// on a deleted entity; the whole removal is one transaction.
    pub fn delete(&self, nodes: &[NodeRef]) -> Result<()> {
        let deleting: HashSet<&NodeRef> = nodes.iter().collect();
        let mut broken = Vec::new();
        for node in nodes {
            for dependent in self.dependents(node)? {
                if !deleting.contains(&dependent) {
                    broken.push(format!("{}:{}", dependent.kind(), dependent.id_str()));
                }
            }
        }
        if !broken.is_empty() {
            broken.sort();
            broken.dedup();
            return Err(StoreError::DependentsExist(broken.join(", ")));
        }

        self.with_transaction(|tx| {
            for node in nodes {
                match node {
                    NodeRef::Pipe(id) => {
                        tx.execute("DELETE FROM pipes WHERE id = ?1", params![id.as_str()])?;
                        clear_flags(tx, "pipe", id.as_str())?;
                    }
                    NodeRef::Task(id) => {
                        tx.execute(
                            "DELETE FROM task_inputs WHERE task_id = ?1",
                            params![id.as_str()],
                        )?;
                        tx.execute(
                            "DELETE FROM task_outputs WHERE task_id = ?1",
                            params![id.as_str()],
                        )?;
                        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id.as_str()])?;
                        clear_flags(tx, "task", id.as_str())?;
                    }
                    NodeRef::Resource(id) => {
                        tx.execute("DELETE FROM resources WHERE id = ?1", params![id.as_str()])?;
                        clear_flags(tx, "resource", id.as_str())?;
                    }
                    NodeRef::File(id) => {
                        tx.execute("DELETE FROM files WHERE id = ?1", params![id.as_str()])?;
                        clear_flags(tx, "file", id.as_str())?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Entities whose integrity depends on `node` existing. A resource or
    /// file blocks deletion only while a task still consumes it.
    fn dependents(&self, node: &NodeRef) -> Result<Vec<NodeRef>> {
        match node {
            NodeRef::Resource(_) | NodeRef::File(_) => Ok(self
                .consumers(node)?
                .into_iter()
                .map(NodeRef::Task)
                .collect()),
            NodeRef::Task(id) => {
                let task = self.get_task(id)?;
                Ok(task.outputs.iter().map(NodeRef::from).collect())
            }
            NodeRef::Pipe(id) => {
                let conn = self.connection();
                let mut stmt = conn.prepare("SELECT id FROM tasks WHERE pipe_id = ?1")?;
                let rows = stmt.query_map(params![id.as_str()], |r| r.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(NodeRef::Task(TaskId::from(row?)));
                }
                Ok(out)
            }
        }
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn parse_dt(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_pipe(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pipe> {
    let module: Option<String> = row.get(1)?;
    let name: Option<String> = row.get(2)?;
    let source_hash: Option<String> = row.get(3)?;
    let identity = match (module, name, source_hash) {
        (Some(module), Some(name), _) => PipeIdentity::Named { module, name },
        (_, _, Some(source_hash)) => PipeIdentity::Anonymous { source_hash },
        _ => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Null,
                "pipe row has neither a name nor a source hash".into(),
            ));
        }
    };
    let signature_json: String = row.get(4)?;
    let signature = serde_json::from_str(&signature_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Pipe {
        id: PipeId::from(row.get::<_, String>(0)?),
        identity,
        signature,
        return_volatile: row.get::<_, i32>(5)? != 0,
        is_deterministic: row.get::<_, i32>(6)? != 0,
        has_output_func: row.get::<_, i32>(7)? != 0,
        description: row.get(8)?,
        created_at: parse_dt(row.get::<_, String>(9)?)?,
    })
}

fn row_to_resource(row: &rusqlite::Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: ResourceId::from(row.get::<_, String>(0)?),
        task_id: TaskId::from(row.get::<_, String>(1)?),
        ordinal: row.get::<_, i64>(2)? as u32,
        vault_hash: row.get(3)?,
        volatile: row.get::<_, i32>(4)? != 0,
        description: row.get(5)?,
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileResource> {
    Ok(FileResource {
        id: FileId::from(row.get::<_, String>(0)?),
        task_id: row.get::<_, Option<String>>(1)?.map(TaskId::from),
        path: row.get::<_, String>(2)?.into(),
        size: row.get::<_, i64>(3)? as u64,
        md5: row.get(4)?,
        registered_at: parse_dt(row.get::<_, String>(5)?)?,
        description: row.get(6)?,
    })
}

fn decode_input(
    kind: &str,
    node_id: Option<String>,
    literal: Option<String>,
) -> Result<Argument> {
    match kind {
        "literal" => {
            let raw = literal
                .ok_or_else(|| StoreError::Corrupt("literal input without a payload".into()))?;
            let value: Value = serde_json::from_str(&raw)?;
            Ok(Argument::Value(value))
        }
        "resource" => {
            let id = node_id
                .ok_or_else(|| StoreError::Corrupt("resource input without a node id".into()))?;
            Ok(Argument::Resource(id.into()))
        }
        "file" => {
            let id = node_id
                .ok_or_else(|| StoreError::Corrupt("file input without a node id".into()))?;
            Ok(Argument::File(id.into()))
        }
        other => Err(StoreError::Corrupt(format!("unknown input kind `{other}`"))),
    }
}

fn insert_file(tx: &Transaction<'_>, file: &FileResource) -> Result<()> {
    tx.execute(
        "INSERT INTO files (id, task_id, path, size, md5, registered_at, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            file.id.as_str(),
            file.task_id.as_ref().map(|t| t.as_str()),
            file.path.display().to_string(),
            file.size as i64,
            file.md5,
            file.registered_at.to_rfc3339(),
            file.description,
        ],
    )?;
    Ok(())
}

fn set_flag(
    conn: &Connection,
    kind: &str,
    node_id: &str,
    flag: &str,
    value: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO info_flags (kind, node_id, flag, value) VALUES (?1, ?2, ?3, ?4)",
        params![kind, node_id, flag, value],
    )?;
    Ok(())
}

fn clear_flags(conn: &Connection, kind: &str, node_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM info_flags WHERE kind = ?1 AND node_id = ?2",
        params![kind, node_id],
    )?;
    Ok(())
}
