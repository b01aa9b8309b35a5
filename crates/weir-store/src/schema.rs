//! SQLite schema for the provenance database.

/// Current schema version, recorded in the `meta` table.
pub(crate) const SCHEMA_VERSION: i32 = 1;

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipes (
    id               TEXT PRIMARY KEY,
    module           TEXT,
    name             TEXT,
    source_hash      TEXT,
    signature        TEXT NOT NULL,
    return_volatile  INTEGER NOT NULL,
    is_deterministic INTEGER NOT NULL,
    has_output_func  INTEGER NOT NULL,
    description      TEXT,
    created_at       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_pipes_named
    ON pipes (module, name) WHERE module IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_pipes_anonymous
    ON pipes (source_hash) WHERE source_hash IS NOT NULL;

CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    pipe_id     TEXT NOT NULL REFERENCES pipes (id),
    fingerprint TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    description TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_fingerprint ON tasks (fingerprint);

CREATE TABLE IF NOT EXISTS resources (
    id          TEXT PRIMARY KEY,
    task_id     TEXT NOT NULL REFERENCES tasks (id),
    ordinal     INTEGER NOT NULL,
    vault_hash  TEXT,
    volatile    INTEGER NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS files (
    id            TEXT PRIMARY KEY,
    task_id       TEXT REFERENCES tasks (id),
    path          TEXT NOT NULL,
    size          INTEGER NOT NULL,
    md5           TEXT NOT NULL,
    registered_at TEXT NOT NULL,
    description   TEXT
);
CREATE INDEX IF NOT EXISTS idx_files_path ON files (path);

CREATE TABLE IF NOT EXISTS task_inputs (
    task_id  TEXT NOT NULL REFERENCES tasks (id),
    position INTEGER NOT NULL,
    kind     TEXT NOT NULL,
    node_id  TEXT,
    literal  TEXT,
    PRIMARY KEY (task_id, position)
);
CREATE INDEX IF NOT EXISTS idx_task_inputs_node ON task_inputs (node_id);

CREATE TABLE IF NOT EXISTS task_outputs (
    task_id  TEXT NOT NULL REFERENCES tasks (id),
    position INTEGER NOT NULL,
    kind     TEXT NOT NULL,
    node_id  TEXT NOT NULL,
    PRIMARY KEY (task_id, position)
);
CREATE INDEX IF NOT EXISTS idx_task_outputs_node ON task_outputs (node_id);

CREATE TABLE IF NOT EXISTS info_flags (
    kind    TEXT NOT NULL,
    node_id TEXT NOT NULL,
    flag    TEXT NOT NULL,
    value   TEXT,
    PRIMARY KEY (kind, node_id, flag)
);
";
