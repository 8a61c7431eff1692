/// SQL DDL for the registry database.
///
/// All four pipeline stages share one `file_instances` table keyed by a
/// global id with a `stage` discriminator. Audit and lineage rows are
/// append-only; triggers reject any UPDATE or DELETE against them.

pub const SCHEMA_VERSION: i32 = 1;

pub const CREATE_TABLES_SQL: &str = "
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

-- Environments: isolated workspaces, each with its own asset folder
CREATE TABLE IF NOT EXISTS environments (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    category TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'Pending',
    allowed_roles TEXT NOT NULL DEFAULT 'all',
    purpose TEXT,
    source_environment_id TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (source_environment_id) REFERENCES environments(id)
);

-- Blueprints: templates that define what a file must look like
CREATE TABLE IF NOT EXISTS blueprints (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    stage TEXT NOT NULL,
    purpose TEXT,
    owner_team TEXT,
    source_type TEXT,
    source_name TEXT,
    source_specifier TEXT,
    workflow TEXT NOT NULL DEFAULT 'doer_and_reviewer',
    doer_roles TEXT NOT NULL DEFAULT 'admin',
    reviewer_roles TEXT NOT NULL DEFAULT 'admin',
    expected_extension TEXT NOT NULL,
    min_size_kb REAL,
    max_size_kb REAL,
    expected_structure TEXT,
    primary_key_column TEXT,
    status TEXT NOT NULL DEFAULT 'Active',
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- File instances: one row per uploaded version, never deleted
CREATE TABLE IF NOT EXISTS file_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stage TEXT NOT NULL,
    blueprint_id TEXT NOT NULL,
    env_id TEXT NOT NULL,
    rel_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    structure TEXT,
    validation_summary TEXT,
    current_status TEXT NOT NULL DEFAULT 'Active',
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(env_id, rel_path),
    FOREIGN KEY (blueprint_id) REFERENCES blueprints(id),
    FOREIGN KEY (env_id) REFERENCES environments(id)
);

-- Lineage: parent -> child links between file instances
CREATE TABLE IF NOT EXISTS lineage_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_stage TEXT NOT NULL,
    parent_id INTEGER NOT NULL,
    child_stage TEXT NOT NULL,
    child_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(parent_id, child_id),
    FOREIGN KEY (parent_id) REFERENCES file_instances(id),
    FOREIGN KEY (child_id) REFERENCES file_instances(id)
);

-- Audit log: the single source of truth for governance
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    capacity TEXT NOT NULL,
    comment TEXT
);

-- Project plan tasks
CREATE TABLE IF NOT EXISTS milestones (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    env_id TEXT NOT NULL,
    title TEXT NOT NULL,
    duration_days INTEGER NOT NULL DEFAULT 1,
    due_date TEXT,
    owner TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'Pending',
    target_kind TEXT,
    target_id TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (env_id) REFERENCES environments(id)
);

-- Finish-to-start dependencies: task cannot start before predecessor ends
CREATE TABLE IF NOT EXISTS dependencies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    predecessor_task_id INTEGER NOT NULL,
    UNIQUE(task_id, predecessor_task_id),
    CHECK(task_id <> predecessor_task_id),
    FOREIGN KEY (task_id) REFERENCES milestones(id) ON DELETE CASCADE,
    FOREIGN KEY (predecessor_task_id) REFERENCES milestones(id) ON DELETE CASCADE
);

-- Action items raised against anything in an environment
CREATE TABLE IF NOT EXISTS action_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    env_id TEXT NOT NULL,
    description TEXT NOT NULL,
    owner TEXT NOT NULL,
    due_date TEXT,
    status TEXT NOT NULL DEFAULT 'Open',
    target_kind TEXT,
    target_id TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (env_id) REFERENCES environments(id)
);
";

pub const CREATE_INDEXES_SQL: &str = "
-- At most one Active instance per (blueprint, environment) slot
CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_one_active
    ON file_instances(blueprint_id, env_id) WHERE current_status = 'Active';
CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_slot_hash
    ON file_instances(blueprint_id, env_id, content_hash);
CREATE INDEX IF NOT EXISTS idx_instances_env_stage ON file_instances(env_id, stage);
CREATE INDEX IF NOT EXISTS idx_lineage_child ON lineage_links(child_id);
CREATE INDEX IF NOT EXISTS idx_lineage_parent ON lineage_links(parent_id);
CREATE INDEX IF NOT EXISTS idx_audit_target ON audit_log(target_kind, target_id);
CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_milestones_env ON milestones(env_id);
CREATE INDEX IF NOT EXISTS idx_milestones_owner ON milestones(owner);
CREATE INDEX IF NOT EXISTS idx_dependencies_pred ON dependencies(predecessor_task_id);
CREATE INDEX IF NOT EXISTS idx_action_items_env ON action_items(env_id);
CREATE INDEX IF NOT EXISTS idx_action_items_owner ON action_items(owner);
";

pub const CREATE_TRIGGERS_SQL: &str = "
CREATE TRIGGER IF NOT EXISTS audit_log_no_update
    BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
    BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS lineage_no_update
    BEFORE UPDATE ON lineage_links
BEGIN
    SELECT RAISE(ABORT, 'lineage_links is append-only');
END;

CREATE TRIGGER IF NOT EXISTS lineage_no_delete
    BEFORE DELETE ON lineage_links
BEGIN
    SELECT RAISE(ABORT, 'lineage_links is append-only');
END;

CREATE TRIGGER IF NOT EXISTS file_instances_no_delete
    BEFORE DELETE ON file_instances
BEGIN
    SELECT RAISE(ABORT, 'file instances are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS file_instances_immutable
    BEFORE UPDATE OF stage, blueprint_id, env_id, rel_path, content_hash, size_bytes,
        structure, created_by, created_at ON file_instances
BEGIN
    SELECT RAISE(ABORT, 'only current_status of a file instance may change');
END;

CREATE TRIGGER IF NOT EXISTS environments_no_delete
    BEFORE DELETE ON environments
BEGIN
    SELECT RAISE(ABORT, 'environments are archived, never deleted');
END;
";
