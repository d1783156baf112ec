//! Store collaborator: change capture, upsert-by-id, and transactional save

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{
    ChangeRecord, ChangeType, Checkpoint, EntityKind, FieldMap, GoalMap, RecordId, SyncMeta,
    SyncStatus, TelemetryPoint, META_COLUMNS,
};
use crate::util::now_millis;

use super::values::{from_sql, to_sql};
use super::Database;

/// Who performed a write. Recorded on every change-log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Author {
    /// A user action on this device
    Local,
    /// The merge engine applying a companion-device message
    Peer,
    /// The merge engine applying a cloud document
    Cloud,
    /// Sync status and version updates
    Bookkeeping,
}

impl Author {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Peer => "peer",
            Self::Cloud => "cloud",
            Self::Bookkeeping => "bookkeeping",
        }
    }
}

/// How sync metadata is stamped by an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMeta {
    /// Record needs a cloud push
    Pending,
    /// Record mirrors a confirmed cloud state
    Synced { version: i64, last_synced_at: Option<i64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// A child whose parent could not be found when it was merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrphanLink {
    pub entity: EntityKind,
    pub id: RecordId,
    pub parent: RecordId,
}

/// Operations available inside a store transaction.
pub trait StoreTxn {
    fn exists(&self, kind: EntityKind, id: RecordId) -> Result<bool>;

    /// Full row snapshot: `id`, domain columns, and sync metadata.
    fn fetch(&self, kind: EntityKind, id: RecordId) -> Result<Option<FieldMap>>;

    /// Full snapshots of the children owned by a root, ordered by `order_index`.
    fn children(&self, root: EntityKind, id: RecordId) -> Result<Vec<FieldMap>>;

    /// Every root id of `kind`, in store order.
    fn root_ids(&self, kind: EntityKind) -> Result<Vec<RecordId>>;

    fn sync_meta(&self, kind: EntityKind, id: RecordId) -> Result<Option<SyncMeta>>;

    /// Insert-or-update keyed by id. Keys that are not syncable columns are ignored;
    /// columns absent from `fields` keep their stored value.
    fn upsert(
        &mut self,
        kind: EntityKind,
        id: RecordId,
        fields: &FieldMap,
        meta: WriteMeta,
    ) -> Result<UpsertOutcome>;

    /// Delete by id; `false` when already absent.
    fn delete(&mut self, kind: EntityKind, id: RecordId) -> Result<bool>;

    /// Delete a root and every child it owns. Returns the number of rows removed.
    fn delete_subgraph(&mut self, root: EntityKind, id: RecordId) -> Result<usize>;

    fn set_parent(&mut self, kind: EntityKind, id: RecordId, parent: RecordId) -> Result<bool>;

    fn set_sync_status(&mut self, kind: EntityKind, id: RecordId, status: SyncStatus)
        -> Result<bool>;

    fn set_sync_meta(&mut self, kind: EntityKind, id: RecordId, meta: SyncMeta) -> Result<bool>;

    fn record_orphan(&mut self, orphan: OrphanLink) -> Result<()>;

    fn clear_orphan(&mut self, kind: EntityKind, id: RecordId) -> Result<()>;

    fn orphans(&self) -> Result<Vec<OrphanLink>>;

    /// Remove every record of a kind. Returns the number of rows removed.
    fn clear_kind(&mut self, kind: EntityKind) -> Result<usize>;

    fn replace_goals(&mut self, goals: &GoalMap) -> Result<()>;

    fn merge_goals(&mut self, goals: &GoalMap) -> Result<()>;

    fn append_telemetry(&mut self, point: &TelemetryPoint) -> Result<()>;
}

/// The local persistent store the sync engine runs against.
///
/// The store is the exclusion domain: `transaction` serializes writers, so a
/// fetch-or-create inside one transaction can never race another.
pub trait SyncStore: Send + Sync + 'static {
    /// Changes committed after `checkpoint` by any of `authors`, in commit order,
    /// and the checkpoint just past the last history row scanned.
    fn fetch_since(
        &self,
        checkpoint: Checkpoint,
        authors: &[Author],
        limit: usize,
    ) -> Result<(Vec<ChangeRecord>, Checkpoint)>;

    /// Run `f` in one transaction; commits when `f` returns `Ok`.
    fn transaction<T, F>(&self, author: Author, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTxn) -> Result<T>;

    /// Run read-only work against a consistent view.
    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn StoreTxn) -> Result<T>;

    fn load_checkpoint(&self, consumer: &str) -> Result<Checkpoint>;

    /// Persist a consumer checkpoint. Never moves backwards; returns the stored value.
    fn save_checkpoint(&self, consumer: &str, checkpoint: Checkpoint) -> Result<Checkpoint>;

    /// Roots whose subgraph needs a cloud push, in store iteration order.
    fn pending_roots(&self) -> Result<Vec<(EntityKind, RecordId)>>;

    fn load_goals(&self) -> Result<GoalMap>;
}

/// Run store work on the blocking pool, off the async executor.
pub async fn on_store<S, T, F>(store: &Arc<S>, f: F) -> Result<T>
where
    S: SyncStore,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|error| Error::Database(format!("store task failed: {error}")))?
}

/// `SQLite` implementation of `SyncStore`
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub const fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| Error::Database("store lock poisoned".to_string()))
    }

    /// Run a local (user-authored) write against the raw connection.
    ///
    /// Used by the typed repositories; commits when `f` returns `Ok`.
    pub fn local<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut db = self.lock()?;
        let tx = db.connection_mut().transaction()?;
        set_author(&tx, Author::Local)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Highest change-log sequence written so far.
    pub fn history_head(&self) -> Result<Checkpoint> {
        let db = self.lock()?;
        let seq: Option<i64> = db
            .connection()
            .query_row("SELECT MAX(seq) FROM change_log", [], |row| row.get(0))?;
        Ok(Checkpoint::from_seq(seq.unwrap_or(0)))
    }

    pub fn telemetry_for(&self, workout_id: RecordId) -> Result<Vec<TelemetryPoint>> {
        let db = self.lock()?;
        let mut stmt = db.connection().prepare(
            "SELECT recorded_at, elapsed_ms, heart_rate, distance_m
             FROM telemetry_points WHERE workout_id = ? ORDER BY recorded_at, id",
        )?;
        let points = stmt
            .query_map(params![workout_id.as_str()], |row| {
                Ok(TelemetryPoint {
                    workout_id,
                    recorded_at: row.get(0)?,
                    elapsed_ms: row.get(1)?,
                    heart_rate: row.get(2)?,
                    distance_m: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }
}

fn set_author(conn: &Connection, author: Author) -> Result<()> {
    conn.execute(
        "UPDATE sync_session SET author = ? WHERE id = 1",
        params![author.as_str()],
    )?;
    Ok(())
}

/// Strip the id and local sync metadata from a full row snapshot.
pub fn sync_payload(mut fields: FieldMap) -> FieldMap {
    fields.remove("id");
    for column in META_COLUMNS {
        fields.remove(column.name);
    }
    fields
}

fn parse_id(raw: &str) -> Result<RecordId> {
    raw.parse()
        .map_err(|_| Error::Database(format!("invalid record id in store: {raw}")))
}

impl SyncStore for SqliteStore {
    fn fetch_since(
        &self,
        checkpoint: Checkpoint,
        authors: &[Author],
        limit: usize,
    ) -> Result<(Vec<ChangeRecord>, Checkpoint)> {
        let db = self.lock()?;
        let conn = db.connection();
        let txn = SqliteTxn { conn };

        let mut stmt = conn.prepare(
            "SELECT seq, entity, record_id, change_type, author
             FROM change_log WHERE seq > ? ORDER BY seq LIMIT ?",
        )?;
        let rows = stmt
            .query_map(
                params![checkpoint.seq(), i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut next = checkpoint;
        let mut records = Vec::with_capacity(rows.len());
        for (seq, entity, record_id, change_type, author) in rows {
            next = Checkpoint::from_seq(seq);
            if !authors.iter().any(|wanted| wanted.as_str() == author) {
                continue;
            }

            let kind = EntityKind::from_str(&entity)?;
            let id = parse_id(&record_id)?;
            let change_type = ChangeType::from_str(&change_type)?;

            if change_type == ChangeType::Delete {
                records.push(ChangeRecord::delete(kind, id));
                continue;
            }

            // A later delete in the history supersedes this row
            let Some(values) = txn.fetch(kind, id)? else {
                continue;
            };
            records.push(ChangeRecord::upsert(kind, id, change_type, sync_payload(values)));
        }

        Ok((records, next))
    }

    fn transaction<T, F>(&self, author: Author, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTxn) -> Result<T>,
    {
        let mut db = self.lock()?;
        let tx = db.connection_mut().transaction()?;
        set_author(&tx, author)?;
        let out = {
            let mut txn = SqliteTxn { conn: &tx };
            f(&mut txn)?
        };
        set_author(&tx, Author::Local)?;
        tx.commit()?;
        Ok(out)
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn StoreTxn) -> Result<T>,
    {
        let db = self.lock()?;
        let txn = SqliteTxn {
            conn: db.connection(),
        };
        f(&txn)
    }

    fn load_checkpoint(&self, consumer: &str) -> Result<Checkpoint> {
        let db = self.lock()?;
        let seq: Option<i64> = db
            .connection()
            .query_row(
                "SELECT seq FROM sync_checkpoints WHERE consumer = ?",
                params![consumer],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Checkpoint::from_seq(seq.unwrap_or(0)))
    }

    fn save_checkpoint(&self, consumer: &str, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let db = self.lock()?;
        let conn = db.connection();
        conn.execute(
            "INSERT INTO sync_checkpoints (consumer, seq) VALUES (?1, ?2)
             ON CONFLICT(consumer) DO UPDATE SET seq = MAX(seq, excluded.seq)",
            params![consumer, checkpoint.seq()],
        )?;
        let stored: i64 = conn.query_row(
            "SELECT seq FROM sync_checkpoints WHERE consumer = ?",
            params![consumer],
            |row| row.get(0),
        )?;
        Ok(Checkpoint::from_seq(stored))
    }

    fn pending_roots(&self) -> Result<Vec<(EntityKind, RecordId)>> {
        let db = self.lock()?;
        let conn = db.connection();
        let mut roots = Vec::new();
        for kind in [EntityKind::Workout, EntityKind::WorkoutTemplate] {
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM {} WHERE sync_status IN ('pending', 'error') ORDER BY rowid",
                kind.table()
            ))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for id in ids {
                roots.push((kind, parse_id(&id)?));
            }
        }
        Ok(roots)
    }

    fn load_goals(&self) -> Result<GoalMap> {
        let db = self.lock()?;
        let mut stmt = db
            .connection()
            .prepare("SELECT exercise_name, target_seconds FROM goals ORDER BY exercise_name")?;
        let goals = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
            .collect::<rusqlite::Result<GoalMap>>()?;
        Ok(goals)
    }
}

/// `StoreTxn` over a connection or an open transaction.
struct SqliteTxn<'a> {
    conn: &'a Connection,
}

impl SqliteTxn<'_> {
    fn select_columns(kind: EntityKind) -> String {
        std::iter::once("id")
            .chain(kind.columns().iter().map(|column| column.name))
            .chain(META_COLUMNS.iter().map(|column| column.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn row_to_fields(kind: EntityKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<FieldMap> {
        let mut fields = FieldMap::new();
        fields.insert("id".into(), serde_json::Value::String(row.get(0)?));
        for (index, column) in kind.columns().iter().chain(META_COLUMNS).enumerate() {
            let value = from_sql(column.ty, row.get_ref(index + 1)?);
            fields.insert(column.name.into(), value);
        }
        Ok(fields)
    }

    fn meta_params(meta: WriteMeta) -> (Vec<&'static str>, Vec<SqlValue>) {
        match meta {
            WriteMeta::Pending => (
                vec!["sync_status"],
                vec![SqlValue::Text(SyncStatus::Pending.as_str().into())],
            ),
            WriteMeta::Synced {
                version,
                last_synced_at,
            } => (
                vec!["sync_status", "version", "last_synced_at"],
                vec![
                    SqlValue::Text(SyncStatus::Synced.as_str().into()),
                    SqlValue::Integer(version),
                    last_synced_at.map_or(SqlValue::Null, SqlValue::Integer),
                ],
            ),
        }
    }
}

impl StoreTxn for SqliteTxn<'_> {
    fn exists(&self, kind: EntityKind, id: RecordId) -> Result<bool> {
        let exists = self.conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)", kind.table()),
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn fetch(&self, kind: EntityKind, id: RecordId) -> Result<Option<FieldMap>> {
        let fields = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE id = ?",
                    Self::select_columns(kind),
                    kind.table()
                ),
                params![id.as_str()],
                |row| Self::row_to_fields(kind, row),
            )
            .optional()?;
        Ok(fields)
    }

    fn children(&self, root: EntityKind, id: RecordId) -> Result<Vec<FieldMap>> {
        let Some(child) = root.child() else {
            return Ok(Vec::new());
        };
        let Some(link) = child.parent() else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} = ? ORDER BY order_index, rowid",
            Self::select_columns(child),
            child.table(),
            link.column
        ))?;
        let children = stmt
            .query_map(params![id.as_str()], |row| Self::row_to_fields(child, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(children)
    }

    fn root_ids(&self, kind: EntityKind) -> Result<Vec<RecordId>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {} ORDER BY rowid", kind.table()))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids.iter().map(|id| parse_id(id)).collect()
    }

    fn sync_meta(&self, kind: EntityKind, id: RecordId) -> Result<Option<SyncMeta>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT version, sync_status, last_synced_at FROM {} WHERE id = ?",
                    kind.table()
                ),
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(version, status, last_synced_at)| {
            Ok(SyncMeta {
                version,
                sync_status: status.parse()?,
                last_synced_at,
            })
        })
        .transpose()
    }

    fn upsert(
        &mut self,
        kind: EntityKind,
        id: RecordId,
        fields: &FieldMap,
        meta: WriteMeta,
    ) -> Result<UpsertOutcome> {
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (name, value) in fields {
            // Unknown attributes are tolerated so newer peers can add fields
            let Some(column) = kind.column(name) else {
                continue;
            };
            names.push(column.name);
            values.push(to_sql(column, value)?);
        }
        let (meta_names, meta_values) = Self::meta_params(meta);
        names.extend(meta_names);
        values.extend(meta_values);

        if self.exists(kind, id)? {
            let assignments = names
                .iter()
                .map(|name| format!("{name} = ?"))
                .collect::<Vec<_>>()
                .join(", ");
            values.push(SqlValue::Text(id.as_str()));
            self.conn.execute(
                &format!("UPDATE {} SET {assignments} WHERE id = ?", kind.table()),
                params_from_iter(values),
            )?;
            Ok(UpsertOutcome::Updated)
        } else {
            let placeholders = vec!["?"; names.len() + 1].join(", ");
            let columns = std::iter::once("id")
                .chain(names.iter().copied())
                .collect::<Vec<_>>()
                .join(", ");
            values.insert(0, SqlValue::Text(id.as_str()));
            self.conn.execute(
                &format!(
                    "INSERT INTO {} ({columns}) VALUES ({placeholders})",
                    kind.table()
                ),
                params_from_iter(values),
            )?;
            Ok(UpsertOutcome::Inserted)
        }
    }

    fn delete(&mut self, kind: EntityKind, id: RecordId) -> Result<bool> {
        let rows = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?", kind.table()),
            params![id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn delete_subgraph(&mut self, root: EntityKind, id: RecordId) -> Result<usize> {
        let mut removed = 0;
        if let Some(child) = root.child() {
            if let Some(link) = child.parent() {
                removed += self.conn.execute(
                    &format!("DELETE FROM {} WHERE {} = ?", child.table(), link.column),
                    params![id.as_str()],
                )?;
            }
        }
        if self.delete(root, id)? {
            removed += 1;
        }
        Ok(removed)
    }

    fn set_parent(&mut self, kind: EntityKind, id: RecordId, parent: RecordId) -> Result<bool> {
        let Some(link) = kind.parent() else {
            return Err(Error::InvalidInput(format!("{kind} has no parent link")));
        };
        let rows = self.conn.execute(
            &format!("UPDATE {} SET {} = ? WHERE id = ?", kind.table(), link.column),
            params![parent.as_str(), id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn set_sync_status(
        &mut self,
        kind: EntityKind,
        id: RecordId,
        status: SyncStatus,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            &format!("UPDATE {} SET sync_status = ? WHERE id = ?", kind.table()),
            params![status.as_str(), id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn set_sync_meta(&mut self, kind: EntityKind, id: RecordId, meta: SyncMeta) -> Result<bool> {
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET version = ?, sync_status = ?, last_synced_at = ? WHERE id = ?",
                kind.table()
            ),
            params![
                meta.version,
                meta.sync_status.as_str(),
                meta.last_synced_at,
                id.as_str()
            ],
        )?;
        Ok(rows > 0)
    }

    fn record_orphan(&mut self, orphan: OrphanLink) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO orphan_links (entity, record_id, parent_id, recorded_at)
             VALUES (?, ?, ?, ?)",
            params![
                orphan.entity.as_str(),
                orphan.id.as_str(),
                orphan.parent.as_str(),
                now_millis()
            ],
        )?;
        Ok(())
    }

    fn clear_orphan(&mut self, kind: EntityKind, id: RecordId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM orphan_links WHERE entity = ? AND record_id = ?",
            params![kind.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    fn orphans(&self) -> Result<Vec<OrphanLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity, record_id, parent_id FROM orphan_links ORDER BY recorded_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(entity, id, parent)| {
                Ok(OrphanLink {
                    entity: entity.parse()?,
                    id: parse_id(&id)?,
                    parent: parse_id(&parent)?,
                })
            })
            .collect()
    }

    fn clear_kind(&mut self, kind: EntityKind) -> Result<usize> {
        let rows = self
            .conn
            .execute(&format!("DELETE FROM {}", kind.table()), [])?;
        Ok(rows)
    }

    fn replace_goals(&mut self, goals: &GoalMap) -> Result<()> {
        self.conn.execute("DELETE FROM goals", [])?;
        self.merge_goals(goals)
    }

    fn merge_goals(&mut self, goals: &GoalMap) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT OR REPLACE INTO goals (exercise_name, target_seconds) VALUES (?, ?)",
        )?;
        for (name, seconds) in goals {
            stmt.execute(params![name, seconds])?;
        }
        Ok(())
    }

    fn append_telemetry(&mut self, point: &TelemetryPoint) -> Result<()> {
        self.conn.execute(
            "INSERT INTO telemetry_points (workout_id, recorded_at, elapsed_ms, heart_rate, distance_m)
             VALUES (?, ?, ?, ?, ?)",
            params![
                point.workout_id.as_str(),
                point.recorded_at,
                point.elapsed_ms,
                point.heart_rate,
                point.distance_m
            ],
        )?;
        Ok(())
    }
}
