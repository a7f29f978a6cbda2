use std::io::Write;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use log::{debug, info, Level};
use logging_timer::timer;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;

use crate::error::UpgradeError;
use crate::patch::display_version;

pub const DEFAULT_VERSION_TABLE: &str = "DBVERSION";
pub const DEFAULT_LOG_TABLE: &str = "DBVERSIONLOG";

/// Spec of a version table without a `SPEC` column.
pub const LEGACY_SPEC: &str = "1.0";
/// Spec that introduced the history `TYPE` column.
pub const TYPED_HISTORY_SPEC: &str = "1.1";

const MAX_TEXT_BYTES: usize = 3000;
const COMPLETED: &str = "COMPLETED VERSION ";
const DOWNGRADED: &str = "DOWNGRADED VERSION ";

/// The persisted progress row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressRecord {
    pub version: Option<String>,
    /// Set while a patch towards this version is part way done
    pub target: Option<String>,
    pub statements_done: u32,
    /// Schema version of the control tables; `None` before the first setup
    pub spec: Option<String>,
}

/// What the control tables look like on disk.
#[derive(Debug, Clone, Copy, Default)]
struct Layout {
    version_table: bool,
    spec_column: bool,
    log_table: bool,
    type_column: bool,
}

/// One row of the history log, as exported.
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub statement: Option<u32>,
    pub stamp: Option<String>,
    pub command: Option<String>,
    pub result: Option<String>,
}

/// Version table and history log of the database being upgraded.
///
/// Every call takes the connection the default user's statements run on, so progress
/// writes join whatever transaction a patch has open.
///
/// The record is cached until the store is marked stale. Patches can create or alter
/// the control tables, so the layout is probed again on every reload.
pub struct ProgressStore {
    version_table: String,
    log_table: String,
    log_statements: bool,
    layout: Layout,
    record: Option<ProgressRecord>,
}

impl ProgressStore {
    pub fn new(version_table: &str, log_table: &str, log_statements: bool) -> Self {
        ProgressStore {
            version_table: version_table.to_owned(),
            log_table: log_table.to_owned(),
            log_statements,
            layout: Layout::default(),
            record: None,
        }
    }

    pub fn set_stale(&mut self) {
        self.record = None;
    }

    fn table_exists(conn: &Connection, table: &str) -> Result<bool, UpgradeError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, UpgradeError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM pragma_table_info(?1) WHERE name = ?2 COLLATE NOCASE",
            [table, column],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn probe(&self, conn: &Connection) -> Result<Layout, UpgradeError> {
        let version_table = Self::table_exists(conn, &self.version_table)?;
        let log_table = Self::table_exists(conn, &self.log_table)?;
        Ok(Layout {
            version_table,
            spec_column: version_table && Self::column_exists(conn, &self.version_table, "SPEC")?,
            log_table,
            type_column: log_table && Self::column_exists(conn, &self.log_table, "TYPE")?,
        })
    }

    /// The progress record, reloaded when stale.
    pub fn read(&mut self, conn: &Connection) -> Result<&ProgressRecord, UpgradeError> {
        if self.record.is_none() {
            let _tmr = timer!(Level::Trace; "ProgressStore::read");
            self.layout = self.probe(conn)?;
            let record = self.load(conn)?;
            debug!("Loaded progress record {:?}", record);
            self.record = Some(record);
        }
        self.record
            .as_ref()
            .ok_or_else(|| UpgradeError::Error("Progress record not loaded".to_owned()))
    }

    fn load(&self, conn: &Connection) -> Result<ProgressRecord, UpgradeError> {
        if !self.layout.version_table {
            return Ok(ProgressRecord::default());
        }

        let sql = if self.layout.spec_column {
            format!("SELECT VERSION, TARGET, STATEMENTS, SPEC FROM {}", self.version_table)
        } else {
            format!("SELECT VERSION, TARGET, STATEMENTS, NULL FROM {}", self.version_table)
        };
        let row = conn
            .query_row(&sql, [], |row| {
                Ok(ProgressRecord {
                    version: row.get(0)?,
                    target: row.get(1)?,
                    statements_done: row.get::<_, Option<u32>>(2)?.unwrap_or(0),
                    spec: row.get(3)?,
                })
            })
            .optional()?;

        let mut record = row.unwrap_or_default();
        if record.spec.is_none() {
            // No SPEC column means the legacy layout; an empty SPEC column means the
            // tables were just created by a setup that hasn't recorded itself yet
            record.spec = Some(
                if self.layout.spec_column {
                    TYPED_HISTORY_SPEC
                } else {
                    LEGACY_SPEC
                }
                .to_owned(),
            );
        }
        Ok(record)
    }

    pub fn version(&mut self, conn: &Connection) -> Result<Option<String>, UpgradeError> {
        Ok(self.read(conn)?.version.clone())
    }

    pub fn target(&mut self, conn: &Connection) -> Result<Option<String>, UpgradeError> {
        Ok(self.read(conn)?.target.clone())
    }

    pub fn statements_done(&mut self, conn: &Connection) -> Result<u32, UpgradeError> {
        Ok(self.read(conn)?.statements_done)
    }

    pub fn spec(&mut self, conn: &Connection) -> Result<Option<String>, UpgradeError> {
        Ok(self.read(conn)?.spec.clone())
    }

    fn require_version_table(&mut self, conn: &Connection) -> Result<(), UpgradeError> {
        self.read(conn)?;
        if !self.layout.version_table {
            return Err(UpgradeError::Config(format!(
                "Version table {} does not exist, the upgrade file needs a SETUP block that creates it",
                self.version_table
            )));
        }
        Ok(())
    }

    /// Runs `update` on the single progress row, or `insert` when the table is empty.
    fn update_or_insert(
        conn: &Connection,
        update: &str,
        insert: &str,
        params: &[&dyn ToSql],
    ) -> Result<(), UpgradeError> {
        if conn.execute(update, params)? == 0 {
            conn.execute(insert, params)?;
        }
        Ok(())
    }

    /// Records that `count` statements of the patch towards `target` are done.
    pub fn begin_progress(&mut self, conn: &Connection, target: &str, count: u32) -> Result<(), UpgradeError> {
        self.require_version_table(conn)?;
        Self::update_or_insert(
            conn,
            &format!("UPDATE {} SET TARGET = ?1, STATEMENTS = ?2", self.version_table),
            &format!("INSERT INTO {} (TARGET, STATEMENTS) VALUES (?1, ?2)", self.version_table),
            params![target, count],
        )?;
        if let Some(record) = self.record.as_mut() {
            record.target = Some(target.to_owned());
            record.statements_done = count;
        }
        Ok(())
    }

    /// Marks the jump to `version` as complete.
    pub fn commit_version(&mut self, conn: &Connection, version: &str) -> Result<(), UpgradeError> {
        self.require_version_table(conn)?;
        Self::update_or_insert(
            conn,
            &format!(
                "UPDATE {} SET VERSION = ?1, TARGET = NULL, STATEMENTS = 0",
                self.version_table
            ),
            &format!("INSERT INTO {} (VERSION, STATEMENTS) VALUES (?1, 0)", self.version_table),
            params![version],
        )?;
        info!("Database is now at version \"{}\"", version);
        if let Some(record) = self.record.as_mut() {
            record.version = Some(version.to_owned());
            record.target = None;
            record.statements_done = 0;
        }
        Ok(())
    }

    /// Records the control tables' spec after a setup patch.
    pub fn update_spec(&mut self, conn: &Connection, spec: &str) -> Result<(), UpgradeError> {
        self.require_version_table(conn)?;
        if !self.layout.spec_column {
            if spec == LEGACY_SPEC {
                return Ok(());
            }
            return Err(UpgradeError::Config(format!(
                "Version table {} has no SPEC column for spec \"{}\"",
                self.version_table, spec
            )));
        }
        Self::update_or_insert(
            conn,
            &format!("UPDATE {} SET SPEC = ?1", self.version_table),
            &format!("INSERT INTO {} (SPEC, STATEMENTS) VALUES (?1, 0)", self.version_table),
            params![spec],
        )?;
        debug!("Control tables at spec \"{}\"", spec);
        self.set_stale();
        Ok(())
    }

    /// The `UPGRADE` command of the legacy setup: classifies the existing history rows
    /// and records the new spec.
    pub fn migrate_history(&mut self, conn: &mut Connection) -> Result<(), UpgradeError> {
        let _tmr = timer!(Level::Debug; "ProgressStore::migrate_history");
        self.set_stale();
        self.read(conn)?;
        if !self.layout.type_column || !self.layout.spec_column {
            return Err(UpgradeError::Config(format!(
                "UPGRADE needs the TYPE column in {} and the SPEC column in {}",
                self.log_table, self.version_table
            )));
        }

        let pattern = format!("{}%", COMPLETED);
        // A savepoint nests inside a transaction the patch may have open
        let tx = conn.savepoint()?;
        tx.execute(
            &format!(
                "UPDATE {} SET TYPE = 'S' WHERE RESULT IS NULL OR RESULT NOT LIKE ?1",
                self.log_table
            ),
            [&pattern],
        )?;
        tx.execute(
            &format!("UPDATE {} SET TYPE = 'B' WHERE RESULT LIKE ?1", self.log_table),
            [&pattern],
        )?;
        tx.execute(
            &format!("UPDATE {} SET SPEC = ?1", self.version_table),
            [TYPED_HISTORY_SPEC],
        )?;
        tx.commit()?;

        info!("Migrated history log {} to spec \"{}\"", self.log_table, TYPED_HISTORY_SPEC);
        self.set_stale();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_history(
        &mut self,
        conn: &Connection,
        entry_type: &str,
        source: Option<&str>,
        target: &str,
        statement: Option<u32>,
        command: Option<&str>,
        result: Option<&str>,
    ) -> Result<(), UpgradeError> {
        self.read(conn)?;
        if !self.layout.version_table {
            debug!("No control tables yet, history entry for \"{}\" not kept", target);
            return Ok(());
        }
        if !self.layout.log_table {
            return Err(UpgradeError::Config(format!(
                "History log {} does not exist, the SETUP block that creates {} must create it too",
                self.log_table, self.version_table
            )));
        }

        let stamp = Utc::now().timestamp();
        let command = command.map(|c| truncate(c, MAX_TEXT_BYTES));
        let result = result.map(|r| truncate(r, MAX_TEXT_BYTES));

        if self.layout.type_column {
            conn.execute(
                &format!(
                    "INSERT INTO {} (TYPE, SOURCE, TARGET, STATEMENT, STAMP, COMMAND, RESULT) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    self.log_table
                ),
                params![entry_type, source, target, statement, stamp, command, result],
            )?;
        } else {
            conn.execute(
                &format!(
                    "INSERT INTO {} (SOURCE, TARGET, STATEMENT, STAMP, COMMAND, RESULT) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    self.log_table
                ),
                params![source, target, statement, stamp, command, result],
            )?;
        }
        Ok(())
    }

    /// Logs a statement of the patch towards `target`; `index` is `None` for statements
    /// that aren't counted. `result` is `None` for success; successes are only kept
    /// when statement logging is on.
    pub fn append_history(
        &mut self,
        conn: &Connection,
        source: Option<&str>,
        target: &str,
        index: Option<u32>,
        command: &str,
        result: Option<&str>,
    ) -> Result<(), UpgradeError> {
        if result.is_none() && !self.log_statements {
            return Ok(());
        }
        self.insert_history(conn, "S", source, target, index, Some(command), result)
    }

    pub fn log_complete(
        &mut self,
        conn: &Connection,
        source: Option<&str>,
        target: &str,
    ) -> Result<(), UpgradeError> {
        let result = format!("{}{}", COMPLETED, target);
        self.insert_history(conn, "B", source, target, None, None, Some(&result))
    }

    /// Rewrites the completion markers of `versions` so they no longer count as reached.
    pub fn downgrade_history(
        &mut self,
        conn: &mut Connection,
        versions: &IndexSet<String>,
    ) -> Result<(), UpgradeError> {
        self.read(conn)?;
        if !self.layout.log_table || versions.is_empty() {
            return Ok(());
        }

        let pattern = format!("{}%", COMPLETED);
        let sql = format!(
            "UPDATE {} SET RESULT = ?1 || TARGET WHERE RESULT LIKE ?2 AND TARGET = ?3",
            self.log_table
        );
        let tx = conn.savepoint()?;
        for version in versions {
            let changed = tx.execute(&sql, params![DOWNGRADED, pattern, version])?;
            debug!("Downgraded {} history entries for \"{}\"", changed, version);
        }
        tx.commit()?;
        Ok(())
    }

    /// True when the history records that `version` was completed.
    pub fn log_contains(&mut self, conn: &Connection, version: &str) -> Result<bool, UpgradeError> {
        self.read(conn)?;
        if !self.layout.log_table {
            return Ok(false);
        }

        let count: i64 = conn.query_row(
            &format!(
                "SELECT count(*) FROM {} WHERE RESULT LIKE ?1 AND TARGET = ?2",
                self.log_table
            ),
            params![format!("{}%", COMPLETED), version],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn history(&mut self, conn: &Connection) -> Result<Vec<HistoryEntry>, UpgradeError> {
        self.read(conn)?;
        if !self.layout.log_table {
            return Ok(Vec::new());
        }

        let entry_type = if self.layout.type_column { "TYPE" } else { "NULL" };
        let mut stmt = conn.prepare(&format!(
            "SELECT ID, {}, SOURCE, TARGET, STATEMENT, STAMP, COMMAND, RESULT FROM {} ORDER BY ID",
            entry_type, self.log_table
        ))?;
        let rows = stmt.query_map([], |row| {
            let stamp: Option<i64> = row.get(5)?;
            Ok(HistoryEntry {
                id: row.get(0)?,
                entry_type: row.get(1)?,
                source: row.get(2)?,
                target: row.get(3)?,
                statement: row.get(4)?,
                stamp: stamp
                    .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
                    .map(|dt| dt.to_rfc3339()),
                command: row.get(6)?,
                result: row.get(7)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Writes the history log as a JSON array.
    pub fn export_history<W: Write>(&mut self, conn: &Connection, sink: W) -> Result<(), UpgradeError> {
        let entries = self.history(conn)?;
        serde_json::to_writer_pretty(sink, &entries)
            .map_err(|e| UpgradeError::Error(format!("Failed to export history: {}", e)))
    }

    /// One line describing where the database stands.
    pub fn version_statement(&mut self, conn: &Connection) -> Result<String, UpgradeError> {
        let record = self.read(conn)?;
        Ok(match (&record.version, &record.target) {
            (version, Some(target)) => format!(
                "The database is upgrading from {} to {}, {} statements succeeded.",
                display_version(version.as_deref()),
                display_version(Some(target.as_str())),
                record.statements_done
            ),
            (Some(version), None) => {
                format!("The database is at version {}.", display_version(Some(version.as_str())))
            }
            (None, None) => "The database has no version yet.".to_owned(),
        })
    }
}

/// `text` cut to at most `max` bytes on a character boundary.
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
