use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info, warn, Level};
use logging_timer::timer;
use phf::Map;
use phf_macros::phf_map;
use rusqlite::{Connection, OpenFlags};
use strum::{Display, EnumString};

use crate::config::{ConnectionConfig, RetryConfig};
use crate::error::UpgradeError;
use crate::interrupt::InterruptToken;

/// Name of the connection that upgrades start on and the progress store lives in.
pub const DEFAULT_DATABASE: &str = "default";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
pub enum CommitStrategy {
    /// Each persistent statement runs in its own transaction
    #[default]
    Transactional,
    /// Statements run as the driver executes them
    Autocommit,
}

/// Primary and extended SQLite result codes by number.
static RESULT_CODES: Map<i32, &'static str> = phf_map! {
    1i32 => "SQLITE_ERROR",
    2i32 => "SQLITE_INTERNAL",
    3i32 => "SQLITE_PERM",
    4i32 => "SQLITE_ABORT",
    5i32 => "SQLITE_BUSY",
    6i32 => "SQLITE_LOCKED",
    7i32 => "SQLITE_NOMEM",
    8i32 => "SQLITE_READONLY",
    9i32 => "SQLITE_INTERRUPT",
    10i32 => "SQLITE_IOERR",
    11i32 => "SQLITE_CORRUPT",
    12i32 => "SQLITE_NOTFOUND",
    13i32 => "SQLITE_FULL",
    14i32 => "SQLITE_CANTOPEN",
    15i32 => "SQLITE_PROTOCOL",
    17i32 => "SQLITE_SCHEMA",
    18i32 => "SQLITE_TOOBIG",
    19i32 => "SQLITE_CONSTRAINT",
    20i32 => "SQLITE_MISMATCH",
    21i32 => "SQLITE_MISUSE",
    23i32 => "SQLITE_AUTH",
    25i32 => "SQLITE_RANGE",
    26i32 => "SQLITE_NOTADB",
    275i32 => "SQLITE_CONSTRAINT_CHECK",
    531i32 => "SQLITE_CONSTRAINT_COMMITHOOK",
    787i32 => "SQLITE_CONSTRAINT_FOREIGNKEY",
    1043i32 => "SQLITE_CONSTRAINT_FUNCTION",
    1299i32 => "SQLITE_CONSTRAINT_NOTNULL",
    1555i32 => "SQLITE_CONSTRAINT_PRIMARYKEY",
    1811i32 => "SQLITE_CONSTRAINT_TRIGGER",
    2067i32 => "SQLITE_CONSTRAINT_UNIQUE",
    2323i32 => "SQLITE_CONSTRAINT_VTAB",
    2579i32 => "SQLITE_CONSTRAINT_ROWID",
};

/// Codes an `IGNORE SQL ERROR` list can name for this error, most specific first:
/// extended name, primary name, extended number, primary number.
pub fn error_codes(error: &rusqlite::Error) -> Vec<String> {
    let rusqlite::Error::SqliteFailure(failure, _) = error else {
        return Vec::new();
    };

    let extended = failure.extended_code;
    let primary = extended & 0xff;
    let mut codes = Vec::with_capacity(4);

    if extended != primary {
        if let Some(name) = RESULT_CODES.get(&extended) {
            codes.push(name.to_string());
        }
    }
    if let Some(name) = RESULT_CODES.get(&primary) {
        codes.push(name.to_string());
    }
    if extended != primary {
        codes.push(extended.to_string());
    }
    codes.push(primary.to_string());
    codes
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// No retries when absent
    pub max_duration: Option<Duration>,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            interval: Duration::from_millis(config.interval_ms),
            max_duration: config.max_duration_secs.map(Duration::from_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: Duration::from_secs(1),
            max_duration: None,
        }
    }
}

/// A named SQLite database with one cached connection per user.
pub struct Database {
    name: String,
    path: PathBuf,
    default_user: Option<String>,
    create: bool,
    busy_timeout: Duration,
    connections: HashMap<String, Connection>,
}

impl Database {
    pub fn new(config: &ConnectionConfig) -> Self {
        Database {
            name: config.name.to_ascii_lowercase(),
            path: config.path.clone(),
            default_user: config.user.clone(),
            create: config.create,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            connections: HashMap::new(),
        }
    }

    fn try_open(&self) -> Result<Connection, rusqlite::Error> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        let conn = Connection::open_with_flags(&self.path, flags)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Opens a new connection, retrying as the policy allows. An interruption ends
    /// the retries early and reports the last failure.
    pub fn open(&self, retry: &RetryPolicy, interrupt: &InterruptToken) -> Result<Connection, UpgradeError> {
        let _tmr = timer!(Level::Debug; "Database::open", "{}", self.name);
        let started = Instant::now();

        loop {
            match self.try_open() {
                Ok(conn) => {
                    debug!("Connected to database '{}' at {}", self.name, self.path.display());
                    return Ok(conn);
                }
                Err(err) => {
                    let retry_allowed = retry
                        .max_duration
                        .is_some_and(|max| started.elapsed() + retry.interval <= max);
                    if !retry_allowed {
                        return Err(UpgradeError::Config(format!(
                            "Could not connect to database '{}' at {}: {}",
                            self.name,
                            self.path.display(),
                            err
                        )));
                    }

                    warn!(
                        "Connecting to database '{}' failed ({}), retrying in {:?}",
                        self.name, err, retry.interval
                    );
                    if interrupt.sleep(retry.interval) {
                        return Err(UpgradeError::Config(format!(
                            "Interrupted while connecting to database '{}': {}",
                            self.name, err
                        )));
                    }
                }
            }
        }
    }

    /// The cached connection for `user`, or for the default user when `None`.
    pub fn connection(
        &mut self,
        user: Option<&str>,
        retry: &RetryPolicy,
        interrupt: &InterruptToken,
    ) -> Result<&mut Connection, UpgradeError> {
        let key = user.or(self.default_user.as_deref()).unwrap_or("").to_owned();

        if !self.connections.contains_key(&key) {
            let conn = self.open(retry, interrupt)?;
            info!("Opened connection for user '{}' on database '{}'", key, self.name);
            self.connections.insert(key.clone(), conn);
        }

        self.connections.get_mut(&key).ok_or_else(|| {
            UpgradeError::Error(format!("Connection for user '{}' disappeared", key))
        })
    }

    pub fn close(&mut self) {
        for (user, conn) in self.connections.drain() {
            if let Err((_, err)) = conn.close() {
                warn!("Closing connection for user '{}' on '{}' failed: {}", user, self.name, err);
            }
        }
    }

    /// Runs one persistent statement under `strategy`. Transaction control statements,
    /// and anything on a connection already inside an explicit transaction, run as is.
    pub fn execute(conn: &mut Connection, sql: &str, strategy: CommitStrategy) -> Result<(), rusqlite::Error> {
        if strategy == CommitStrategy::Autocommit
            || !conn.is_autocommit()
            || is_transaction_control(sql)
        {
            return conn.execute_batch(sql);
        }

        // Dropping the transaction without commit rolls it back
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.commit()
    }
}

/// True when `sql` starts, ends or marks a transaction itself.
fn is_transaction_control(sql: &str) -> bool {
    let keyword = sql
        .split(|c: char| c.is_whitespace() || c == ';')
        .find(|word| !word.is_empty())
        .unwrap_or("");
    TRANSACTION_CONTROL
        .iter()
        .any(|control| keyword.eq_ignore_ascii_case(control))
}

const TRANSACTION_CONTROL: [&str; 6] = ["BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE"];

/// All databases an upgrade can address, by case-insensitive name.
pub struct Databases {
    databases: HashMap<String, Database>,
    retry: RetryPolicy,
    interrupt: InterruptToken,
}

impl Databases {
    pub fn new(default: Database, retry: RetryPolicy, interrupt: InterruptToken) -> Self {
        let mut databases = HashMap::new();
        databases.insert(DEFAULT_DATABASE.to_owned(), default);
        Databases {
            databases,
            retry,
            interrupt,
        }
    }

    pub fn from_config(
        default: &ConnectionConfig,
        others: &[ConnectionConfig],
        retry: &RetryConfig,
        interrupt: InterruptToken,
    ) -> Self {
        let mut default = Database::new(default);
        default.name = DEFAULT_DATABASE.to_owned();

        let mut databases = Databases::new(default, retry.into(), interrupt);
        for config in others {
            databases.add(Database::new(config));
        }
        databases
    }

    pub fn add(&mut self, database: Database) {
        self.databases.insert(database.name.clone(), database);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.databases.contains_key(&name.to_ascii_lowercase())
    }

    pub fn connection(&mut self, name: &str, user: Option<&str>) -> Result<&mut Connection, UpgradeError> {
        let database = self
            .databases
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| UpgradeError::Config(format!("Database '{}' is not configured", name)))?;
        database.connection(user, &self.retry, &self.interrupt)
    }

    pub fn close_all(&mut self) {
        for database in self.databases.values_mut() {
            database.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, name: &str) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_owned(),
            path: dir.path().join(format!("{}.db", name)),
            user: None,
            create: true,
            busy_timeout_ms: 1000,
        }
    }

    #[test]
    fn test_error_codes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT UNIQUE)")
            .unwrap();
        conn.execute_batch("INSERT INTO t (name) VALUES ('a')").unwrap();

        let err = conn
            .execute_batch("INSERT INTO t (name) VALUES ('a')")
            .unwrap_err();
        assert_eq!(
            error_codes(&err),
            vec!["SQLITE_CONSTRAINT_UNIQUE", "SQLITE_CONSTRAINT", "2067", "19"]
        );

        let err = conn.execute_batch("DROP TABLE missing").unwrap_err();
        assert_eq!(error_codes(&err), vec!["SQLITE_ERROR", "1"]);
    }

    #[test]
    fn test_transactional_statement_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();

        let result = Database::execute(
            &mut conn,
            "INSERT INTO t VALUES (1); INSERT INTO t VALUES (1);",
            CommitStrategy::Transactional,
        );
        assert!(result.is_err());
        let count: i64 = conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_autocommit_statement_keeps_partial_work() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();

        let result = Database::execute(
            &mut conn,
            "INSERT INTO t VALUES (1); INSERT INTO t VALUES (1);",
            CommitStrategy::Autocommit,
        );
        assert!(result.is_err());
        let count: i64 = conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_explicit_transaction_is_not_wrapped() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); BEGIN").unwrap();
        Database::execute(&mut conn, "INSERT INTO t VALUES (1)", CommitStrategy::Transactional)
            .unwrap();
        assert!(!conn.is_autocommit());
        conn.execute_batch("ROLLBACK").unwrap();
    }

    #[test]
    fn test_transaction_control_passes_through() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();

        for strategy in [CommitStrategy::Transactional, CommitStrategy::Autocommit] {
            Database::execute(&mut conn, "BEGIN", strategy).unwrap();
            assert!(!conn.is_autocommit());
            Database::execute(&mut conn, "INSERT INTO t VALUES (NULL)", strategy).unwrap();
            Database::execute(&mut conn, "commit;", strategy).unwrap();
            assert!(conn.is_autocommit());
        }
        let count: i64 = conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);

        assert!(is_transaction_control("  savepoint one"));
        assert!(is_transaction_control("END TRANSACTION"));
        assert!(!is_transaction_control("BEGINNING_OF_TIME"));
        assert!(!is_transaction_control("INSERT INTO t VALUES (1)"));
    }

    #[test]
    fn test_connection_cache_per_user() {
        let dir = TempDir::new().unwrap();
        let mut databases = Databases::from_config(
            &config(&dir, "main"),
            &[config(&dir, "Audit")],
            &RetryConfig::default(),
            InterruptToken::new(),
        );

        databases
            .connection("DEFAULT", None)
            .unwrap()
            .execute_batch("CREATE TEMP TABLE scratch (x)")
            .unwrap();
        // Temp tables are per connection
        assert!(databases
            .connection("default", None)
            .unwrap()
            .execute_batch("INSERT INTO scratch VALUES (1)")
            .is_ok());
        assert!(databases
            .connection("default", Some("other"))
            .unwrap()
            .execute_batch("INSERT INTO scratch VALUES (1)")
            .is_err());

        assert!(databases.contains("audit"));
        assert!(databases.connection("audit", None).is_ok());
        assert!(matches!(
            databases.connection("missing", None),
            Err(UpgradeError::Config(_))
        ));
        databases.close_all();
    }

    #[test]
    fn test_open_without_create_fails_fast() {
        let dir = TempDir::new().unwrap();
        let mut missing = config(&dir, "missing");
        missing.create = false;
        let database = Database::new(&missing);

        let started = Instant::now();
        let result = database.open(&RetryPolicy::default(), &InterruptToken::new());
        assert!(matches!(result, Err(UpgradeError::Config(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_open_retries_until_deadline() {
        let dir = TempDir::new().unwrap();
        let mut missing = config(&dir, "missing");
        missing.create = false;
        let database = Database::new(&missing);

        let retry = RetryPolicy {
            interval: Duration::from_millis(20),
            max_duration: Some(Duration::from_millis(100)),
        };
        let started = Instant::now();
        assert!(database.open(&retry, &InterruptToken::new()).is_err());
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
