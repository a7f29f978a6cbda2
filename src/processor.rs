use std::path::Path;

use log::{debug, warn, Level};
use logging_timer::timer;

use crate::context::ExecutionContext;
use crate::database::{error_codes, Database, Databases};
use crate::directive::{parse_run, Directive};
use crate::error::{SqlFailure, UpgradeError};
use crate::listener::{AssertListener, CommandListener, PrintListener};
use crate::observer::ProgressObserver;
use crate::script::ScriptEvaluator;
use crate::source::sql_file::SqlFile;
use crate::source::{Command, Delimiter};

/// Include depth at which `RUN` gives up, which catches files that include themselves.
const MAX_RUN_DEPTH: usize = 32;

/// Highest `SECTION.n` level.
const MAX_SECTION_LEVEL: u8 = 9;

/// What commands run against and report to.
pub struct Environment {
    pub databases: Databases,
    pub observer: Box<dyn ProgressObserver>,
    pub evaluator: Box<dyn ScriptEvaluator>,
}

/// Result of a persistent command that didn't fail the upgrade.
#[derive(Debug)]
pub enum StatementOutcome {
    Executed,
    /// Failed with an error covered by an `IGNORE SQL ERROR` scope
    Ignored(SqlFailure),
}

pub(crate) fn sql_failure(err: &rusqlite::Error, command: &Command) -> SqlFailure {
    let message = match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message.clone(),
        rusqlite::Error::SqliteFailure(failure, None) => failure.to_string(),
        other => other.to_string(),
    };
    SqlFailure {
        codes: error_codes(err),
        message,
        command: command.text().to_owned(),
        location: command.location().clone(),
    }
}

/// Interprets commands against an [`ExecutionContext`]: control directives change the
/// context, persistent commands go to the listeners, `RUN` or the database.
pub struct CommandProcessor {
    listeners: Vec<Box<dyn CommandListener>>,
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandProcessor {
    /// A processor with the `ASSERT` and `PRINT` listeners.
    pub fn new() -> Self {
        CommandProcessor {
            listeners: vec![Box::new(AssertListener), Box::new(PrintListener)],
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn CommandListener>) {
        self.listeners.push(listener);
    }

    /// Offers `command` to the listeners. `true` when one of them handled it.
    pub fn offer(
        &mut self,
        env: &mut Environment,
        ctx: &ExecutionContext<'_>,
        command: &Command,
        skip: bool,
    ) -> Result<bool, UpgradeError> {
        for listener in &mut self.listeners {
            if listener.execute(env, ctx, command, skip)? {
                debug!("Listener handled command at {}", command.location());
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn terminate(&mut self) {
        for listener in &mut self.listeners {
            listener.terminate();
        }
    }

    /// Applies a directive that only concerns the context. While skipping, only the
    /// block structure is tracked.
    pub fn apply_directive(
        &mut self,
        env: &mut Environment,
        ctx: &mut ExecutionContext<'_>,
        directive: Directive,
        command: &Command,
    ) -> Result<(), UpgradeError> {
        let location = command.location();

        match directive {
            Directive::IfScript(expression) => {
                let condition = if ctx.skipping() {
                    false
                } else {
                    env.evaluator.evaluate(&expression, location)?
                };
                ctx.skip(!condition);
            }
            Directive::Skip => ctx.skip(true),
            Directive::Else => ctx.else_branch(location)?,
            Directive::EndIf | Directive::EndSkip => ctx.end_skip(location)?,
            Directive::IgnoreSqlError(codes) => ctx.push_ignores(codes),
            Directive::EndIgnore => ctx.pop_ignores(location)?,
            _ if ctx.skipping() => {
                debug!("Skipped directive at {}", location);
            }
            Directive::Section { level, message } => {
                if level > MAX_SECTION_LEVEL || level > ctx.section_level() + 1 {
                    return Err(UpgradeError::source_error(
                        format!(
                            "SECTION.{} is not allowed after a section of level {}",
                            level,
                            ctx.section_level()
                        ),
                        location,
                    ));
                }
                ctx.set_section_level(level);
                env.observer.section(level, &message);
            }
            Directive::SetDelimiter(delimiters) => ctx.set_delimiters(delimiters),
            Directive::ResetDelimiter => ctx.reset_delimiters(),
            Directive::SetUser(user) => ctx.set_user(&user),
            Directive::SelectConnection(name) => {
                if !env.databases.contains(&name) {
                    return Err(UpgradeError::source_error(
                        format!("Connection '{}' is not configured", name),
                        location,
                    ));
                }
                ctx.select_database(&name);
            }
            Directive::EscapeProcessing(on) => ctx.set_escape_processing(on),
            Directive::SetCommitStrategy(strategy) => ctx.set_commit_strategy(strategy),
            Directive::ResetCommitStrategy => ctx.reset_commit_strategy(),
            Directive::Encoding(_) if location.line() == 1 => {}
            Directive::Encoding(_) => {
                return Err(UpgradeError::source_error(
                    "ENCODING is only allowed on the first line of a file",
                    location,
                ));
            }
            Directive::Transient | Directive::EndTransient | Directive::IfHistory { .. } => {
                return Err(UpgradeError::source_error(
                    format!("\"{}\" is only allowed in an upgrade block", command.text()),
                    location,
                ));
            }
        }
        Ok(())
    }

    /// Runs a persistent command. Database errors covered by the context's ignore
    /// scopes come back as [`StatementOutcome::Ignored`].
    pub fn execute(
        &mut self,
        env: &mut Environment,
        ctx: &mut ExecutionContext<'_>,
        command: &Command,
    ) -> Result<StatementOutcome, UpgradeError> {
        env.observer.executing(command);

        let outcome = self.dispatch(env, ctx, command)?;
        if matches!(outcome, StatementOutcome::Executed) {
            env.observer.executed(command);
        }
        Ok(outcome)
    }

    fn dispatch(
        &mut self,
        env: &mut Environment,
        ctx: &mut ExecutionContext<'_>,
        command: &Command,
    ) -> Result<StatementOutcome, UpgradeError> {
        let result = match self.offer(env, ctx, command, false) {
            Ok(true) => Ok(()),
            Ok(false) => match parse_run(command.text()) {
                // Failures inside the file were settled there
                Some(file) => {
                    return self
                        .run(env, ctx, &file, command)
                        .map(|()| StatementOutcome::Executed)
                }
                None => Self::execute_sql(env, ctx, command),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => Ok(StatementOutcome::Executed),
            Err(UpgradeError::StatementFailed(failure)) => {
                let ignored = ctx.ignores_any(&failure.codes);
                env.observer.exception(&failure, ignored);
                if !ignored {
                    return Err(UpgradeError::StatementFailed(failure));
                }
                warn!("Ignoring {}", failure);
                Ok(StatementOutcome::Ignored(failure))
            }
            Err(err) => Err(err),
        }
    }

    fn execute_sql(
        env: &mut Environment,
        ctx: &ExecutionContext<'_>,
        command: &Command,
    ) -> Result<(), UpgradeError> {
        let sql = if ctx.escape_processing() {
            process_escapes(command.text())
        } else {
            command.text().to_owned()
        };
        let strategy = ctx.commit_strategy();
        let conn = env.databases.connection(ctx.database(), ctx.user())?;

        let _tmr = timer!(Level::Debug; "CommandProcessor::execute_sql", "{}", command.location());
        Database::execute(conn, &sql, strategy)
            .map_err(|err| UpgradeError::StatementFailed(sql_failure(&err, command)))
    }

    /// `RUN "<file>"`: the whole file in a child context, relative to the including file.
    fn run(
        &mut self,
        env: &mut Environment,
        ctx: &mut ExecutionContext<'_>,
        file: &str,
        command: &Command,
    ) -> Result<(), UpgradeError> {
        let location = command.location();
        if ctx.depth() >= MAX_RUN_DEPTH {
            return Err(UpgradeError::source_error(
                format!("RUN nested more than {} levels deep", MAX_RUN_DEPTH),
                location,
            ));
        }

        let path = location
            .path()
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(file);
        let sql_file = SqlFile::open(&path).map_err(|err| {
            UpgradeError::source_error(format!("Cannot run {}: {}", path.display(), err), location)
        })?;
        debug!("Running {}", sql_file.path().display());

        let mut child = ctx.child();
        let mut reader = sql_file.reader();
        loop {
            let delimiters = child
                .delimiters()
                .map(<[Delimiter]>::to_vec)
                .unwrap_or_else(Delimiter::defaults);
            let Some(command) = reader.read_command(&delimiters)? else {
                break;
            };

            if command.is_transient() {
                if self.offer(env, &child, &command, child.skipping())? {
                    continue;
                }
                let directive = Directive::parse(command.text()).ok_or_else(|| {
                    UpgradeError::source_error(
                        format!("Unknown directive \"{}\"", command.text()),
                        command.location(),
                    )
                })?;
                self.apply_directive(env, &mut child, directive, &command)?;
            } else if child.skipping() {
                env.observer.skipped(&command);
            } else {
                self.execute(env, &mut child, &command)?;
            }
        }

        child.ensure_closed(&reader.location())
    }
}

/// Rewrites `{fn ...}`, `{d '...'}`, `{t '...'}`, `{ts '...'}`, `{oj ...}` and
/// `{escape '...'}` escapes that appear outside string literals.
pub fn process_escapes(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(pos) = rest.find(['\'', '"', '{']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(quote) = tail.chars().next().filter(|c| *c != '{') {
            // Copy the literal through its closing quote; doubled quotes stay inside
            let end = tail[1..].find(quote).map_or(tail.len(), |i| i + 2);
            out.push_str(&tail[..end]);
            rest = &tail[end..];
            continue;
        }

        match escape_end(tail) {
            Some(end) => {
                let body = tail[1..end].trim_start();
                let keyword_len = body
                    .find(|c: char| !c.is_ascii_alphabetic())
                    .unwrap_or(body.len());
                let (keyword, args) = body.split_at(keyword_len);
                let args = process_escapes(args.trim());
                match keyword.to_ascii_lowercase().as_str() {
                    "fn" | "d" | "t" | "ts" | "oj" => out.push_str(&args),
                    "escape" => {
                        out.push_str("ESCAPE ");
                        out.push_str(&args);
                    }
                    _ => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Index of the `}` closing the escape that starts at `text[0]`.
fn escape_end(text: &str) -> Option<usize> {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '{') => depth += 1,
            (None, '}') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, RetryConfig};
    use crate::interrupt::InterruptToken;
    use crate::observer::tests::RecordingObserver;
    use crate::script::VariableEvaluator;
    use crate::source::Location;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// An environment with a `default` and an `audit` database in a scratch directory.
    pub fn environment(observer: &RecordingObserver) -> (TempDir, Environment) {
        let dir = TempDir::new().unwrap();
        let connection = |name: &str| ConnectionConfig {
            name: name.to_owned(),
            path: dir.path().join(format!("{}.db", name)),
            user: None,
            create: true,
            busy_timeout_ms: 1000,
        };
        let databases = Databases::from_config(
            &connection("default"),
            &[connection("audit")],
            &RetryConfig::default(),
            InterruptToken::new(),
        );

        let mut variables = BTreeMap::new();
        variables.insert("environment".to_owned(), "test".to_owned());

        let env = Environment {
            databases,
            observer: Box::new(observer.clone()),
            evaluator: Box::new(VariableEvaluator::new(variables)),
        };
        (dir, env)
    }

    fn location(dir: &TempDir, line: usize) -> Location {
        Location::new(Arc::from(dir.path().join("upgrade.sql")), line)
    }

    fn transient(dir: &TempDir, text: &str) -> Command {
        Command::transient(text, location(dir, 1))
    }

    fn persistent(dir: &TempDir, text: &str) -> Command {
        Command::persistent(text, location(dir, 2))
    }

    fn apply(
        processor: &mut CommandProcessor,
        env: &mut Environment,
        ctx: &mut ExecutionContext<'_>,
        command: &Command,
    ) -> Result<(), UpgradeError> {
        let directive = Directive::parse(command.text()).unwrap();
        processor.apply_directive(env, ctx, directive, command)
    }

    fn count(env: &mut Environment, database: &str, sql: &str) -> i64 {
        env.databases
            .connection(database, None)
            .unwrap()
            .query_row(sql, [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_ignore_scope_escalates_after_end() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        processor
            .execute(&mut env, &mut ctx, &persistent(&dir, "CREATE TABLE t (id INTEGER PRIMARY KEY)"))
            .unwrap();
        let insert = persistent(&dir, "INSERT INTO t VALUES (1)");
        processor.execute(&mut env, &mut ctx, &insert).unwrap();

        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "IGNORE SQL ERROR SQLITE_CONSTRAINT")).unwrap();
        match processor.execute(&mut env, &mut ctx, &insert).unwrap() {
            StatementOutcome::Ignored(failure) => {
                assert_eq!(failure.codes[0], "SQLITE_CONSTRAINT_PRIMARYKEY");
            }
            other => panic!("unexpected {:?}", other),
        }

        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "END IGNORE")).unwrap();
        assert!(matches!(
            processor.execute(&mut env, &mut ctx, &insert),
            Err(UpgradeError::StatementFailed(_))
        ));
        assert_eq!(
            observer
                .events()
                .iter()
                .filter(|e| e.starts_with("exception"))
                .count(),
            2
        );
    }

    #[test]
    fn test_numeric_ignore_codes() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "IGNORE SQL ERROR 1")).unwrap();
        let outcome = processor
            .execute(&mut env, &mut ctx, &persistent(&dir, "DROP TABLE missing"))
            .unwrap();
        assert!(matches!(outcome, StatementOutcome::Ignored(_)));
    }

    #[test]
    fn test_connection_and_user_directives() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "SET USER admin")).unwrap();
        assert_eq!(ctx.user(), Some("admin"));
        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "SELECT CONNECTION audit")).unwrap();
        assert_eq!(ctx.database(), "audit");
        assert_eq!(ctx.user(), None);

        processor
            .execute(&mut env, &mut ctx, &persistent(&dir, "CREATE TABLE audit_log (x)"))
            .unwrap();
        assert_eq!(
            count(&mut env, "audit", "SELECT count(*) FROM sqlite_master WHERE name = 'audit_log'"),
            1
        );

        let err = apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "USE CONNECTION nowhere"))
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Source { .. }));
    }

    #[test]
    fn test_sections_and_scripts() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "SECTION \"Tables\"")).unwrap();
        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "SECTION.2 \"Indexes\"")).unwrap();
        assert!(apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "SECTION.4 \"Too deep\"")).is_err());

        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "IF SCRIPT environment == \"production\"")).unwrap();
        assert!(ctx.skipping());
        // Sections inside a skipped block are not reported
        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "SECTION \"Hidden\"")).unwrap();
        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "ELSE")).unwrap();
        assert!(!ctx.skipping());
        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "END IF")).unwrap();
        ctx.ensure_closed(&location(&dir, 9)).unwrap();

        assert_eq!(observer.events(), vec!["section 1 Tables", "section 2 Indexes"]);
    }

    #[test]
    fn test_upgrade_only_directives_rejected() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        for text in ["TRANSIENT", "IF HISTORY CONTAINS \"1.0\""] {
            assert!(matches!(
                apply(&mut processor, &mut env, &mut ctx, &transient(&dir, text)),
                Err(UpgradeError::Source { .. })
            ));
        }
    }

    #[test]
    fn test_run_file() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        fs::create_dir(dir.path().join("data")).unwrap();
        fs::write(
            dir.path().join("data/seed.sql"),
            "--* SET DELIMITER TRAILING ;\n\
             CREATE TABLE seed (x);\n\
             INSERT INTO seed VALUES (1);\n\
             --* IF SCRIPT environment == \"production\"\n\
             INSERT INTO seed VALUES (2);\n\
             --* END IF\n\
             --* SKIP\n\
             PRINT SELECT 'never';\n\
             --* END SKIP\n\
             PRINT SELECT count(*) FROM seed;\n",
        )
        .unwrap();

        let run = persistent(&dir, "RUN \"data/seed.sql\"");
        let outcome = processor.execute(&mut env, &mut ctx, &run).unwrap();
        assert!(matches!(outcome, StatementOutcome::Executed));
        assert_eq!(count(&mut env, "default", "SELECT count(*) FROM seed"), 1);

        // The child's delimiter doesn't leak back
        assert!(ctx.delimiters().is_none());
        let events = observer.events();
        assert!(events.contains(&"print 1".to_owned()));
        assert!(events.contains(&"skipped INSERT INTO seed VALUES (2)".to_owned()));
        assert_eq!(events.last().map(String::as_str), Some("executed RUN \"data/seed.sql\""));
    }

    #[test]
    fn test_run_inherits_ignores_and_catches_cycles() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        fs::write(dir.path().join("drop.sql"), "DROP TABLE missing\nGO\n").unwrap();
        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "IGNORE SQL ERROR SQLITE_ERROR")).unwrap();
        processor
            .execute(&mut env, &mut ctx, &persistent(&dir, "RUN \"drop.sql\""))
            .unwrap();

        fs::write(dir.path().join("loop.sql"), "RUN \"loop.sql\"\nGO\n").unwrap();
        let err = processor
            .execute(&mut env, &mut ctx, &persistent(&dir, "RUN \"loop.sql\""))
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Source { .. }));

        let missing = processor
            .execute(&mut env, &mut ctx, &persistent(&dir, "RUN \"nothing.sql\""))
            .unwrap_err();
        assert!(matches!(missing, UpgradeError::Source { .. }));
    }

    #[test]
    fn test_commit_strategy_directive() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        processor
            .execute(&mut env, &mut ctx, &persistent(&dir, "CREATE TABLE t (id INTEGER PRIMARY KEY)"))
            .unwrap();
        let batch = persistent(&dir, "INSERT INTO t VALUES (1); INSERT INTO t VALUES (1);");
        assert!(processor.execute(&mut env, &mut ctx, &batch).is_err());
        assert_eq!(count(&mut env, "default", "SELECT count(*) FROM t"), 0);

        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "SET COMMIT_STRATEGY = AUTOCOMMIT")).unwrap();
        assert!(processor.execute(&mut env, &mut ctx, &batch).is_err());
        assert_eq!(count(&mut env, "default", "SELECT count(*) FROM t"), 1);
    }

    #[test]
    fn test_escape_processing() {
        assert_eq!(
            process_escapes("SELECT {fn ucase(name)} FROM t WHERE d = {d '2024-01-02'}"),
            "SELECT ucase(name) FROM t WHERE d = '2024-01-02'"
        );
        assert_eq!(
            process_escapes("SELECT '{fn x}' FROM a {oj a LEFT JOIN b ON {fn lower(a.x)} = b.x}"),
            "SELECT '{fn x}' FROM a a LEFT JOIN b ON lower(a.x) = b.x"
        );
        assert_eq!(
            process_escapes("WHERE x LIKE 'a\\_%' {escape '\\'}"),
            "WHERE x LIKE 'a\\_%' ESCAPE '\\'"
        );
        assert_eq!(process_escapes("SELECT {unknown} {"), "SELECT {unknown} {");
    }

    #[test]
    fn test_escape_processing_directive() {
        let observer = RecordingObserver::new();
        let (dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        apply(&mut processor, &mut env, &mut ctx, &transient(&dir, "JDBC ESCAPE PROCESSING ON")).unwrap();
        processor
            .execute(&mut env, &mut ctx, &persistent(&dir, "CREATE TABLE d AS SELECT {fn upper('x')} AS v"))
            .unwrap();
        assert_eq!(count(&mut env, "default", "SELECT count(*) FROM d WHERE v = 'X'"), 1);
    }

    #[test]
    fn test_location_of_statement_failure() {
        let observer = RecordingObserver::new();
        let (_dir, mut env) = environment(&observer);
        let mut processor = CommandProcessor::new();
        let mut ctx = ExecutionContext::new();

        let command = Command::persistent(
            "SELEC 1",
            Location::new(Arc::from(PathBuf::from("/tmp/upgrade.sql")), 42),
        );
        match processor.execute(&mut env, &mut ctx, &command) {
            Err(UpgradeError::StatementFailed(failure)) => {
                assert_eq!(failure.location.line(), 42);
                assert!(failure.message.contains("syntax error"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
