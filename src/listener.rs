use log::debug;
use rusqlite::types::ValueRef;

use crate::context::ExecutionContext;
use crate::directive::{parse_print, AssertCommand, AssertMode};
use crate::error::{SqlFailure, UpgradeError};
use crate::processor::{sql_failure, Environment};
use crate::source::Command;

/// Gets a look at every command before the built-in interpretation.
pub trait CommandListener: Send {
    /// Returns `true` when the command was fully handled. `skip` tells whether the
    /// command sits in a skipped block.
    fn execute(
        &mut self,
        env: &mut Environment,
        ctx: &ExecutionContext<'_>,
        command: &Command,
        skip: bool,
    ) -> Result<bool, UpgradeError>;

    /// Called once when the upgrade ends.
    fn terminate(&mut self) {}
}

/// `ASSERT EXISTS|EMPTY MESSAGE "<message>" SELECT ...`
#[derive(Debug, Default)]
pub struct AssertListener;

impl CommandListener for AssertListener {
    fn execute(
        &mut self,
        env: &mut Environment,
        ctx: &ExecutionContext<'_>,
        command: &Command,
        skip: bool,
    ) -> Result<bool, UpgradeError> {
        if !command.is_persistent() {
            return Ok(false);
        }
        let Some(assert) = AssertCommand::parse(command.text()) else {
            return Ok(false);
        };
        if skip {
            return Ok(true);
        }

        let conn = env.databases.connection(ctx.database(), ctx.user())?;
        let has_rows = conn
            .prepare(&assert.query)
            .and_then(|mut stmt| {
                let mut rows = stmt.query([])?;
                let first = rows.next()?.is_some();
                Ok(first)
            })
            .map_err(|err| UpgradeError::StatementFailed(sql_failure(&err, command)))?;

        let holds = match assert.mode {
            AssertMode::Exists => has_rows,
            AssertMode::Empty => !has_rows,
        };
        debug!("Assertion at {} holds: {}", command.location(), holds);

        if !holds {
            return Err(UpgradeError::StatementFailed(SqlFailure {
                codes: Vec::new(),
                message: assert.message,
                command: command.text().to_owned(),
                location: command.location().clone(),
            }));
        }
        Ok(true)
    }
}

/// `PRINT SELECT ...` prints the first column of every row.
#[derive(Debug, Default)]
pub struct PrintListener;

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_owned(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

impl CommandListener for PrintListener {
    fn execute(
        &mut self,
        env: &mut Environment,
        ctx: &ExecutionContext<'_>,
        command: &Command,
        skip: bool,
    ) -> Result<bool, UpgradeError> {
        if !command.is_persistent() {
            return Ok(false);
        }
        let Some(query) = parse_print(command.text()) else {
            return Ok(false);
        };
        if skip {
            return Ok(true);
        }

        let conn = env.databases.connection(ctx.database(), ctx.user())?;
        let lines = conn
            .prepare(&query)
            .and_then(|mut stmt| {
                let mut rows = stmt.query([])?;
                let mut lines = Vec::new();
                while let Some(row) = rows.next()? {
                    lines.push(render(row.get_ref(0)?));
                }
                Ok(lines)
            })
            .map_err(|err| UpgradeError::StatementFailed(sql_failure(&err, command)))?;

        for line in &lines {
            env.observer.print(line);
        }
        Ok(true)
    }
}
