use std::collections::HashSet;

use crate::database::{CommitStrategy, DEFAULT_DATABASE};
use crate::error::UpgradeError;
use crate::source::{Delimiter, Location};

/// Interpreter state for one command stream. A `RUN` file gets a child context that
/// borrows its parent for the duration of the include.
///
/// Skip state is two counters rather than a stack: while `skip_counter` is non-zero
/// every nested `IF`/`SKIP` also skips, otherwise `no_skip_counter` records the open
/// blocks that did not.
#[derive(Debug)]
pub struct ExecutionContext<'p> {
    parent: Option<&'p ExecutionContext<'p>>,
    database: String,
    user: Option<String>,
    escape_processing: bool,
    section_level: u8,
    ignore_stack: Vec<Vec<String>>,
    ignore_set: HashSet<String>,
    skip_counter: u32,
    no_skip_counter: u32,
    delimiters: Option<Vec<Delimiter>>,
    commit_strategy: Option<CommitStrategy>,
}

impl ExecutionContext<'static> {
    pub fn new() -> Self {
        ExecutionContext {
            parent: None,
            database: DEFAULT_DATABASE.to_owned(),
            user: None,
            escape_processing: false,
            section_level: 0,
            ignore_stack: Vec::new(),
            ignore_set: HashSet::new(),
            skip_counter: 0,
            no_skip_counter: 0,
            delimiters: None,
            commit_strategy: None,
        }
    }
}

impl Default for ExecutionContext<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'p> ExecutionContext<'p> {
    /// Connection, user, escape processing and section level carry over; ignore
    /// scopes and skip state stay with the parent and are consulted through it.
    pub fn child(&self) -> ExecutionContext<'_> {
        ExecutionContext {
            parent: Some(self),
            database: self.database.clone(),
            user: self.user.clone(),
            escape_processing: self.escape_processing,
            section_level: self.section_level,
            ignore_stack: Vec::new(),
            ignore_set: HashSet::new(),
            skip_counter: 0,
            no_skip_counter: 0,
            delimiters: None,
            commit_strategy: None,
        }
    }

    /// Number of ancestors.
    pub fn depth(&self) -> usize {
        self.parent.map_or(0, |parent| parent.depth() + 1)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Switching connection reverts to that connection's default user.
    pub fn select_database(&mut self, name: &str) {
        self.database = name.to_ascii_lowercase();
        self.user = None;
    }

    pub fn set_user(&mut self, user: &str) {
        self.user = Some(user.to_owned());
    }

    pub fn escape_processing(&self) -> bool {
        self.escape_processing
    }

    pub fn set_escape_processing(&mut self, on: bool) {
        self.escape_processing = on;
    }

    pub fn section_level(&self) -> u8 {
        self.section_level
    }

    pub fn set_section_level(&mut self, level: u8) {
        self.section_level = level;
    }

    // ---- Skip state

    /// Opens an `IF`/`SKIP` block; `skip` is whether its body should be skipped.
    pub fn skip(&mut self, skip: bool) {
        if self.skip_counter > 0 || skip {
            self.skip_counter += 1;
        } else {
            self.no_skip_counter += 1;
        }
    }

    /// Closes the innermost `IF`/`SKIP` block.
    pub fn end_skip(&mut self, location: &Location) -> Result<(), UpgradeError> {
        if self.skip_counter > 0 {
            self.skip_counter -= 1;
        } else if self.no_skip_counter > 0 {
            self.no_skip_counter -= 1;
        } else {
            return Err(UpgradeError::source_error(
                "END without a matching IF or SKIP",
                location,
            ));
        }
        Ok(())
    }

    /// Flips the innermost block.
    pub fn else_branch(&mut self, location: &Location) -> Result<(), UpgradeError> {
        let was_skipping = self.skip_counter > 0;
        self.end_skip(location)?;
        self.skip(!was_skipping);
        Ok(())
    }

    pub fn skipping(&self) -> bool {
        self.skip_counter > 0 || self.parent.is_some_and(|parent| parent.skipping())
    }

    /// Fails if an `IF`, `SKIP` or `IGNORE SQL ERROR` opened in this stream is still open.
    pub fn ensure_closed(&self, location: &Location) -> Result<(), UpgradeError> {
        if self.skip_counter > 0 || self.no_skip_counter > 0 {
            return Err(UpgradeError::source_error(
                "IF or SKIP without a matching END",
                location,
            ));
        }
        if !self.ignore_stack.is_empty() {
            return Err(UpgradeError::source_error(
                "IGNORE SQL ERROR without a matching END IGNORE",
                location,
            ));
        }
        Ok(())
    }

    // ---- Ignore scopes

    pub fn push_ignores(&mut self, codes: Vec<String>) {
        self.ignore_stack.push(codes);
        self.rebuild_ignores();
    }

    pub fn pop_ignores(&mut self, location: &Location) -> Result<(), UpgradeError> {
        if self.ignore_stack.pop().is_none() {
            return Err(UpgradeError::source_error(
                "END IGNORE without a matching IGNORE SQL ERROR",
                location,
            ));
        }
        self.rebuild_ignores();
        Ok(())
    }

    fn rebuild_ignores(&mut self) {
        self.ignore_set = self
            .ignore_stack
            .iter()
            .flatten()
            .map(|code| code.to_ascii_uppercase())
            .collect();
    }

    pub fn ignores_error(&self, code: &str) -> bool {
        self.ignore_set.contains(&code.to_ascii_uppercase())
            || self.parent.is_some_and(|parent| parent.ignores_error(code))
    }

    /// True when any of `codes` is in scope.
    pub fn ignores_any(&self, codes: &[String]) -> bool {
        codes.iter().any(|code| self.ignores_error(code))
    }

    // ---- Overrides, looked up through the parent chain

    pub fn set_delimiters(&mut self, delimiters: Vec<Delimiter>) {
        self.delimiters = Some(delimiters);
    }

    pub fn reset_delimiters(&mut self) {
        self.delimiters = None;
    }

    pub fn delimiters(&self) -> Option<&[Delimiter]> {
        self.delimiters
            .as_deref()
            .or_else(|| self.parent.and_then(|parent| parent.delimiters()))
    }

    pub fn set_commit_strategy(&mut self, strategy: CommitStrategy) {
        self.commit_strategy = Some(strategy);
    }

    pub fn reset_commit_strategy(&mut self) {
        self.commit_strategy = None;
    }

    pub fn commit_strategy(&self) -> CommitStrategy {
        self.commit_strategy
            .or_else(|| self.parent.map(|parent| parent.commit_strategy()))
            .unwrap_or_default()
    }
}
