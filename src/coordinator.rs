use std::io::Write;

use indexmap::IndexSet;
use log::{debug, error, info, Level};
use logging_timer::timer;
use rusqlite::Connection;

use crate::context::ExecutionContext;
use crate::database::{Databases, DEFAULT_DATABASE};
use crate::directive::Directive;
use crate::error::UpgradeError;
use crate::graph::OpenPatches;
use crate::interrupt::InterruptToken;
use crate::listener::CommandListener;
use crate::patch::{display_version, Patch};
use crate::processor::{CommandProcessor, Environment, StatementOutcome};
use crate::source::upgrade_file::UpgradeFile;
use crate::source::{Command, Delimiter};
use crate::store::{ProgressStore, DEFAULT_LOG_TABLE, DEFAULT_VERSION_TABLE};

/// Persistent command of a setup patch that migrates the history log.
const MIGRATE_COMMAND: &str = "UPGRADE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Completed,
    NoUpgradeNeeded,
    Aborted,
}

/// Runs an upgrade file against the configured databases.
///
/// Owns everything an upgrade touches: the parsed file, the progress store, the command
/// processor with its listeners and the environment commands run in.
pub struct UpgradeCoordinator {
    file: UpgradeFile,
    store: ProgressStore,
    processor: CommandProcessor,
    env: Environment,
    interrupt: InterruptToken,
}

impl UpgradeCoordinator {
    pub fn new(
        file: UpgradeFile,
        env: Environment,
        interrupt: InterruptToken,
        log_statements: bool,
    ) -> Self {
        let (version_table, log_table) = file
            .control_tables()
            .unwrap_or((DEFAULT_VERSION_TABLE, DEFAULT_LOG_TABLE));
        let store = ProgressStore::new(version_table, log_table, log_statements);

        UpgradeCoordinator {
            file,
            store,
            processor: CommandProcessor::new(),
            env,
            interrupt,
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn CommandListener>) {
        self.processor.add_listener(listener);
    }

    fn current_version(&mut self) -> Result<Option<String>, UpgradeError> {
        self.store.version(control(&mut self.env.databases)?)
    }

    /// Versions the database can be upgraded to. `tips` keeps only the end points;
    /// a `prefix` also follows open patches.
    pub fn resolve_targets(
        &mut self,
        tips: bool,
        prefix: Option<&str>,
        allow_downgrade: bool,
    ) -> Result<IndexSet<String>, UpgradeError> {
        let open = if prefix.is_some() {
            OpenPatches::Follow
        } else {
            OpenPatches::Stop
        };
        let reachable = self.reachable(allow_downgrade, open)?;

        Ok(if tips {
            self.file.graph().tips(&reachable, prefix)
        } else {
            reachable
                .into_iter()
                .filter(|v| prefix.is_none_or(|p| v.starts_with(p)))
                .collect()
        })
    }

    fn reachable(
        &mut self,
        allow_downgrade: bool,
        open: OpenPatches,
    ) -> Result<IndexSet<String>, UpgradeError> {
        let conn = control(&mut self.env.databases)?;
        let version = self.store.version(conn)?;
        let target = self.store.target(conn)?;
        let reachable = self.file.graph().reachable(
            version.as_deref(),
            target.as_deref(),
            allow_downgrade,
            open,
        );

        if reachable.is_empty() {
            return Err(UpgradeError::Config(format!(
                "The current version {} is not a version of {}",
                display_version(version.as_deref()),
                self.file.path().display()
            )));
        }
        Ok(reachable)
    }

    /// The single version `requested` stands for: an exact version, a `prefix*`
    /// wildcard, or the only end point reachable when `None`.
    fn resolve_target(
        &mut self,
        requested: Option<&str>,
        allow_downgrade: bool,
    ) -> Result<String, UpgradeError> {
        let _tmr = timer!(Level::Debug; "UpgradeCoordinator::resolve_target", "{:?}", requested);

        let (candidates, wanted) = match requested {
            Some(target) => match target.strip_suffix('*') {
                Some(prefix) => {
                    let reachable = self.reachable(allow_downgrade, OpenPatches::Follow)?;
                    (self.file.graph().tips(&reachable, Some(prefix)), target)
                }
                None => {
                    let reachable = self.reachable(allow_downgrade, OpenPatches::Follow)?;
                    if !reachable.contains(target) {
                        return Err(UpgradeError::Config(format!(
                            "Target version \"{}\" is not reachable from {}",
                            target,
                            display_version(self.current_version()?.as_deref())
                        )));
                    }
                    return Ok(target.to_owned());
                }
            },
            None => {
                let reachable = self.reachable(allow_downgrade, OpenPatches::Stop)?;
                (self.file.graph().tips(&reachable, None), "any")
            }
        };

        match candidates.len() {
            1 => candidates
                .into_iter()
                .next()
                .ok_or_else(|| UpgradeError::Error("Lost the only target".to_owned())),
            0 => Err(UpgradeError::Config(format!(
                "No version matching \"{}\" is reachable from {}",
                wanted,
                display_version(self.current_version()?.as_deref())
            ))),
            _ => Err(UpgradeError::Config(format!(
                "More than one version matches \"{}\": {}",
                wanted,
                candidates.into_iter().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Brings the control tables to the newest spec the file defines.
    pub fn setup(&mut self) -> Result<PatchOutcome, UpgradeError> {
        let spec = self.store.spec(control(&mut self.env.databases)?)?;
        let setups = self.file.graph().setup_path(spec.as_deref());
        if setups.is_empty() {
            debug!("Control tables are at spec {}", display_version(spec.as_deref()));
        }

        for patch in &setups {
            if self.apply_patch(patch)? == PatchOutcome::Aborted {
                return Ok(PatchOutcome::Aborted);
            }
        }
        Ok(PatchOutcome::Completed)
    }

    /// Upgrades the database to `target` (see [`Self::resolve_target`]).
    ///
    /// The observer always hears how the run ended, errors included.
    pub fn upgrade(
        &mut self,
        target: Option<&str>,
        allow_downgrade: bool,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let _tmr = timer!(Level::Info; "UpgradeCoordinator::upgrade", "{:?}", target);

        let result = self.run_upgrade(target, allow_downgrade);
        if !matches!(
            result,
            Ok(UpgradeOutcome::Completed) | Ok(UpgradeOutcome::NoUpgradeNeeded)
        ) {
            self.env.observer.upgrade_aborted();
        }
        self.processor.terminate();
        result
    }

    fn run_upgrade(
        &mut self,
        target: Option<&str>,
        allow_downgrade: bool,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        if self.setup()? == PatchOutcome::Aborted {
            return Ok(UpgradeOutcome::Aborted);
        }

        let target = self.resolve_target(target, allow_downgrade)?;
        let version = self.current_version()?;
        if version.as_deref() == Some(target.as_str()) {
            self.env.observer.no_upgrade_needed(&target);
            return Ok(UpgradeOutcome::NoUpgradeNeeded);
        }

        let path = self
            .file
            .graph()
            .path(version.as_deref(), &target, allow_downgrade)
            .ok_or_else(|| {
                UpgradeError::Config(format!(
                    "No path from {} to \"{}\"",
                    display_version(version.as_deref()),
                    target
                ))
            })?;
        info!(
            "Upgrading from {} to \"{}\" in {} patches",
            display_version(version.as_deref()),
            target,
            path.len()
        );

        for patch in &path {
            if self.apply_patch(patch)? == PatchOutcome::Aborted {
                return Ok(UpgradeOutcome::Aborted);
            }
        }

        self.env.observer.upgrade_complete(&target);
        Ok(UpgradeOutcome::Completed)
    }

    /// Runs the block of `patch`, skipping the statements a previous run already did.
    fn apply_patch(&mut self, patch: &Patch) -> Result<PatchOutcome, UpgradeError> {
        let _tmr = timer!(Level::Debug; "UpgradeCoordinator::apply_patch", "{}", patch);

        let counted = !patch.is_setup();
        let conn = control(&mut self.env.databases)?;
        let skip = if counted && self.store.target(conn)?.as_deref() == Some(patch.target()) {
            self.store.statements_done(conn)?
        } else {
            0
        };
        info!("Applying {} (skipping {} statements)", patch, skip);
        self.env.observer.patch_starting(patch, skip);

        let default_delimiters = self.file.delimiters();
        let mut reader = self.file.segment(patch);
        let mut ctx = ExecutionContext::new();
        let mut count: u32 = 0;
        let mut dont_count = false;

        loop {
            if self.interrupt.is_interrupted() {
                info!("Interrupted in {} after statement {}", patch, count);
                return Ok(PatchOutcome::Aborted);
            }

            let delimiters = ctx
                .delimiters()
                .map(<[Delimiter]>::to_vec)
                .unwrap_or_else(|| default_delimiters.clone());
            let Some(command) = reader.read_command(&delimiters)? else {
                break;
            };

            if command.is_transient() {
                if self
                    .processor
                    .offer(&mut self.env, &ctx, &command, ctx.skipping())?
                {
                    continue;
                }
                let directive = Directive::parse(command.text()).ok_or_else(|| {
                    UpgradeError::source_error(
                        format!("Unknown directive \"{}\"", command.text()),
                        command.location(),
                    )
                })?;

                match directive {
                    Directive::Transient if dont_count => {
                        return Err(UpgradeError::source_error(
                            "TRANSIENT blocks can't be nested",
                            command.location(),
                        ));
                    }
                    Directive::Transient => dont_count = true,
                    Directive::EndTransient if !dont_count => {
                        return Err(UpgradeError::source_error(
                            "END TRANSIENT without a matching TRANSIENT",
                            command.location(),
                        ));
                    }
                    Directive::EndTransient => dont_count = false,
                    Directive::IfHistory { negated, version } => {
                        let condition = if ctx.skipping() {
                            false
                        } else {
                            self.store
                                .log_contains(control(&mut self.env.databases)?, &version)?
                                != negated
                        };
                        ctx.skip(!condition);
                    }
                    other => {
                        self.processor
                            .apply_directive(&mut self.env, &mut ctx, other, &command)?
                    }
                }
                continue;
            }

            if dont_count || !counted {
                if ctx.skipping() {
                    self.env.observer.skipped(&command);
                } else if patch.is_setup() && command.text().eq_ignore_ascii_case(MIGRATE_COMMAND) {
                    self.env.observer.executing(&command);
                    self.store.migrate_history(control(&mut self.env.databases)?)?;
                    self.env.observer.executed(&command);
                } else {
                    // Uncounted statements only leave a trace when they fail
                    let result = self.processor.execute(&mut self.env, &mut ctx, &command);
                    if !matches!(result, Ok(StatementOutcome::Executed)) {
                        if patch.is_setup() {
                            // The block may have created the control tables by now
                            self.store.set_stale();
                        }
                        Self::record(
                            &mut self.store,
                            &mut self.env.databases,
                            patch,
                            None,
                            &command,
                            result,
                        )?;
                    }
                }
                continue;
            }

            count += 1;
            if count <= skip || ctx.skipping() {
                self.env.observer.skipped(&command);
                continue;
            }

            let result = self.processor.execute(&mut self.env, &mut ctx, &command);
            if result.is_ok() {
                // Progress first, so a crash before the history write still resumes
                // after this statement
                self.store
                    .begin_progress(control(&mut self.env.databases)?, patch.target(), count)?;
            }
            Self::record(
                &mut self.store,
                &mut self.env.databases,
                patch,
                Some(count),
                &command,
                result,
            )?;
        }

        let end = reader.location();
        ctx.ensure_closed(&end)?;
        if dont_count {
            return Err(UpgradeError::source_error(
                "TRANSIENT without a matching END TRANSIENT",
                &end,
            ));
        }

        self.env.observer.patch_finished(patch);
        self.store.set_stale();
        let conn = control(&mut self.env.databases)?;

        if patch.is_setup() {
            self.store.update_spec(conn, patch.target())?;
            return Ok(PatchOutcome::Completed);
        }

        if patch.is_downgrade() {
            let mut superseded =
                self.file
                    .graph()
                    .reachable(Some(patch.target()), None, false, OpenPatches::Stop);
            superseded.shift_remove(patch.target());
            self.store.downgrade_history(conn, &superseded)?;
        }

        if !patch.is_open() {
            self.store.commit_version(conn, patch.target())?;
            self.store.log_complete(conn, patch.source(), patch.target())?;
        }

        Ok(PatchOutcome::Completed)
    }

    /// Logs how `command` went and passes its failure on. A failure is reported even
    /// when the history can't take it.
    fn record(
        store: &mut ProgressStore,
        databases: &mut Databases,
        patch: &Patch,
        index: Option<u32>,
        command: &Command,
        result: Result<StatementOutcome, UpgradeError>,
    ) -> Result<(), UpgradeError> {
        let (text, failure) = match result {
            Ok(StatementOutcome::Executed) => (None, None),
            Ok(StatementOutcome::Ignored(failure)) => {
                (Some(format!("IGNORED: {}", failure.outcome_text())), None)
            }
            Err(UpgradeError::StatementFailed(failure)) => {
                (Some(failure.outcome_text()), Some(failure))
            }
            Err(err) => return Err(err),
        };

        let logged = control(databases).and_then(|conn| {
            store.append_history(
                conn,
                patch.source(),
                patch.target(),
                index,
                command.text(),
                text.as_deref(),
            )
        });
        match failure {
            None => logged,
            Some(failure) => {
                if let Err(err) = logged {
                    error!("Failed to log the failure of \"{}\": {}", failure.command, err);
                }
                Err(UpgradeError::StatementFailed(failure))
            }
        }
    }

    pub fn export_history<W: Write>(&mut self, sink: W) -> Result<(), UpgradeError> {
        self.store.export_history(control(&mut self.env.databases)?, sink)
    }

    pub fn version_statement(&mut self) -> Result<String, UpgradeError> {
        self.store.version_statement(control(&mut self.env.databases)?)
    }

    /// Closes every connection the upgrade opened.
    pub fn end(mut self) {
        self.env.databases.close_all();
    }
}

/// The default user's connection to the default database, which the progress store
/// shares with the statements.
fn control(databases: &mut Databases) -> Result<&mut Connection, UpgradeError> {
    databases.connection(DEFAULT_DATABASE, None)
}
