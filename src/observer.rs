use log::{debug, info, warn};

use crate::error::SqlFailure;
use crate::patch::Patch;
use crate::source::Command;

/// Receives the lifecycle of an upgrade run.
///
/// Implementations render progress for a particular front end. The coordinator calls
/// these from the worker thread that runs the upgrade.
pub trait ProgressObserver: Send {
    fn patch_starting(&mut self, patch: &Patch, skip: u32);

    /// A `SECTION` directive was reached
    fn section(&mut self, level: u8, message: &str);

    fn executing(&mut self, command: &Command);

    fn executed(&mut self, command: &Command);

    /// A persistent command was not run, either because it already ran before a restart
    /// or because it sits in a skipped block.
    fn skipped(&mut self, command: &Command);

    /// A statement failed. `ignored` is true when an `IGNORE SQL ERROR` scope covers it.
    fn exception(&mut self, failure: &SqlFailure, ignored: bool);

    fn patch_finished(&mut self, patch: &Patch);

    fn upgrade_complete(&mut self, version: &str);

    fn upgrade_aborted(&mut self);

    fn no_upgrade_needed(&mut self, version: &str);

    /// Output of a `PRINT` command
    fn print(&mut self, message: &str);
}

/// Writes progress to stdout, with details going to the log.
#[derive(Debug, Default)]
pub struct LogObserver {
    executed: u32,
    skipped: u32,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressObserver for LogObserver {
    fn patch_starting(&mut self, patch: &Patch, skip: u32) {
        self.executed = 0;
        self.skipped = 0;
        if skip > 0 {
            println!("Resuming {} after statement {}", patch, skip);
        } else {
            println!("Applying {}", patch);
        }
        info!("Patch starting: {} (skip {})", patch, skip);
    }

    fn section(&mut self, level: u8, message: &str) {
        let indent = "  ".repeat(level as usize);
        println!("{}{}", indent, message);
        info!("Section {}: {}", level, message);
    }

    fn executing(&mut self, command: &Command) {
        debug!("Executing at {}: {}", command.location(), command.text());
    }

    fn executed(&mut self, command: &Command) {
        self.executed += 1;
        debug!("Executed at {}", command.location());
    }

    fn skipped(&mut self, command: &Command) {
        self.skipped += 1;
        debug!("Skipped at {}: {}", command.location(), command.text());
    }

    fn exception(&mut self, failure: &SqlFailure, ignored: bool) {
        if ignored {
            warn!("Ignored error {}", failure);
        } else {
            println!("Error: {}", failure);
        }
    }

    fn patch_finished(&mut self, patch: &Patch) {
        println!(
            "Finished {} ({} executed, {} skipped)",
            patch, self.executed, self.skipped
        );
        info!("Patch finished: {}", patch);
    }

    fn upgrade_complete(&mut self, version: &str) {
        println!("Database is at version \"{}\"", version);
        info!("Upgrade complete: {}", version);
    }

    fn upgrade_aborted(&mut self) {
        println!("Upgrade aborted");
        warn!("Upgrade aborted");
    }

    fn no_upgrade_needed(&mut self, version: &str) {
        println!("Database is already at version \"{}\"", version);
        info!("No upgrade needed: {}", version);
    }

    fn print(&mut self, message: &str) {
        println!("{}", message);
    }
}
