use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use flexi_logger::{detailed_format, Duplicate, FileSpec, Logger, LoggerHandle};
use log::{debug, info, warn};

use crate::config::{Config, LoggingConfig};
use crate::coordinator::{UpgradeCoordinator, UpgradeOutcome};
use crate::database::Databases;
use crate::error::UpgradeError;
use crate::interrupt::InterruptToken;
use crate::observer::LogObserver;
use crate::processor::Environment;
use crate::script::VariableEvaluator;
use crate::source::upgrade_file::UpgradeFile;

#[derive(Parser)]
#[command(
    name = "dbupgrade",
    version,
    about = "dbupgrade: resumable, versioned database schema upgrades"
)]
pub struct Cli {
    /// Configuration file (default: config.toml in the user's config directory)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Upgrade definition file (overrides upgrade.file from the configuration)
    #[arg(long = "file", short = 'f', global = true)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Upgrade the database (default if no command specified)
    Upgrade {
        /// Version to upgrade to; "prefix*" picks the single reachable match
        #[arg(long = "target", short = 't')]
        target: Option<String>,

        /// Allow downgrade patches on the path
        #[arg(long = "downgrade", default_value_t = false)]
        downgrade: bool,
    },

    /// List the versions the database can be upgraded to
    Targets {
        /// Every reachable version instead of only the end points
        #[arg(long = "all", short = 'a', default_value_t = false)]
        all: bool,

        /// Only versions starting with this prefix (follows open patches)
        #[arg(long = "prefix", short = 'p')]
        prefix: Option<String>,

        #[arg(long = "downgrade", default_value_t = false)]
        downgrade: bool,
    },

    /// Show the current version of the database
    Status,

    /// Export the upgrade history as JSON
    History {
        /// Write to this file instead of stdout
        #[arg(long = "output", short = 'o')]
        output: Option<PathBuf>,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), UpgradeError> {
        let args = Cli::parse();

        let config = match &args.config {
            Some(path) => Config::load_from(path),
            None => {
                let project_dirs = ProjectDirs::from("", "", "dbupgrade").ok_or_else(|| {
                    UpgradeError::Config("Could not determine the config directory".to_owned())
                })?;
                Config::load_config(&project_dirs)
            }
        };

        // Dropping the handle stops the logger
        let _logger = Self::start_logging(&config.logging)?;
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

        let file = args.file.clone().unwrap_or_else(|| config.upgrade.file.clone());
        let command = args.command.unwrap_or(Command::Upgrade {
            target: None,
            downgrade: false,
        });

        match command {
            Command::Upgrade { target, downgrade } => {
                let target = target.or_else(|| config.upgrade.target.clone());
                let downgrade = downgrade || config.upgrade.downgrade_allowed;
                Self::upgrade(&config, &file, target, downgrade)
            }
            Command::Targets {
                all,
                prefix,
                downgrade,
            } => {
                let mut coordinator = Self::coordinator(&config, &file, InterruptToken::new())?;
                let targets = coordinator.resolve_targets(!all, prefix.as_deref(), downgrade)?;
                for target in &targets {
                    println!("{}", target);
                }
                coordinator.end();
                Ok(())
            }
            Command::Status => {
                let mut coordinator = Self::coordinator(&config, &file, InterruptToken::new())?;
                println!("{}", coordinator.version_statement()?);
                coordinator.end();
                Ok(())
            }
            Command::History { output } => {
                let mut coordinator = Self::coordinator(&config, &file, InterruptToken::new())?;
                match output {
                    Some(path) => coordinator.export_history(BufWriter::new(File::create(&path)?))?,
                    None => coordinator.export_history(io::stdout().lock())?,
                }
                coordinator.end();
                Ok(())
            }
        }
    }

    fn start_logging(logging: &LoggingConfig) -> Result<LoggerHandle, UpgradeError> {
        let logger = Logger::try_with_env_or_str(logging.log_spec())
            .map_err(|e| UpgradeError::Config(format!("Invalid log spec: {}", e)))?
            .format(detailed_format);

        let logger = match &logging.directory {
            Some(directory) => logger
                .log_to_file(FileSpec::default().directory(directory))
                .duplicate_to_stderr(Duplicate::Warn),
            None => logger,
        };

        logger
            .start()
            .map_err(|e| UpgradeError::Error(format!("Failed to start logging: {}", e)))
    }

    fn coordinator(
        config: &Config,
        file: &Path,
        interrupt: InterruptToken,
    ) -> Result<UpgradeCoordinator, UpgradeError> {
        let upgrade_file = UpgradeFile::open(file)?;
        let env = Environment {
            databases: Databases::from_config(
                &config.database,
                &config.connections,
                &config.retry,
                interrupt.clone(),
            ),
            observer: Box::new(LogObserver::new()),
            evaluator: Box::new(VariableEvaluator::new(config.variables.clone())),
        };
        Ok(UpgradeCoordinator::new(
            upgrade_file,
            env,
            interrupt,
            config.upgrade.log_statements,
        ))
    }

    /// Runs the upgrade on a blocking worker; Ctrl-C asks it to stop after the current
    /// statement.
    fn upgrade(
        config: &Config,
        file: &Path,
        target: Option<String>,
        allow_downgrade: bool,
    ) -> Result<(), UpgradeError> {
        let interrupt = InterruptToken::new();
        let mut coordinator = Self::coordinator(config, file, interrupt.clone())?;

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| UpgradeError::Error(format!("Failed to create runtime: {}", e)))?;

        let outcome = rt.block_on(async move {
            let mut worker = tokio::task::spawn_blocking(move || {
                let result = coordinator.upgrade(target.as_deref(), allow_downgrade);
                coordinator.end();
                result
            });

            let joined = tokio::select! {
                joined = &mut worker => joined,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupt received, stopping after the current statement");
                    println!("Interrupted, finishing the current statement...");
                    interrupt.interrupt();
                    worker.await
                }
            };
            match joined {
                Ok(result) => result,
                Err(e) => Err(UpgradeError::Error(format!("Upgrade worker failed: {}", e))),
            }
        })?;

        match outcome {
            UpgradeOutcome::Completed | UpgradeOutcome::NoUpgradeNeeded => {
                info!("Upgrade finished: {:?}", outcome);
                Ok(())
            }
            UpgradeOutcome::Aborted => Err(UpgradeError::Error(
                "The upgrade was interrupted and can be resumed".to_owned(),
            )),
        }
    }
}
