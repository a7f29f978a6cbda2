mod cli;
mod config;
mod context;
mod coordinator;
mod database;
mod directive;
mod error;
mod graph;
mod interrupt;
mod listener;
mod observer;
mod patch;
mod processor;
mod script;
mod source;
mod store;

use cli::Cli;
use log::error;

fn main() {
    // Logging is configured from the loaded config inside handle_command_line
    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
