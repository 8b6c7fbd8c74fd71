// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::sync::Mutex;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod command;
pub mod command_attrs;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod consts;
pub mod daemon;
pub mod device;
pub mod fatal;
pub mod handle;
pub mod handle_map;
#[cfg(feature = "reference-io")]
pub mod reference_io;
pub mod resource_manager;
pub mod session_registry;
pub mod transport;

/// The command line arguments tabrmd expects.
///
/// NOTE: You must check `version()` and handle it yourself if it is set.
/// Clap won't do a good job with its automatic version support for a
/// library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        help = "Show more in logs, may be provided multiple times",
        action = clap::ArgAction::Count,
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "The file to write logs to, defaults to stderr")]
    pub log_file: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands tabrmd supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Start the resource manager daemon")]
    Daemon,
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run tabrmd with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    if let Some(log_file) = args.log_file.clone() {
        let file = std::fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon => {
            let config = config::read_config(&args.config_file)?;
            daemon_run(config)
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(feature = "reference-io")]
fn daemon_run(config: config::Config) -> anyhow::Result<()> {
    daemon::run(config)
}

#[cfg(not(feature = "reference-io"))]
fn daemon_run(_config: config::Config) -> anyhow::Result<()> {
    Err(anyhow!(
        "the daemon subcommand needs a concrete connection factory and device transport; \
         build with the `reference-io` feature to get the bundled Unix-socket/TCP-simulator ones"
    ))
}
