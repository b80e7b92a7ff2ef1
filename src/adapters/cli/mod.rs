// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser)]
#[command(
    name = "fleetd",
    version,
    about = "Fleet account reconciliation daemon",
    long_about = None,
    after_help = "fleetd daemon\n\
\n\
Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < FLEETD_CONFIG_PATH < command-line flags.\n\
If --config is omitted, fleetd tries FLEETD_CONFIG_PATH, then the default config file location; missing default config is OK.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, fleetd uses FLEETD_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the SQLite database file. Overrides `database_path` from the config file."
    )]
    pub database_path: Option<PathBuf>,
    #[arg(
        long,
        value_name = "USER",
        help = "SSH username for outbound sessions. Overrides `ssh_username` from the config file."
    )]
    pub ssh_username: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        help = "SSH private key for outbound sessions. Overrides `ssh_identity_path` from the config file."
    )]
    pub ssh_identity_path: Option<String>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging and include logs from dependencies. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    let mut cmd = cli_command();
    let matches = cmd.get_matches_mut();
    let verbose_override = if matches.get_flag("verbose") {
        Some(true)
    } else {
        None
    };
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    ParsedOpts {
        opts,
        verbose_override,
    }
}
