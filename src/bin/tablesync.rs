// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Binary for `tablesync`: loads a TOML description of the desired table
//! states and performs a single apply pass per table.

#[macro_use]
extern crate clap;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate slog;
extern crate sloggers;
extern crate tablesync;

use clap::{App, Arg, ArgMatches};
use slog::Logger;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::process::exit;
use tablesync::command::{CommandFactory, DummyCommandFactory, IPVersion, ProcessCommandFactory};
use tablesync::errors::*;
use tablesync::rules::{Chain, Rule};
use tablesync::table::{Table, TableOptionsBuilder};
use tablesync::types::{Config, TableConfig};

fn build_logger(matches: &ArgMatches) -> Result<Logger> {
    let severity = match matches.value_of("log-level") {
        Some("trace") => Severity::Trace,
        Some("debug") => Severity::Debug,
        Some("warning") => Severity::Warning,
        Some("error") => Severity::Error,
        Some("critical") => Severity::Critical,
        _ => Severity::Info,
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    Ok(builder.build()?)
}

fn sync_table(table_config: &TableConfig, dry_run: bool, logger: &Logger) -> Result<()> {
    let ip_version = match table_config.ip_version {
        4 => IPVersion::IPv4,
        6 => IPVersion::IPv6,
        other => bail!(
            "invalid ip_version {} for table '{}'",
            other,
            table_config.name
        ),
    };
    let command_factory: Box<dyn CommandFactory> = if dry_run {
        Box::new(DummyCommandFactory)
    } else {
        Box::new(ProcessCommandFactory)
    };

    let options = TableOptionsBuilder::default()
        .name(table_config.name.clone())
        .ip_version(ip_version)
        .historic_chain_prefixes(table_config.chain_prefixes.clone())
        .hash_prefix(table_config.hash_prefix.clone())
        .extra_cleanup_regex(table_config.extra_cleanup_regex.clone())
        .build()
        .map_err(|error| format_err!("{}", error))?;
    let mut table = Table::new(options, command_factory, logger)?;

    for chain_config in &table_config.chains {
        let rules = chain_config
            .rules
            .iter()
            .map(|spec| Rule::new(spec.as_str()))
            .collect();
        table.update_chain(Chain::new(chain_config.name.as_str(), rules));
    }
    for (chain_name, rule_specs) in &table_config.insertions {
        let rules = rule_specs
            .iter()
            .map(|spec| Rule::new(spec.as_str()))
            .collect();
        table.set_rule_insertions(chain_name, rules);
    }

    table.apply()
}

fn run(matches: &ArgMatches, logger: &Logger) -> Result<()> {
    let config_file = matches.value_of("config-file").unwrap();
    let dry_run = matches.is_present("dry-run");
    info!(logger, "Loading configuration"; "config_file" => config_file, "dry_run" => dry_run);
    let config = Config::load_file(config_file)?;

    for table_config in &config.tables {
        sync_table(table_config, dry_run, logger)?;
        info!(logger, "Table synchronized"; "table" => table_config.name.clone());
    }

    Ok(())
}

fn main() {
    let matches = App::new("tablesync")
        .version(crate_version!())
        .author("Pit Kleyersburg <pitkley@googlemail.com>")
        .about("Kernel packet-filter table synchronizer")
        .arg(
            Arg::with_name("config-file")
                .takes_value(true)
                .short("c")
                .long("config-file")
                .value_name("FILE")
                .required(true)
                .help("Set the configuration file"),
        )
        .arg(
            Arg::with_name("dry-run")
                .long("dry-run")
                .help("Compute the restore transactions without touching the host"),
        )
        .arg(
            Arg::with_name("log-level")
                .takes_value(true)
                .long("log-level")
                .value_name("SEVERITY")
                .possible_values(&["trace", "debug", "info", "warning", "error", "critical"])
                .default_value("info")
                .help("Define the log level"),
        )
        .get_matches();

    let logger = match build_logger(&matches) {
        Ok(logger) => logger,
        Err(error) => {
            eprintln!("tablesync: cannot set up logging: {}", error);
            exit(1);
        }
    };

    if let Err(error) = run(&matches, &logger) {
        crit!(logger, "tablesync failed"; "error" => %error);
        exit(1);
    }
}
