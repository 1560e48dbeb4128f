// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! CLI entry point: parses arguments, loads the configuration, wires up the Filter Driver and
//! Inventory Source, and runs the daemon until `SIGINT`/`SIGTERM`.

use std::path::PathBuf;
use std::process::exit;

use clap::{crate_version, App, Arg};
use slog::{crit, info, o};

use netfw6::config::Config;
use netfw6::inventory::DockerInventory;
use netfw6::iptables::{IPTables, IPTablesDummy, IPTablesProcess};
use netfw6::logging::build_logger;
use netfw6::Daemon;

fn parse_args() -> clap::ArgMatches<'static> {
    App::new("netfw6")
        .version(crate_version!())
        .about("Reconciles IPv6/IPv4 netfilter rules for containers on macvlan/bridge networks")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the TOML configuration file")
                .default_value("/etc/netfw6.toml")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dry-run")
                .long("dry-run")
                .help("Derive and log the rules that would be applied, without touching iptables"),
        )
        .get_matches()
}

fn require_root() -> Result<(), String> {
    // SAFETY: `geteuid` takes no arguments and has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(format!(
            "netfw6 must run as root to administer iptables/ip6tables (current euid: {})",
            euid
        ));
    }
    Ok(())
}

fn run() -> netfw6::Result<()> {
    let matches = parse_args();
    let config_path = PathBuf::from(matches.value_of("config").unwrap());
    let dry_run = matches.is_present("dry-run");

    let config = Config::load(&config_path)?;
    let log = build_logger(&config)?;

    if !dry_run {
        if let Err(reason) = require_root() {
            crit!(log, "refusing to start"; "reason" => reason.clone());
            return Err(netfw6::NetFw6Error::ConfigInvalid { reason }.into());
        }
    }

    info!(log, "starting netfw6";
          "parent_iface" => &config.parent_iface,
          "gateway_iface" => &config.gateway_iface,
          "dry_run" => dry_run);

    let inventory = DockerInventory::new(&config.docker_socket, log.new(o!("component" => "inventory")))?;

    let dummy = IPTablesDummy;
    let v6_process = IPTablesProcess::with_program(config.ip6tables_cmd.clone());
    let v4_process = IPTablesProcess::with_program(config.iptables_cmd.clone());

    let (v6, v4): (&dyn IPTables, &dyn IPTables) = if dry_run {
        (&dummy, &dummy)
    } else {
        (&v6_process, &v4_process)
    };

    let mut daemon = Daemon::new(
        &inventory,
        v6,
        v4,
        config,
        Some(config_path),
        log.new(o!("component" => "daemon")),
    );

    let term = daemon.term_flag();
    signal_hook::flag::register(signal_hook::SIGINT, term.clone())?;
    signal_hook::flag::register(signal_hook::SIGTERM, term)?;

    daemon.run()
}

fn main() {
    if let Err(e) = run() {
        eprintln!("netfw6: {}", e);
        exit(1);
    }
}
