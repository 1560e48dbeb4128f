// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Structured logging setup, built on [`slog`] and configured through [`sloggers`] the same way
//! the reference implementation wires up its own logger: a terminal logger by default, or a file
//! logger when [`Config::log_file`](../config/struct.Config.html#structfield.log_file) is set.

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use crate::config::Config;
use crate::errors::{NetFw6Error, Result};

fn parse_severity(level: &str) -> Result<Severity> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Severity::Trace),
        "debug" => Ok(Severity::Debug),
        "info" => Ok(Severity::Info),
        "warning" | "warn" => Ok(Severity::Warning),
        "error" => Ok(Severity::Error),
        "critical" => Ok(Severity::Critical),
        other => Err(NetFw6Error::ConfigInvalid {
            reason: format!("unknown log level '{}'", other),
        }
        .into()),
    }
}

/// Build the root [`slog::Logger`] for a run, following `config.log_level` and
/// `config.log_file`.
pub fn build_logger(config: &Config) -> Result<slog::Logger> {
    let severity = parse_severity(&config.log_level)?;

    let logger = match &config.log_file {
        Some(path) => {
            let mut builder = FileLoggerBuilder::new(path);
            builder.level(severity);
            builder.build()?
        }
        None => {
            let mut builder = TerminalLoggerBuilder::new();
            builder.level(severity);
            builder.destination(Destination::Stderr);
            builder.build()?
        }
    };

    Ok(logger)
}
