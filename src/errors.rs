// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Error types used throughout this crate.
//!
//! Rather than a single monolithic error enum, [`NetFw6Error`](enum.NetFw6Error.html) only
//! captures the failure modes this crate itself can produce (see §7 of the design for the
//! rationale behind each variant); everything that originates in a dependency is carried through
//! via the [`From`] conversions below and surfaced as a `failure::Error`.

use failure::Fail;
use std::fmt;

/// The crate-wide `Result` alias.
pub type Result<T> = ::std::result::Result<T, failure::Error>;

/// Errors raised directly by this crate's own logic.
///
/// Everything else (I/O, the Docker client, TOML (de)serialization, URL parsing) is wrapped
/// through `failure::Error`'s blanket `From` conversions and does not need its own variant here.
#[derive(Debug, Fail)]
pub enum NetFw6Error {
    /// The on-disk configuration is missing a required value or points at something that does
    /// not exist (e.g. a log directory). Surfaced at startup only; never raised again afterwards.
    #[fail(display = "invalid configuration: {}", reason)]
    ConfigInvalid {
        /// Human-readable explanation of what is wrong.
        reason: String,
    },

    /// The container runtime's control socket could not be reached.
    #[fail(display = "inventory source unavailable: {}", reason)]
    InventoryUnavailable {
        /// Human-readable explanation of what is wrong.
        reason: String,
    },

    /// Invocation of the administration program (`iptables`/`ip6tables`) failed or returned a
    /// non-zero exit status for an operation other than an existence check.
    #[fail(
        display = "administration program '{}' failed for {} {}: {}",
        program, table, chain, reason
    )]
    AdminProgramFailure {
        /// Which administration program was invoked (`iptables` or `ip6tables`).
        program: String,
        /// The table the operation targeted.
        table: String,
        /// The chain the operation targeted.
        chain: String,
        /// What went wrong.
        reason: String,
    },

    /// A `docker-ipv6-firewall.ports` label value did not match the grammar in §6. The offending
    /// element is skipped and the rest of the label is still processed.
    #[fail(display = "could not parse port label element '{}': {}", element, reason)]
    LabelParse {
        /// The offending comma-separated element.
        element: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// A trait method was invoked on an [`IPTables`](../iptables/trait.IPTables.html)
    /// implementation that does not support it.
    #[fail(display = "method '{}' is not implemented by this backend", method)]
    TraitMethodUnimplemented {
        /// Name of the unimplemented method.
        method: String,
    },
}

/// Marker error used where only a human-readable reason is useful, e.g. when a network is
/// eligible by driver but carries no IPv6 address.
#[derive(Debug)]
pub struct MissingAddress {
    /// Name of the network missing an address.
    pub network: String,
}

impl fmt::Display for MissingAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "network '{}' has no usable IPv6 address", self.network)
    }
}

impl std::error::Error for MissingAddress {}
