// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The configuration-file contract: interface names, chain names, monitored network-driver
//! tags and command paths, loaded from TOML via `serde` with `derive_builder`-backed defaulting
//! for optional fields.
//!
//! # Example
//!
//! ```toml
//! parent_iface = "ens3"
//! gateway_iface = "macvlan_gw"
//! monitored_drivers = ["macvlan", "bridge"]
//!
//! [chains]
//! fwd6 = "DOCKER_IPV6FW_FORWARD"
//! in6 = "DOCKER_IPV6FW_INPUT"
//! nat6 = "DOCKER_IPV6FW_NAT"
//! fwd4 = "DOCKER_IPV4FW_FORWARD"
//! nat4 = "DOCKER_IPV4FW_NAT"
//! isolation = "DOCKER_IPV6FW_ISOLATION"
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use derive_builder::Builder;
use serde::{de, Deserialize};

use crate::chains::ChainNames;
use crate::errors::{NetFw6Error, Result};

fn default_monitored_drivers() -> Vec<String> {
    vec!["macvlan".to_owned(), "bridge".to_owned()]
}

fn default_chains() -> ChainNamesConfig {
    let names = ChainNames::default();
    ChainNamesConfig {
        fwd6: names.fwd6,
        in6: names.in6,
        nat6: names.nat6,
        fwd4: names.fwd4,
        nat4: names.nat4,
        isolation: names.isolation,
    }
}

fn default_iptables_cmd() -> String {
    "iptables".to_owned()
}

fn default_ip6tables_cmd() -> String {
    "ip6tables".to_owned()
}

fn default_link_local_v6() -> String {
    "fe80::/10".to_owned()
}

fn default_docker_socket() -> String {
    "unix:///var/run/docker.sock".to_owned()
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_config_poll_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// The `[chains]` section: names of the six private chains. Mirrors
/// [`ChainNames`](../chains/struct.ChainNames.html) for deserialization, since `derive(Deserialize)`
/// cannot be implemented directly on a type from another module without control of its fields.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChainNamesConfig {
    /// See [`ChainNames::fwd6`](../chains/struct.ChainNames.html#structfield.fwd6).
    pub fwd6: String,
    /// See [`ChainNames::in6`](../chains/struct.ChainNames.html#structfield.in6).
    pub in6: String,
    /// See [`ChainNames::nat6`](../chains/struct.ChainNames.html#structfield.nat6).
    pub nat6: String,
    /// See [`ChainNames::fwd4`](../chains/struct.ChainNames.html#structfield.fwd4).
    pub fwd4: String,
    /// See [`ChainNames::nat4`](../chains/struct.ChainNames.html#structfield.nat4).
    pub nat4: String,
    /// See [`ChainNames::isolation`](../chains/struct.ChainNames.html#structfield.isolation).
    pub isolation: String,
}

impl From<ChainNamesConfig> for ChainNames {
    fn from(c: ChainNamesConfig) -> Self {
        ChainNames {
            fwd6: c.fwd6,
            in6: c.in6,
            nat6: c.nat6,
            fwd4: c.fwd4,
            nat4: c.nat4,
            isolation: c.isolation,
        }
    }
}

/// The complete on-disk configuration.
///
/// `parent_iface` and `gateway_iface` are the only required fields; everything else defaults the
/// same way the reference implementation's configuration class does.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Builder)]
#[serde(deny_unknown_fields)]
#[builder(setter(into))]
pub struct Config {
    /// The upstream physical interface.
    pub parent_iface: String,
    /// The host-side endpoint of the container network.
    pub gateway_iface: String,

    /// Container-network driver tags eligible for rule creation. Accepts either a single string
    /// or a list, e.g. `monitored_drivers = "macvlan"` or `monitored_drivers = ["macvlan", "bridge"]`.
    #[serde(
        default = "default_monitored_drivers",
        deserialize_with = "string_or_seq_string"
    )]
    #[builder(default = "default_monitored_drivers()")]
    pub monitored_drivers: Vec<String>,

    /// Names of the six private chains.
    #[serde(default = "default_chains")]
    #[builder(default = "default_chains()")]
    pub chains: ChainNamesConfig,

    /// Path to the `iptables` administration program.
    #[serde(default = "default_iptables_cmd")]
    #[builder(default = "default_iptables_cmd()")]
    pub iptables_cmd: String,
    /// Path to the `ip6tables` administration program.
    #[serde(default = "default_ip6tables_cmd")]
    #[builder(default = "default_ip6tables_cmd()")]
    pub ip6tables_cmd: String,
    /// The IPv6 link-local prefix.
    #[serde(default = "default_link_local_v6")]
    #[builder(default = "default_link_local_v6()")]
    pub link_local_v6: String,

    /// URI of the container runtime's control socket.
    #[serde(default = "default_docker_socket")]
    #[builder(default = "default_docker_socket()")]
    pub docker_socket: String,

    /// Periodic sweep period, in seconds.
    #[serde(default = "default_sweep_interval")]
    #[builder(default = "default_sweep_interval()")]
    pub sweep_interval: u64,
    /// Configuration-file modification-time poll period, in seconds.
    #[serde(default = "default_config_poll_interval")]
    #[builder(default = "default_config_poll_interval()")]
    pub config_poll_interval: u64,

    /// Minimum log severity to emit (`trace`, `debug`, `info`, `warning`, `error`, `critical`).
    #[serde(default = "default_log_level")]
    #[builder(default = "default_log_level()")]
    pub log_level: String,
    /// Optional path to a log file. When unset, logs go to the terminal.
    #[serde(default)]
    #[builder(default = "None")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load and validate a configuration from a single TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.parent_iface.trim().is_empty() {
            return Err(NetFw6Error::ConfigInvalid {
                reason: "'parent_iface' must not be empty".to_owned(),
            }
            .into());
        }
        if self.gateway_iface.trim().is_empty() {
            return Err(NetFw6Error::ConfigInvalid {
                reason: "'gateway_iface' must not be empty".to_owned(),
            }
            .into());
        }
        if self.monitored_drivers.is_empty() {
            return Err(NetFw6Error::ConfigInvalid {
                reason: "'monitored_drivers' must not be empty".to_owned(),
            }
            .into());
        }
        if let Some(log_file) = &self.log_file {
            let log_dir = log_file.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(log_dir) = log_dir {
                if !log_dir.is_dir() {
                    return Err(NetFw6Error::ConfigInvalid {
                        reason: format!(
                            "log directory '{}' does not exist",
                            log_dir.display()
                        ),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Watches a configuration file's modification time and reports when it has changed since the
/// last check, so the caller can trigger a full reconcile on the new values.
pub struct ConfigWatcher {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Start watching `path`, capturing its current modification time as the baseline.
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let last_mtime = fs::metadata(&path)?.modified().ok();
        Ok(ConfigWatcher { path, last_mtime })
    }

    /// Returns `true` (and updates the baseline) iff the file's modification time has advanced
    /// since the last call.
    pub fn poll(&mut self) -> Result<bool> {
        let mtime = fs::metadata(&self.path)?.modified().ok();
        if mtime > self.last_mtime {
            self.last_mtime = mtime;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

struct StringOrSeqString;

impl<'de> de::Visitor<'de> for StringOrSeqString {
    type Value = Vec<String>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string or a sequence of strings")
    }

    fn visit_str<E>(self, value: &str) -> ::std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(vec![value.to_owned()])
    }

    fn visit_seq<S>(self, mut seq: S) -> ::std::result::Result<Self::Value, S::Error>
    where
        S: de::SeqAccess<'de>,
    {
        let mut out = Vec::new();
        while let Some(value) = seq.next_element::<String>()? {
            out.push(value);
        }
        Ok(out)
    }
}

/// Supports `monitored_drivers = "macvlan"` as shorthand for a single-element list, in addition
/// to the regular `monitored_drivers = ["macvlan", "bridge"]` form.
fn string_or_seq_string<'de, D>(deserializer: D) -> ::std::result::Result<Vec<String>, D::Error>
where
    D: de::Deserializer<'de>,
{
    deserializer.deserialize_any(StringOrSeqString)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_when_omitted() {
        let toml_str = r#"
            parent_iface = "ens3"
            gateway_iface = "macvlan_gw"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.monitored_drivers, vec!["macvlan", "bridge"]);
        assert_eq!(config.sweep_interval, 60);
        assert_eq!(config.config_poll_interval, 5);
        assert_eq!(config.docker_socket, "unix:///var/run/docker.sock");
        assert_eq!(config.chains.fwd6, "DOCKER_IPV6FW_FORWARD");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_file, None);
    }

    #[test]
    fn log_file_pointing_at_missing_directory_is_rejected() {
        let config = ConfigBuilder::default()
            .parent_iface("ens3")
            .gateway_iface("macvlan_gw")
            .log_file(Some(PathBuf::from("/does/not/exist/netfw6.log")))
            .build()
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_required_field_fails_to_parse() {
        let toml_str = r#"
            parent_iface = "ens3"
        "#;
        let result: ::std::result::Result<Config, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn empty_parent_iface_is_rejected_by_validation() {
        let config = ConfigBuilder::default()
            .parent_iface("")
            .gateway_iface("macvlan_gw")
            .build()
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_applies_same_defaults_as_serde() {
        let config = ConfigBuilder::default()
            .parent_iface("ens3")
            .gateway_iface("macvlan_gw")
            .build()
            .unwrap();
        assert_eq!(config.sweep_interval, 60);
        assert_eq!(config.monitored_drivers, vec!["macvlan", "bridge"]);
    }
}
