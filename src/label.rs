// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Parser for the `docker-ipv6-firewall.ports` label grammar:
//!
//! ```text
//! list  := entry (',' entry)*
//! entry := [port | port ':' port] ['/' proto]
//! proto := 'tcp' | 'udp' | 'all'
//! ```
//!
//! `int` defaults to `ext` when omitted, and `proto` defaults to `tcp`. `all` expands to both
//! `tcp` and `udp`. Whitespace around commas is permitted. A malformed element is reported as a
//! [`NetFw6Error::LabelParse`](../errors/enum.NetFw6Error.html) so the caller can log it and skip
//! just that element, per §4.4's failure semantics.

use crate::errors::NetFw6Error;
use crate::types::Protocol;

/// One parsed `docker-ipv6-firewall.ports` entry: a port pair plus protocol.
///
/// `published == target` means the container simply wants the port accepted as-is (no DNAT);
/// otherwise a NAT rewrite from `published` to `target` is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLabelEntry {
    /// Port as seen from outside the container's network.
    pub published: u16,
    /// Port the container actually listens on.
    pub target: u16,
    /// Protocol.
    pub proto: Protocol,
}

/// Parse a full `docker-ipv6-firewall.ports` label value into its entries.
///
/// Elements that fail to parse are reported individually via `on_error` and then skipped; the
/// rest of the list is still processed, matching the "skip the offending element, keep the rest"
/// rule.
pub fn parse_port_label<F>(value: &str, mut on_error: F) -> Vec<PortLabelEntry>
where
    F: FnMut(NetFw6Error),
{
    let mut entries = Vec::new();
    for raw in value.split(',') {
        let element = raw.trim();
        if element.is_empty() {
            continue;
        }
        match parse_entry(element) {
            Ok(parsed) => entries.extend(parsed),
            Err(reason) => on_error(NetFw6Error::LabelParse {
                element: element.to_owned(),
                reason,
            }),
        }
    }
    entries
}

fn parse_entry(element: &str) -> Result<Vec<PortLabelEntry>, String> {
    let (ports, proto) = match element.find('/') {
        Some(idx) => (&element[..idx], &element[idx + 1..]),
        None => (element, "tcp"),
    };
    let ports = ports.trim();
    let proto = proto.trim();

    let (published, target) = if let Some(idx) = ports.find(':') {
        let ext = parse_port(&ports[..idx])?;
        let int = parse_port(&ports[idx + 1..])?;
        (ext, int)
    } else {
        let ext = parse_port(ports)?;
        (ext, ext)
    };

    let protos: Vec<Protocol> = match proto.to_ascii_lowercase().as_str() {
        "all" => vec![Protocol::Tcp, Protocol::Udp],
        other => vec![other
            .parse()
            .map_err(|_| format!("unknown protocol '{}'", other))?],
    };

    Ok(protos
        .into_iter()
        .map(|proto| PortLabelEntry {
            published,
            target,
            proto,
        })
        .collect())
}

fn parse_port(s: &str) -> Result<u16, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("missing port number".to_owned());
    }
    s.parse::<u16>()
        .map_err(|_| format!("invalid port number '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(value: &str) -> Vec<PortLabelEntry> {
        let mut errors = Vec::new();
        let entries = parse_port_label(value, |e| errors.push(e));
        assert!(errors.is_empty(), "unexpected parse errors: {:?}", errors);
        entries
    }

    #[test]
    fn plain_port_defaults_to_tcp_and_identity_mapping() {
        let entries = parse_ok("5000");
        assert_eq!(
            entries,
            vec![PortLabelEntry {
                published: 5000,
                target: 5000,
                proto: Protocol::Tcp,
            }]
        );
    }

    #[test]
    fn explicit_protocol() {
        let entries = parse_ok("809/tcp");
        assert_eq!(entries[0].proto, Protocol::Tcp);
    }

    #[test]
    fn ext_int_pair_with_protocol() {
        let entries = parse_ok("443:444/udp");
        assert_eq!(
            entries,
            vec![PortLabelEntry {
                published: 443,
                target: 444,
                proto: Protocol::Udp,
            }]
        );
    }

    #[test]
    fn all_expands_to_both_protocols() {
        let entries = parse_ok("53/all");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.proto == Protocol::Tcp));
        assert!(entries.iter().any(|e| e.proto == Protocol::Udp));
    }

    #[test]
    fn full_list_from_scenario() {
        let entries = parse_ok("809/tcp, 443:444/udp, 5000");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].published, 809);
        assert_eq!(entries[0].target, 809);
        assert_eq!(entries[1].published, 443);
        assert_eq!(entries[1].target, 444);
        assert_eq!(entries[2].published, 5000);
        assert_eq!(entries[2].target, 5000);
    }

    #[test]
    fn whitespace_around_commas_is_tolerated() {
        let entries = parse_ok("  80 , 443/tcp  ");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn malformed_element_is_skipped_rest_kept() {
        let mut errors = Vec::new();
        let entries = parse_port_label("80, not-a-port, 443", |e| errors.push(e));
        assert_eq!(entries.len(), 2);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn unknown_protocol_is_an_error() {
        let mut errors = Vec::new();
        let entries = parse_port_label("80/sctp", |e| errors.push(e));
        assert!(entries.is_empty());
        assert_eq!(errors.len(), 1);
    }
}
