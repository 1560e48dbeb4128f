// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The Inventory Source: a trait abstracting the container runtime, plus a `shiplift`-backed
//! implementation that talks to the Docker Engine API.
//!
//! The trait exists so the [`Reconciler`](../reconcile/index.html) can be driven by a fake
//! inventory in tests, the same way the reference implementation's processing code is generic
//! over its Docker client collaborator.

use std::collections::{BTreeMap, HashMap as Map};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use futures::Future;
use serde::Deserialize;
use shiplift::builder::ContainerListOptions;
use shiplift::Docker;
use slog::{debug, o, warn, Logger};
use url::Url;

use crate::errors::{NetFw6Error, Result};
use crate::types::{
    AttachedNetwork, ContainerDescriptor, Protocol, PublishMode, PublishedPort, ServiceDescriptor,
    ServicePort,
};

/// Label carrying the cluster-assigned service id on a container backing a service task,
/// used as the read-only fallback when the cluster API is unreachable (§4.4.2.c).
pub const SERVICE_ID_LABEL: &str = "com.docker.swarm.service.id";

/// Which kind of owner a [`RawEvent`](struct.RawEvent.html) concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// A single container.
    Container,
    /// A cluster service.
    Service,
}

/// What happened to the owner named by a [`RawEvent`](struct.RawEvent.html).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// The owner started running, or an already-running owner's observable state changed.
    Start,
    /// The owner stopped running or was removed.
    Stop,
}

/// A single `{type, action, id}` tuple straight off the Inventory Source's lifecycle-event
/// stream, carrying no resolved descriptor — resolving `id` into a full
/// [`ContainerDescriptor`](../types/struct.ContainerDescriptor.html) or
/// [`ServiceDescriptor`](../types/struct.ServiceDescriptor.html) is the Reconciler's job, so a
/// snapshot taken slightly later (and therefore slightly more current) is what gets applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Container or service.
    pub kind: OwnerKind,
    /// What happened.
    pub action: EventAction,
    /// Id of the owner this event concerns.
    pub id: String,
}

/// Blocking adapter over `shiplift`'s futures-0.1-based client: every call in this crate is
/// driven by a synchronous worker loop, so we resolve each future on the calling thread rather
/// than running a reactor.
trait FutureSync: Future {
    fn sync(self) -> ::std::result::Result<Self::Item, Self::Error>
    where
        Self: Sized,
    {
        self.wait()
    }
}

impl<F: Future> FutureSync for F {}

/// Abstraction over the container runtime: snapshot operations for containers and services, plus
/// a lifecycle-event stream.
pub trait InventorySource {
    /// The current set of running containers.
    fn snapshot_containers(&self) -> Result<Vec<ContainerDescriptor>>;

    /// The current set of cluster services. Returns an empty list (not an error) on a host that
    /// is not part of a cluster, or whose daemon does not expose the service API.
    fn snapshot_services(&self) -> Result<Vec<ServiceDescriptor>>;

    /// The containers currently backing `service_id`'s tasks. Falls back to containers carrying
    /// [`SERVICE_ID_LABEL`](constant.SERVICE_ID_LABEL.html) when the cluster API call fails,
    /// per §4.4.2.c.
    fn containers_for_service(&self, service_id: &str) -> Result<Vec<ContainerDescriptor>>;

    /// Resolve a single container by id, or `None` if it is no longer running.
    fn container(&self, id: &str) -> Result<Option<ContainerDescriptor>>;

    /// Start the background lifecycle-event stream, returning the receiving end of the channel
    /// it is published on. Events for the same owner are delivered in source order; no ordering
    /// is promised across owners.
    fn event_stream(&self) -> Result<Receiver<RawEvent>>;
}

/// `shiplift`-backed implementation talking to the Docker Engine API.
pub struct DockerInventory {
    docker: Docker,
    /// Kept alongside `docker` because `shiplift` 0.6 has no typed wrapper for the Swarm services
    /// endpoint; `snapshot_services` speaks raw HTTP over this same socket instead.
    docker_socket: Url,
    log: Logger,
}

impl DockerInventory {
    /// Connect to the control socket at `docker_socket`.
    pub fn new(docker_socket: &str, log: Logger) -> Result<Self> {
        let docker_socket: Url = docker_socket.parse()?;
        let docker = Docker::host(docker_socket.clone());
        Ok(DockerInventory {
            docker,
            docker_socket,
            log,
        })
    }

    /// `GET path` against the Engine API over `docker_socket`, for endpoints `shiplift` doesn't
    /// expose. Only supports `unix://` sockets, which is what every deployment of this daemon
    /// uses in practice (it already requires local root to administer `iptables`).
    fn raw_get(&self, path: &str) -> Result<Vec<u8>> {
        if self.docker_socket.scheme() != "unix" {
            return Err(NetFw6Error::InventoryUnavailable {
                reason: format!(
                    "cluster service discovery needs a unix:// docker_socket, got scheme {:?}",
                    self.docker_socket.scheme()
                ),
            }
            .into());
        }

        let unavailable = |reason: String| NetFw6Error::InventoryUnavailable { reason }.into();

        let mut stream = UnixStream::connect(self.docker_socket.path())
            .map_err(|e| unavailable(e.to_string()))?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|e| unavailable(e.to_string()))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .map_err(|e| unavailable(e.to_string()))?;

        let (head, raw_body) = split_http_response(&raw)
            .ok_or_else(|| unavailable("malformed HTTP response from docker daemon".to_owned()))?;

        let status_line = head.lines().next().unwrap_or("");
        if !status_line.contains(" 200 ") {
            return Err(unavailable(format!("docker daemon returned {}", status_line)));
        }

        let body = if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
            dechunk(raw_body)
        } else {
            raw_body.to_vec()
        };
        Ok(body)
    }

    fn container_descriptor(&self, id: &str) -> Result<ContainerDescriptor> {
        let details = self.docker.containers().get(id).inspect().sync()?;

        let labels = details.config.labels.clone().unwrap_or_default();

        let mut published_ports = Vec::new();
        let mut seen: Vec<(u16, Protocol)> = Vec::new();
        if let Some(bindings) = details.host_config.port_bindings.as_ref() {
            for (spec, maybe_bindings) in bindings {
                let (container_port, proto) = match parse_port_spec(spec) {
                    Some(parsed) => parsed,
                    None => continue,
                };
                seen.push((container_port, proto));
                match maybe_bindings {
                    Some(host_bindings) if !host_bindings.is_empty() => {
                        for binding in host_bindings {
                            let host_port = binding.host_port.as_ref().and_then(|p| p.parse().ok());
                            published_ports.push(PublishedPort {
                                container_port,
                                host_port,
                                proto,
                            });
                        }
                    }
                    _ => published_ports.push(PublishedPort {
                        container_port,
                        host_port: None,
                        proto,
                    }),
                }
            }
        }

        // `NetworkSettings.Ports` carries the same map shape as `HostConfig.PortBindings` (the
        // Engine API populates both from the same internal port-map), and is the only place a
        // binding shows up when a container is attached after start rather than at `create` time.
        // Only consult it for container/proto pairs `HostConfig.PortBindings` didn't already cover.
        if let Some(ports) = details.network_settings.ports.as_ref() {
            for (spec, maybe_bindings) in ports {
                let (container_port, proto) = match parse_port_spec(spec) {
                    Some(parsed) => parsed,
                    None => continue,
                };
                if seen.contains(&(container_port, proto)) {
                    continue;
                }
                match maybe_bindings {
                    Some(host_bindings) if !host_bindings.is_empty() => {
                        for binding in host_bindings {
                            let host_port = binding.host_port.as_ref().and_then(|p| p.parse().ok());
                            published_ports.push(PublishedPort {
                                container_port,
                                host_port,
                                proto,
                            });
                        }
                    }
                    _ => published_ports.push(PublishedPort {
                        container_port,
                        host_port: None,
                        proto,
                    }),
                }
            }
        }

        let mut networks = Vec::new();
        for (name, entry) in &details.network_settings.networks {
            let global_ipv6_address = if entry.global_ipv6_address.is_empty() {
                None
            } else {
                Some(entry.global_ipv6_address.clone())
            };
            networks.push(AttachedNetwork {
                name: name.clone(),
                driver: network_driver(&self.docker, name).unwrap_or_default(),
                global_ipv6_address,
            });
        }

        Ok(ContainerDescriptor {
            id: details.id,
            name: details.name.trim_start_matches('/').to_owned(),
            labels,
            published_ports,
            networks,
        })
    }
}

impl InventorySource for DockerInventory {
    fn snapshot_containers(&self) -> Result<Vec<ContainerDescriptor>> {
        let containers = self
            .docker
            .containers()
            .list(&ContainerListOptions::builder().all(false).build())
            .sync()
            .map_err(|e| NetFw6Error::InventoryUnavailable {
                reason: e.to_string(),
            })?;

        debug!(self.log, "listed running containers"; "count" => containers.len());

        let mut descriptors = Vec::with_capacity(containers.len());
        for container in &containers {
            descriptors.push(self.container_descriptor(&container.id)?);
        }
        Ok(descriptors)
    }

    fn snapshot_services(&self) -> Result<Vec<ServiceDescriptor>> {
        let body = match self.raw_get("/services") {
            Ok(body) => body,
            Err(e) => {
                // Covers both legitimate cases (worker node, non-swarm host, non-unix socket) and
                // genuine failures; §6 asks for an empty list rather than an error either way, so
                // the distinction only matters for the log line.
                debug!(self.log, "cluster services unavailable, treating host as non-swarm"; "error" => e.to_string());
                return Ok(Vec::new());
            }
        };

        let raw_services: Vec<RawService> = serde_json::from_slice(&body).map_err(|e| {
            NetFw6Error::InventoryUnavailable {
                reason: format!("malformed response from /services: {}", e),
            }
        })?;

        debug!(self.log, "listed cluster services"; "count" => raw_services.len());
        Ok(raw_services.into_iter().map(RawService::into_descriptor).collect())
    }

    fn containers_for_service(&self, service_id: &str) -> Result<Vec<ContainerDescriptor>> {
        let containers = self.snapshot_containers()?;
        Ok(containers
            .into_iter()
            .filter(|c| c.labels.get(SERVICE_ID_LABEL).map(String::as_str) == Some(service_id))
            .collect())
    }

    fn container(&self, id: &str) -> Result<Option<ContainerDescriptor>> {
        match self.container_descriptor(id) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(_) => Ok(None),
        }
    }

    fn event_stream(&self) -> Result<Receiver<RawEvent>> {
        let (tx, rx) = unbounded();
        let docker = self.docker.clone();
        let log = self.log.new(o!("worker" => "docker-events"));

        thread::spawn(move || loop {
            // `Stream::wait` turns the futures-0.1 event stream into a blocking iterator; each
            // item resolves as soon as the daemon emits it, so this does not buffer.
            for item in docker.events(&Default::default()).wait() {
                match item {
                    Ok(raw) => {
                        if let Some(event) = translate_event(&raw) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(log, "docker event stream failed, retrying"; "error" => e.to_string());
                        break;
                    }
                }
            }
            thread::sleep(Duration::from_secs(5));
        });

        Ok(rx)
    }
}

fn network_driver(docker: &Docker, name: &str) -> Option<String> {
    docker
        .networks()
        .get(name)
        .inspect()
        .sync()
        .ok()
        .map(|details| details.driver)
}

/// Splits a raw HTTP/1.1 response into its header block (as `&str`) and the remaining bytes
/// (body, still possibly chunk-encoded). `None` if no `\r\n\r\n` header terminator is present.
fn split_http_response(raw: &[u8]) -> Option<(&str, &[u8])> {
    let marker = b"\r\n\r\n";
    let pos = raw.windows(marker.len()).position(|w| w == marker)?;
    let head = std::str::from_utf8(&raw[..pos]).ok()?;
    Some((head, &raw[pos + marker.len()..]))
}

/// Decodes an HTTP chunked-transfer-encoded body. Malformed input decodes to whatever was
/// successfully parsed before the point it stopped making sense.
fn dechunk(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = match body.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => pos,
            None => break,
        };
        let size = match std::str::from_utf8(&body[..line_end])
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
        {
            Some(size) => size,
            None => break,
        };
        body = &body[line_end + 2..];
        if size == 0 || body.len() < size {
            break;
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size..];
        if body.len() >= 2 && &body[..2] == b"\r\n" {
            body = &body[2..];
        }
    }
    out
}

/// Mirrors the subset of the Engine API's `Service` object (`GET /services`) this crate needs;
/// field names match the JSON Docker actually sends, not Rust conventions.
#[derive(Deserialize)]
struct RawService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Spec")]
    spec: RawServiceSpec,
}

#[derive(Deserialize)]
struct RawServiceSpec {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "EndpointSpec")]
    endpoint_spec: Option<RawEndpointSpec>,
}

#[derive(Deserialize)]
struct RawEndpointSpec {
    #[serde(rename = "Ports", default)]
    ports: Vec<RawEndpointPort>,
}

#[derive(Deserialize)]
struct RawEndpointPort {
    #[serde(rename = "Protocol")]
    protocol: String,
    #[serde(rename = "TargetPort")]
    target_port: Option<u16>,
    #[serde(rename = "PublishedPort")]
    published_port: Option<u16>,
    #[serde(rename = "PublishMode", default)]
    publish_mode: Option<String>,
}

impl RawService {
    fn into_descriptor(self) -> ServiceDescriptor {
        let ports = self
            .spec
            .endpoint_spec
            .map(|endpoint| endpoint.ports)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|port| {
                let proto = port.protocol.parse().ok()?;
                let publish_mode = match port.publish_mode.as_deref() {
                    Some("host") => PublishMode::Host,
                    _ => PublishMode::Ingress,
                };
                Some(ServicePort {
                    published_port: port.published_port,
                    target_port: port.target_port,
                    proto,
                    publish_mode,
                })
            })
            .collect();

        ServiceDescriptor {
            id: self.id,
            name: self.spec.name,
            labels: self.spec.labels,
            ports,
        }
    }
}

fn parse_port_spec(spec: &str) -> Option<(u16, Protocol)> {
    let mut parts = spec.splitn(2, '/');
    let port = parts.next()?.parse().ok()?;
    let proto = parts.next().unwrap_or("tcp").parse().ok()?;
    Some((port, proto))
}

fn translate_event(raw: &shiplift::rep::Event) -> Option<RawEvent> {
    let action = match raw.action.as_str() {
        "start" | "unpause" | "update" => EventAction::Start,
        "die" | "stop" | "kill" | "destroy" => EventAction::Stop,
        _ => return None,
    };
    let kind = match raw.typ.as_str() {
        "container" => OwnerKind::Container,
        "service" => OwnerKind::Service,
        _ => return None,
    };
    Some(RawEvent {
        kind,
        action,
        id: raw.actor.id.clone(),
    })
}

/// A fixed, in-memory `InventorySource` for tests: a snapshot given at construction time, never
/// changing, with an event stream fed by the test itself.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// A stand-in inventory whose snapshots and events are supplied directly by the test.
    pub struct FakeInventory {
        containers: Mutex<Vec<ContainerDescriptor>>,
        services: Mutex<Map<String, (ServiceDescriptor, Vec<ContainerDescriptor>)>>,
        events: Mutex<Option<Receiver<RawEvent>>>,
    }

    impl FakeInventory {
        /// An empty inventory.
        pub fn new() -> Self {
            FakeInventory {
                containers: Mutex::new(Vec::new()),
                services: Mutex::new(Map::new()),
                events: Mutex::new(None),
            }
        }

        /// Replace the container snapshot.
        pub fn set_containers(&self, containers: Vec<ContainerDescriptor>) {
            *self.containers.lock().unwrap() = containers;
        }

        /// Register a service and the containers currently backing it.
        pub fn set_service(&self, service: ServiceDescriptor, containers: Vec<ContainerDescriptor>) {
            self.services
                .lock()
                .unwrap()
                .insert(service.id.clone(), (service, containers));
        }

        /// Install the receiving end of a channel the test will feed events into.
        pub fn set_event_stream(&self, rx: Receiver<RawEvent>) {
            *self.events.lock().unwrap() = Some(rx);
        }
    }

    impl InventorySource for FakeInventory {
        fn snapshot_containers(&self) -> Result<Vec<ContainerDescriptor>> {
            Ok(self.containers.lock().unwrap().clone())
        }

        fn snapshot_services(&self) -> Result<Vec<ServiceDescriptor>> {
            Ok(self
                .services
                .lock()
                .unwrap()
                .values()
                .map(|(s, _)| s.clone())
                .collect())
        }

        fn containers_for_service(&self, service_id: &str) -> Result<Vec<ContainerDescriptor>> {
            Ok(self
                .services
                .lock()
                .unwrap()
                .get(service_id)
                .map(|(_, containers)| containers.clone())
                .unwrap_or_default())
        }

        fn container(&self, id: &str) -> Result<Option<ContainerDescriptor>> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.id == id)
                .cloned())
        }

        fn event_stream(&self) -> Result<Receiver<RawEvent>> {
            self.events
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| NetFw6Error::InventoryUnavailable {
                    reason: "no event stream installed on fake inventory".to_owned(),
                }
                .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeInventory;
    use super::*;

    #[test]
    fn fake_inventory_round_trips_a_container_snapshot() {
        let fake = FakeInventory::new();
        let container = ContainerDescriptor {
            id: "c1".to_owned(),
            name: "web".to_owned(),
            ..Default::default()
        };
        fake.set_containers(vec![container.clone()]);

        let snapshot = fake.snapshot_containers().unwrap();
        assert_eq!(snapshot, vec![container]);
    }

    #[test]
    fn fake_inventory_resolves_service_containers() {
        let fake = FakeInventory::new();
        let service = ServiceDescriptor {
            id: "svc1".to_owned(),
            name: "web-service".to_owned(),
            ..Default::default()
        };
        let container = ContainerDescriptor {
            id: "c1".to_owned(),
            ..Default::default()
        };
        fake.set_service(service, vec![container.clone()]);

        let containers = fake.containers_for_service("svc1").unwrap();
        assert_eq!(containers, vec![container]);
    }
}
