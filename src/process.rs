// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Worker orchestration: wires the [`Reconciler`](../reconcile/struct.Reconciler.html) up to the
//! Inventory Source's event stream, a periodic sweep tick and a configuration-file watch, the way
//! §5 describes — one cooperating "worker" per concern, funnelled into a single `select!` loop so
//! the Reconciler (and therefore the Ledger) stays single-writer without needing an explicit lock.
//!
//! The event worker is the Inventory Source's own background thread (every implementation of
//! [`InventorySource::event_stream`](../inventory/trait.InventorySource.html#tymethod.event_stream)
//! already runs its blocking I/O off the main thread and hands events over a channel); the sweep
//! and config-watch workers are [`crossbeam_channel::tick`] timers. Draining all three on one
//! thread keeps every `IPTables`/`InventorySource` borrow scoped to `run()`'s stack frame, with no
//! need to make the collaborators `'static` or `Send`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick};
use slog::{error, info, o, warn, Logger};

use crate::chains::ChainManager;
use crate::config::{Config, ConfigWatcher};
use crate::errors::Result;
use crate::inventory::{EventAction, InventorySource, OwnerKind, RawEvent};
use crate::iptables::IPTables;
use crate::reconcile::{ReconcileChains, Reconciler};
use crate::types::{ContainerDescriptor, Event, ServiceDescriptor};

/// Coordinates the Reconciler's lifecycle for one run: installs the base rules, drains the event
/// stream / sweep tick / config-watch tick on the calling thread, and tears everything down again
/// on [`stop`](#method.stop).
pub struct Daemon<'a> {
    inventory: &'a dyn InventorySource,
    v6: &'a dyn IPTables,
    v4: &'a dyn IPTables,
    config: Config,
    config_path: Option<PathBuf>,
    log: Logger,
    term: Arc<AtomicBool>,
}

impl<'a> Daemon<'a> {
    /// Build a daemon over the given collaborators. Does not start anything yet; call
    /// [`run`](#method.run) to install base rules and begin draining events.
    pub fn new(
        inventory: &'a dyn InventorySource,
        v6: &'a dyn IPTables,
        v4: &'a dyn IPTables,
        config: Config,
        config_path: Option<PathBuf>,
        log: Logger,
    ) -> Self {
        Daemon {
            inventory,
            v6,
            v4,
            config,
            config_path,
            log,
            term: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A clone of the termination flag, `false` until a shutdown is requested. Pass this straight
    /// to [`signal_hook::flag::register`] for `SIGINT`/`SIGTERM`; [`run`](#method.run) notices
    /// within one tick of the fastest timer and returns.
    pub fn term_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.term)
    }

    /// Request shutdown out-of-band (used by tests that don't go through a signal handler).
    pub fn stop(&self) {
        self.term.store(true, Ordering::SeqCst);
    }

    /// Install the private chains and base rules, then drain events/ticks until the running flag
    /// is cleared, then best-effort tear down owner rules and the private-chain jumps.
    pub fn run(&mut self) -> Result<()> {
        let mut chain_manager = ChainManager::new(
            self.v6,
            self.v4,
            self.config.chains.clone().into(),
            self.config.parent_iface.clone(),
            self.config.gateway_iface.clone(),
            self.config.link_local_v6.clone(),
            self.log.new(o!("component" => "chains")),
        );
        chain_manager.initialize()?;
        info!(self.log, "installed base rules and private chains");

        let chains = ReconcileChains {
            fwd6: self.config.chains.fwd6.clone(),
            nat6: self.config.chains.nat6.clone(),
        };
        let mut reconciler = Reconciler::new(
            self.inventory,
            self.v6,
            chains,
            self.config.clone(),
            self.log.new(o!("component" => "reconcile")),
        );

        let result = self.drain(&mut reconciler);

        if let Err(e) = &result {
            error!(self.log, "reconcile loop exited with an error"; "error" => e.to_string());
        }

        self.shutdown(&mut reconciler, &mut chain_manager);
        result
    }

    fn drain(&mut self, reconciler: &mut Reconciler<'_>) -> Result<()> {
        let event_rx = self.inventory.event_stream()?;
        let sweep_tick = tick(Duration::from_secs(self.config.sweep_interval));
        // A 0s interval would busy-loop; fall back to a conservative poll period instead of
        // special-casing it, since operators are expected to leave this at its default.
        let config_tick = tick(Duration::from_secs(self.config.config_poll_interval.max(1)));
        let mut config_watcher = self
            .config_path
            .as_ref()
            .and_then(|path| ConfigWatcher::new(path).ok());

        while !self.term.load(Ordering::SeqCst) {
            select! {
                recv(event_rx) -> raw => match raw {
                    Ok(raw) => self.handle_raw_event(reconciler, raw),
                    Err(_) => {
                        warn!(self.log, "inventory event stream disconnected, falling back to sweep-only operation");
                        break;
                    }
                },
                recv(sweep_tick) -> _ => {
                    if let Err(e) = reconciler.sweep() {
                        error!(self.log, "sweep failed"; "error" => e.to_string());
                    }
                },
                recv(config_tick) -> _ => {
                    if let (Some(watcher), Some(path)) = (config_watcher.as_mut(), self.config_path.as_ref()) {
                        self.poll_config(watcher, path, reconciler);
                    }
                },
                default(Duration::from_millis(500)) => continue,
            }
        }

        Ok(())
    }

    fn handle_raw_event(&self, reconciler: &mut Reconciler<'_>, raw: RawEvent) {
        let event = match resolve_event(self.inventory, &raw, &self.log) {
            Some(event) => event,
            None => return,
        };
        if let Err(e) = reconciler.handle_event(event) {
            error!(self.log, "failed to handle event"; "error" => e.to_string());
        }
    }

    fn poll_config(&mut self, watcher: &mut ConfigWatcher, path: &PathBuf, reconciler: &mut Reconciler<'_>) {
        match watcher.poll() {
            Ok(true) => match Config::load(path) {
                Ok(new_config) => {
                    info!(self.log, "reloading configuration";
                          "parent_iface" => &new_config.parent_iface,
                          "gateway_iface" => &new_config.gateway_iface);
                    self.config = new_config.clone();
                    reconciler.set_config(new_config);
                }
                Err(e) => {
                    warn!(self.log, "configuration reload failed, keeping old configuration"; "error" => e.to_string());
                }
            },
            Ok(false) => {}
            Err(e) => warn!(self.log, "could not poll configuration file"; "error" => e.to_string()),
        }
    }

    fn shutdown(&mut self, reconciler: &mut Reconciler<'_>, chain_manager: &mut ChainManager<'_>) {
        if let Err(e) = reconciler.teardown_all() {
            error!(self.log, "failed to remove owner-attributed rules during shutdown"; "error" => e.to_string());
        }
        if let Err(e) = chain_manager.cleanup() {
            error!(self.log, "failed to clean up private chains"; "error" => e.to_string());
        } else {
            info!(self.log, "removed base rules and private-chain jumps");
        }
    }
}

fn resolve_event(inventory: &dyn InventorySource, raw: &RawEvent, log: &Logger) -> Option<Event> {
    match (raw.kind, raw.action) {
        (OwnerKind::Container, EventAction::Start) => match inventory.container(&raw.id) {
            Ok(Some(descriptor)) => Some(Event::ContainerStart(descriptor)),
            Ok(None) => None,
            Err(e) => {
                warn!(log, "could not resolve container for event"; "id" => &raw.id, "error" => e.to_string());
                None
            }
        },
        (OwnerKind::Container, EventAction::Stop) => Some(Event::ContainerStop(raw.id.clone())),
        (OwnerKind::Service, EventAction::Start) => {
            resolve_service(inventory, &raw.id, log).map(|(s, c)| Event::ServiceUpdate(s, c))
        }
        (OwnerKind::Service, EventAction::Stop) => Some(Event::ServiceRemove(raw.id.clone())),
    }
}

fn resolve_service(
    inventory: &dyn InventorySource,
    service_id: &str,
    log: &Logger,
) -> Option<(ServiceDescriptor, Vec<ContainerDescriptor>)> {
    let services = match inventory.snapshot_services() {
        Ok(services) => services,
        Err(e) => {
            warn!(log, "could not list services for event"; "error" => e.to_string());
            return None;
        }
    };
    let service = services.into_iter().find(|s| s.id == service_id)?;
    let containers = inventory
        .containers_for_service(service_id)
        .unwrap_or_default();
    Some((service, containers))
}
