//! Instance registry: port → instance mapping and instance lifecycle.
//!
//! # Data Flow
//! ```text
//! create(spec)
//!     → create lock (one creation at a time)
//!     → explicit port: mapped? PortInUse : start engine
//!       no port: walk the range from the cursor, skip mapped ports and
//!       ports the engine reports in use, up to max_attempts
//!     → insert into map, publish new roster
//!
//! delete(port)
//!     → mark retiring (hidden from get/list, second delete is NotFound)
//!     → wake quiescence waiters with InstanceRemoved
//!     → stop engine (port released)
//!     → remove from map, publish new roster
//! ```
//!
//! # Design Decisions
//! - `DashMap` gives per-entry locking: lookups on unrelated ports never
//!   contend with each other or with a create in progress
//! - `list()` reads a roster published through `ArcSwap`, so it is one
//!   consistent point in time without locking the map
//! - A port leaves the map only after its engine has stopped, so a create
//!   can never bind a port that is still being served

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::{FleetConfig, InstanceDefaults, PortRangeConfig};
use crate::engine::{EngineError, ProxyEngine};
use crate::error::{FleetError, FleetResult};
use crate::filter::{PassthroughScriptHost, ScriptHost};
use crate::instance::{InstanceRuntime, LaunchSpec, ProxyInstance};
use crate::observability::metrics;
use crate::settings::InstanceSettings;

/// Inclusive candidate port range plus an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    pub max_attempts: u32,
}

impl PortRange {
    pub fn new(start: u16, end: u16, max_attempts: u32) -> Self {
        Self {
            start,
            end,
            max_attempts,
        }
    }

    fn len(&self) -> u32 {
        u32::from(self.end.saturating_sub(self.start)) + 1
    }

    /// Port `offset` steps after `from`, wrapping inside the range.
    fn nth_after(&self, from: u16, offset: u32) -> u16 {
        let base = if (self.start..=self.end).contains(&from) {
            u32::from(from - self.start)
        } else {
            0
        };
        let index = (base + offset) % self.len();
        // index < len <= u16 range, so this fits.
        self.start + index as u16
    }
}

impl From<&PortRangeConfig> for PortRange {
    fn from(config: &PortRangeConfig) -> Self {
        Self::new(config.start, config.end, config.max_attempts)
    }
}

/// Owner of every live proxy instance.
#[derive(Debug)]
pub struct ProxyRegistry {
    instances: DashMap<u16, Arc<ProxyInstance>>,
    roster: ArcSwap<Vec<Arc<ProxyInstance>>>,
    /// Serializes probing and registration. Holds the next candidate port.
    create_lock: Mutex<u16>,
    range: PortRange,
    defaults: InstanceDefaults,
    engine: Arc<dyn ProxyEngine>,
    script_host: Arc<dyn ScriptHost>,
}

impl ProxyRegistry {
    pub fn new(config: &FleetConfig, engine: Arc<dyn ProxyEngine>) -> Self {
        let range = PortRange::from(&config.ports);
        Self {
            instances: DashMap::new(),
            roster: ArcSwap::from_pointee(Vec::new()),
            create_lock: Mutex::new(range.start),
            range,
            defaults: config.defaults.clone(),
            engine,
            script_host: Arc::new(PassthroughScriptHost::default()),
        }
    }

    /// Use `host` to run filter scripts added after this call.
    pub fn with_script_host(mut self, host: Arc<dyn ScriptHost>) -> Self {
        self.script_host = host;
        self
    }

    pub fn port_range(&self) -> PortRange {
        self.range
    }

    /// Start a new instance.
    pub async fn create(&self, spec: LaunchSpec) -> FleetResult<Arc<ProxyInstance>> {
        let mut cursor = self.create_lock.lock().await;

        let instance = match spec.requested_port {
            Some(port) => {
                if self.instances.contains_key(&port) {
                    return Err(FleetError::PortInUse(port));
                }
                self.start_on(port, &spec).await.map_err(FleetError::EngineStartFailure)?
            }
            None => {
                let instance = self.probe(*cursor, &spec).await?;
                *cursor = self.range.nth_after(instance.port(), 1);
                instance
            }
        };

        self.instances.insert(instance.port(), Arc::clone(&instance));
        self.roster.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&instance));
            next.sort_by_key(|i| i.port());
            next
        });
        drop(cursor);

        metrics::record_instance_created(self.instances.len());
        tracing::info!(
            port = instance.port(),
            address = %instance.local_addr(),
            "Proxy instance created"
        );
        Ok(instance)
    }

    async fn probe(&self, from: u16, spec: &LaunchSpec) -> FleetResult<Arc<ProxyInstance>> {
        let mut attempts = 0;
        for offset in 0..self.range.len() {
            if attempts >= self.range.max_attempts {
                break;
            }
            let port = self.range.nth_after(from, offset);
            if self.instances.contains_key(&port) {
                continue;
            }

            attempts += 1;
            match self.start_on(port, spec).await {
                Ok(instance) => return Ok(instance),
                Err(EngineError::AddressInUse(_)) => {
                    tracing::debug!(port, "Port busy outside the registry, trying next");
                }
                Err(e) => return Err(FleetError::EngineStartFailure(e)),
            }
        }

        tracing::warn!(
            start = self.range.start,
            end = self.range.end,
            attempts,
            "No free port for new proxy instance"
        );
        Err(FleetError::PortsExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    async fn start_on(&self, port: u16, spec: &LaunchSpec) -> Result<Arc<ProxyInstance>, EngineError> {
        let runtime = Arc::new(InstanceRuntime::new(
            port,
            InstanceSettings::from_defaults(&self.defaults),
            Arc::clone(&self.script_host),
        ));
        let handle = self.engine.start(port, spec, Arc::clone(&runtime)).await?;
        Ok(Arc::new(ProxyInstance::new(runtime, spec.clone(), handle)))
    }

    /// Live instance on `port`. Instances being deleted are not returned.
    pub fn get(&self, port: u16) -> Option<Arc<ProxyInstance>> {
        self.instances
            .get(&port)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|instance| !instance.is_retiring())
    }

    /// Like [`get`](Self::get), as an error.
    pub fn require(&self, port: u16) -> FleetResult<Arc<ProxyInstance>> {
        self.get(port).ok_or(FleetError::InstanceNotFound(port))
    }

    /// Live instances sorted by port.
    pub fn list(&self) -> Vec<Arc<ProxyInstance>> {
        self.roster
            .load()
            .iter()
            .filter(|instance| !instance.is_retiring())
            .cloned()
            .collect()
    }

    /// Stop and unregister the instance on `port`.
    pub async fn delete(&self, port: u16) -> FleetResult<()> {
        let instance = self
            .instances
            .get(&port)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(FleetError::InstanceNotFound(port))?;
        if !instance.begin_retire() {
            return Err(FleetError::InstanceNotFound(port));
        }

        instance.activity().mark_removed();
        instance.stop_engine().await;

        self.instances.remove(&port);
        self.roster.rcu(|current| {
            current
                .iter()
                .filter(|i| i.port() != port)
                .cloned()
                .collect::<Vec<_>>()
        });

        metrics::record_instance_deleted(self.instances.len());
        tracing::info!(port, "Proxy instance deleted");
        Ok(())
    }

    /// Delete every instance, continuing past failures.
    pub async fn shutdown_all(&self) {
        let ports: Vec<u16> = self.instances.iter().map(|entry| *entry.key()).collect();
        tracing::info!(instances = ports.len(), "Stopping all proxy instances");
        for port in ports {
            if let Err(e) = self.delete(port).await {
                tracing::warn!(port, error = %e, "Failed to delete proxy instance during shutdown");
            }
        }
    }
}
