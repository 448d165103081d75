//! The endpoint registry: owns every listener container of the process.
//!
//! Mutations (register, unregister, bulk lifecycle) are serialized behind one
//! async lock. Lookups only take the read side of the container table, so
//! status queries never wait for a container to start or stop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::container::{
    ContainerFailure, ContainerState, ContainerStatus, FailureListener, ListenerContainer,
    StopReport,
};
use crate::endpoint::EndpointDescriptor;
use crate::error::{ConfigurationError, ListenerError, Result};
use crate::factory::ContainerFactory;
use crate::handler::RecordHandler;

#[derive(Default)]
struct Table {
    /// Container ids in registration order.
    order: Vec<String>,
    containers: HashMap<String, ListenerContainer>,
    groups: HashMap<String, Vec<String>>,
}

impl Table {
    fn members(&self, ids: &[String]) -> Vec<ListenerContainer> {
        ids.iter()
            .filter_map(|id| self.containers.get(id).cloned())
            .collect()
    }

    fn remove(&mut self, id: &str) -> Option<ListenerContainer> {
        let container = self.containers.remove(id)?;
        self.order.retain(|existing| existing != id);
        if let Some(group) = container.group_name() {
            if let Some(members) = self.groups.get_mut(group) {
                members.retain(|existing| existing != id);
                if members.is_empty() {
                    self.groups.remove(group);
                }
            }
        }
        Some(container)
    }
}

/// Reports container failures. The registry never restarts a failed container.
struct FailureLog;

impl FailureListener for FailureLog {
    fn container_failed(&self, id: &str, failure: &ContainerFailure) {
        match failure.error.failed_record() {
            Some((topic, partition, offset)) => error!(
                "Listener container '{id}' failed on {topic}-{partition}@{offset}: {}",
                failure.error
            ),
            None => error!("Listener container '{id}' failed: {}", failure.error),
        }
    }
}

pub struct EndpointRegistry {
    default_factory: Arc<ContainerFactory>,
    factories: HashMap<String, Arc<ContainerFactory>>,
    table: RwLock<Table>,
    mutations: tokio::sync::Mutex<()>,
    running: AtomicBool,
    closed: AtomicBool,
    failure_listener: Arc<dyn FailureListener>,
}

impl EndpointRegistry {
    pub fn new(default_factory: ContainerFactory) -> Self {
        Self {
            default_factory: Arc::new(default_factory),
            factories: HashMap::new(),
            table: RwLock::new(Table::default()),
            mutations: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            failure_listener: Arc::new(FailureLog),
        }
    }

    /// Register a named factory, selected by descriptors through
    /// `container_factory`.
    pub fn with_factory(mut self, name: impl Into<String>, factory: ContainerFactory) -> Self {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with_failure_listener(mut self, listener: Arc<dyn FailureListener>) -> Self {
        self.failure_listener = listener;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    fn factory_for(&self, descriptor: &EndpointDescriptor) -> Result<&ContainerFactory> {
        match descriptor.container_factory() {
            None => Ok(self.default_factory.as_ref()),
            Some(name) => self.factories.get(name).map(Arc::as_ref).ok_or_else(|| {
                ConfigurationError::new(
                    descriptor.id(),
                    format!("unknown container factory '{name}'"),
                )
                .into()
            }),
        }
    }

    /// Whether `start_all` ran and the registry was not stopped since.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Build and register the container for `descriptor`.
    ///
    /// A live container with the same id is a `DuplicateId` error; a stopped
    /// one is replaced. The new container starts right away when the
    /// registry is running and the endpoint auto-starts.
    pub async fn register(
        &self,
        descriptor: EndpointDescriptor,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<ListenerContainer> {
        let _guard = self.mutations.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(ListenerError::RegistryClosed);
        }

        let id = descriptor.id().to_string();
        let existing = self.read().containers.get(&id).map(ListenerContainer::state);
        if existing.is_some_and(|state| state != ContainerState::Stopped) {
            return Err(ListenerError::DuplicateId(id));
        }

        let container = self
            .factory_for(&descriptor)?
            .create_container(descriptor, handler)?;
        container.set_failure_listener(Arc::clone(&self.failure_listener));

        {
            let mut table = self.write();
            if table.remove(&id).is_some() {
                info!("Replacing stopped listener container '{id}'");
            }
            table.order.push(id.clone());
            table.containers.insert(id.clone(), container.clone());
            if let Some(group) = container.group_name() {
                table
                    .groups
                    .entry(group.to_string())
                    .or_default()
                    .push(id.clone());
            }
        }
        info!(
            "Registered listener container '{}' for {}",
            id,
            container.descriptor().selection()
        );

        if self.is_running() && container.auto_startup() {
            container.start().await?;
        }
        Ok(container)
    }

    /// Remove a stopped or never started container.
    pub async fn unregister(&self, id: &str) -> Result<ListenerContainer> {
        let _guard = self.mutations.lock().await;
        let mut table = self.write();
        let container = table
            .containers
            .get(id)
            .ok_or_else(|| ListenerError::UnknownContainer(id.to_string()))?;
        let state = container.state();
        if !matches!(state, ContainerState::Stopped | ContainerState::Created) {
            return Err(ListenerError::IllegalState {
                id: id.to_string(),
                state,
                operation: "unregister",
            });
        }
        let container = table
            .remove(id)
            .ok_or_else(|| ListenerError::UnknownContainer(id.to_string()))?;
        info!("Unregistered listener container '{id}'");
        Ok(container)
    }

    pub fn get_container(&self, id: &str) -> Option<ListenerContainer> {
        self.read().containers.get(id).cloned()
    }

    /// Registered ids in registration order.
    pub fn container_ids(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn containers(&self) -> Vec<ListenerContainer> {
        let table = self.read();
        table.members(&table.order)
    }

    pub fn group(&self, name: &str) -> Option<ContainerGroup<'_>> {
        let table = self.read();
        table.groups.contains_key(name).then(|| ContainerGroup {
            registry: self,
            name: name.to_string(),
        })
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().groups.keys().cloned().collect();
        names.sort();
        names
    }

    fn group_members(&self, name: &str) -> Vec<ListenerContainer> {
        let table = self.read();
        table
            .groups
            .get(name)
            .map(|ids| table.members(ids))
            .unwrap_or_default()
    }

    fn require(&self, id: &str) -> Result<ListenerContainer> {
        self.get_container(id)
            .ok_or_else(|| ListenerError::UnknownContainer(id.to_string()))
    }

    /// Start every auto-startup container in registration order and mark the
    /// registry running.
    ///
    /// Every container is attempted; the first failure is returned.
    pub async fn start_all(&self) -> Result<()> {
        let _guard = self.mutations.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(ListenerError::RegistryClosed);
        }
        self.running.store(true, Ordering::Release);

        let containers = self.containers();
        info!("Starting {} listener containers", containers.len());
        let mut first_error = None;
        for container in containers {
            if !container.auto_startup() {
                info!(
                    "Listener container '{}' does not auto-start; leaving it {}",
                    container.id(),
                    container.state()
                );
                continue;
            }
            if let Err(e) = container.start().await {
                error!("Failed to start listener container '{}': {e}", container.id());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop every container in registration order.
    pub async fn stop_all(&self, timeout: Duration) -> Vec<(String, StopReport)> {
        let _guard = self.mutations.lock().await;
        self.running.store(false, Ordering::Release);
        stop_each(self.containers(), timeout).await
    }

    /// Stop everything and refuse further registrations.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<(String, StopReport)> {
        let reports = {
            let _guard = self.mutations.lock().await;
            self.closed.store(true, Ordering::Release);
            self.running.store(false, Ordering::Release);
            stop_each(self.containers(), timeout).await
        };
        let abandoned: usize = reports.iter().map(|(_, r)| r.abandoned).sum();
        if abandoned > 0 {
            warn!("Registry shut down with {abandoned} abandoned sub-units");
        } else {
            info!("Registry shut down");
        }
        reports
    }

    /// Start one container. Refused once the registry is shut down.
    pub async fn start_container(&self, id: &str) -> Result<()> {
        let _guard = self.mutations.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(ListenerError::RegistryClosed);
        }
        self.require(id)?.start().await
    }

    pub async fn stop_container(&self, id: &str, timeout: Duration) -> Result<StopReport> {
        let _guard = self.mutations.lock().await;
        self.require(id)?.stop(timeout).await
    }

    pub async fn pause_container(&self, id: &str) -> Result<()> {
        let _guard = self.mutations.lock().await;
        self.require(id)?.pause().await
    }

    pub async fn resume_container(&self, id: &str) -> Result<()> {
        let _guard = self.mutations.lock().await;
        self.require(id)?.resume().await
    }

    pub fn status(&self, id: &str) -> Result<ContainerStatus> {
        Ok(self.require(id)?.status())
    }

    /// Status of every container, in registration order.
    pub fn statuses(&self) -> Vec<ContainerStatus> {
        self.containers().iter().map(ListenerContainer::status).collect()
    }
}

async fn stop_each(
    containers: Vec<ListenerContainer>,
    timeout: Duration,
) -> Vec<(String, StopReport)> {
    let mut reports = Vec::with_capacity(containers.len());
    for container in containers {
        match container.stop(timeout).await {
            Ok(report) => reports.push((container.id().to_string(), report)),
            Err(e) => warn!("Failed to stop listener container '{}': {e}", container.id()),
        }
    }
    reports
}

/// Non-owning view of the containers sharing a group name.
///
/// Membership is read at call time, so containers unregistered meanwhile are
/// no longer affected.
pub struct ContainerGroup<'a> {
    registry: &'a EndpointRegistry,
    name: String,
}

impl ContainerGroup<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn containers(&self) -> Vec<ListenerContainer> {
        self.registry.group_members(&self.name)
    }

    pub fn ids(&self) -> Vec<String> {
        self.containers()
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    /// Start every member regardless of its auto-startup flag.
    pub async fn start_all(&self) -> Result<()> {
        let _guard = self.registry.mutations.lock().await;
        let mut first_error = None;
        for container in self.containers() {
            if let Err(e) = container.start().await {
                error!(
                    "Failed to start listener container '{}' of group '{}': {e}",
                    container.id(),
                    self.name
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn stop_all(&self, timeout: Duration) -> Vec<(String, StopReport)> {
        let _guard = self.registry.mutations.lock().await;
        info!("Stopping listener container group '{}'", self.name);
        stop_each(self.containers(), timeout).await
    }
}
