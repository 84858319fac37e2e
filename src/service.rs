//! Managed-service lifecycle.
//!
//! Each service holds its state in an atomic cell and declares the services
//! it depends on by name. The supervisor refuses to start a service whose
//! dependencies are not running, emits an event on every transition, and a
//! separate observer task cascades failures to dependents so that the fault
//! path never re-enters a service mid-startup.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Result, VaultError};

/// Lifecycle state of a managed service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Failed = 4,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            4 => ServiceState::Failed,
            _ => ServiceState::Stopped,
        }
    }
}

/// Emitted on every service state transition.
#[derive(Clone, Debug)]
pub struct ServiceStateChanged {
    pub service: &'static str,
    pub state: ServiceState,
}

/// A service with a supervised lifecycle.
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Unique name of the service.
    fn name(&self) -> &'static str;

    /// Names of services that must be running before this one starts.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Brings the service up. Called in state `STARTING`.
    async fn do_start(&self) -> anyhow::Result<()>;

    /// Takes the service down. Called in state `STOPPING`.
    async fn do_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Registered {
    service: Arc<dyn ManagedService>,
    state: AtomicU8,
}

impl Registered {
    fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Registry and state machine driver for a set of managed services.
pub struct Supervisor {
    services: Vec<Arc<Registered>>,
    events: broadcast::Sender<ServiceStateChanged>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Supervisor {
            services: Vec::new(),
            events,
        }
    }

    /// Registers a service. Start order follows registration order.
    pub fn register(&mut self, service: Arc<dyn ManagedService>) {
        self.services.push(Arc::new(Registered {
            service,
            state: AtomicU8::new(ServiceState::Stopped as u8),
        }));
    }

    /// Returns a service's current state.
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.find(name).map(|reg| reg.state())
    }

    /// Subscribes to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceStateChanged> {
        self.events.subscribe()
    }

    fn find(&self, name: &str) -> Option<&Arc<Registered>> {
        self.services.iter().find(|reg| reg.service.name() == name)
    }

    fn emit(&self, service: &'static str, state: ServiceState) {
        let _ = self.events.send(ServiceStateChanged { service, state });
    }

    /// Starts one service.
    ///
    /// Returns `Err` if the service is unknown, a dependency is not running,
    /// or `do_start` failed (leaving the service `FAILED`).
    pub async fn start(&self, name: &str) -> Result<()> {
        let reg = self.find(name).ok_or_else(|| unknown_service(name))?;
        let service_name = reg.service.name();

        match reg.state() {
            ServiceState::Running | ServiceState::Starting => return Ok(()),
            _ => {}
        }

        for dep in reg.service.dependencies() {
            let dep_state = self.state(dep);
            if dep_state != Some(ServiceState::Running) {
                return Err(VaultError::ServiceDependencyUnavailable {
                    service: service_name.to_owned(),
                    dependency: (*dep).to_owned(),
                });
            }
        }

        reg.set_state(ServiceState::Starting);
        self.emit(service_name, ServiceState::Starting);

        match reg.service.do_start().await {
            Ok(()) => {
                reg.set_state(ServiceState::Running);
                self.emit(service_name, ServiceState::Running);
                info!(service = service_name, "service started");
                Ok(())
            }
            Err(cause) => {
                reg.set_state(ServiceState::Failed);
                self.emit(service_name, ServiceState::Failed);
                error!(service = service_name, error = %cause, "service failed to start");
                Err(VaultError::TaskExecutionFailed {
                    retryable: false,
                    cause,
                })
            }
        }
    }

    /// Stops one service.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let reg = self.find(name).ok_or_else(|| unknown_service(name))?;
        let service_name = reg.service.name();

        if reg.state() != ServiceState::Running {
            return Ok(());
        }

        reg.set_state(ServiceState::Stopping);
        self.emit(service_name, ServiceState::Stopping);

        match reg.service.do_stop().await {
            Ok(()) => {
                reg.set_state(ServiceState::Stopped);
                self.emit(service_name, ServiceState::Stopped);
                info!(service = service_name, "service stopped");
                Ok(())
            }
            Err(cause) => {
                reg.set_state(ServiceState::Failed);
                self.emit(service_name, ServiceState::Failed);
                Err(VaultError::TaskExecutionFailed {
                    retryable: false,
                    cause,
                })
            }
        }
    }

    /// Starts every registered service in registration order.
    ///
    /// Registration order must respect dependencies; the per-service check
    /// turns a violation into an error rather than a hang.
    pub async fn start_all(&self) -> Result<()> {
        for reg in &self.services {
            self.start(reg.service.name()).await?;
        }
        Ok(())
    }

    /// Stops every running service in reverse registration order.
    pub async fn stop_all(&self) {
        for reg in self.services.iter().rev() {
            if let Err(e) = self.stop(reg.service.name()).await {
                warn!(service = reg.service.name(), error = %e, "stop failed");
            }
        }
    }

    /// Marks every (transitive) dependent of `failed` as failed.
    ///
    /// Used by the cascade observer; each service fails at most once, so the
    /// walk terminates even with dependency diamonds.
    pub fn fail_dependents(&self, failed: &str) {
        let mut queue = vec![failed.to_owned()];
        while let Some(name) = queue.pop() {
            for reg in &self.services {
                if !reg.service.dependencies().contains(&name.as_str()) {
                    continue;
                }
                let state = reg.state();
                if state == ServiceState::Running || state == ServiceState::Starting {
                    reg.set_state(ServiceState::Failed);
                    self.emit(reg.service.name(), ServiceState::Failed);
                    warn!(
                        service = reg.service.name(),
                        after = %name,
                        "service failed by dependency cascade"
                    );
                    queue.push(reg.service.name().to_owned());
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the failure-cascade observer for a supervisor.
///
/// Kept separate from `start()`/`stop()` so a failure during startup never
/// re-enters the supervisor from inside a transition.
pub fn spawn_cascade_observer(supervisor: Arc<Supervisor>) -> JoinHandle<()> {
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.state == ServiceState::Failed {
                supervisor.fail_dependents(event.service);
            }
        }
    })
}

fn unknown_service(name: &str) -> VaultError {
    VaultError::ServiceDependencyUnavailable {
        service: name.to_owned(),
        dependency: "unregistered".to_owned(),
    }
}
