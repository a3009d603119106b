//! Service container collaborator and stability monitoring.
//!
//! The controller does not manage service lifecycles itself. It installs and
//! removes services through [`ServiceContainer`], waits for the container to
//! settle before VERIFY, and diffs the container's failed and missing
//! dependency sets against the previous baseline through
//! [`ContainerStateMonitor`].

use crate::cancel::CancelToken;
use crate::ControllerError;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use trellis_model::ServiceName;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Up,
    /// Installed but waiting for dependencies.
    Down,
    Failed,
}

/// Failed services and services with unsatisfied dependencies, taken once
/// the container is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StabilitySnapshot {
    pub failed: BTreeSet<ServiceName>,
    /// Service -> dependencies that are not up.
    pub problems: BTreeMap<ServiceName, BTreeSet<ServiceName>>,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum StabilityError {
    #[error("service container did not stabilize within {0:?}")]
    Timeout(Duration),
    #[error("interrupted while waiting for service container stability")]
    Interrupted,
}

pub trait ServiceContainer: Send + Sync {
    fn install(&self, name: ServiceName, dependencies: Vec<ServiceName>) -> Result<(), ControllerError>;

    /// Remove a service; `false` if it was not installed.
    fn remove(&self, name: &ServiceName) -> bool;

    fn state(&self, name: &ServiceName) -> Option<ServiceState>;

    fn service_names(&self) -> Vec<ServiceName>;

    /// Block until no service transitions are in flight.
    fn await_stability(&self, timeout: Duration, cancel: &CancelToken) -> Result<(), StabilityError>;

    fn snapshot(&self) -> StabilitySnapshot;
}

#[derive(Debug)]
struct ServiceEntry {
    dependencies: Vec<ServiceName>,
    state: ServiceState,
}

#[derive(Debug, Default)]
struct ServiceTable {
    services: IndexMap<ServiceName, ServiceEntry>,
    fail_on_start: BTreeSet<ServiceName>,
    in_flight: usize,
}

impl ServiceTable {
    /// Recompute every state until nothing changes: a service is up when
    /// none of its dependencies is missing, down or failed.
    fn settle(&mut self) {
        loop {
            let next: Vec<ServiceState> = self
                .services
                .iter()
                .map(|(name, entry)| {
                    if self.fail_on_start.contains(name) {
                        ServiceState::Failed
                    } else if entry.dependencies.iter().all(|d| {
                        self.services
                            .get(d)
                            .is_some_and(|dep| dep.state == ServiceState::Up)
                    }) {
                        ServiceState::Up
                    } else {
                        ServiceState::Down
                    }
                })
                .collect();
            let mut changed = false;
            for (entry, state) in self.services.values_mut().zip(next) {
                if entry.state != state {
                    entry.state = state;
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }

    fn snapshot(&self) -> StabilitySnapshot {
        let mut snapshot = StabilitySnapshot::default();
        for (name, entry) in &self.services {
            match entry.state {
                ServiceState::Up => {}
                ServiceState::Failed => {
                    snapshot.failed.insert(name.clone());
                }
                ServiceState::Down => {
                    let missing = entry
                        .dependencies
                        .iter()
                        .filter(|d| {
                            self.services
                                .get(*d)
                                .map_or(true, |dep| dep.state != ServiceState::Up)
                        })
                        .cloned()
                        .collect();
                    snapshot.problems.insert(name.clone(), missing);
                }
            }
        }
        snapshot
    }
}

/// In-memory [`ServiceContainer`]. Services start synchronously; failures and
/// slow transitions can be injected.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    table: Mutex<ServiceTable>,
    settled: Condvar,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `name` fail whenever it is (re)started.
    pub fn fail_on_start(&self, name: ServiceName) {
        let mut table = self.table.lock();
        table.fail_on_start.insert(name);
        table.settle();
    }

    pub fn clear_failure(&self, name: &ServiceName) {
        let mut table = self.table.lock();
        table.fail_on_start.remove(name);
        table.settle();
    }

    /// Hold the container unstable until the matching [`Self::end_transition`].
    pub fn begin_transition(&self) {
        self.table.lock().in_flight += 1;
    }

    pub fn end_transition(&self) {
        let mut table = self.table.lock();
        table.in_flight = table.in_flight.saturating_sub(1);
        if table.in_flight == 0 {
            self.settled.notify_all();
        }
    }
}

impl ServiceContainer for ServiceRegistry {
    fn install(&self, name: ServiceName, dependencies: Vec<ServiceName>) -> Result<(), ControllerError> {
        let mut table = self.table.lock();
        if table.services.contains_key(&name) {
            return Err(ControllerError::failed(format!(
                "service {name} is already installed"
            )));
        }
        debug!("installing service {name}");
        table.services.insert(
            name,
            ServiceEntry {
                dependencies,
                state: ServiceState::Down,
            },
        );
        table.settle();
        Ok(())
    }

    fn remove(&self, name: &ServiceName) -> bool {
        let mut table = self.table.lock();
        let removed = table.services.shift_remove(name).is_some();
        if removed {
            debug!("removed service {name}");
            table.settle();
        }
        removed
    }

    fn state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.table.lock().services.get(name).map(|e| e.state)
    }

    fn service_names(&self) -> Vec<ServiceName> {
        self.table.lock().services.keys().cloned().collect()
    }

    fn await_stability(&self, timeout: Duration, cancel: &CancelToken) -> Result<(), StabilityError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        while table.in_flight > 0 {
            if cancel.is_cancelled() {
                return Err(StabilityError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StabilityError::Timeout(timeout));
            }
            self.settled
                .wait_for(&mut table, (deadline - now).min(POLL_INTERVAL));
        }
        Ok(())
    }

    fn snapshot(&self) -> StabilitySnapshot {
        self.table.lock().snapshot()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDependency {
    /// Installed but not up, as opposed to not installed at all.
    pub unavailable: bool,
    pub dependents: BTreeSet<ServiceName>,
}

/// Changes in the container's problem state since the last reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerStateChangeReport {
    pub missing_dependencies: BTreeMap<ServiceName, MissingDependency>,
    pub no_longer_missing: BTreeSet<ServiceName>,
    pub failed: BTreeSet<ServiceName>,
    pub newly_failed: BTreeSet<ServiceName>,
}

impl ContainerStateChangeReport {
    /// Whether the change introduced failures or missing dependencies.
    pub fn has_new_problems(&self) -> bool {
        !self.missing_dependencies.is_empty() || !self.newly_failed.is_empty()
    }
}

impl fmt::Display for ContainerStateChangeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.newly_failed.is_empty() {
            let names: Vec<&str> = self.newly_failed.iter().map(ServiceName::as_str).collect();
            parts.push(format!("services failed to start: {}", names.join(", ")));
        }
        for (name, missing) in &self.missing_dependencies {
            let dependents: Vec<&str> = missing.dependents.iter().map(ServiceName::as_str).collect();
            let kind = if missing.unavailable {
                "unavailable"
            } else {
                "missing"
            };
            parts.push(format!(
                "{name} is {kind}; required by {}",
                dependents.join(", ")
            ));
        }
        if !self.no_longer_missing.is_empty() {
            let names: Vec<&str> = self.no_longer_missing.iter().map(ServiceName::as_str).collect();
            parts.push(format!("no longer missing: {}", names.join(", ")));
        }
        f.write_str(&parts.join("; "))
    }
}

#[derive(Debug, Default)]
struct Baseline {
    missing: BTreeSet<ServiceName>,
    failed: BTreeSet<ServiceName>,
}

pub struct ContainerStateMonitor {
    container: Arc<dyn ServiceContainer>,
    baseline: Mutex<Baseline>,
}

impl fmt::Debug for ContainerStateMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerStateMonitor")
            .field("baseline", &self.baseline)
            .finish_non_exhaustive()
    }
}

impl ContainerStateMonitor {
    pub fn new(container: Arc<dyn ServiceContainer>) -> Self {
        Self {
            container,
            baseline: Mutex::new(Baseline::default()),
        }
    }

    pub fn container(&self) -> &Arc<dyn ServiceContainer> {
        &self.container
    }

    /// Wait for the container to settle. Timeouts and cancellation are
    /// reported as different errors.
    pub fn await_stability(&self, timeout: Duration, cancel: &CancelToken) -> Result<(), ControllerError> {
        match self.container.await_stability(timeout, cancel) {
            Ok(()) => Ok(()),
            Err(StabilityError::Interrupted) => Err(ControllerError::Cancelled),
            Err(e @ StabilityError::Timeout(_)) => {
                warn!("{e}");
                Err(ControllerError::Timeout(e.to_string()))
            }
        }
    }

    /// Make the container's current problems the baseline for the next
    /// report.
    pub fn reset_baseline(&self) {
        let snapshot = self.container.snapshot();
        let mut baseline = self.baseline.lock();
        baseline.missing = snapshot.problems.into_values().flatten().collect();
        baseline.failed = snapshot.failed;
    }

    /// Diff the container's current problems against the baseline. Returns
    /// `None` when nothing changed. With `reset_history` the current state
    /// becomes the new baseline.
    pub fn create_container_state_change_report(
        &self,
        reset_history: bool,
    ) -> Option<ContainerStateChangeReport> {
        let snapshot = self.container.snapshot();
        let mut missing_now: BTreeMap<ServiceName, MissingDependency> = BTreeMap::new();
        for (dependent, missing) in &snapshot.problems {
            for name in missing {
                missing_now
                    .entry(name.clone())
                    .or_insert_with(|| MissingDependency {
                        unavailable: self.container.state(name).is_some(),
                        dependents: BTreeSet::new(),
                    })
                    .dependents
                    .insert(dependent.clone());
            }
        }

        let mut baseline = self.baseline.lock();
        let no_longer_missing: BTreeSet<ServiceName> = baseline
            .missing
            .iter()
            .filter(|name| !missing_now.contains_key(*name))
            .cloned()
            .collect();
        let newly_failed: BTreeSet<ServiceName> =
            snapshot.failed.difference(&baseline.failed).cloned().collect();
        let current_missing: BTreeSet<ServiceName> = missing_now.keys().cloned().collect();
        let missing_dependencies: BTreeMap<ServiceName, MissingDependency> = missing_now
            .into_iter()
            .filter(|(name, _)| !baseline.missing.contains(name))
            .collect();

        if reset_history {
            baseline.missing = current_missing;
            baseline.failed = snapshot.failed.clone();
        }

        if missing_dependencies.is_empty() && no_longer_missing.is_empty() && newly_failed.is_empty() {
            return None;
        }
        Some(ContainerStateChangeReport {
            missing_dependencies,
            no_longer_missing,
            failed: snapshot.failed,
            newly_failed,
        })
    }
}
