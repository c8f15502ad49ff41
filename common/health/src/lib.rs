use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Liveness reporting for the long-running loops of a consumer.
///
/// Every partition pool runs its own dispatch loop, and the process can only
/// be trusted to make progress on its partitions if all of those loops are
/// alive. Each loop registers as a component with a reporting deadline:
///   - the process is unhealthy as soon as one component is unhealthy,
///   - a component that does not report again before its deadline is `Stalled`,
///   - a registry with no components is unhealthy.
///
/// Components can be removed again, which is what happens to a partition pool
/// when a rebalance revokes its partition.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if every registered component is healthy.
    pub healthy: bool,
    /// Per-component status, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first report.
    Starting,
    /// Reported healthy, must report again before the given instant.
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// The HealthyUntil deadline went by without a new report.
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

/// Handed to a component so it can report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy until `now + deadline`.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                _ = map.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = self.component.as_str(), "poisoned health registry lock"),
        }
    }

    /// Remove this component from its registry.
    pub fn deregister(self) {
        match self.components.write() {
            Ok(mut map) => {
                _ = map.remove(&self.component);
            }
            Err(_) => warn!(component = self.component.as_str(), "poisoned health registry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a new component, which starts in the `Starting` status.
    /// Registering a name twice resets the existing component.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Compute the process status from every registered component.
    /// Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("{} health registry lock is poisoned", self.name);
                return HealthStatus::default();
            }
        };

        let now = OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let observed = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(observed, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            _ = status.components.insert(name.clone(), observed);
        }

        match status.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, status.components),
        }
        status
    }
}
