//! Long-lived engine services and the registry that holds them.
//!
//! Services are started once, in registration order, and stopped in
//! reverse order. A service looks up the services it depends on through the
//! [`ServiceContext`] while it starts, so anything it needs must have been
//! registered (and started) before it.
//!
//! ```text
//! ServiceManager
//!   └── ServiceContext (shared, cloneable)
//!         ├── SettingsService
//!         ├── ProjectService
//!         ├── RuntimeFrameworkService ── needs nothing
//!         ├── DriverService
//!         ├── DomainManager
//!         ├── TestAgency ─────────────── needs RuntimeFrameworkService
//!         └── DefaultTestRunnerFactory ─ built over the services above,
//!                                        checks they are running
//! ```

pub mod manager;
pub mod project;
pub mod settings;

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::error;

pub use manager::ServiceManager;
pub use project::{ProjectError, ProjectService};
pub use settings::SettingsService;

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Started,
    Error,
}

/// Atomic holder for a [`ServiceStatus`].
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ServiceStatus {
        match self.0.load(Ordering::Acquire) {
            1 => ServiceStatus::Started,
            2 => ServiceStatus::Error,
            _ => ServiceStatus::Stopped,
        }
    }

    pub fn set(&self, status: ServiceStatus) {
        let raw = match status {
            ServiceStatus::Stopped => 0,
            ServiceStatus::Started => 1,
            ServiceStatus::Error => 2,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/// Errors raised by services and the service manager.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A service could not start. Engine initialization stops here.
    #[error("Service {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    /// A dependency is missing from the context or is not running.
    #[error("Required service {0} is not available")]
    MissingDependency(&'static str),

    /// A service could not stop cleanly.
    #[error("Service {name} failed to stop: {reason}")]
    StopFailed { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// A named, stateful engine component with a start/stop lifecycle.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn status(&self) -> ServiceStatus;

    /// Starts the service, resolving dependencies from `context`.
    ///
    /// A service that cannot run should either return an error or leave
    /// its status at [`ServiceStatus::Error`]; both abort engine startup.
    async fn start_service(&self, context: &ServiceContext) -> ServiceResult<()>;

    async fn stop_service(&self) -> ServiceResult<()>;

    /// Upcast used for lookups by concrete type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Registry of services shared by everything in one engine.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct ServiceContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    services: RwLock<Vec<Arc<dyn Service>>>,
    cache: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a service to the registry.
    pub fn add(&self, service: Arc<dyn Service>) {
        self.inner
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(service);
    }

    /// Snapshot of the registered services in registration order.
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.inner
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Finds the registered service of type `T`.
    ///
    /// Lookups are cached per type. Returns `None`, and logs an error, when
    /// no such service is registered.
    pub fn get_service<T: Service>(&self) -> Option<Arc<T>> {
        let key = TypeId::of::<T>();

        if let Some(hit) = self
            .inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
        {
            return hit.downcast::<T>().ok();
        }

        for service in self.services() {
            let any = service.into_any();
            if let Ok(found) = Arc::clone(&any).downcast::<T>() {
                self.inner
                    .cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, any);
                return Some(found);
            }
        }

        error!("Requested service {} was not found", type_name::<T>());
        None
    }

    /// Like [`get_service`](Self::get_service), but also requires the
    /// service to be started.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::MissingDependency`] if the service is absent
    /// or not in the `Started` state.
    pub fn require<T: Service>(&self) -> ServiceResult<Arc<T>> {
        match self.get_service::<T>() {
            Some(service) if service.status() == ServiceStatus::Started => Ok(service),
            _ => Err(ServiceError::MissingDependency(type_name::<T>())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker {
        status: StatusCell,
    }

    #[async_trait]
    impl Service for Marker {
        fn name(&self) -> &'static str {
            "Marker"
        }

        fn status(&self) -> ServiceStatus {
            self.status.get()
        }

        async fn start_service(&self, _context: &ServiceContext) -> ServiceResult<()> {
            self.status.set(ServiceStatus::Started);
            Ok(())
        }

        async fn stop_service(&self) -> ServiceResult<()> {
            self.status.set(ServiceStatus::Stopped);
            Ok(())
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn test_status_cell() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), ServiceStatus::Stopped);
        cell.set(ServiceStatus::Error);
        assert_eq!(cell.get(), ServiceStatus::Error);
    }

    #[test]
    fn test_get_service_by_type() {
        let context = ServiceContext::new();
        assert!(context.get_service::<Marker>().is_none());

        let marker = Arc::new(Marker {
            status: StatusCell::new(),
        });
        context.add(marker.clone());

        let found = context.get_service::<Marker>().unwrap();
        assert!(Arc::ptr_eq(&found, &marker));

        // Second lookup is served from the cache.
        let again = context.get_service::<Marker>().unwrap();
        assert!(Arc::ptr_eq(&again, &marker));
    }

    #[test]
    fn test_require_checks_status() {
        let context = ServiceContext::new();
        let marker = Arc::new(Marker {
            status: StatusCell::new(),
        });
        context.add(marker.clone());

        assert!(matches!(
            context.require::<Marker>(),
            Err(ServiceError::MissingDependency(_))
        ));

        marker.status.set(ServiceStatus::Started);
        assert!(context.require::<Marker>().is_ok());
    }
}
