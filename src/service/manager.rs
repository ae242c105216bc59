//! Startup and shutdown ordering for engine services.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::{Service, ServiceContext, ServiceError, ServiceResult, ServiceStatus};

/// Owns the engine's services and drives their lifecycle.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use testagency::config::Config;
/// use testagency::service::{ServiceManager, SettingsService};
///
/// # async fn example() -> anyhow::Result<()> {
/// let mut manager = ServiceManager::new();
/// manager.add_service(Arc::new(SettingsService::new(Config::default())));
/// manager.start_services().await?;
///
/// let settings = manager.get_service::<SettingsService>().unwrap();
/// println!("Hosting runtime: {}", settings.config().runtime.current);
///
/// manager.stop_services().await;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ServiceManager {
    context: ServiceContext,
    started: bool,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared with every service.
    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    pub fn add_service(&mut self, service: Arc<dyn Service>) {
        debug!("Adding service {}", service.name());
        self.context.add(service);
    }

    pub fn get_service<T: Service>(&self) -> Option<Arc<T>> {
        self.context.get_service::<T>()
    }

    pub fn services_started(&self) -> bool {
        self.started
    }

    /// Starts every service in registration order.
    ///
    /// # Errors
    ///
    /// Stops at the first service that fails to start, or that is left in
    /// the [`ServiceStatus::Error`] state, and returns
    /// [`ServiceError::StartFailed`]. Services after it are not started.
    pub async fn start_services(&mut self) -> ServiceResult<()> {
        for service in self.context.services() {
            let name = service.name();
            info!("Initializing {}", name);

            if let Err(e) = service.start_service(&self.context).await {
                error!("Failed to initialize {}: {}", name, e);
                return Err(ServiceError::StartFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }

            if service.status() == ServiceStatus::Error {
                error!("Failed to initialize {}", name);
                return Err(ServiceError::StartFailed {
                    name: name.to_string(),
                    reason: "service reported an error status".to_string(),
                });
            }
        }

        self.started = true;
        Ok(())
    }

    /// Stops every service in reverse registration order.
    ///
    /// Failures are logged and never propagated, so one broken service
    /// cannot keep the others running.
    pub async fn stop_services(&mut self) {
        for service in self.context.services().into_iter().rev() {
            let name = service.name();
            info!("Stopping {}", name);

            if let Err(e) = service.stop_service().await {
                error!("Failure stopping service {}: {}", name, e);
            }
        }

        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::service::StatusCell;

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Normal,
        FailStart,
        ErrorStatus,
        FailStop,
    }

    struct Recorder {
        name: &'static str,
        behavior: Behavior,
        status: StatusCell,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &'static str, behavior: Behavior, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                status: StatusCell::new(),
                log: Arc::clone(log),
            })
        }
    }

    #[async_trait]
    impl Service for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn status(&self) -> ServiceStatus {
            self.status.get()
        }

        async fn start_service(&self, _context: &ServiceContext) -> ServiceResult<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            match self.behavior {
                Behavior::FailStart => Err(ServiceError::Other(anyhow::anyhow!("boom"))),
                Behavior::ErrorStatus => {
                    self.status.set(ServiceStatus::Error);
                    Ok(())
                }
                _ => {
                    self.status.set(ServiceStatus::Started);
                    Ok(())
                }
            }
        }

        async fn stop_service(&self) -> ServiceResult<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            self.status.set(ServiceStatus::Stopped);
            if self.behavior == Behavior::FailStop {
                return Err(ServiceError::StopFailed {
                    name: self.name.to_string(),
                    reason: "stuck".to_string(),
                });
            }
            Ok(())
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn test_start_in_order_stop_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ServiceManager::new();
        manager.add_service(Recorder::new("a", Behavior::Normal, &log));
        manager.add_service(Recorder::new("b", Behavior::FailStop, &log));
        manager.add_service(Recorder::new("c", Behavior::Normal, &log));

        manager.start_services().await.unwrap();
        assert!(manager.services_started());

        manager.stop_services().await;
        assert!(!manager.services_started());

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["start a", "start b", "start c", "stop c", "stop b", "stop a"]
        );
    }

    #[tokio::test]
    async fn test_start_failure_aborts_sequence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ServiceManager::new();
        manager.add_service(Recorder::new("a", Behavior::Normal, &log));
        manager.add_service(Recorder::new("b", Behavior::FailStart, &log));
        manager.add_service(Recorder::new("c", Behavior::Normal, &log));

        let err = manager.start_services().await.unwrap_err();
        assert!(matches!(err, ServiceError::StartFailed { ref name, .. } if name == "b"));
        assert!(!manager.services_started());
        assert_eq!(log.lock().unwrap().clone(), vec!["start a", "start b"]);
    }

    #[tokio::test]
    async fn test_error_status_aborts_sequence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ServiceManager::new();
        manager.add_service(Recorder::new("a", Behavior::ErrorStatus, &log));
        manager.add_service(Recorder::new("b", Behavior::Normal, &log));

        assert!(manager.start_services().await.is_err());
        assert_eq!(log.lock().unwrap().clone(), vec!["start a"]);
    }
}
