//! Engine configuration exposed as a service.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Service, ServiceContext, ServiceResult, ServiceStatus, StatusCell};
use crate::config::Config;

/// Holds the loaded engine [`Config`] for other services to read.
pub struct SettingsService {
    config: Config,
    status: StatusCell,
}

impl SettingsService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            status: StatusCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl Service for SettingsService {
    fn name(&self) -> &'static str {
        "SettingsService"
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
