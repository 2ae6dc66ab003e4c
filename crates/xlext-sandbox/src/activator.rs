use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use xlext_surfaces::SurfaceManager;

use crate::{
    activation::{ActivationOptions, ActiveExtension, ExtensionActivator},
    context::{SandboxContextLauncher, SandboxMessageBus},
    host::{SandboxHostOptions, SandboxHostTimeouts, SandboxRuntimeHost},
};

/// Activates extensions inside isolated contexts created by `launcher`.
pub struct SandboxExtensionActivator {
    launcher: Arc<dyn SandboxContextLauncher>,
    surfaces: Arc<SurfaceManager>,
    bus: SandboxMessageBus,
    timeouts: SandboxHostTimeouts,
}

impl SandboxExtensionActivator {
    pub fn new(
        launcher: Arc<dyn SandboxContextLauncher>,
        surfaces: Arc<SurfaceManager>,
        bus: SandboxMessageBus,
        timeouts: SandboxHostTimeouts,
    ) -> Self {
        Self {
            launcher,
            surfaces,
            bus,
            timeouts,
        }
    }

    pub fn bus(&self) -> &SandboxMessageBus {
        &self.bus
    }
}

#[async_trait]
impl ExtensionActivator for SandboxExtensionActivator {
    async fn activate(&self, options: ActivationOptions) -> Result<Box<dyn ActiveExtension>> {
        let host = SandboxRuntimeHost::activate(SandboxHostOptions {
            activation: options,
            surfaces: Arc::clone(&self.surfaces),
            launcher: Arc::clone(&self.launcher),
            bus: self.bus.clone(),
            timeouts: self.timeouts,
        })
        .await?;
        Ok(Box::new(host))
    }
}
