use std::{
    collections::BTreeMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use xlext_permissions::{
    get_default_permissions, high_risk_escalations, Capability, CapabilityGate, PermissionSet,
    TrustLevel,
};
use xlext_sandbox::{ActivationOptions, ActiveExtension, ExtensionActivator, HostServices};

use crate::{
    config::ExtensionRuntimeConfig,
    mode::{resolve_runtime_mode, RuntimeMode},
    provenance::ProvenanceHostServices,
    registry::{ExtensionRegistryDocument, ExtensionRegistryEntry, ExtensionRegistryStore},
};

#[derive(Debug, Error)]
/// Enumerates supported `RuntimeManagerError` values.
pub enum RuntimeManagerError {
    #[error("unknown extension '{id}'")]
    UnknownExtension { id: String },
    #[error("granting {capabilities} to extension \"{name}\" was not confirmed")]
    ConfirmationDeclined { name: String, capabilities: String },
    #[error("extension registry error: {0:#}")]
    Registry(#[source] anyhow::Error),
}

/// Interactive confirmation for high-risk capability grants.
#[async_trait]
pub trait HighRiskGrantConfirmer: Send + Sync {
    async fn confirm_high_risk_grants(
        &self,
        entry: &ExtensionRegistryEntry,
        capabilities: &[Capability],
    ) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Non-interactive confirmer that always gives the same answer.
pub struct StaticGrantConfirmer {
    pub approve: bool,
}

#[async_trait]
impl HighRiskGrantConfirmer for StaticGrantConfirmer {
    async fn confirm_high_risk_grants(
        &self,
        _entry: &ExtensionRegistryEntry,
        _capabilities: &[Capability],
    ) -> bool {
        self.approve
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Public struct `ExtensionRuntimeStatus` used across extension runtimes.
pub struct ExtensionRuntimeStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub trust: TrustLevel,
    pub runtime_mode: RuntimeMode,
    pub loaded: bool,
    pub instance_id: Option<String>,
    pub last_error: Option<String>,
    pub permissions: PermissionSet,
}

impl ExtensionRuntimeStatus {
    fn from_entry(entry: &ExtensionRegistryEntry, runtime_mode: RuntimeMode) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            enabled: entry.enabled,
            trust: entry.trust,
            runtime_mode,
            loaded: false,
            instance_id: None,
            last_error: None,
            permissions: entry.effective_permissions(),
        }
    }

    /// Line shown in extension-management UI.
    pub fn status_line(&self) -> String {
        match (self.enabled, self.loaded, self.last_error.as_deref()) {
            (_, true, _) => "loaded".to_string(),
            (false, false, _) => "disabled".to_string(),
            (true, false, Some(error)) => format!("not loaded: {error}"),
            (true, false, None) => "not loaded".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Outcome of one [`ExtensionRuntimeManager::initialize`] pass.
pub struct InitializeSummary {
    pub discovered: usize,
    pub activated: usize,
    pub failed: usize,
    pub skipped_disabled: usize,
    pub diagnostics: Vec<String>,
}

/// Collaborators for [`ExtensionRuntimeManager::new`].
pub struct ExtensionRuntimeManagerOptions {
    pub config: ExtensionRuntimeConfig,
    pub store: Arc<dyn ExtensionRegistryStore>,
    pub services: Arc<dyn HostServices>,
    pub host_activator: Arc<dyn ExtensionActivator>,
    pub sandbox_activator: Arc<dyn ExtensionActivator>,
    pub confirmer: Arc<dyn HighRiskGrantConfirmer>,
}

struct LoadedExtension {
    instance: Box<dyn ActiveExtension>,
}

#[derive(Default)]
struct ManagerState {
    runtimes: BTreeMap<String, LoadedExtension>,
    statuses: BTreeMap<String, ExtensionRuntimeStatus>,
}

/// Owns every activated extension instance and its registry bookkeeping.
pub struct ExtensionRuntimeManager {
    config: ExtensionRuntimeConfig,
    store: Arc<dyn ExtensionRegistryStore>,
    services: Arc<dyn HostServices>,
    host_activator: Arc<dyn ExtensionActivator>,
    sandbox_activator: Arc<dyn ExtensionActivator>,
    confirmer: Arc<dyn HighRiskGrantConfirmer>,
    state: Mutex<ManagerState>,
    next_instance: AtomicU64,
}

impl ExtensionRuntimeManager {
    pub fn new(options: ExtensionRuntimeManagerOptions) -> Self {
        Self {
            config: options.config,
            store: options.store,
            services: options.services,
            host_activator: options.host_activator,
            sandbox_activator: options.sandbox_activator,
            confirmer: options.confirmer,
            state: Mutex::new(ManagerState::default()),
            next_instance: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ExtensionRuntimeConfig {
        &self.config
    }

    /// Activates every enabled stored extension. One entry failing never stops
    /// the pass; its error is recorded on its status instead.
    pub async fn initialize(&self) -> Result<InitializeSummary, RuntimeManagerError> {
        let document = self.load_document().await?;
        let mut state = self.state.lock().await;
        let mut summary = InitializeSummary {
            discovered: document.items.len(),
            ..InitializeSummary::default()
        };
        let removed = state
            .runtimes
            .keys()
            .filter(|id| document.find(id).is_none())
            .cloned()
            .collect::<Vec<_>>();
        for id in removed {
            self.dispose_runtime(&mut state, &id).await;
        }
        state.statuses.retain(|id, _| document.find(id).is_some());
        for entry in &document.items {
            self.dispose_runtime(&mut state, &entry.id).await;
            if !entry.enabled {
                summary.skipped_disabled += 1;
                state.statuses.insert(
                    entry.id.clone(),
                    ExtensionRuntimeStatus::from_entry(entry, self.runtime_mode_for(entry)),
                );
                continue;
            }
            match self.activate_entry(&mut state, entry).await {
                Ok(()) => summary.activated += 1,
                Err(error) => {
                    summary.failed += 1;
                    summary
                        .diagnostics
                        .push(format!("extension_id={} error={}", entry.id, error));
                }
            }
        }
        info!(
            discovered = summary.discovered,
            activated = summary.activated,
            failed = summary.failed,
            skipped_disabled = summary.skipped_disabled,
            "extension runtime initialized"
        );
        Ok(summary)
    }

    /// Stores `entry` (replacing any extension with the same id) and
    /// activates it when enabled.
    pub async fn install_extension(
        &self,
        entry: ExtensionRegistryEntry,
    ) -> Result<ExtensionRuntimeStatus, RuntimeManagerError> {
        entry.validate().map_err(RuntimeManagerError::Registry)?;
        let escalations = high_risk_escalations(
            entry.trust,
            &get_default_permissions(entry.trust),
            &entry.effective_permissions(),
        );
        self.confirm(&entry, &escalations).await?;

        let mut document = self.load_document().await?;
        let mut entry = entry;
        let now = Utc::now();
        if let Some(existing) = document.find(&entry.id) {
            entry.created_at = existing.created_at;
        }
        entry.updated_at = now;
        document.upsert(entry.clone());
        self.save_document(&document).await?;

        let mut state = self.state.lock().await;
        self.restart_entry(&mut state, &entry).await;
        Ok(self.status_or_default(&state, &entry))
    }

    pub async fn set_extension_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<ExtensionRuntimeStatus, RuntimeManagerError> {
        let mut document = self.load_document().await?;
        let entry = document
            .find_mut(id)
            .ok_or_else(|| RuntimeManagerError::UnknownExtension { id: id.to_string() })?;
        entry.enabled = enabled;
        entry.updated_at = Utc::now();
        let entry = entry.clone();
        self.save_document(&document).await?;

        let mut state = self.state.lock().await;
        self.restart_entry(&mut state, &entry).await;
        Ok(self.status_or_default(&state, &entry))
    }

    /// Disposes the running instance (gracefully) and activates a fresh one.
    pub async fn reload_extension(
        &self,
        id: &str,
    ) -> Result<ExtensionRuntimeStatus, RuntimeManagerError> {
        let document = self.load_document().await?;
        let entry = document
            .find(id)
            .ok_or_else(|| RuntimeManagerError::UnknownExtension { id: id.to_string() })?;
        let mut state = self.state.lock().await;
        self.restart_entry(&mut state, entry).await;
        Ok(self.status_or_default(&state, entry))
    }

    pub async fn uninstall_extension(&self, id: &str) -> Result<(), RuntimeManagerError> {
        let mut document = self.load_document().await?;
        document
            .remove(id)
            .ok_or_else(|| RuntimeManagerError::UnknownExtension { id: id.to_string() })?;
        self.save_document(&document).await?;
        let mut state = self.state.lock().await;
        self.dispose_runtime(&mut state, id).await;
        state.statuses.remove(id);
        info!(extension_id = id, "extension uninstalled");
        Ok(())
    }

    /// Persists one capability override and restarts the extension so the new
    /// grant takes effect. High-risk escalations need confirmation first.
    pub async fn set_extension_capability(
        &self,
        id: &str,
        capability: Capability,
        allowed: bool,
    ) -> Result<ExtensionRuntimeStatus, RuntimeManagerError> {
        let mut document = self.load_document().await?;
        let current = document
            .find(id)
            .cloned()
            .ok_or_else(|| RuntimeManagerError::UnknownExtension { id: id.to_string() })?;
        let baseline = current.effective_permissions();
        let candidate = baseline.with(capability, allowed);
        let escalations = high_risk_escalations(current.trust, &baseline, &candidate);
        self.confirm(&current, &escalations).await?;

        let entry = document
            .find_mut(id)
            .ok_or_else(|| RuntimeManagerError::UnknownExtension { id: id.to_string() })?;
        entry
            .permissions
            .insert(capability.as_str().to_string(), allowed);
        entry.updated_at = Utc::now();
        let entry = entry.clone();
        self.save_document(&document).await?;

        let mut state = self.state.lock().await;
        self.restart_entry(&mut state, &entry).await;
        Ok(self.status_or_default(&state, &entry))
    }

    /// Gracefully disposes every running instance.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let ids = state.runtimes.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            self.dispose_runtime(&mut state, &id).await;
        }
    }

    pub async fn extension_statuses(&self) -> Vec<ExtensionRuntimeStatus> {
        self.state.lock().await.statuses.values().cloned().collect()
    }

    pub async fn extension_status(&self, id: &str) -> Option<ExtensionRuntimeStatus> {
        self.state.lock().await.statuses.get(id).cloned()
    }

    pub async fn loaded_instance_id(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .runtimes
            .get(id)
            .map(|loaded| loaded.instance.instance_id().to_string())
    }

    fn runtime_mode_for(&self, entry: &ExtensionRegistryEntry) -> RuntimeMode {
        resolve_runtime_mode(entry.trust, self.config.sandbox_kill_switch)
    }

    async fn confirm(
        &self,
        entry: &ExtensionRegistryEntry,
        escalations: &[Capability],
    ) -> Result<(), RuntimeManagerError> {
        if escalations.is_empty()
            || self
                .confirmer
                .confirm_high_risk_grants(entry, escalations)
                .await
        {
            return Ok(());
        }
        let capabilities = escalations
            .iter()
            .map(|capability| capability.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        warn!(
            extension_id = %entry.id,
            capabilities = %capabilities,
            "high-risk capability grant declined"
        );
        Err(RuntimeManagerError::ConfirmationDeclined {
            name: entry.name.clone(),
            capabilities,
        })
    }

    async fn load_document(&self) -> Result<ExtensionRegistryDocument, RuntimeManagerError> {
        self.store.load().await.map_err(RuntimeManagerError::Registry)
    }

    async fn save_document(
        &self,
        document: &ExtensionRegistryDocument,
    ) -> Result<(), RuntimeManagerError> {
        self.store
            .save(document)
            .await
            .map_err(RuntimeManagerError::Registry)
    }

    fn status_or_default(
        &self,
        state: &ManagerState,
        entry: &ExtensionRegistryEntry,
    ) -> ExtensionRuntimeStatus {
        state
            .statuses
            .get(&entry.id)
            .cloned()
            .unwrap_or_else(|| {
                ExtensionRuntimeStatus::from_entry(entry, self.runtime_mode_for(entry))
            })
    }

    /// Disposes any running instance of `entry`, then activates it again when
    /// enabled. Activation errors land on the status, not the caller.
    async fn restart_entry(&self, state: &mut ManagerState, entry: &ExtensionRegistryEntry) {
        self.dispose_runtime(state, &entry.id).await;
        if entry.enabled {
            let _ = self.activate_entry(state, entry).await;
        } else {
            state.statuses.insert(
                entry.id.clone(),
                ExtensionRuntimeStatus::from_entry(entry, self.runtime_mode_for(entry)),
            );
        }
    }

    async fn dispose_runtime(&self, state: &mut ManagerState, id: &str) {
        if let Some(loaded) = state.runtimes.remove(id) {
            loaded.instance.dispose(true).await;
            if let Some(status) = state.statuses.get_mut(id) {
                status.loaded = false;
                status.instance_id = None;
            }
        }
    }

    async fn activate_entry(
        &self,
        state: &mut ManagerState,
        entry: &ExtensionRegistryEntry,
    ) -> Result<(), String> {
        let runtime_mode = self.runtime_mode_for(entry);
        let mut status = ExtensionRuntimeStatus::from_entry(entry, runtime_mode);
        let sequence = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        let instance_id = format!("{}#{}", entry.id, sequence);
        let services: Arc<dyn HostServices> = match runtime_mode {
            RuntimeMode::Host => Arc::new(ProvenanceHostServices::new(
                Arc::clone(&self.services),
                entry.id.clone(),
                entry.name.clone(),
            )),
            RuntimeMode::SandboxIframe => Arc::clone(&self.services),
        };
        let options = ActivationOptions {
            instance_id: instance_id.clone(),
            extension_id: entry.id.clone(),
            extension_name: entry.name.clone(),
            source: entry.source.clone(),
            services,
            capabilities: CapabilityGate::new(entry.name.clone(), status.permissions),
            widget_owner_id: Some(instance_id.clone()),
            widget_api_v2_enabled: self.config.widget_api_v2,
        };
        let activator = match runtime_mode {
            RuntimeMode::Host => Arc::clone(&self.host_activator),
            RuntimeMode::SandboxIframe => Arc::clone(&self.sandbox_activator),
        };
        let outcome = AssertUnwindSafe(activator.activate(options))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("extension activation panicked")));
        match outcome {
            Ok(instance) => {
                info!(
                    extension_id = %entry.id,
                    instance_id = %instance_id,
                    runtime_mode = %runtime_mode,
                    "extension activated"
                );
                status.loaded = true;
                status.instance_id = Some(instance_id);
                state.statuses.insert(entry.id.clone(), status);
                state
                    .runtimes
                    .insert(entry.id.clone(), LoadedExtension { instance });
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                warn!(
                    extension_id = %entry.id,
                    runtime_mode = %runtime_mode,
                    error = %message,
                    "extension activation failed"
                );
                status.last_error = Some(message.clone());
                state.statuses.insert(entry.id.clone(), status);
                Err(message)
            }
        }
    }
}
