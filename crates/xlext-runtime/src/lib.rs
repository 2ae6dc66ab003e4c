//! Extension runtime manager.
//!
//! Resolves each stored extension's runtime mode and effective permissions,
//! activates it through the host loader or the sandbox activator, isolates
//! per-extension failures, and owns reload/enable/uninstall lifecycles.

mod config;
mod manager;
mod mode;
mod provenance;
mod registry;

pub use config::{
    ExtensionRuntimeConfig, BOOTSTRAP_TIMEOUT_MS_ENV, REQUEST_TIMEOUT_MS_ENV,
    SANDBOX_KILL_SWITCH_ENV, WIDGET_API_V2_ENV,
};
pub use manager::{
    ExtensionRuntimeManager, ExtensionRuntimeManagerOptions, ExtensionRuntimeStatus,
    HighRiskGrantConfirmer, InitializeSummary, RuntimeManagerError, StaticGrantConfirmer,
};
pub use mode::{resolve_runtime_mode, RuntimeMode};
pub use provenance::{format_tool_failure, tool_description_with_provenance, ProvenanceHostServices};
pub use registry::{
    load_registry_document, parse_registry_document, ExtensionRegistryDocument,
    ExtensionRegistryEntry, ExtensionRegistryStore, InMemoryRegistryStore, JsonFileRegistryStore,
    EXTENSION_REGISTRY_SCHEMA_VERSION,
};

#[cfg(test)]
mod tests;
