//! Activation interface between the runtime manager and the code that actually
//! runs an extension (host-side loader or sandbox activator).

use std::{collections::BTreeMap, fmt, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use xlext_permissions::{Capability, CapabilityGate};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Where an extension's code comes from.
pub enum ExtensionSource {
    Inline { code: String },
    Module { specifier: String },
}

impl fmt::Display for ExtensionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline { code } => write!(f, "inline ({} chars)", code.chars().count()),
            Self::Module { specifier } => write!(f, "module {specifier}"),
        }
    }
}

/// Handler invoked when a user runs an extension-registered command.
#[async_trait]
pub trait ExtensionCommandHandler: Send + Sync {
    async fn run(&self, args: String) -> Result<()>;
}

/// Executor behind an extension-registered agent tool.
#[async_trait]
pub trait ExtensionToolExecutor: Send + Sync {
    async fn execute(&self, params: Value) -> Result<Value>;
}

#[derive(Clone)]
/// Public struct `CommandRegistration` used across extension runtimes.
pub struct CommandRegistration {
    pub name: String,
    pub description: String,
    pub handler: Arc<dyn ExtensionCommandHandler>,
}

impl fmt::Debug for CommandRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistration")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
/// Public struct `ToolRegistration` used across extension runtimes.
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub executor: Arc<dyn ExtensionToolExecutor>,
}

impl fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Receives agent events for one subscription, in emission order.
pub type AgentEventListener = Arc<dyn Fn(Value) + Send + Sync>;

/// Detaches an agent event subscription when consumed.
pub struct AgentEventSubscription {
    unsubscribe: Box<dyn FnOnce() + Send>,
}

impl AgentEventSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Box::new(unsubscribe),
        }
    }

    pub fn unsubscribe(self) {
        (self.unsubscribe)();
    }
}

impl fmt::Debug for AgentEventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEventSubscription").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Public struct `LlmCompletionRequest` used across extension runtimes.
pub struct LlmCompletionRequest {
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `HttpFetchRequest` used across extension runtimes.
pub struct HttpFetchRequest {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `HttpFetchResponse` used across extension runtimes.
pub struct HttpFetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `SkillSummary` used across extension runtimes.
pub struct SkillSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `DownloadFileRequest` used across extension runtimes.
pub struct DownloadFileRequest {
    pub filename: String,
    pub content: String,
    #[serde(default = "default_download_mime_type")]
    pub mime_type: String,
}

fn default_download_mime_type() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ToastKind` values.
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// Host-mediated operations an extension may reach, implemented by the host
/// application. Every call is already capability-checked by the runtime.
#[async_trait]
pub trait HostServices: Send + Sync {
    async fn register_command(&self, extension_id: &str, command: CommandRegistration)
        -> Result<()>;
    async fn register_tool(&self, extension_id: &str, tool: ToolRegistration) -> Result<()>;
    async fn unregister_tool(&self, extension_id: &str, name: &str) -> Result<()>;
    fn subscribe_agent_events(
        &self,
        listener: AgentEventListener,
    ) -> Result<AgentEventSubscription>;
    async fn llm_complete(&self, request: LlmCompletionRequest) -> Result<Value>;
    async fn http_fetch(&self, request: HttpFetchRequest) -> Result<HttpFetchResponse>;
    async fn storage_get(&self, extension_id: &str, key: &str) -> Result<Option<Value>>;
    async fn storage_set(&self, extension_id: &str, key: &str, value: Value) -> Result<()>;
    async fn storage_delete(&self, extension_id: &str, key: &str) -> Result<()>;
    async fn storage_keys(&self, extension_id: &str) -> Result<Vec<String>>;
    async fn clipboard_write_text(&self, text: &str) -> Result<()>;
    async fn inject_agent_context(&self, extension_id: &str, text: &str) -> Result<()>;
    async fn steer_agent(&self, text: &str) -> Result<()>;
    async fn follow_up_agent(&self, text: &str) -> Result<()>;
    async fn list_skills(&self) -> Result<Vec<SkillSummary>>;
    async fn read_skill(&self, name: &str) -> Result<String>;
    async fn install_skill(&self, name: &str, markdown: &str) -> Result<()>;
    async fn uninstall_skill(&self, name: &str) -> Result<()>;
    async fn download_file(&self, request: DownloadFileRequest) -> Result<()>;
    fn toast(&self, message: &str, kind: ToastKind);
}

/// Everything a runtime needs to activate one extension instance.
#[derive(Clone)]
pub struct ActivationOptions {
    pub instance_id: String,
    pub extension_id: String,
    pub extension_name: String,
    pub source: ExtensionSource,
    pub services: Arc<dyn HostServices>,
    pub capabilities: CapabilityGate,
    pub widget_owner_id: Option<String>,
    pub widget_api_v2_enabled: bool,
}

impl ActivationOptions {
    pub fn is_capability_enabled(&self, capability: Capability) -> bool {
        self.capabilities.is_enabled(capability)
    }

    pub fn format_capability_error(&self, capability: Capability) -> String {
        self.capabilities.format_error(capability)
    }

    /// Owner key for widgets and overlays contributed by this instance.
    pub fn surface_owner_id(&self) -> &str {
        self.widget_owner_id.as_deref().unwrap_or(&self.instance_id)
    }
}

impl fmt::Debug for ActivationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationOptions")
            .field("instance_id", &self.instance_id)
            .field("extension_id", &self.extension_id)
            .field("extension_name", &self.extension_name)
            .field("source", &self.source)
            .field("capabilities", &self.capabilities)
            .field("widget_owner_id", &self.widget_owner_id)
            .field("widget_api_v2_enabled", &self.widget_api_v2_enabled)
            .finish_non_exhaustive()
    }
}

/// Starts an extension instance in one runtime mode.
#[async_trait]
pub trait ExtensionActivator: Send + Sync {
    async fn activate(&self, options: ActivationOptions) -> Result<Box<dyn ActiveExtension>>;
}

/// A running extension instance.
#[async_trait]
pub trait ActiveExtension: Send + Sync {
    fn instance_id(&self) -> &str;

    /// Tears the instance down. Must be idempotent.
    async fn dispose(&self, graceful: bool);
}
