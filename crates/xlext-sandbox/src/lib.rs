//! Sandbox runtime host for untrusted extensions.
//!
//! Launches each extension instance in an isolated context, services its
//! capability-gated requests against host collaborators, and correlates
//! host-initiated requests through a transport-agnostic pending table.

mod activation;
mod activator;
mod bootstrap;
mod context;
mod error;
mod host;
mod in_process;
mod pending;
mod process;
mod registrations;
mod requests;

pub use activation::{
    ActivationOptions, ActiveExtension, AgentEventListener, AgentEventSubscription,
    CommandRegistration, DownloadFileRequest, ExtensionActivator, ExtensionCommandHandler,
    ExtensionSource, ExtensionToolExecutor, HostServices, HttpFetchRequest, HttpFetchResponse,
    LlmCompletionRequest, SkillSummary, ToastKind, ToolRegistration,
};
pub use activator::SandboxExtensionActivator;
pub use bootstrap::{
    render_bootstrap_document, validate_module_specifier, SandboxBootstrap,
    WIDGET_API_VERSION_LEGACY, WIDGET_API_VERSION_V2,
};
pub use context::{
    ContextId, InboundMessage, ListenerId, SandboxContext, SandboxContextLauncher,
    SandboxContextSpec, SandboxMessageBus, SANDBOX_FLAGS,
};
pub use error::SandboxHostError;
pub use host::{
    SandboxHostOptions, SandboxHostTimeouts, SandboxRuntimeHost, DEFAULT_BOOTSTRAP_TIMEOUT_MS,
    DEFAULT_REQUEST_TIMEOUT_MS,
};
pub use in_process::{InProcessSandboxLauncher, SandboxGuest, SandboxPort};
pub use pending::PendingRequestTable;
pub use process::{ProcessSandboxConfig, ProcessSandboxLauncher};
pub use registrations::{
    normalize_extension_command_name, validate_extension_tool_name, validate_tool_arguments,
    validate_tool_parameters_schema,
};
pub use requests::{required_capability, SandboxRpcRequest};
