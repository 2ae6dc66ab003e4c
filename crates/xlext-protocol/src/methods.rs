use std::{fmt, str::FromStr};

/// Event posted by the host to deliver one agent event to a sandbox subscription.
pub const HOST_EVENT_AGENT_EVENT: &str = "agent_event";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Returned when a method name is not part of the protocol.
pub struct UnknownMethodError {
    pub method: String,
}

impl fmt::Display for UnknownMethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported extension sandbox method '{}'", self.method)
    }
}

impl std::error::Error for UnknownMethodError {}

macro_rules! wire_names {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownMethodError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw {
                    $($wire => Ok($name::$variant),)+
                    other => Err(UnknownMethodError {
                        method: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Methods a sandboxed extension may invoke on the host.
pub enum SandboxRpcMethod {
    RegisterCommand,
    RegisterTool,
    UnregisterTool,
    SubscribeAgentEvents,
    UnsubscribeAgentEvents,
    LlmComplete,
    HttpFetch,
    StorageGet,
    StorageSet,
    StorageDelete,
    StorageKeys,
    ClipboardWriteText,
    InjectAgentContext,
    SteerAgent,
    FollowUpAgent,
    ListSkills,
    ReadSkill,
    InstallSkill,
    UninstallSkill,
    DownloadFile,
    Toast,
    OverlayShow,
    OverlayDismiss,
    WidgetShow,
    WidgetDismiss,
    WidgetUpsert,
    WidgetRemove,
    WidgetClear,
}

wire_names!(SandboxRpcMethod {
    RegisterCommand => "register_command",
    RegisterTool => "register_tool",
    UnregisterTool => "unregister_tool",
    SubscribeAgentEvents => "subscribe_agent_events",
    UnsubscribeAgentEvents => "unsubscribe_agent_events",
    LlmComplete => "llm_complete",
    HttpFetch => "http_fetch",
    StorageGet => "storage_get",
    StorageSet => "storage_set",
    StorageDelete => "storage_delete",
    StorageKeys => "storage_keys",
    ClipboardWriteText => "clipboard_write_text",
    InjectAgentContext => "inject_agent_context",
    SteerAgent => "steer_agent",
    FollowUpAgent => "follow_up_agent",
    ListSkills => "list_skills",
    ReadSkill => "read_skill",
    InstallSkill => "install_skill",
    UninstallSkill => "uninstall_skill",
    DownloadFile => "download_file",
    Toast => "toast",
    OverlayShow => "overlay_show",
    OverlayDismiss => "overlay_dismiss",
    WidgetShow => "widget_show",
    WidgetDismiss => "widget_dismiss",
    WidgetUpsert => "widget_upsert",
    WidgetRemove => "widget_remove",
    WidgetClear => "widget_clear",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Methods the host may invoke on a sandboxed extension.
pub enum HostRpcMethod {
    Deactivate,
    RunCommand,
    ExecuteTool,
    UiAction,
}

wire_names!(HostRpcMethod {
    Deactivate => "deactivate",
    RunCommand => "run_command",
    ExecuteTool => "execute_tool",
    UiAction => "ui_action",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Lifecycle events a sandbox posts to the host.
pub enum SandboxEvent {
    Ready,
    Error,
}

wire_names!(SandboxEvent {
    Ready => "ready",
    Error => "error",
});
