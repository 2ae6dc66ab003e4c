//! Capability permission model for third-party extensions.
//!
//! Maps an extension's trust level to its default capability grants, overlays
//! stored per-extension overrides, and answers whether a single capability is
//! allowed. Also provides the capability gate handed to runtimes so denials are
//! reported with one consistent, user-facing sentence.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Closed set of host-mediated operations an extension can be granted.
pub enum Capability {
    CommandsRegister,
    ToolsRegister,
    AgentEventsRead,
    LlmComplete,
    HttpFetch,
    StorageReadWrite,
    ClipboardWrite,
    AgentContextWrite,
    AgentSteer,
    AgentFollowUp,
    SkillsRead,
    SkillsWrite,
    DownloadFile,
    UiToast,
    UiOverlay,
    UiWidget,
}

impl Capability {
    pub const ALL: [Capability; 16] = [
        Capability::CommandsRegister,
        Capability::ToolsRegister,
        Capability::AgentEventsRead,
        Capability::LlmComplete,
        Capability::HttpFetch,
        Capability::StorageReadWrite,
        Capability::ClipboardWrite,
        Capability::AgentContextWrite,
        Capability::AgentSteer,
        Capability::AgentFollowUp,
        Capability::SkillsRead,
        Capability::SkillsWrite,
        Capability::DownloadFile,
        Capability::UiToast,
        Capability::UiOverlay,
        Capability::UiWidget,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommandsRegister => "commands.register",
            Self::ToolsRegister => "tools.register",
            Self::AgentEventsRead => "agent.events.read",
            Self::LlmComplete => "llm.complete",
            Self::HttpFetch => "http.fetch",
            Self::StorageReadWrite => "storage.readwrite",
            Self::ClipboardWrite => "clipboard.write",
            Self::AgentContextWrite => "agent.context.write",
            Self::AgentSteer => "agent.steer",
            Self::AgentFollowUp => "agent.followup",
            Self::SkillsRead => "skills.read",
            Self::SkillsWrite => "skills.write",
            Self::DownloadFile => "download.file",
            Self::UiToast => "ui.toast",
            Self::UiOverlay => "ui.overlay",
            Self::UiWidget => "ui.widget",
        }
    }

    /// Phrase completing "cannot ..." in denial messages.
    pub fn blocked_action(self) -> &'static str {
        match self {
            Self::CommandsRegister => "register commands",
            Self::ToolsRegister => "register tools",
            Self::AgentEventsRead => "read agent events",
            Self::LlmComplete => "call the language model",
            Self::HttpFetch => "make network requests",
            Self::StorageReadWrite => "use extension storage",
            Self::ClipboardWrite => "write to the clipboard",
            Self::AgentContextWrite => "inject agent context",
            Self::AgentSteer => "steer the agent",
            Self::AgentFollowUp => "queue agent follow-ups",
            Self::SkillsRead => "read skills",
            Self::SkillsWrite => "install or remove skills",
            Self::DownloadFile => "download files",
            Self::UiToast => "show notifications",
            Self::UiOverlay => "show overlays",
            Self::UiWidget => "show widgets",
        }
    }

    /// High-risk grants need interactive confirmation for non-builtin extensions.
    pub fn is_high_risk(self) -> bool {
        matches!(
            self,
            Self::ToolsRegister
                | Self::AgentEventsRead
                | Self::LlmComplete
                | Self::HttpFetch
                | Self::AgentContextWrite
                | Self::AgentSteer
                | Self::AgentFollowUp
                | Self::SkillsWrite
        )
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = PermissionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|capability| capability.as_str() == raw.trim())
            .ok_or_else(|| PermissionError::UnknownCapability(raw.trim().to_string()))
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Capability::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
/// Inherent trust of an extension's source, most trusted first.
pub enum TrustLevel {
    Builtin,
    LocalModule,
    InlineCode,
    RemoteUrl,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 4] = [
        TrustLevel::Builtin,
        TrustLevel::LocalModule,
        TrustLevel::InlineCode,
        TrustLevel::RemoteUrl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::LocalModule => "local-module",
            Self::InlineCode => "inline-code",
            Self::RemoteUrl => "remote-url",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = PermissionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TrustLevel::ALL
            .into_iter()
            .find(|trust| trust.as_str() == raw.trim())
            .ok_or_else(|| PermissionError::UnknownTrustLevel(raw.trim().to_string()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Enumerates supported `PermissionError` values.
pub enum PermissionError {
    #[error("unknown extension capability '{0}'")]
    UnknownCapability(String),
    #[error("unknown extension trust level '{0}': expected one of builtin, local-module, inline-code, remote-url")]
    UnknownTrustLevel(String),
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
/// Total map from every [`Capability`] to a grant flag, stored as a bitset.
pub struct PermissionSet {
    bits: u32,
}

impl PermissionSet {
    pub fn none() -> Self {
        Self { bits: 0 }
    }

    pub fn all() -> Self {
        Self::from_capabilities(Capability::ALL)
    }

    pub fn from_capabilities(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let bits = capabilities
            .into_iter()
            .fold(0, |bits, capability| bits | capability.bit());
        Self { bits }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.bits & capability.bit() != 0
    }

    /// Returns a copy with only `capability` changed.
    pub fn with(self, capability: Capability, allowed: bool) -> Self {
        let bits = if allowed {
            self.bits | capability.bit()
        } else {
            self.bits & !capability.bit()
        };
        Self { bits }
    }

    pub fn granted(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(|capability| self.allows(*capability))
    }

    pub fn high_risk_grants(&self) -> Vec<Capability> {
        self.granted()
            .filter(|capability| capability.is_high_risk())
            .collect()
    }

    pub fn to_map(&self) -> BTreeMap<Capability, bool> {
        Capability::ALL
            .into_iter()
            .map(|capability| (capability, self.allows(capability)))
            .collect()
    }
}

impl fmt::Debug for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.granted()).finish()
    }
}

impl Serialize for PermissionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PermissionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<Capability, bool>::deserialize(deserializer)?;
        Ok(map
            .into_iter()
            .fold(PermissionSet::none(), |set, (capability, allowed)| {
                set.with(capability, allowed)
            }))
    }
}

const SAFE_UI_CAPABILITIES: [Capability; 4] = [
    Capability::CommandsRegister,
    Capability::UiToast,
    Capability::UiOverlay,
    Capability::UiWidget,
];

/// Default grants for `trust`.
pub fn get_default_permissions(trust: TrustLevel) -> PermissionSet {
    match trust {
        TrustLevel::Builtin => PermissionSet::all(),
        TrustLevel::LocalModule => PermissionSet::all()
            .with(Capability::HttpFetch, false)
            .with(Capability::SkillsWrite, false),
        TrustLevel::InlineCode | TrustLevel::RemoteUrl => {
            PermissionSet::from_capabilities(SAFE_UI_CAPABILITIES)
        }
    }
}

pub fn is_capability_allowed(permissions: &PermissionSet, capability: Capability) -> bool {
    permissions.allows(capability)
}

/// Pure update: returns a new set, leaving `permissions` untouched.
pub fn set_capability_allowed(
    permissions: &PermissionSet,
    capability: Capability,
    allowed: bool,
) -> PermissionSet {
    permissions.with(capability, allowed)
}

/// Derives the effective set from trust defaults plus stored overrides.
///
/// Unknown capability names in stored overrides are ignored so an older host
/// can still read a registry written by a newer one.
pub fn resolve_permission_set(
    trust: TrustLevel,
    overrides: &BTreeMap<String, bool>,
) -> PermissionSet {
    overrides
        .iter()
        .fold(get_default_permissions(trust), |set, (name, allowed)| {
            match Capability::from_str(name) {
                Ok(capability) => set.with(capability, *allowed),
                Err(error) => {
                    warn!(capability = %name, %error, "ignoring stored permission override");
                    set
                }
            }
        })
}

/// Capabilities that `candidate` grants beyond `baseline` and that require
/// confirmation for an extension of trust level `trust`.
pub fn high_risk_escalations(
    trust: TrustLevel,
    baseline: &PermissionSet,
    candidate: &PermissionSet,
) -> Vec<Capability> {
    if trust == TrustLevel::Builtin {
        return Vec::new();
    }
    candidate
        .high_risk_grants()
        .into_iter()
        .filter(|capability| !baseline.allows(*capability))
        .collect()
}

/// Formats the user-facing denial sentence for `extension_name`.
pub fn format_capability_denied(extension_name: &str, capability: Capability) -> String {
    format!(
        "Permission denied for extension \"{}\": cannot {}.",
        extension_name,
        capability.blocked_action()
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Capability predicate bound to one extension's effective permission set.
pub struct CapabilityGate {
    extension_name: String,
    permissions: PermissionSet,
}

impl CapabilityGate {
    pub fn new(extension_name: impl Into<String>, permissions: PermissionSet) -> Self {
        Self {
            extension_name: extension_name.into(),
            permissions,
        }
    }

    pub fn extension_name(&self) -> &str {
        &self.extension_name
    }

    pub fn permissions(&self) -> PermissionSet {
        self.permissions
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.permissions.allows(capability)
    }

    pub fn format_error(&self, capability: Capability) -> String {
        format_capability_denied(&self.extension_name, capability)
    }

    /// Returns the denial message when `capability` is not granted.
    pub fn check(&self, capability: Capability) -> Result<(), String> {
        if self.is_enabled(capability) {
            Ok(())
        } else {
            Err(self.format_error(capability))
        }
    }
}

#[cfg(test)]
mod tests;
