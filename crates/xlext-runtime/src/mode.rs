use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use xlext_permissions::TrustLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Where an extension instance executes.
pub enum RuntimeMode {
    Host,
    SandboxIframe,
}

impl RuntimeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::SandboxIframe => "sandbox-iframe",
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "host" => Ok(Self::Host),
            "sandbox-iframe" => Ok(Self::SandboxIframe),
            other => Err(format!("unknown extension runtime mode '{other}'")),
        }
    }
}

/// Vetted sources always run host-side. Untrusted sources run sandboxed
/// unless the kill switch forces them back to the host.
pub fn resolve_runtime_mode(trust: TrustLevel, sandbox_kill_switch_enabled: bool) -> RuntimeMode {
    match trust {
        TrustLevel::Builtin | TrustLevel::LocalModule => RuntimeMode::Host,
        TrustLevel::InlineCode | TrustLevel::RemoteUrl if sandbox_kill_switch_enabled => {
            RuntimeMode::Host
        }
        TrustLevel::InlineCode | TrustLevel::RemoteUrl => RuntimeMode::SandboxIframe,
    }
}

#[cfg(test)]
mod tests {
    use xlext_permissions::TrustLevel;

    use super::{resolve_runtime_mode, RuntimeMode};

    #[test]
    fn unit_runtime_mode_table_honors_kill_switch_only_for_untrusted_sources() {
        for kill_switch in [false, true] {
            assert_eq!(
                resolve_runtime_mode(TrustLevel::Builtin, kill_switch),
                RuntimeMode::Host
            );
            assert_eq!(
                resolve_runtime_mode(TrustLevel::LocalModule, kill_switch),
                RuntimeMode::Host
            );
        }
        assert_eq!(
            resolve_runtime_mode(TrustLevel::InlineCode, false),
            RuntimeMode::SandboxIframe
        );
        assert_eq!(
            resolve_runtime_mode(TrustLevel::RemoteUrl, false),
            RuntimeMode::SandboxIframe
        );
        assert_eq!(
            resolve_runtime_mode(TrustLevel::InlineCode, true),
            RuntimeMode::Host
        );
        assert_eq!(
            resolve_runtime_mode(TrustLevel::RemoteUrl, true),
            RuntimeMode::Host
        );
    }

    #[test]
    fn unit_runtime_mode_round_trips_wire_names() {
        assert_eq!("sandbox-iframe".parse::<RuntimeMode>(), Ok(RuntimeMode::SandboxIframe));
        assert_eq!(RuntimeMode::Host.to_string(), "host");
        assert!("iframe".parse::<RuntimeMode>().is_err());
    }
}
