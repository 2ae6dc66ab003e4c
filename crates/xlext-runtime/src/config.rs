use std::{path::Path, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use xlext_sandbox::{SandboxHostTimeouts, DEFAULT_BOOTSTRAP_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS};

pub const SANDBOX_KILL_SWITCH_ENV: &str = "XLEXT_SANDBOX_KILL_SWITCH";
pub const WIDGET_API_V2_ENV: &str = "XLEXT_WIDGET_API_V2";
pub const BOOTSTRAP_TIMEOUT_MS_ENV: &str = "XLEXT_BOOTSTRAP_TIMEOUT_MS";
pub const REQUEST_TIMEOUT_MS_ENV: &str = "XLEXT_REQUEST_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Operator settings for the extension runtime manager.
pub struct ExtensionRuntimeConfig {
    /// Forces sandboxed trust levels back to host execution.
    pub sandbox_kill_switch: bool,
    pub widget_api_v2: bool,
    pub bootstrap_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub deactivate_timeout_ms: u64,
}

impl Default for ExtensionRuntimeConfig {
    fn default() -> Self {
        Self {
            sandbox_kill_switch: false,
            widget_api_v2: true,
            bootstrap_timeout_ms: DEFAULT_BOOTSTRAP_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            deactivate_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl ExtensionRuntimeConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("failed to parse runtime config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `XLEXT_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let kill_switch = lookup(SANDBOX_KILL_SWITCH_ENV);
        if let Some(value) = parse_optional_bool(SANDBOX_KILL_SWITCH_ENV, kill_switch)? {
            self.sandbox_kill_switch = value;
        }
        if let Some(value) = parse_optional_bool(WIDGET_API_V2_ENV, lookup(WIDGET_API_V2_ENV))? {
            self.widget_api_v2 = value;
        }
        let bootstrap_timeout = lookup(BOOTSTRAP_TIMEOUT_MS_ENV);
        if let Some(value) = parse_optional_ms(BOOTSTRAP_TIMEOUT_MS_ENV, bootstrap_timeout)? {
            self.bootstrap_timeout_ms = value;
        }
        let request_timeout = lookup(REQUEST_TIMEOUT_MS_ENV);
        if let Some(value) = parse_optional_ms(REQUEST_TIMEOUT_MS_ENV, request_timeout)? {
            self.request_timeout_ms = value;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("bootstrap_timeout_ms", self.bootstrap_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("deactivate_timeout_ms", self.deactivate_timeout_ms),
        ] {
            if value == 0 {
                bail!("extension runtime config '{}' must be greater than 0", field);
            }
        }
        Ok(())
    }

    pub fn sandbox_timeouts(&self) -> SandboxHostTimeouts {
        SandboxHostTimeouts {
            bootstrap: Duration::from_millis(self.bootstrap_timeout_ms),
            request: Duration::from_millis(self.request_timeout_ms),
            deactivate: Duration::from_millis(self.deactivate_timeout_ms),
        }
    }
}

fn parse_optional_bool(name: &str, raw: Option<String>) -> Result<Option<bool>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = raw.trim().to_ascii_lowercase();
    if value.is_empty() {
        return Ok(None);
    }
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow!(
            "invalid {} value '{}': expected one of 1,true,yes,on,0,false,no,off",
            name,
            raw.trim()
        )),
    }
}

fn parse_optional_ms(name: &str, raw: Option<String>) -> Result<Option<u64>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value = trimmed
        .parse::<u64>()
        .map_err(|_| anyhow!("invalid {} value '{}': expected milliseconds", name, trimmed))?;
    Ok(Some(value))
}
