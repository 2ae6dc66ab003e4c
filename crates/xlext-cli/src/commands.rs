use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::debug;
use xlext_permissions::{get_default_permissions, Capability, PermissionSet, TrustLevel};
use xlext_protocol::{parse_envelope, EnvelopeBody};
use xlext_runtime::{
    resolve_runtime_mode, ExtensionRegistryStore, ExtensionRuntimeConfig, JsonFileRegistryStore,
};
use xlext_sandbox::{render_bootstrap_document, ExtensionSource, SandboxBootstrap};

use crate::cli_args::{Cli, CliCommand};

pub(crate) async fn run_cli(cli: Cli) -> Result<String> {
    match cli.command {
        CliCommand::Permissions { trust, json } => render_permissions(trust, json),
        CliCommand::Registry {
            path,
            config,
            kill_switch,
        } => execute_registry_command(&path, config.as_deref(), kill_switch).await,
        CliCommand::Envelopes { path } => execute_envelopes_command(&path),
        CliCommand::Bootstrap {
            instance_id,
            inline,
            module,
            legacy_widgets,
        } => execute_bootstrap_command(
            &instance_id,
            inline.as_deref(),
            module.as_deref(),
            legacy_widgets,
        ),
        CliCommand::Config { path } => execute_config_command(path.as_deref()),
    }
}

pub(crate) fn load_runtime_config(path: Option<&Path>) -> Result<ExtensionRuntimeConfig> {
    let mut config = match path {
        Some(path) => ExtensionRuntimeConfig::load_from_path(path)?,
        None => ExtensionRuntimeConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn render_granted(permissions: &PermissionSet) -> String {
    let granted = permissions
        .granted()
        .map(Capability::as_str)
        .collect::<Vec<_>>();
    if granted.is_empty() {
        "none".to_string()
    } else {
        granted.join(",")
    }
}

pub(crate) fn render_permissions(trust: TrustLevel, json: bool) -> Result<String> {
    let permissions = get_default_permissions(trust);
    if json {
        let mut rendered = serde_json::to_string_pretty(&permissions)
            .context("failed to render permission table")?;
        rendered.push('\n');
        return Ok(rendered);
    }
    let mut lines = vec![format!(
        "permissions: trust={} granted={} high_risk={}",
        trust,
        permissions.granted().count(),
        permissions.high_risk_grants().len()
    )];
    for capability in Capability::ALL {
        let decision = if permissions.allows(capability) {
            "allow"
        } else {
            "deny"
        };
        let marker = if capability.is_high_risk() {
            " high-risk"
        } else {
            ""
        };
        lines.push(format!("  {:<20} {decision}{marker}", capability.as_str()));
    }
    Ok(format!("{}\n", lines.join("\n")))
}

pub(crate) async fn execute_registry_command(
    path: &Path,
    config_path: Option<&Path>,
    kill_switch: bool,
) -> Result<String> {
    let config = load_runtime_config(config_path)?;
    let kill_switch = kill_switch || config.sandbox_kill_switch;
    let store = JsonFileRegistryStore::new(path);
    let document = store.load().await?;
    debug!(path = %path.display(), entries = document.items.len(), "loaded extension registry");

    let mut lines = vec![format!(
        "registry: path={} version={} entries={} kill_switch={}",
        path.display(),
        document.version,
        document.items.len(),
        kill_switch
    )];
    for entry in &document.items {
        let permissions = entry.effective_permissions();
        let high_risk = if entry.trust == TrustLevel::Builtin {
            Vec::new()
        } else {
            permissions.high_risk_grants()
        };
        lines.push(format!(
            "- id={} name={:?} trust={} mode={} enabled={} source={} granted={} high_risk={}",
            entry.id,
            entry.name,
            entry.trust,
            resolve_runtime_mode(entry.trust, kill_switch),
            entry.enabled,
            entry.source,
            render_granted(&permissions),
            if high_risk.is_empty() {
                "none".to_string()
            } else {
                high_risk
                    .iter()
                    .map(|capability| capability.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            }
        ));
    }
    Ok(format!("{}\n", lines.join("\n")))
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct EnvelopeCaptureSummary {
    pub(crate) total: usize,
    pub(crate) requests: usize,
    pub(crate) responses: usize,
    pub(crate) events: usize,
    pub(crate) invalid: Vec<(usize, &'static str)>,
}

pub(crate) fn summarize_envelope_capture(raw: &str) -> EnvelopeCaptureSummary {
    let mut summary = EnvelopeCaptureSummary::default();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        summary.total += 1;
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            summary.invalid.push((index + 1, "malformed json"));
            continue;
        };
        match parse_envelope(&value).map(|envelope| envelope.body) {
            Some(EnvelopeBody::Request { .. }) => summary.requests += 1,
            Some(EnvelopeBody::Response { .. }) => summary.responses += 1,
            Some(EnvelopeBody::Event { .. }) => summary.events += 1,
            None => summary.invalid.push((index + 1, "rejected envelope")),
        }
    }
    summary
}

pub(crate) fn execute_envelopes_command(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let summary = summarize_envelope_capture(&raw);
    let mut lines = vec![format!(
        "envelopes: total={} valid={} invalid={} requests={} responses={} events={}",
        summary.total,
        summary.total - summary.invalid.len(),
        summary.invalid.len(),
        summary.requests,
        summary.responses,
        summary.events
    )];
    for (line, reason) in &summary.invalid {
        lines.push(format!("  line {line}: {reason}"));
    }
    Ok(format!("{}\n", lines.join("\n")))
}

pub(crate) fn execute_bootstrap_command(
    instance_id: &str,
    inline: Option<&Path>,
    module: Option<&str>,
    legacy_widgets: bool,
) -> Result<String> {
    let source = match (inline, module) {
        (Some(path), None) => ExtensionSource::Inline {
            code: std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        },
        (None, Some(specifier)) => ExtensionSource::Module {
            specifier: specifier.to_string(),
        },
        _ => bail!("exactly one of --inline or --module is required"),
    };
    let bootstrap = SandboxBootstrap::new(instance_id, source, !legacy_widgets);
    Ok(render_bootstrap_document(&bootstrap)?)
}

pub(crate) fn execute_config_command(path: Option<&Path>) -> Result<String> {
    let config = load_runtime_config(path)?;
    let mut rendered =
        serde_json::to_string_pretty(&config).context("failed to render runtime config")?;
    rendered.push('\n');
    Ok(rendered)
}
