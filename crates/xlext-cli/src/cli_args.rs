use std::path::PathBuf;

use clap::{Parser, Subcommand};
use xlext_permissions::TrustLevel;

fn parse_trust_level(value: &str) -> Result<TrustLevel, String> {
    value
        .parse::<TrustLevel>()
        .map_err(|error| error.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "xlext",
    about = "Inspect extension permissions, registries, and sandbox wire traffic",
    version
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Print the default capability grants for a trust level.
    Permissions {
        #[arg(long, value_parser = parse_trust_level)]
        trust: TrustLevel,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Summarize a stored extension registry and how each entry would run.
    Registry {
        #[arg(long, env = "XLEXT_REGISTRY_PATH")]
        path: PathBuf,
        #[arg(long, env = "XLEXT_RUNTIME_CONFIG")]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        kill_switch: bool,
    },
    /// Validate an NDJSON capture of sandbox envelopes.
    Envelopes {
        #[arg(long)]
        path: PathBuf,
    },
    /// Render the bootstrap document a sandbox context would load.
    Bootstrap {
        #[arg(long)]
        instance_id: String,
        #[arg(long, conflicts_with = "module", required_unless_present = "module")]
        inline: Option<PathBuf>,
        #[arg(long)]
        module: Option<String>,
        #[arg(long, default_value_t = false)]
        legacy_widgets: bool,
    },
    /// Print the effective runtime configuration after environment overrides.
    Config {
        #[arg(long, env = "XLEXT_RUNTIME_CONFIG")]
        path: Option<PathBuf>,
    },
}
