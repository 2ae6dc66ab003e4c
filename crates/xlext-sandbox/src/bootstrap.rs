use serde::Serialize;
use url::Url;
use xlext_protocol::{serialize_for_inline_embedding, EXTENSION_SANDBOX_CHANNEL};

use crate::{activation::ExtensionSource, error::SandboxHostError};

pub const WIDGET_API_VERSION_LEGACY: u8 = 1;
pub const WIDGET_API_VERSION_V2: u8 = 2;
const BOOTSTRAP_GLOBAL_NAME: &str = "__XLEXT_SANDBOX_BOOTSTRAP__";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Payload embedded into every sandbox bootstrap document.
pub struct SandboxBootstrap {
    pub channel: String,
    pub instance_id: String,
    pub source: ExtensionSource,
    pub widget_api_version: u8,
}

impl SandboxBootstrap {
    pub fn new(instance_id: &str, source: ExtensionSource, widget_api_v2_enabled: bool) -> Self {
        Self {
            channel: EXTENSION_SANDBOX_CHANNEL.to_string(),
            instance_id: instance_id.to_string(),
            source,
            widget_api_version: if widget_api_v2_enabled {
                WIDGET_API_VERSION_V2
            } else {
                WIDGET_API_VERSION_LEGACY
            },
        }
    }
}

/// Accepts `https:` module URLs, plus plain `http:` for loopback development hosts.
pub fn validate_module_specifier(specifier: &str) -> Result<Url, SandboxHostError> {
    let url = Url::parse(specifier.trim()).map_err(|error| SandboxHostError::Bootstrap {
        message: format!("invalid extension module specifier '{}': {}", specifier.trim(), error),
    })?;
    let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    match url.scheme() {
        "https" => Ok(url),
        "http" if loopback => Ok(url),
        scheme => Err(SandboxHostError::Bootstrap {
            message: format!(
                "extension module specifier must use https (found scheme '{}')",
                scheme
            ),
        }),
    }
}

/// Renders the document loaded into a fresh sandbox context.
///
/// The payload is inlined through [`serialize_for_inline_embedding`], so code
/// or specifiers containing `</script>` cannot break out of the script block.
pub fn render_bootstrap_document(bootstrap: &SandboxBootstrap) -> Result<String, SandboxHostError> {
    let script_sources = match &bootstrap.source {
        ExtensionSource::Inline { code } => {
            if code.trim().is_empty() {
                return Err(SandboxHostError::Bootstrap {
                    message: "inline extension code must not be empty".to_string(),
                });
            }
            "'unsafe-inline'".to_string()
        }
        ExtensionSource::Module { specifier } => {
            let url = validate_module_specifier(specifier)?;
            format!("'unsafe-inline' {}", url.origin().ascii_serialization())
        }
    };
    let payload = serde_json::to_value(bootstrap).map_err(|error| SandboxHostError::Bootstrap {
        message: format!("failed to serialize sandbox bootstrap payload: {error}"),
    })?;
    let content_security_policy = format!(
        "default-src 'none'; script-src {script_sources}; style-src 'unsafe-inline'; img-src data:; connect-src 'none'; form-action 'none'; base-uri 'none'"
    );
    Ok(format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<meta http-equiv=\"Content-Security-Policy\" content=\"{content_security_policy}\">\n</head>\n<body>\n<script>globalThis.{BOOTSTRAP_GLOBAL_NAME} = {};</script>\n</body>\n</html>\n",
        serialize_for_inline_embedding(&payload)
    ))
}
