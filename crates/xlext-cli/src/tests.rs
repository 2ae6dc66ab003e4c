use clap::Parser;
use serde_json::json;
use xlext_permissions::TrustLevel;
use xlext_protocol::{Envelope, EnvelopeDirection};

use crate::cli_args::{Cli, CliCommand};
use crate::commands::{
    execute_bootstrap_command, execute_envelopes_command, execute_registry_command,
    render_permissions, summarize_envelope_capture,
};

#[test]
fn unit_cli_parses_trust_levels_and_rejects_unknown_ones() {
    let cli =
        Cli::try_parse_from(["xlext", "permissions", "--trust", "remote-url"]).expect("parse");
    assert!(matches!(
        cli.command,
        CliCommand::Permissions {
            trust: TrustLevel::RemoteUrl,
            json: false
        }
    ));
    let error = Cli::try_parse_from(["xlext", "permissions", "--trust", "sideloaded"])
        .expect_err("unknown trust");
    assert!(error.to_string().contains("unknown extension trust level 'sideloaded'"));
}

#[test]
fn unit_bootstrap_requires_exactly_one_source() {
    assert!(Cli::try_parse_from(["xlext", "bootstrap", "--instance-id", "ext.a#1"]).is_err());
    assert!(Cli::try_parse_from([
        "xlext",
        "bootstrap",
        "--instance-id",
        "ext.a#1",
        "--inline",
        "a.js",
        "--module",
        "https://cdn.example.com/a.js",
    ])
    .is_err());
}

#[test]
fn functional_permission_table_marks_defaults_and_high_risk() {
    let rendered = render_permissions(TrustLevel::InlineCode, false).expect("render");
    assert!(rendered.starts_with("permissions: trust=inline-code granted=4 high_risk=0\n"));
    assert!(rendered.contains("  ui.overlay           allow\n"));
    assert!(rendered.contains("  http.fetch           deny high-risk\n"));

    let json = render_permissions(TrustLevel::Builtin, true).expect("json");
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    assert_eq!(parsed["tools.register"], json!(true));
}

#[tokio::test]
async fn integration_registry_summary_reports_modes_and_kill_switch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("extensions.json");
    std::fs::write(
        &path,
        json!({
            "version": 1,
            "items": [
                {
                    "id": "ext.inline",
                    "name": "Inline",
                    "source": { "kind": "inline", "code": "export default () => {}" },
                    "trust": "inline-code",
                    "permissions": { "llm.complete": true },
                    "createdAt": "2026-01-02T03:04:05Z",
                    "updatedAt": "2026-01-02T03:04:05Z"
                },
                {
                    "id": "ext.core",
                    "name": "Core",
                    "source": { "kind": "module", "specifier": "https://cdn.example.com/core.js" },
                    "trust": "builtin",
                    "createdAt": "2026-01-02T03:04:05Z",
                    "updatedAt": "2026-01-02T03:04:05Z"
                }
            ]
        })
        .to_string(),
    )
    .expect("write registry");

    let rendered = execute_registry_command(&path, None, false)
        .await
        .expect("registry");
    assert!(rendered.contains("entries=2 kill_switch=false"));
    let inline_line = "- id=ext.inline name=\"Inline\" trust=inline-code mode=sandbox-iframe";
    assert!(rendered.contains(inline_line));
    assert!(rendered.contains("high_risk=llm.complete\n"));
    assert!(rendered.contains("- id=ext.core name=\"Core\" trust=builtin mode=host"));

    let killed = execute_registry_command(&path, None, true)
        .await
        .expect("registry");
    assert!(killed.contains("trust=inline-code mode=host"));
}

#[test]
fn functional_envelope_capture_counts_kinds_and_flags_rejects() {
    let request = Envelope::request(
        "ext.a#1",
        EnvelopeDirection::SandboxToHost,
        "req-1",
        "ui_toast",
        Some(json!({ "message": "hi" })),
    );
    let response = Envelope::response_ok(
        "ext.a#1",
        EnvelopeDirection::HostToSandbox,
        "req-1",
        json!(null),
    );
    let foreign = json!({
        "channel": "other",
        "instanceId": "x",
        "direction": "host_to_sandbox",
        "kind": "event",
        "event": "ready"
    });
    let capture = format!(
        "{}\n\n{}\n{{not json\n{}\n",
        request.to_value(),
        response.to_value(),
        foreign
    );
    let summary = summarize_envelope_capture(&capture);
    assert_eq!(summary.total, 4);
    assert_eq!(summary.requests, 1);
    assert_eq!(summary.responses, 1);
    assert_eq!(summary.events, 0);
    assert_eq!(
        summary.invalid,
        vec![(4, "malformed json"), (5, "rejected envelope")]
    );

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("capture.ndjson");
    std::fs::write(&path, capture).expect("write capture");
    let rendered = execute_envelopes_command(&path).expect("envelopes");
    assert!(rendered.starts_with(
        "envelopes: total=4 valid=2 invalid=2 requests=1 responses=1 events=0\n"
    ));
}

#[test]
fn regression_bootstrap_command_escapes_inline_code_and_rejects_plain_http() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = dir.path().join("ext.js");
    std::fs::write(&script, "document.write('</script>')").expect("write script");
    let document =
        execute_bootstrap_command("ext.a#1", Some(&script), None, true).expect("bootstrap");
    assert_eq!(document.matches("</script>").count(), 1);
    assert!(document.contains("\"widgetApiVersion\":1"));

    let error = execute_bootstrap_command(
        "ext.b#2",
        None,
        Some("http://cdn.example.com/ext.js"),
        false,
    )
    .expect_err("plain http");
    assert!(error.to_string().contains("must use https"));
}
