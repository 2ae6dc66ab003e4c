use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use xlext_permissions::TrustLevel;
use xlext_protocol::EnvelopeBody;
use xlext_runtime::{
    ExtensionRegistryDocument, ExtensionRegistryEntry, ExtensionRuntimeConfig,
    ExtensionRuntimeManager, ExtensionRuntimeManagerOptions, InMemoryRegistryStore,
    StaticGrantConfirmer,
};
use xlext_sandbox::{
    ActivationOptions, ActiveExtension, AgentEventListener, AgentEventSubscription,
    CommandRegistration, DownloadFileRequest, ExtensionActivator, ExtensionSource, HostServices,
    HttpFetchRequest, HttpFetchResponse, InProcessSandboxLauncher, LlmCompletionRequest,
    SandboxExtensionActivator, SandboxMessageBus, SandboxPort, SkillSummary, ToastKind,
    ToolRegistration,
};
use xlext_surfaces::SurfaceManager;

#[derive(Debug)]
enum GuestReport {
    Response {
        request_id: String,
        ok: bool,
        error: Option<String>,
    },
    HostRequest {
        method: String,
        params: Value,
    },
}

struct QuietServices;

#[async_trait]
impl HostServices for QuietServices {
    async fn register_command(
        &self,
        _extension_id: &str,
        _command: CommandRegistration,
    ) -> Result<()> {
        Ok(())
    }

    async fn register_tool(&self, _extension_id: &str, _tool: ToolRegistration) -> Result<()> {
        Ok(())
    }

    async fn unregister_tool(&self, _extension_id: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    fn subscribe_agent_events(
        &self,
        _listener: AgentEventListener,
    ) -> Result<AgentEventSubscription> {
        Ok(AgentEventSubscription::new(|| {}))
    }

    async fn llm_complete(&self, _request: LlmCompletionRequest) -> Result<Value> {
        bail!("llm should never be reached without llm.complete")
    }

    async fn http_fetch(&self, _request: HttpFetchRequest) -> Result<HttpFetchResponse> {
        bail!("network disabled")
    }

    async fn storage_get(&self, _extension_id: &str, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn storage_set(&self, _extension_id: &str, _key: &str, _value: Value) -> Result<()> {
        Ok(())
    }

    async fn storage_delete(&self, _extension_id: &str, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn storage_keys(&self, _extension_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn clipboard_write_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn inject_agent_context(&self, _extension_id: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn steer_agent(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn follow_up_agent(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn list_skills(&self) -> Result<Vec<SkillSummary>> {
        Ok(Vec::new())
    }

    async fn read_skill(&self, _name: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn install_skill(&self, _name: &str, _markdown: &str) -> Result<()> {
        Ok(())
    }

    async fn uninstall_skill(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn download_file(&self, _request: DownloadFileRequest) -> Result<()> {
        Ok(())
    }

    fn toast(&self, _message: &str, _kind: ToastKind) {}
}

struct UnavailableHostLoader;

#[async_trait]
impl ExtensionActivator for UnavailableHostLoader {
    async fn activate(&self, _options: ActivationOptions) -> Result<Box<dyn ActiveExtension>> {
        bail!("host loader is not available")
    }
}

async fn run_guest(mut port: SandboxPort, reports: mpsc::UnboundedSender<GuestReport>) {
    if port.instance_id().starts_with("ext.broken#") {
        port.send_error("guest exploded");
        return;
    }
    port.send_ready();
    port.send_request(
        "widget",
        "widget_upsert",
        Some(json!({ "widgetId": "status", "text": "Ready", "placement": "below-input" })),
    );
    port.send_request(
        "overlay",
        "overlay_show",
        Some(json!({ "node": { "type": "button", "label": "Go", "actionId": "go" } })),
    );
    port.send_request("llm", "llm_complete", Some(json!({ "messages": [] })));

    while let Some(envelope) = port.recv_envelope().await {
        let error = envelope.body.error_message();
        match envelope.body {
            EnvelopeBody::Response { request_id, ok, .. } => {
                let _ = reports.send(GuestReport::Response {
                    request_id,
                    ok,
                    error,
                });
            }
            EnvelopeBody::Request {
                request_id,
                method,
                params,
            } => {
                let _ = reports.send(GuestReport::HostRequest {
                    method,
                    params: params.unwrap_or(Value::Null),
                });
                port.respond_ok(&request_id, Value::Null);
            }
            EnvelopeBody::Event { .. } => {}
        }
    }
}

fn inline_entry(id: &str, name: &str) -> ExtensionRegistryEntry {
    ExtensionRegistryEntry::new(
        id,
        name,
        ExtensionSource::Inline {
            code: "export default function activate(api) {}".to_string(),
        },
        TrustLevel::InlineCode,
    )
}

async fn next_report(reports: &mut mpsc::UnboundedReceiver<GuestReport>) -> GuestReport {
    tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("guest report before timeout")
        .expect("guest report channel open")
}

#[tokio::test]
async fn integration_sandboxed_extensions_activate_render_and_shut_down_cleanly() {
    let (report_tx, mut reports) = mpsc::unbounded_channel();
    let launcher = InProcessSandboxLauncher::new(move |port: SandboxPort| {
        let reports = report_tx.clone();
        async move { run_guest(port, reports).await }
    });
    let surfaces = Arc::new(SurfaceManager::new());
    let config = ExtensionRuntimeConfig::default();
    let sandbox_activator = SandboxExtensionActivator::new(
        Arc::new(launcher),
        Arc::clone(&surfaces),
        SandboxMessageBus::new(),
        config.sandbox_timeouts(),
    );
    let store = Arc::new(InMemoryRegistryStore::new(ExtensionRegistryDocument {
        version: 1,
        items: vec![
            inline_entry("ext.widgets", "Widgets"),
            inline_entry("ext.broken", "Broken"),
        ],
    }));
    let manager = ExtensionRuntimeManager::new(ExtensionRuntimeManagerOptions {
        config,
        store,
        services: Arc::new(QuietServices),
        host_activator: Arc::new(UnavailableHostLoader),
        sandbox_activator: Arc::new(sandbox_activator),
        confirmer: Arc::new(StaticGrantConfirmer { approve: false }),
    });

    let summary = manager.initialize().await.expect("initialize");
    assert_eq!(summary.activated, 1);
    assert_eq!(summary.failed, 1);

    let broken = manager.extension_status("ext.broken").await.expect("broken status");
    assert!(!broken.loaded);
    assert_eq!(broken.last_error.as_deref(), Some("guest exploded"));
    let healthy = manager.extension_status("ext.widgets").await.expect("healthy status");
    assert!(healthy.loaded);
    assert_eq!(healthy.instance_id.as_deref(), Some("ext.widgets#1"));

    let mut responses = Vec::new();
    while responses.len() < 3 {
        if let GuestReport::Response {
            request_id,
            ok,
            error,
        } = next_report(&mut reports).await
        {
            responses.push((request_id, ok, error));
        }
    }
    responses.sort();
    assert_eq!(
        responses,
        vec![
            (
                "llm".to_string(),
                false,
                Some(
                    "Permission denied for extension \"Widgets\": cannot call the language model."
                        .to_string()
                )
            ),
            ("overlay".to_string(), true, None),
            ("widget".to_string(), true, None),
        ]
    );
    assert_eq!(surfaces.widget_count("ext.widgets#1"), 1);
    let overlay = surfaces.overlay().expect("overlay shown");
    assert_eq!(overlay.owner_id, "ext.widgets#1");

    assert!(surfaces.dispatch_overlay_action("go"));
    match next_report(&mut reports).await {
        GuestReport::HostRequest { method, params } => {
            assert_eq!(method, "ui_action");
            assert_eq!(params["surface"], json!("overlay"));
            assert_eq!(params["actionId"], json!("go"));
        }
        other => panic!("expected ui_action, got {other:?}"),
    }

    manager.shutdown().await;
    match next_report(&mut reports).await {
        GuestReport::HostRequest { method, .. } => assert_eq!(method, "deactivate"),
        other => panic!("expected deactivate, got {other:?}"),
    }
    assert_eq!(surfaces.widget_count("ext.widgets#1"), 0);
    assert!(surfaces.overlay().is_none());
    assert_eq!(manager.loaded_instance_id("ext.widgets").await, None);
}
