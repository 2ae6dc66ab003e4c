use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use xlext_permissions::{Capability, TrustLevel};
use xlext_sandbox::{
    ActivationOptions, ActiveExtension, AgentEventListener, AgentEventSubscription,
    CommandRegistration, DownloadFileRequest, ExtensionActivator, ExtensionSource,
    ExtensionToolExecutor, HostServices, HttpFetchRequest, HttpFetchResponse,
    LlmCompletionRequest, SkillSummary, ToastKind, ToolRegistration,
};

use super::{
    ExtensionRegistryDocument, ExtensionRegistryEntry, ExtensionRegistryStore,
    ExtensionRuntimeConfig, ExtensionRuntimeManager, ExtensionRuntimeManagerOptions,
    InMemoryRegistryStore, ProvenanceHostServices, RuntimeManagerError, RuntimeMode,
    StaticGrantConfirmer,
};

#[derive(Default)]
struct RecordingServices {
    tools: Mutex<Vec<ToolRegistration>>,
}

#[async_trait]
impl HostServices for RecordingServices {
    async fn register_command(
        &self,
        _extension_id: &str,
        _command: CommandRegistration,
    ) -> Result<()> {
        Ok(())
    }

    async fn register_tool(&self, _extension_id: &str, tool: ToolRegistration) -> Result<()> {
        self.tools.lock().expect("tools").push(tool);
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
        Ok(Value::Null)
    }

    async fn http_fetch(&self, _request: HttpFetchRequest) -> Result<HttpFetchResponse> {
        bail!("network disabled in tests")
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

struct FailingTool;

#[async_trait]
impl ExtensionToolExecutor for FailingTool {
    async fn execute(&self, _params: Value) -> Result<Value> {
        Err(anyhow!("sheet is locked"))
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail(&'static str),
    Panic,
}

#[derive(Default)]
struct ScriptedActivator {
    behaviors: BTreeMap<String, Behavior>,
    activations: Mutex<Vec<ActivationOptions>>,
    events: Arc<Mutex<Vec<String>>>,
    register_tool_on_activate: bool,
}

impl ScriptedActivator {
    fn with(behaviors: &[(&str, Behavior)]) -> Self {
        Self {
            behaviors: behaviors
                .iter()
                .map(|(id, behavior)| (id.to_string(), *behavior))
                .collect(),
            ..Self::default()
        }
    }

    fn activated_instances(&self) -> Vec<String> {
        self.activations
            .lock()
            .expect("activations")
            .iter()
            .map(|options| options.instance_id.clone())
            .collect()
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().expect("events").clone()
    }
}

struct FakeInstance {
    instance_id: String,
    events: Arc<Mutex<Vec<String>>>,
    disposed: AtomicBool,
}

#[async_trait]
impl ActiveExtension for FakeInstance {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn dispose(&self, graceful: bool) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.events
                .lock()
                .expect("events")
                .push(format!("dispose {} graceful={graceful}", self.instance_id));
        }
    }
}

#[async_trait]
impl ExtensionActivator for ScriptedActivator {
    async fn activate(&self, options: ActivationOptions) -> Result<Box<dyn ActiveExtension>> {
        self.activations
            .lock()
            .expect("activations")
            .push(options.clone());
        match self
            .behaviors
            .get(&options.extension_id)
            .copied()
            .unwrap_or(Behavior::Succeed)
        {
            Behavior::Succeed => {}
            Behavior::Fail(message) => bail!("{message}"),
            Behavior::Panic => panic!("activator exploded"),
        }
        if self.register_tool_on_activate {
            options
                .services
                .register_tool(
                    &options.extension_id,
                    ToolRegistration {
                        name: "fill_range".to_string(),
                        description: "Fills a range.".to_string(),
                        parameters: json!({ "type": "object" }),
                        executor: Arc::new(FailingTool),
                    },
                )
                .await?;
        }
        Ok(Box::new(FakeInstance {
            instance_id: options.instance_id,
            events: Arc::clone(&self.events),
            disposed: AtomicBool::new(false),
        }))
    }
}

fn inline_entry(id: &str, name: &str) -> ExtensionRegistryEntry {
    ExtensionRegistryEntry::new(
        id,
        name,
        ExtensionSource::Inline {
            code: "export default () => {}".to_string(),
        },
        TrustLevel::InlineCode,
    )
}

struct Fixture {
    manager: ExtensionRuntimeManager,
    store: Arc<InMemoryRegistryStore>,
    services: Arc<RecordingServices>,
    host: Arc<ScriptedActivator>,
    sandbox: Arc<ScriptedActivator>,
}

fn fixture(
    entries: Vec<ExtensionRegistryEntry>,
    config: ExtensionRuntimeConfig,
    host: ScriptedActivator,
    sandbox: ScriptedActivator,
    approve_high_risk: bool,
) -> Fixture {
    let store = Arc::new(InMemoryRegistryStore::new(ExtensionRegistryDocument {
        version: 1,
        items: entries,
    }));
    let services = Arc::new(RecordingServices::default());
    let host = Arc::new(host);
    let sandbox = Arc::new(sandbox);
    let manager = ExtensionRuntimeManager::new(ExtensionRuntimeManagerOptions {
        config,
        store: store.clone(),
        services: services.clone(),
        host_activator: host.clone(),
        sandbox_activator: sandbox.clone(),
        confirmer: Arc::new(StaticGrantConfirmer {
            approve: approve_high_risk,
        }),
    });
    Fixture {
        manager,
        store,
        services,
        host,
        sandbox,
    }
}

#[tokio::test]
async fn integration_initialize_isolates_failing_extension() {
    let mut disabled = inline_entry("ext.off", "Off");
    disabled.enabled = false;
    let builtin = ExtensionRegistryEntry::new(
        "ext.core",
        "Core",
        ExtensionSource::Module {
            specifier: "https://cdn.example.com/core.js".to_string(),
        },
        TrustLevel::Builtin,
    );
    let fixture = fixture(
        vec![
            inline_entry("ext.bad", "Bad"),
            inline_entry("ext.good", "Good"),
            disabled,
            builtin,
        ],
        ExtensionRuntimeConfig::default(),
        ScriptedActivator::default(),
        ScriptedActivator::with(&[("ext.bad", Behavior::Fail("sandbox bootstrap failed: boom"))]),
        false,
    );

    let summary = fixture.manager.initialize().await.expect("initialize");
    assert_eq!(summary.discovered, 4);
    assert_eq!(summary.activated, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped_disabled, 1);
    assert_eq!(
        summary.diagnostics,
        vec!["extension_id=ext.bad error=sandbox bootstrap failed: boom".to_string()]
    );

    let bad = fixture.manager.extension_status("ext.bad").await.expect("bad");
    assert!(!bad.loaded);
    assert_eq!(bad.last_error.as_deref(), Some("sandbox bootstrap failed: boom"));
    assert_eq!(bad.status_line(), "not loaded: sandbox bootstrap failed: boom");

    let good = fixture.manager.extension_status("ext.good").await.expect("good");
    assert!(good.loaded);
    assert_eq!(good.last_error, None);
    assert_eq!(good.runtime_mode, RuntimeMode::SandboxIframe);
    assert_eq!(good.status_line(), "loaded");

    let off = fixture.manager.extension_status("ext.off").await.expect("off");
    assert_eq!(off.status_line(), "disabled");

    assert_eq!(fixture.host.activated_instances(), vec!["ext.core#3".to_string()]);
    assert_eq!(
        fixture.sandbox.activated_instances(),
        vec!["ext.bad#1".to_string(), "ext.good#2".to_string()]
    );
}

#[tokio::test]
async fn functional_activation_options_carry_gate_owner_and_widget_generation() {
    let config = ExtensionRuntimeConfig {
        widget_api_v2: false,
        ..ExtensionRuntimeConfig::default()
    };
    let fixture = fixture(
        vec![inline_entry("ext.a", "Alpha")],
        config,
        ScriptedActivator::default(),
        ScriptedActivator::default(),
        false,
    );
    fixture.manager.initialize().await.expect("initialize");
    let options = fixture.sandbox.activations.lock().expect("activations")[0].clone();
    assert_eq!(options.widget_owner_id.as_deref(), Some("ext.a#1"));
    assert!(!options.widget_api_v2_enabled);
    assert!(options.is_capability_enabled(Capability::UiOverlay));
    assert!(!options.is_capability_enabled(Capability::ToolsRegister));
    assert_eq!(
        options.format_capability_error(Capability::ToolsRegister),
        "Permission denied for extension \"Alpha\": cannot register tools."
    );
}

#[tokio::test]
async fn functional_kill_switch_routes_untrusted_sources_to_host() {
    let config = ExtensionRuntimeConfig {
        sandbox_kill_switch: true,
        ..ExtensionRuntimeConfig::default()
    };
    let fixture = fixture(
        vec![inline_entry("ext.a", "A")],
        config,
        ScriptedActivator::default(),
        ScriptedActivator::default(),
        false,
    );
    fixture.manager.initialize().await.expect("initialize");
    assert_eq!(fixture.host.activated_instances(), vec!["ext.a#1".to_string()]);
    assert!(fixture.sandbox.activated_instances().is_empty());
    let status = fixture.manager.extension_status("ext.a").await.expect("status");
    assert_eq!(status.runtime_mode, RuntimeMode::Host);
}

#[tokio::test]
async fn regression_activation_panic_does_not_abort_initialize() {
    let fixture = fixture(
        vec![inline_entry("ext.panics", "P"), inline_entry("ext.ok", "Ok")],
        ExtensionRuntimeConfig::default(),
        ScriptedActivator::default(),
        ScriptedActivator::with(&[("ext.panics", Behavior::Panic)]),
        false,
    );
    let summary = fixture.manager.initialize().await.expect("initialize");
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.activated, 1);
    let status = fixture.manager.extension_status("ext.panics").await.expect("status");
    assert_eq!(
        status.last_error.as_deref(),
        Some("extension activation panicked")
    );
}

#[tokio::test]
async fn functional_host_runtime_tools_are_attributed() {
    let mut host = ScriptedActivator::default();
    host.register_tool_on_activate = true;
    let builtin = ExtensionRegistryEntry::new(
        "ext.sheets",
        "Sheets",
        ExtensionSource::Module {
            specifier: "https://cdn.example.com/sheets.js".to_string(),
        },
        TrustLevel::LocalModule,
    );
    let fixture = fixture(
        vec![builtin],
        ExtensionRuntimeConfig::default(),
        host,
        ScriptedActivator::default(),
        false,
    );
    fixture.manager.initialize().await.expect("initialize");
    let tool = fixture.services.tools.lock().expect("tools")[0].clone();
    assert_eq!(
        tool.description,
        "Fills a range.\n\nSource: extension \"Sheets\" (ext.sheets)."
    );
    let error = tool.executor.execute(json!({})).await.expect_err("failure");
    assert_eq!(
        error.to_string(),
        "[Extension Sheets] Tool \"fill_range\" failed: sheet is locked"
    );
}

#[tokio::test]
async fn unit_provenance_wrapper_handles_empty_description() {
    let services = Arc::new(RecordingServices::default());
    let wrapped = ProvenanceHostServices::new(services.clone(), "ext.x", "X");
    wrapped
        .register_tool(
            "ext.x",
            ToolRegistration {
                name: "t".to_string(),
                description: "  ".to_string(),
                parameters: json!({ "type": "object" }),
                executor: Arc::new(FailingTool),
            },
        )
        .await
        .expect("register");
    assert_eq!(
        services.tools.lock().expect("tools")[0].description,
        "Source: extension \"X\" (ext.x)."
    );
}

#[tokio::test]
async fn functional_high_risk_grant_requires_confirmation() {
    let declined = fixture(
        vec![inline_entry("ext.a", "Alpha")],
        ExtensionRuntimeConfig::default(),
        ScriptedActivator::default(),
        ScriptedActivator::default(),
        false,
    );
    declined.manager.initialize().await.expect("initialize");
    let error = declined
        .manager
        .set_extension_capability("ext.a", Capability::ToolsRegister, true)
        .await
        .expect_err("declined");
    assert!(matches!(error, RuntimeManagerError::ConfirmationDeclined { .. }));
    assert_eq!(
        error.to_string(),
        "granting tools.register to extension \"Alpha\" was not confirmed"
    );
    assert!(declined.store.snapshot().items[0].permissions.is_empty());
    assert_eq!(declined.sandbox.activated_instances().len(), 1);

    // Revoking never needs confirmation.
    declined
        .manager
        .set_extension_capability("ext.a", Capability::UiOverlay, false)
        .await
        .expect("revoke");

    let approved = fixture(
        vec![inline_entry("ext.a", "Alpha")],
        ExtensionRuntimeConfig::default(),
        ScriptedActivator::default(),
        ScriptedActivator::default(),
        true,
    );
    approved.manager.initialize().await.expect("initialize");
    let status = approved
        .manager
        .set_extension_capability("ext.a", Capability::ToolsRegister, true)
        .await
        .expect("approved");
    assert!(status.loaded);
    assert!(status.permissions.allows(Capability::ToolsRegister));
    assert_eq!(status.instance_id.as_deref(), Some("ext.a#2"));
    assert_eq!(
        approved.store.snapshot().items[0].permissions.get("tools.register"),
        Some(&true)
    );
    assert_eq!(
        approved.sandbox.events(),
        vec!["dispose ext.a#1 graceful=true".to_string()]
    );
}

#[tokio::test]
async fn functional_install_with_high_risk_overrides_is_confirmed() {
    let fixture = fixture(
        Vec::new(),
        ExtensionRuntimeConfig::default(),
        ScriptedActivator::default(),
        ScriptedActivator::default(),
        false,
    );
    let mut entry = inline_entry("ext.net", "Net");
    entry.permissions.insert("http.fetch".to_string(), true);
    let error = fixture
        .manager
        .install_extension(entry.clone())
        .await
        .expect_err("declined");
    assert!(matches!(error, RuntimeManagerError::ConfirmationDeclined { .. }));
    assert!(fixture.store.snapshot().items.is_empty());

    entry.permissions.clear();
    let status = fixture.manager.install_extension(entry).await.expect("install");
    assert!(status.loaded);
    assert_eq!(fixture.store.snapshot().items.len(), 1);
}

#[tokio::test]
async fn functional_lifecycle_disposes_prior_instance_before_each_transition() {
    let fixture = fixture(
        vec![inline_entry("ext.a", "A"), inline_entry("ext.b", "B")],
        ExtensionRuntimeConfig::default(),
        ScriptedActivator::default(),
        ScriptedActivator::default(),
        false,
    );
    fixture.manager.initialize().await.expect("initialize");

    let reloaded = fixture.manager.reload_extension("ext.a").await.expect("reload");
    assert_eq!(reloaded.instance_id.as_deref(), Some("ext.a#3"));

    let disabled = fixture
        .manager
        .set_extension_enabled("ext.a", false)
        .await
        .expect("disable");
    assert!(!disabled.loaded);
    assert_eq!(disabled.status_line(), "disabled");
    assert_eq!(fixture.manager.loaded_instance_id("ext.a").await, None);
    assert!(!fixture.store.snapshot().items[0].enabled);

    fixture.manager.uninstall_extension("ext.b").await.expect("uninstall");
    assert!(fixture.manager.extension_status("ext.b").await.is_none());
    assert!(fixture.store.snapshot().find("ext.b").is_none());

    assert_eq!(
        fixture.sandbox.events(),
        vec![
            "dispose ext.a#1 graceful=true".to_string(),
            "dispose ext.a#3 graceful=true".to_string(),
            "dispose ext.b#2 graceful=true".to_string(),
        ]
    );

    let error = fixture
        .manager
        .uninstall_extension("ext.missing")
        .await
        .expect_err("unknown");
    assert_eq!(error.to_string(), "unknown extension 'ext.missing'");
}

#[tokio::test]
async fn regression_reinitialize_disposes_instances_removed_from_the_store() {
    let fixture = fixture(
        vec![inline_entry("ext.a", "A"), inline_entry("ext.b", "B")],
        ExtensionRuntimeConfig::default(),
        ScriptedActivator::default(),
        ScriptedActivator::default(),
        false,
    );
    fixture.manager.initialize().await.expect("initialize");

    let mut document = fixture.store.snapshot();
    document.items.retain(|entry| entry.id != "ext.b");
    fixture.store.save(&document).await.expect("external removal");

    let summary = fixture.manager.initialize().await.expect("reinitialize");
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.activated, 1);
    assert_eq!(
        fixture.sandbox.events(),
        vec![
            "dispose ext.b#2 graceful=true".to_string(),
            "dispose ext.a#1 graceful=true".to_string(),
        ]
    );
    assert_eq!(fixture.manager.loaded_instance_id("ext.b").await, None);
    assert!(fixture.manager.extension_status("ext.b").await.is_none());
    assert_eq!(
        fixture.manager.loaded_instance_id("ext.a").await.as_deref(),
        Some("ext.a#3")
    );
}

#[tokio::test]
async fn functional_shutdown_disposes_every_running_instance() {
    let fixture = fixture(
        vec![inline_entry("ext.a", "A"), inline_entry("ext.b", "B")],
        ExtensionRuntimeConfig::default(),
        ScriptedActivator::default(),
        ScriptedActivator::default(),
        false,
    );
    fixture.manager.initialize().await.expect("initialize");
    fixture.manager.shutdown().await;
    assert_eq!(fixture.sandbox.events().len(), 2);
    for status in fixture.manager.extension_statuses().await {
        assert!(!status.loaded);
        assert_eq!(status.instance_id, None);
    }
}
