//! Attribution wrapper for extensions running host-side.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use xlext_sandbox::{
    AgentEventListener, AgentEventSubscription, CommandRegistration, DownloadFileRequest,
    ExtensionToolExecutor, HostServices, HttpFetchRequest, HttpFetchResponse,
    LlmCompletionRequest, SkillSummary, ToastKind, ToolRegistration,
};

/// Appends the provenance line to a tool description.
pub fn tool_description_with_provenance(
    description: &str,
    extension_name: &str,
    extension_id: &str,
) -> String {
    let source = format!("Source: extension \"{extension_name}\" ({extension_id}).");
    let description = description.trim_end();
    if description.is_empty() {
        source
    } else {
        format!("{description}\n\n{source}")
    }
}

pub fn format_tool_failure(extension_name: &str, tool_name: &str, message: &str) -> String {
    format!("[Extension {extension_name}] Tool \"{tool_name}\" failed: {message}")
}

struct AttributedToolExecutor {
    extension_name: String,
    tool_name: String,
    inner: Arc<dyn ExtensionToolExecutor>,
}

#[async_trait]
impl ExtensionToolExecutor for AttributedToolExecutor {
    async fn execute(&self, params: Value) -> Result<Value> {
        self.inner.execute(params).await.map_err(|error| {
            anyhow!(format_tool_failure(
                &self.extension_name,
                &self.tool_name,
                &error.to_string()
            ))
        })
    }
}

/// [`HostServices`] decorator that stamps every registered tool with the
/// extension's name and id, in its description and in its failures.
pub struct ProvenanceHostServices {
    inner: Arc<dyn HostServices>,
    extension_id: String,
    extension_name: String,
}

impl ProvenanceHostServices {
    pub fn new(
        inner: Arc<dyn HostServices>,
        extension_id: impl Into<String>,
        extension_name: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            extension_id: extension_id.into(),
            extension_name: extension_name.into(),
        }
    }
}

#[async_trait]
impl HostServices for ProvenanceHostServices {
    async fn register_command(
        &self,
        extension_id: &str,
        command: CommandRegistration,
    ) -> Result<()> {
        self.inner.register_command(extension_id, command).await
    }

    async fn register_tool(&self, extension_id: &str, tool: ToolRegistration) -> Result<()> {
        let attributed = ToolRegistration {
            description: tool_description_with_provenance(
                &tool.description,
                &self.extension_name,
                &self.extension_id,
            ),
            executor: Arc::new(AttributedToolExecutor {
                extension_name: self.extension_name.clone(),
                tool_name: tool.name.clone(),
                inner: tool.executor,
            }),
            name: tool.name,
            parameters: tool.parameters,
        };
        self.inner.register_tool(extension_id, attributed).await
    }

    async fn unregister_tool(&self, extension_id: &str, name: &str) -> Result<()> {
        self.inner.unregister_tool(extension_id, name).await
    }

    fn subscribe_agent_events(
        &self,
        listener: AgentEventListener,
    ) -> Result<AgentEventSubscription> {
        self.inner.subscribe_agent_events(listener)
    }

    async fn llm_complete(&self, request: LlmCompletionRequest) -> Result<Value> {
        self.inner.llm_complete(request).await
    }

    async fn http_fetch(&self, request: HttpFetchRequest) -> Result<HttpFetchResponse> {
        self.inner.http_fetch(request).await
    }

    async fn storage_get(&self, extension_id: &str, key: &str) -> Result<Option<Value>> {
        self.inner.storage_get(extension_id, key).await
    }

    async fn storage_set(&self, extension_id: &str, key: &str, value: Value) -> Result<()> {
        self.inner.storage_set(extension_id, key, value).await
    }

    async fn storage_delete(&self, extension_id: &str, key: &str) -> Result<()> {
        self.inner.storage_delete(extension_id, key).await
    }

    async fn storage_keys(&self, extension_id: &str) -> Result<Vec<String>> {
        self.inner.storage_keys(extension_id).await
    }

    async fn clipboard_write_text(&self, text: &str) -> Result<()> {
        self.inner.clipboard_write_text(text).await
    }

    async fn inject_agent_context(&self, extension_id: &str, text: &str) -> Result<()> {
        self.inner.inject_agent_context(extension_id, text).await
    }

    async fn steer_agent(&self, text: &str) -> Result<()> {
        self.inner.steer_agent(text).await
    }

    async fn follow_up_agent(&self, text: &str) -> Result<()> {
        self.inner.follow_up_agent(text).await
    }

    async fn list_skills(&self) -> Result<Vec<SkillSummary>> {
        self.inner.list_skills().await
    }

    async fn read_skill(&self, name: &str) -> Result<String> {
        self.inner.read_skill(name).await
    }

    async fn install_skill(&self, name: &str, markdown: &str) -> Result<()> {
        self.inner.install_skill(name, markdown).await
    }

    async fn uninstall_skill(&self, name: &str) -> Result<()> {
        self.inner.uninstall_skill(name).await
    }

    async fn download_file(&self, request: DownloadFileRequest) -> Result<()> {
        self.inner.download_file(request).await
    }

    fn toast(&self, message: &str, kind: ToastKind) {
        self.inner.toast(message, kind);
    }
}
