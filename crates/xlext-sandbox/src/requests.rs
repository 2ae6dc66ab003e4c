//! Typed payloads for sandbox-to-host requests.

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use xlext_permissions::Capability;
use xlext_protocol::SandboxRpcMethod;
use xlext_surfaces::{UiNode, WidgetLayout};

use crate::{
    activation::{DownloadFileRequest, HttpFetchRequest, LlmCompletionRequest, ToastKind},
    error::SandboxHostError,
};

/// The one capability that gates `method`.
pub fn required_capability(method: SandboxRpcMethod) -> Capability {
    match method {
        SandboxRpcMethod::RegisterCommand => Capability::CommandsRegister,
        SandboxRpcMethod::RegisterTool | SandboxRpcMethod::UnregisterTool => {
            Capability::ToolsRegister
        }
        SandboxRpcMethod::SubscribeAgentEvents | SandboxRpcMethod::UnsubscribeAgentEvents => {
            Capability::AgentEventsRead
        }
        SandboxRpcMethod::LlmComplete => Capability::LlmComplete,
        SandboxRpcMethod::HttpFetch => Capability::HttpFetch,
        SandboxRpcMethod::StorageGet
        | SandboxRpcMethod::StorageSet
        | SandboxRpcMethod::StorageDelete
        | SandboxRpcMethod::StorageKeys => Capability::StorageReadWrite,
        SandboxRpcMethod::ClipboardWriteText => Capability::ClipboardWrite,
        SandboxRpcMethod::InjectAgentContext => Capability::AgentContextWrite,
        SandboxRpcMethod::SteerAgent => Capability::AgentSteer,
        SandboxRpcMethod::FollowUpAgent => Capability::AgentFollowUp,
        SandboxRpcMethod::ListSkills | SandboxRpcMethod::ReadSkill => Capability::SkillsRead,
        SandboxRpcMethod::InstallSkill | SandboxRpcMethod::UninstallSkill => {
            Capability::SkillsWrite
        }
        SandboxRpcMethod::DownloadFile => Capability::DownloadFile,
        SandboxRpcMethod::Toast => Capability::UiToast,
        SandboxRpcMethod::OverlayShow | SandboxRpcMethod::OverlayDismiss => Capability::UiOverlay,
        SandboxRpcMethod::WidgetShow
        | SandboxRpcMethod::WidgetDismiss
        | SandboxRpcMethod::WidgetUpsert
        | SandboxRpcMethod::WidgetRemove
        | SandboxRpcMethod::WidgetClear => Capability::UiWidget,
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCommandParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterToolParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolNameParams {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionParams {
    pub subscription_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageKeyParams {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSetParams {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TextParams {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SkillNameParams {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallSkillParams {
    pub name: String,
    pub markdown: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToastParams {
    pub message: String,
    #[serde(default)]
    pub kind: ToastKind,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Render tree or plain text for an overlay or legacy widget.
pub struct SurfaceContentParams {
    #[serde(default)]
    pub node: Option<UiNode>,
    #[serde(default)]
    pub text: Option<String>,
}

impl SurfaceContentParams {
    /// A structured `node` wins over `text`.
    pub fn into_node(self, method: SandboxRpcMethod) -> Result<UiNode, SandboxHostError> {
        match (self.node, self.text) {
            (Some(node), _) => Ok(node),
            (None, Some(text)) => Ok(UiNode::text(text)),
            (None, None) => Err(SandboxHostError::invalid_params(
                method.as_str(),
                "expected 'node' or 'text'",
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetUpsertParams {
    pub widget_id: String,
    #[serde(flatten)]
    pub content: SurfaceContentParams,
    #[serde(flatten)]
    pub layout: WidgetLayout,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetIdParams {
    pub widget_id: String,
}

#[derive(Debug, Clone, PartialEq)]
/// A sandbox-to-host request with its payload decoded for its method.
pub enum SandboxRpcRequest {
    RegisterCommand(RegisterCommandParams),
    RegisterTool(RegisterToolParams),
    UnregisterTool(ToolNameParams),
    SubscribeAgentEvents,
    UnsubscribeAgentEvents(SubscriptionParams),
    LlmComplete(LlmCompletionRequest),
    HttpFetch(HttpFetchRequest),
    StorageGet(StorageKeyParams),
    StorageSet(StorageSetParams),
    StorageDelete(StorageKeyParams),
    StorageKeys,
    ClipboardWriteText(TextParams),
    InjectAgentContext(TextParams),
    SteerAgent(TextParams),
    FollowUpAgent(TextParams),
    ListSkills,
    ReadSkill(SkillNameParams),
    InstallSkill(InstallSkillParams),
    UninstallSkill(SkillNameParams),
    DownloadFile(DownloadFileRequest),
    Toast(ToastParams),
    OverlayShow(SurfaceContentParams),
    OverlayDismiss,
    WidgetShow(SurfaceContentParams),
    WidgetDismiss,
    WidgetUpsert(WidgetUpsertParams),
    WidgetRemove(WidgetIdParams),
    WidgetClear,
}

fn decode<T: DeserializeOwned>(
    method: SandboxRpcMethod,
    params: Value,
) -> Result<T, SandboxHostError> {
    serde_json::from_value(params)
        .map_err(|error| SandboxHostError::invalid_params(method.as_str(), error.to_string()))
}

// Widget ids and tool names key host-side records, so they are compared trimmed.
fn trimmed(value: String) -> String {
    value.trim().to_string()
}

impl SandboxRpcRequest {
    /// Decodes `params` for `method`. Absent params decode as `{}`.
    pub fn parse(
        method: SandboxRpcMethod,
        params: Option<Value>,
    ) -> Result<Self, SandboxHostError> {
        let params = match params {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params) => params,
        };
        let request = match method {
            SandboxRpcMethod::RegisterCommand => Self::RegisterCommand(decode(method, params)?),
            SandboxRpcMethod::RegisterTool => Self::RegisterTool(decode(method, params)?),
            SandboxRpcMethod::UnregisterTool => {
                let params: ToolNameParams = decode(method, params)?;
                Self::UnregisterTool(ToolNameParams {
                    name: trimmed(params.name),
                })
            }
            SandboxRpcMethod::SubscribeAgentEvents => Self::SubscribeAgentEvents,
            SandboxRpcMethod::UnsubscribeAgentEvents => {
                Self::UnsubscribeAgentEvents(decode(method, params)?)
            }
            SandboxRpcMethod::LlmComplete => Self::LlmComplete(decode(method, params)?),
            SandboxRpcMethod::HttpFetch => Self::HttpFetch(decode(method, params)?),
            SandboxRpcMethod::StorageGet => Self::StorageGet(decode(method, params)?),
            SandboxRpcMethod::StorageSet => Self::StorageSet(decode(method, params)?),
            SandboxRpcMethod::StorageDelete => Self::StorageDelete(decode(method, params)?),
            SandboxRpcMethod::StorageKeys => Self::StorageKeys,
            SandboxRpcMethod::ClipboardWriteText => {
                Self::ClipboardWriteText(decode(method, params)?)
            }
            SandboxRpcMethod::InjectAgentContext => {
                Self::InjectAgentContext(decode(method, params)?)
            }
            SandboxRpcMethod::SteerAgent => Self::SteerAgent(decode(method, params)?),
            SandboxRpcMethod::FollowUpAgent => Self::FollowUpAgent(decode(method, params)?),
            SandboxRpcMethod::ListSkills => Self::ListSkills,
            SandboxRpcMethod::ReadSkill => Self::ReadSkill(decode(method, params)?),
            SandboxRpcMethod::InstallSkill => Self::InstallSkill(decode(method, params)?),
            SandboxRpcMethod::UninstallSkill => Self::UninstallSkill(decode(method, params)?),
            SandboxRpcMethod::DownloadFile => Self::DownloadFile(decode(method, params)?),
            SandboxRpcMethod::Toast => Self::Toast(decode(method, params)?),
            SandboxRpcMethod::OverlayShow => Self::OverlayShow(decode(method, params)?),
            SandboxRpcMethod::OverlayDismiss => Self::OverlayDismiss,
            SandboxRpcMethod::WidgetShow => Self::WidgetShow(decode(method, params)?),
            SandboxRpcMethod::WidgetDismiss => Self::WidgetDismiss,
            SandboxRpcMethod::WidgetUpsert => {
                let mut params: WidgetUpsertParams = decode(method, params)?;
                params.widget_id = trimmed(params.widget_id);
                Self::WidgetUpsert(params)
            }
            SandboxRpcMethod::WidgetRemove => {
                let params: WidgetIdParams = decode(method, params)?;
                Self::WidgetRemove(WidgetIdParams {
                    widget_id: trimmed(params.widget_id),
                })
            }
            SandboxRpcMethod::WidgetClear => Self::WidgetClear,
        };
        Ok(request)
    }

    /// Requests that only touch in-memory host state. These run inline, in
    /// arrival order, so a sandbox that fires `widget_upsert` then
    /// `widget_remove` without awaiting sees them applied in that order.
    pub fn runs_inline(&self) -> bool {
        matches!(
            self,
            Self::Toast(_)
                | Self::OverlayShow(_)
                | Self::OverlayDismiss
                | Self::WidgetShow(_)
                | Self::WidgetDismiss
                | Self::WidgetUpsert(_)
                | Self::WidgetRemove(_)
                | Self::WidgetClear
                | Self::SubscribeAgentEvents
                | Self::UnsubscribeAgentEvents(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use xlext_permissions::Capability;
    use xlext_protocol::SandboxRpcMethod;
    use xlext_surfaces::{UiNode, WidgetPlacement};

    use super::{required_capability, SandboxRpcRequest, ToolNameParams, WidgetIdParams};
    use crate::error::SandboxHostError;

    #[test]
    fn unit_every_method_maps_to_one_capability() {
        for method in SandboxRpcMethod::ALL {
            let capability = required_capability(*method);
            assert!(Capability::ALL.contains(&capability));
        }
        assert_eq!(
            required_capability(SandboxRpcMethod::OverlayShow),
            Capability::UiOverlay
        );
        assert_eq!(
            required_capability(SandboxRpcMethod::RegisterTool),
            Capability::ToolsRegister
        );
        assert_eq!(
            required_capability(SandboxRpcMethod::InstallSkill),
            Capability::SkillsWrite
        );
    }

    #[test]
    fn functional_widget_upsert_decodes_content_and_layout() {
        let request = SandboxRpcRequest::parse(
            SandboxRpcMethod::WidgetUpsert,
            Some(json!({
                "widgetId": "w1",
                "text": "hello",
                "placement": "below-input",
                "order": 3,
                "maxHeightPx": 240
            })),
        )
        .expect("parse");
        let SandboxRpcRequest::WidgetUpsert(params) = request else {
            panic!("expected widget upsert");
        };
        assert_eq!(params.widget_id, "w1");
        assert_eq!(params.layout.placement, WidgetPlacement::BelowInput);
        assert_eq!(params.layout.order, 3);
        assert_eq!(params.layout.max_height_px, Some(240));
        assert_eq!(
            params
                .content
                .into_node(SandboxRpcMethod::WidgetUpsert)
                .expect("node"),
            UiNode::text("hello")
        );
    }

    #[test]
    fn regression_widget_ids_and_tool_names_decode_trimmed() {
        let upsert = SandboxRpcRequest::parse(
            SandboxRpcMethod::WidgetUpsert,
            Some(json!({ "widgetId": " w1 ", "text": "x" })),
        )
        .expect("parse");
        let SandboxRpcRequest::WidgetUpsert(params) = upsert else {
            panic!("expected widget upsert");
        };
        assert_eq!(params.widget_id, "w1");
        assert_eq!(
            SandboxRpcRequest::parse(
                SandboxRpcMethod::WidgetRemove,
                Some(json!({ "widgetId": "\tw1 " }))
            )
            .expect("parse"),
            SandboxRpcRequest::WidgetRemove(WidgetIdParams {
                widget_id: "w1".to_string()
            })
        );
        assert_eq!(
            SandboxRpcRequest::parse(
                SandboxRpcMethod::UnregisterTool,
                Some(json!({ "name": " sum_range " }))
            )
            .expect("parse"),
            SandboxRpcRequest::UnregisterTool(ToolNameParams {
                name: "sum_range".to_string()
            })
        );
    }

    #[test]
    fn regression_missing_params_decode_as_empty_object() {
        assert_eq!(
            SandboxRpcRequest::parse(SandboxRpcMethod::WidgetClear, None).expect("parse"),
            SandboxRpcRequest::WidgetClear
        );
        let error = SandboxRpcRequest::parse(SandboxRpcMethod::StorageGet, None)
            .expect_err("key is required");
        assert!(matches!(
            error,
            SandboxHostError::InvalidParams { ref method, .. } if method == "storage_get"
        ));
        let empty_overlay =
            SandboxRpcRequest::parse(SandboxRpcMethod::OverlayShow, Some(json!({})))
                .expect("parse");
        let SandboxRpcRequest::OverlayShow(content) = empty_overlay else {
            panic!("expected overlay show");
        };
        assert!(content.into_node(SandboxRpcMethod::OverlayShow).is_err());
    }
}
