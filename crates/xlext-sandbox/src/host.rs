//! Per-instance host side of the sandbox RPC bridge.
//!
//! One [`SandboxRuntimeHost`] owns one isolated context: it filters inbound
//! traffic, services capability-checked sandbox requests, correlates
//! host-initiated requests through a [`PendingRequestTable`], forwards UI
//! actions, and tears everything down exactly once.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    panic::AssertUnwindSafe,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use xlext_protocol::{
    parse_envelope, Envelope, EnvelopeBody, EnvelopeDirection, HostRpcMethod, SandboxEvent,
    SandboxRpcMethod, HOST_EVENT_AGENT_EVENT,
};
use xlext_surfaces::{
    ActionHandler, SurfaceManager, SurfaceRender, WidgetUpsert, LEGACY_WIDGET_ID,
};

use crate::{
    activation::{
        ActivationOptions, ActiveExtension, AgentEventListener, AgentEventSubscription,
        CommandRegistration, ExtensionCommandHandler, ExtensionToolExecutor, ToolRegistration,
    },
    bootstrap::{render_bootstrap_document, SandboxBootstrap},
    context::{
        ContextId, InboundMessage, ListenerId, SandboxContext, SandboxContextLauncher,
        SandboxContextSpec, SandboxMessageBus, SANDBOX_FLAGS,
    },
    error::SandboxHostError,
    pending::PendingRequestTable,
    registrations::{
        normalize_extension_command_name, validate_extension_tool_name, validate_tool_arguments,
        validate_tool_parameters_schema,
    },
    requests::{required_capability, SandboxRpcRequest, SurfaceContentParams},
};

pub const DEFAULT_BOOTSTRAP_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Timeouts applied by one sandbox host.
pub struct SandboxHostTimeouts {
    pub bootstrap: Duration,
    pub request: Duration,
    pub deactivate: Duration,
}

impl Default for SandboxHostTimeouts {
    fn default() -> Self {
        Self {
            bootstrap: Duration::from_millis(DEFAULT_BOOTSTRAP_TIMEOUT_MS),
            request: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            deactivate: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Collaborators and settings for [`SandboxRuntimeHost::start`].
#[derive(Clone)]
pub struct SandboxHostOptions {
    pub activation: ActivationOptions,
    pub surfaces: Arc<SurfaceManager>,
    pub launcher: Arc<dyn SandboxContextLauncher>,
    pub bus: SandboxMessageBus,
    pub timeouts: SandboxHostTimeouts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SurfaceSlot {
    Overlay,
    Widget(String),
}

impl SurfaceSlot {
    fn action_params(&self, action_id: &str, generation: u64) -> Value {
        match self {
            Self::Overlay => json!({
                "surface": "overlay",
                "actionId": action_id,
                "generation": generation,
            }),
            Self::Widget(widget_id) => json!({
                "surface": "widget",
                "widgetId": widget_id,
                "actionId": action_id,
                "generation": generation,
            }),
        }
    }
}

struct HostInner {
    activation: ActivationOptions,
    surfaces: Arc<SurfaceManager>,
    bus: SandboxMessageBus,
    timeouts: SandboxHostTimeouts,
    runtime: Handle,
    context_id: ContextId,
    listener_id: ListenerId,
    context: Mutex<Option<Arc<dyn SandboxContext>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    pending: PendingRequestTable<Value, SandboxHostError>,
    readiness: watch::Sender<Readiness>,
    subscriptions: Mutex<BTreeMap<String, AgentEventSubscription>>,
    next_subscription: AtomicU64,
    registered_tools: Mutex<BTreeSet<String>>,
    surface_renders: Mutex<HashMap<SurfaceSlot, SurfaceRender>>,
    disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host side of one sandboxed extension instance.
#[derive(Clone)]
pub struct SandboxRuntimeHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for SandboxRuntimeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntimeHost")
            .field("instance_id", &self.inner.activation.instance_id)
            .field("context_id", &self.inner.context_id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl SandboxRuntimeHost {
    /// Launches the isolated context and starts servicing its traffic.
    ///
    /// The bus listener is registered before launch, so a `ready` event posted
    /// during bootstrap is buffered rather than lost.
    pub async fn start(options: SandboxHostOptions) -> Result<Self, SandboxHostError> {
        let SandboxHostOptions {
            activation,
            surfaces,
            launcher,
            bus,
            timeouts,
        } = options;
        let bootstrap = SandboxBootstrap::new(
            &activation.instance_id,
            activation.source.clone(),
            activation.widget_api_v2_enabled,
        );
        let bootstrap_document = render_bootstrap_document(&bootstrap)?;
        let context_id = ContextId::next();
        let (listener_id, inbound) = bus.add_listener();
        let (readiness, _) = watch::channel(Readiness::Pending);

        let inner = Arc::new(HostInner {
            activation,
            surfaces,
            bus: bus.clone(),
            timeouts,
            runtime: Handle::current(),
            context_id,
            listener_id,
            context: Mutex::new(None),
            pump: Mutex::new(None),
            pending: PendingRequestTable::new(),
            readiness,
            subscriptions: Mutex::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(0),
            registered_tools: Mutex::new(BTreeSet::new()),
            surface_renders: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        });

        let spec = SandboxContextSpec {
            context_id,
            sandbox_flags: SANDBOX_FLAGS,
            bootstrap,
            bootstrap_document,
        };
        let context = match launcher.launch(spec, bus.clone()).await {
            Ok(context) => context,
            Err(error) => {
                bus.remove_listener(listener_id);
                return Err(SandboxHostError::Bootstrap {
                    message: format!("failed to launch extension sandbox: {error}"),
                });
            }
        };
        *lock(&inner.context) = Some(context);
        let pump = tokio::spawn(run_inbound_pump(Arc::downgrade(&inner), inbound));
        *lock(&inner.pump) = Some(pump);
        debug!(
            instance_id = %inner.activation.instance_id,
            context_id = %context_id,
            "extension sandbox launched"
        );
        Ok(Self { inner })
    }

    /// Starts the sandbox and waits for its readiness handshake. A failed
    /// handshake disposes the instance before the error is returned.
    pub async fn activate(options: SandboxHostOptions) -> Result<Self, SandboxHostError> {
        let host = Self::start(options).await?;
        if let Err(error) = host.wait_until_ready().await {
            host.dispose(false).await;
            return Err(error);
        }
        info!(
            instance_id = %host.instance_id(),
            extension_id = %host.inner.activation.extension_id,
            "extension sandbox ready"
        );
        Ok(host)
    }

    /// Resolves on the sandbox `ready` event; fails on an `error` event or
    /// when the bootstrap timeout elapses first.
    pub async fn wait_until_ready(&self) -> Result<(), SandboxHostError> {
        let timeout = self.inner.timeouts.bootstrap;
        let mut receiver = self.inner.readiness.subscribe();
        let outcome = tokio::time::timeout(
            timeout,
            receiver.wait_for(|state| *state != Readiness::Pending),
        )
        .await;
        match outcome {
            Err(_) => Err(SandboxHostError::BootstrapTimeout {
                timeout_ms: duration_ms(timeout),
            }),
            Ok(Err(_)) => Err(SandboxHostError::Disposed),
            Ok(Ok(state)) => match &*state {
                Readiness::Ready => Ok(()),
                Readiness::Failed(message) => Err(SandboxHostError::Bootstrap {
                    message: message.clone(),
                }),
                Readiness::Pending | Readiness::Disposed => Err(SandboxHostError::Disposed),
            },
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.activation.instance_id
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.context_id
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.readiness.borrow() == Readiness::Ready
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    pub fn registered_tools(&self) -> Vec<String> {
        lock(&self.inner.registered_tools).iter().cloned().collect()
    }

    /// Issues a host-to-sandbox request and waits for its correlated response.
    pub async fn call_sandbox(
        &self,
        method: HostRpcMethod,
        params: Value,
    ) -> Result<Value, SandboxHostError> {
        self.inner.call_sandbox(method, params).await
    }

    /// Tears the instance down. Later calls are no-ops.
    pub async fn dispose(&self, graceful_deactivate: bool) {
        self.inner.dispose(graceful_deactivate).await;
    }
}

#[async_trait]
impl ActiveExtension for SandboxRuntimeHost {
    fn instance_id(&self) -> &str {
        SandboxRuntimeHost::instance_id(self)
    }

    async fn dispose(&self, graceful: bool) {
        SandboxRuntimeHost::dispose(self, graceful).await;
    }
}

async fn run_inbound_pump(
    host: Weak<HostInner>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(host) = host.upgrade() else {
            break;
        };
        host.handle_inbound(message);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl HostInner {
    fn instance_id(&self) -> &str {
        &self.activation.instance_id
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn handle_inbound(self: &Arc<Self>, message: InboundMessage) {
        if message.source != self.context_id {
            debug!(
                instance_id = %self.instance_id(),
                source = %message.source,
                reason = "foreign_source",
                "dropped inbound sandbox message"
            );
            return;
        }
        let Some(envelope) = parse_envelope(&message.data) else {
            debug!(
                instance_id = %self.instance_id(),
                reason = "invalid_envelope",
                "dropped inbound sandbox message"
            );
            return;
        };
        if envelope.instance_id != self.activation.instance_id {
            debug!(
                instance_id = %self.instance_id(),
                envelope_instance_id = %envelope.instance_id,
                reason = "foreign_instance",
                "dropped inbound sandbox message"
            );
            return;
        }
        if envelope.direction != EnvelopeDirection::SandboxToHost {
            debug!(
                instance_id = %self.instance_id(),
                reason = "wrong_direction",
                "dropped inbound sandbox message"
            );
            return;
        }

        match envelope.body {
            EnvelopeBody::Response { ref request_id, .. } => {
                let request_id = request_id.clone();
                let settled = self.pending.settle_with(&request_id, |method| {
                    match &envelope.body {
                        EnvelopeBody::Response {
                            ok: true, result, ..
                        } => Ok(result.clone().unwrap_or(Value::Null)),
                        body => Err(SandboxHostError::Sandbox {
                            method: method.to_string(),
                            message: body.error_message().unwrap_or_else(|| {
                                format!("extension sandbox request '{method}' failed")
                            }),
                        }),
                    }
                });
                if !settled {
                    debug!(
                        instance_id = %self.instance_id(),
                        request_id = %request_id,
                        "ignored late or unknown sandbox response"
                    );
                }
            }
            _ if self.is_disposed() => {
                debug!(
                    instance_id = %self.instance_id(),
                    "ignored sandbox message after dispose"
                );
            }
            EnvelopeBody::Event { event, data } => self.handle_event(&event, data),
            EnvelopeBody::Request {
                request_id,
                method,
                params,
            } => self.handle_request(request_id, method, params),
        }
    }

    fn handle_event(&self, event: &str, data: Option<Value>) {
        match SandboxEvent::from_str(event) {
            Ok(SandboxEvent::Ready) => {
                self.readiness.send_if_modified(|state| {
                    if *state == Readiness::Pending {
                        *state = Readiness::Ready;
                        true
                    } else {
                        false
                    }
                });
            }
            Ok(SandboxEvent::Error) => {
                let message = data
                    .as_ref()
                    .and_then(|data| data.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| "extension sandbox reported an error".to_string());
                let failed_bootstrap = self.readiness.send_if_modified(|state| {
                    if *state == Readiness::Pending {
                        *state = Readiness::Failed(message.clone());
                        true
                    } else {
                        false
                    }
                });
                if !failed_bootstrap {
                    warn!(
                        instance_id = %self.instance_id(),
                        error = %message,
                        "extension sandbox reported an error"
                    );
                }
            }
            Err(_) => {
                debug!(
                    instance_id = %self.instance_id(),
                    event,
                    "ignored unknown sandbox event"
                );
            }
        }
    }

    fn handle_request(self: &Arc<Self>, request_id: String, method: String, params: Option<Value>) {
        let request = match self.prepare_request(&method, params) {
            Ok(request) => request,
            Err(error) => {
                self.send_response(&request_id, Err(error));
                return;
            }
        };
        if request.runs_inline() {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| self.execute_inline(request)))
                    .unwrap_or_else(|_| Err(panicked(&method)));
            self.send_response(&request_id, outcome);
            return;
        }
        let host = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(host.execute_async(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(panicked(&method)));
            host.send_response(&request_id, outcome);
        });
    }

    /// Resolves the method, checks its capability, then decodes params. No
    /// host state is touched before the capability check passes.
    fn prepare_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<SandboxRpcRequest, SandboxHostError> {
        let method = SandboxRpcMethod::from_str(method).map_err(|error| {
            SandboxHostError::UnsupportedMethod {
                method: error.method,
            }
        })?;
        let capability = required_capability(method);
        if let Err(message) = self.activation.capabilities.check(capability) {
            warn!(
                instance_id = %self.instance_id(),
                method = %method,
                capability = %capability,
                "extension capability denied"
            );
            return Err(SandboxHostError::CapabilityDenied {
                capability,
                message,
            });
        }
        SandboxRpcRequest::parse(method, params)
    }

    fn send_response(&self, request_id: &str, outcome: Result<Value, SandboxHostError>) {
        let envelope = match outcome {
            Ok(result) => Envelope::response_ok(
                self.instance_id(),
                EnvelopeDirection::HostToSandbox,
                request_id,
                result,
            ),
            Err(error) => {
                debug!(
                    instance_id = %self.instance_id(),
                    request_id,
                    error = %error,
                    "sandbox request failed"
                );
                Envelope::response_error(
                    self.instance_id(),
                    EnvelopeDirection::HostToSandbox,
                    request_id,
                    error.to_string(),
                )
            }
        };
        if let Err(error) = self.post(&envelope) {
            debug!(
                instance_id = %self.instance_id(),
                request_id,
                error = %error,
                "failed to deliver sandbox response"
            );
        }
    }

    fn post(&self, envelope: &Envelope) -> Result<(), SandboxHostError> {
        let context = lock(&self.context)
            .clone()
            .ok_or_else(|| SandboxHostError::Transport {
                message: "extension sandbox context is not attached".to_string(),
            })?;
        context
            .post_message(envelope.to_value())
            .map_err(|error| SandboxHostError::Transport {
                message: error.to_string(),
            })
    }

    fn post_event(&self, event: &str, data: Value) {
        let envelope = Envelope::event(
            self.instance_id(),
            EnvelopeDirection::HostToSandbox,
            event,
            Some(data),
        );
        if let Err(error) = self.post(&envelope) {
            debug!(
                instance_id = %self.instance_id(),
                event,
                error = %error,
                "failed to deliver sandbox event"
            );
        }
    }

    async fn call_sandbox(
        &self,
        method: HostRpcMethod,
        params: Value,
    ) -> Result<Value, SandboxHostError> {
        if self.is_disposed() {
            return Err(SandboxHostError::Disposed);
        }
        self.request_sandbox(method, params, self.timeouts.request).await
    }

    async fn request_sandbox(
        &self,
        method: HostRpcMethod,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, SandboxHostError> {
        let (request_id, outcome) = self.pending.register(method.as_str());
        let envelope = Envelope::request(
            self.instance_id(),
            EnvelopeDirection::HostToSandbox,
            request_id.as_str(),
            method.as_str(),
            Some(params),
        );
        if let Err(error) = self.post(&envelope) {
            self.pending.remove(&request_id);
            return Err(error);
        }
        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SandboxHostError::Disposed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(SandboxHostError::Timeout {
                    method: method.as_str().to_string(),
                    timeout_ms: duration_ms(timeout),
                })
            }
        }
    }

    fn execute_inline(
        self: &Arc<Self>,
        request: SandboxRpcRequest,
    ) -> Result<Value, SandboxHostError> {
        let owner_id = self.activation.surface_owner_id().to_string();
        match request {
            SandboxRpcRequest::Toast(params) => {
                self.activation.services.toast(&params.message, params.kind);
                Ok(Value::Null)
            }
            SandboxRpcRequest::SubscribeAgentEvents => self.subscribe_agent_events(),
            SandboxRpcRequest::UnsubscribeAgentEvents(params) => {
                let subscription = lock(&self.subscriptions).remove(&params.subscription_id);
                let removed = subscription.is_some();
                if let Some(subscription) = subscription {
                    subscription.unsubscribe();
                }
                Ok(json!({ "removed": removed }))
            }
            SandboxRpcRequest::OverlayShow(content) => {
                let node = content.into_node(SandboxRpcMethod::OverlayShow)?;
                let slot = SurfaceSlot::Overlay;
                let (handler, generation) = self.action_handler(slot.clone());
                let render = self
                    .surfaces
                    .show_overlay(&owner_id, node, Some(handler))
                    .map_err(|error| surface_error(SandboxRpcMethod::OverlayShow, error))?;
                Ok(self.record_render(slot, render, &generation))
            }
            SandboxRpcRequest::OverlayDismiss => {
                lock(&self.surface_renders).remove(&SurfaceSlot::Overlay);
                Ok(json!({ "dismissed": self.surfaces.dismiss_overlay() }))
            }
            SandboxRpcRequest::WidgetShow(content) => self.show_legacy_widget(&owner_id, content),
            SandboxRpcRequest::WidgetDismiss => {
                lock(&self.surface_renders)
                    .remove(&SurfaceSlot::Widget(LEGACY_WIDGET_ID.to_string()));
                Ok(json!({ "dismissed": self.surfaces.dismiss_widget(&owner_id) }))
            }
            SandboxRpcRequest::WidgetUpsert(params) => {
                self.require_widget_api_v2(SandboxRpcMethod::WidgetUpsert)?;
                let node = params.content.into_node(SandboxRpcMethod::WidgetUpsert)?;
                let slot = SurfaceSlot::Widget(params.widget_id.clone());
                let (handler, generation) = self.action_handler(slot.clone());
                let render = self
                    .surfaces
                    .upsert_widget(WidgetUpsert {
                        owner_id,
                        widget_id: params.widget_id,
                        node,
                        on_action: Some(handler),
                        layout: params.layout,
                    })
                    .map_err(|error| surface_error(SandboxRpcMethod::WidgetUpsert, error))?;
                Ok(self.record_render(slot, render, &generation))
            }
            SandboxRpcRequest::WidgetRemove(params) => {
                self.require_widget_api_v2(SandboxRpcMethod::WidgetRemove)?;
                lock(&self.surface_renders).remove(&SurfaceSlot::Widget(params.widget_id.clone()));
                Ok(json!({
                    "removed": self.surfaces.remove_widget(&owner_id, &params.widget_id)
                }))
            }
            SandboxRpcRequest::WidgetClear => {
                self.require_widget_api_v2(SandboxRpcMethod::WidgetClear)?;
                lock(&self.surface_renders).retain(|slot, _| *slot == SurfaceSlot::Overlay);
                Ok(json!({ "removed": self.surfaces.clear_widgets(&owner_id) }))
            }
            other => Err(SandboxHostError::Handler {
                message: format!("request {other:?} cannot run inline"),
            }),
        }
    }

    async fn execute_async(
        self: &Arc<Self>,
        request: SandboxRpcRequest,
    ) -> Result<Value, SandboxHostError> {
        let services = Arc::clone(&self.activation.services);
        let extension_id = self.activation.extension_id.as_str();
        match request {
            SandboxRpcRequest::RegisterCommand(params) => {
                let name = normalize_extension_command_name(&params.name).map_err(|error| {
                    SandboxHostError::invalid_params("register_command", error.to_string())
                })?;
                let handler = Arc::new(SandboxCommandProxy {
                    host: Arc::downgrade(self),
                    name: name.clone(),
                });
                services
                    .register_command(
                        extension_id,
                        CommandRegistration {
                            name,
                            description: params.description,
                            handler,
                        },
                    )
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::RegisterTool(params) => {
                let name = validate_extension_tool_name(&params.name).map_err(|error| {
                    SandboxHostError::invalid_params("register_tool", error.to_string())
                })?;
                validate_tool_parameters_schema(&name, &params.parameters).map_err(|error| {
                    SandboxHostError::invalid_params("register_tool", error.to_string())
                })?;
                let executor = Arc::new(SandboxToolProxy {
                    host: Arc::downgrade(self),
                    name: name.clone(),
                    parameters: params.parameters.clone(),
                });
                services
                    .register_tool(
                        extension_id,
                        ToolRegistration {
                            name: name.clone(),
                            description: params.description,
                            parameters: params.parameters,
                            executor,
                        },
                    )
                    .await
                    .map_err(SandboxHostError::handler)?;
                lock(&self.registered_tools).insert(name);
                Ok(Value::Null)
            }
            SandboxRpcRequest::UnregisterTool(params) => {
                services
                    .unregister_tool(extension_id, &params.name)
                    .await
                    .map_err(SandboxHostError::handler)?;
                lock(&self.registered_tools).remove(&params.name);
                Ok(Value::Null)
            }
            SandboxRpcRequest::LlmComplete(request) => services
                .llm_complete(request)
                .await
                .map_err(SandboxHostError::handler),
            SandboxRpcRequest::HttpFetch(request) => {
                let response = services
                    .http_fetch(request)
                    .await
                    .map_err(SandboxHostError::handler)?;
                to_result_value(&response)
            }
            SandboxRpcRequest::StorageGet(params) => Ok(services
                .storage_get(extension_id, &params.key)
                .await
                .map_err(SandboxHostError::handler)?
                .unwrap_or(Value::Null)),
            SandboxRpcRequest::StorageSet(params) => {
                services
                    .storage_set(extension_id, &params.key, params.value)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::StorageDelete(params) => {
                services
                    .storage_delete(extension_id, &params.key)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::StorageKeys => {
                let keys = services
                    .storage_keys(extension_id)
                    .await
                    .map_err(SandboxHostError::handler)?;
                to_result_value(&keys)
            }
            SandboxRpcRequest::ClipboardWriteText(params) => {
                services
                    .clipboard_write_text(&params.text)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::InjectAgentContext(params) => {
                services
                    .inject_agent_context(extension_id, &params.text)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::SteerAgent(params) => {
                services
                    .steer_agent(&params.text)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::FollowUpAgent(params) => {
                services
                    .follow_up_agent(&params.text)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::ListSkills => {
                let skills = services
                    .list_skills()
                    .await
                    .map_err(SandboxHostError::handler)?;
                to_result_value(&skills)
            }
            SandboxRpcRequest::ReadSkill(params) => Ok(Value::String(
                services
                    .read_skill(&params.name)
                    .await
                    .map_err(SandboxHostError::handler)?,
            )),
            SandboxRpcRequest::InstallSkill(params) => {
                services
                    .install_skill(&params.name, &params.markdown)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::UninstallSkill(params) => {
                services
                    .uninstall_skill(&params.name)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            SandboxRpcRequest::DownloadFile(request) => {
                services
                    .download_file(request)
                    .await
                    .map_err(SandboxHostError::handler)?;
                Ok(Value::Null)
            }
            inline => self.execute_inline(inline),
        }
    }

    fn subscribe_agent_events(self: &Arc<Self>) -> Result<Value, SandboxHostError> {
        let sequence = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        let subscription_id = format!("sub-{sequence}");
        let host = Arc::downgrade(self);
        let listener_subscription_id = subscription_id.clone();
        let listener: AgentEventListener = Arc::new(move |event: Value| {
            let Some(host) = host.upgrade() else {
                return;
            };
            if host.is_disposed() {
                return;
            }
            host.post_event(
                HOST_EVENT_AGENT_EVENT,
                json!({
                    "subscriptionId": listener_subscription_id,
                    "event": event,
                }),
            );
        });
        let subscription = self
            .activation
            .services
            .subscribe_agent_events(listener)
            .map_err(SandboxHostError::handler)?;
        lock(&self.subscriptions).insert(subscription_id.clone(), subscription);
        // Dispose may have drained the table while the collaborator subscribed.
        if self.is_disposed() {
            if let Some(subscription) = lock(&self.subscriptions).remove(&subscription_id) {
                subscription.unsubscribe();
            }
            return Err(SandboxHostError::Disposed);
        }
        Ok(json!({ "subscriptionId": subscription_id }))
    }

    fn show_legacy_widget(
        self: &Arc<Self>,
        owner_id: &str,
        content: SurfaceContentParams,
    ) -> Result<Value, SandboxHostError> {
        let node = content.into_node(SandboxRpcMethod::WidgetShow)?;
        let slot = SurfaceSlot::Widget(LEGACY_WIDGET_ID.to_string());
        let (handler, generation) = self.action_handler(slot.clone());
        let render = self
            .surfaces
            .show_widget(owner_id, node, Some(handler))
            .map_err(|error| surface_error(SandboxRpcMethod::WidgetShow, error))?;
        Ok(self.record_render(slot, render, &generation))
    }

    fn require_widget_api_v2(&self, method: SandboxRpcMethod) -> Result<(), SandboxHostError> {
        if self.activation.widget_api_v2_enabled {
            Ok(())
        } else {
            Err(SandboxHostError::Handler {
                message: format!(
                    "{method} requires widget API v2, which is disabled for this extension"
                ),
            })
        }
    }

    fn record_render(
        &self,
        slot: SurfaceSlot,
        render: SurfaceRender,
        generation: &AtomicU64,
    ) -> Value {
        generation.store(render.generation, Ordering::SeqCst);
        let result = json!({
            "generation": render.generation,
            "actionIds": render.action_ids,
        });
        lock(&self.surface_renders).insert(slot, render);
        result
    }

    /// Builds the action callback for one render of `slot`. The callback only
    /// forwards ids that belong to the render it was created for, and only while
    /// that render is still the slot's latest.
    fn action_handler(self: &Arc<Self>, slot: SurfaceSlot) -> (ActionHandler, Arc<AtomicU64>) {
        let generation = Arc::new(AtomicU64::new(0));
        let host = Arc::downgrade(self);
        let handler_generation = Arc::clone(&generation);
        let handler: ActionHandler = Arc::new(move |action_id: String| {
            let Some(host) = host.upgrade() else {
                return;
            };
            host.forward_ui_action(&slot, handler_generation.load(Ordering::SeqCst), action_id);
        });
        (handler, generation)
    }

    fn forward_ui_action(self: &Arc<Self>, slot: &SurfaceSlot, generation: u64, action_id: String) {
        let live = lock(&self.surface_renders).get(slot).is_some_and(|render| {
            render.generation == generation && render.action_ids.contains(&action_id)
        });
        if !live || self.is_disposed() {
            debug!(
                instance_id = %self.instance_id(),
                action_id = %action_id,
                generation,
                "ignored stale ui action"
            );
            return;
        }
        let params = slot.action_params(&action_id, generation);
        let host = Arc::clone(self);
        self.runtime.spawn(async move {
            if let Err(error) = host.call_sandbox(HostRpcMethod::UiAction, params).await {
                debug!(
                    instance_id = %host.instance_id(),
                    action_id = %action_id,
                    error = %error,
                    "ui action was not acknowledged"
                );
            }
        });
    }

    async fn dispose(&self, graceful_deactivate: bool) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let instance_id = self.instance_id().to_string();
        if graceful_deactivate {
            if let Err(error) = self
                .request_sandbox(HostRpcMethod::Deactivate, json!({}), self.timeouts.deactivate)
                .await
            {
                warn!(
                    instance_id = %instance_id,
                    error = %error,
                    "extension sandbox deactivate failed"
                );
            }
        }

        let subscriptions = std::mem::take(&mut *lock(&self.subscriptions));
        for (_, subscription) in subscriptions {
            subscription.unsubscribe();
        }

        let rejected = self.pending.reject_all(|_| SandboxHostError::Disposed);

        let tools = std::mem::take(&mut *lock(&self.registered_tools));
        for tool in tools {
            if let Err(error) = self
                .activation
                .services
                .unregister_tool(&self.activation.extension_id, &tool)
                .await
            {
                warn!(
                    instance_id = %instance_id,
                    tool = %tool,
                    error = %error,
                    "failed to unregister extension tool"
                );
            }
        }

        let owner_id = self.activation.surface_owner_id();
        lock(&self.surface_renders).clear();
        self.surfaces.release_overlay(owner_id);
        if self.activation.widget_api_v2_enabled {
            self.surfaces.clear_widgets(owner_id);
        } else {
            self.surfaces.dismiss_widget(owner_id);
        }

        self.bus.remove_listener(self.listener_id);
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        let context = lock(&self.context).take();
        if let Some(context) = context {
            context.teardown().await;
        }
        self.readiness.send_if_modified(|state| {
            if *state == Readiness::Pending {
                *state = Readiness::Disposed;
                true
            } else {
                false
            }
        });
        info!(
            instance_id = %instance_id,
            rejected_requests = rejected,
            "extension sandbox disposed"
        );
    }
}

fn panicked(method: &str) -> SandboxHostError {
    SandboxHostError::Handler {
        message: format!("extension host handler panicked while handling '{method}'"),
    }
}

fn surface_error(
    method: SandboxRpcMethod,
    error: xlext_surfaces::SurfaceError,
) -> SandboxHostError {
    SandboxHostError::invalid_params(method.as_str(), error.to_string())
}

fn to_result_value<T: serde::Serialize>(value: &T) -> Result<Value, SandboxHostError> {
    serde_json::to_value(value).map_err(|error| SandboxHostError::Handler {
        message: format!("failed to encode result: {error}"),
    })
}

/// Host-side stand-in for a command the sandbox registered.
struct SandboxCommandProxy {
    host: Weak<HostInner>,
    name: String,
}

#[async_trait]
impl ExtensionCommandHandler for SandboxCommandProxy {
    async fn run(&self, args: String) -> Result<()> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| anyhow!("{}", SandboxHostError::Disposed))?;
        host.call_sandbox(
            HostRpcMethod::RunCommand,
            json!({ "name": self.name, "args": args }),
        )
        .await?;
        Ok(())
    }
}

/// Host-side stand-in for a tool the sandbox registered.
struct SandboxToolProxy {
    host: Weak<HostInner>,
    name: String,
    parameters: Value,
}

#[async_trait]
impl ExtensionToolExecutor for SandboxToolProxy {
    async fn execute(&self, params: Value) -> Result<Value> {
        validate_tool_arguments(&self.name, &self.parameters, &params)?;
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| anyhow!("{}", SandboxHostError::Disposed))?;
        let result = host
            .call_sandbox(
                HostRpcMethod::ExecuteTool,
                json!({ "name": self.name, "params": params }),
            )
            .await?;
        Ok(result)
    }
}
