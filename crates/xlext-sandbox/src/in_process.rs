//! Channel-backed sandbox contexts that run a guest task inside this process.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;
use xlext_protocol::{parse_envelope, Envelope, EnvelopeDirection, SandboxEvent};

use crate::{
    bootstrap::SandboxBootstrap,
    context::{
        ContextId, SandboxContext, SandboxContextLauncher, SandboxContextSpec, SandboxMessageBus,
    },
};

/// Guest half of an in-process sandbox: everything a guest can observe about
/// the host arrives through its [`SandboxPort`].
#[async_trait]
pub trait SandboxGuest: Send + Sync {
    async fn run(&self, port: SandboxPort);
}

#[async_trait]
impl<F, Fut> SandboxGuest for F
where
    F: Fn(SandboxPort) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self, port: SandboxPort) {
        (self)(port).await;
    }
}

/// Guest-side endpoint: receives host-to-sandbox messages and posts
/// sandbox-to-host envelopes onto the shared bus under its context id.
pub struct SandboxPort {
    context_id: ContextId,
    bootstrap: SandboxBootstrap,
    bus: SandboxMessageBus,
    inbox: mpsc::UnboundedReceiver<Value>,
}

impl SandboxPort {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn instance_id(&self) -> &str {
        &self.bootstrap.instance_id
    }

    pub fn bootstrap(&self) -> &SandboxBootstrap {
        &self.bootstrap
    }

    /// Next raw message from the host, or `None` once the context is torn down.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    /// Next well-formed envelope addressed to this instance.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        while let Some(raw) = self.inbox.recv().await {
            match parse_envelope(&raw) {
                Some(envelope)
                    if envelope.instance_id == self.bootstrap.instance_id
                        && envelope.direction == EnvelopeDirection::HostToSandbox =>
                {
                    return Some(envelope);
                }
                _ => debug!(context_id = %self.context_id, "guest ignored host message"),
            }
        }
        None
    }

    pub fn post_raw(&self, data: Value) {
        self.bus.post(self.context_id, data);
    }

    fn post(&self, envelope: Envelope) {
        self.post_raw(envelope.to_value());
    }

    pub fn send_ready(&self) {
        self.post(Envelope::event(
            self.instance_id(),
            EnvelopeDirection::SandboxToHost,
            SandboxEvent::Ready.as_str(),
            None,
        ));
    }

    pub fn send_error(&self, message: &str) {
        self.post(Envelope::event(
            self.instance_id(),
            EnvelopeDirection::SandboxToHost,
            SandboxEvent::Error.as_str(),
            Some(json!({ "message": message })),
        ));
    }

    pub fn send_request(&self, request_id: &str, method: &str, params: Option<Value>) {
        self.post(Envelope::request(
            self.instance_id(),
            EnvelopeDirection::SandboxToHost,
            request_id,
            method,
            params,
        ));
    }

    pub fn respond_ok(&self, request_id: &str, result: Value) {
        self.post(Envelope::response_ok(
            self.instance_id(),
            EnvelopeDirection::SandboxToHost,
            request_id,
            result,
        ));
    }

    pub fn respond_error(&self, request_id: &str, message: &str) {
        self.post(Envelope::response_error(
            self.instance_id(),
            EnvelopeDirection::SandboxToHost,
            request_id,
            message,
        ));
    }
}

struct InProcessSandboxContext {
    id: ContextId,
    sender: mpsc::UnboundedSender<Value>,
    task: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

#[async_trait]
impl SandboxContext for InProcessSandboxContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn post_message(&self, message: Value) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(anyhow!("sandbox context {} was torn down", self.id));
        }
        self.sender
            .send(message)
            .map_err(|_| anyhow!("sandbox context {} is closed", self.id))
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Launches each context as a tokio task running `guest`.
pub struct InProcessSandboxLauncher {
    guest: Arc<dyn SandboxGuest>,
}

impl InProcessSandboxLauncher {
    pub fn new(guest: impl SandboxGuest + 'static) -> Self {
        Self {
            guest: Arc::new(guest),
        }
    }
}

#[async_trait]
impl SandboxContextLauncher for InProcessSandboxLauncher {
    async fn launch(
        &self,
        spec: SandboxContextSpec,
        bus: SandboxMessageBus,
    ) -> Result<Arc<dyn SandboxContext>> {
        let (sender, inbox) = mpsc::unbounded_channel();
        let port = SandboxPort {
            context_id: spec.context_id,
            bootstrap: spec.bootstrap,
            bus,
            inbox,
        };
        let guest = Arc::clone(&self.guest);
        let task = tokio::spawn(async move { guest.run(port).await });
        Ok(Arc::new(InProcessSandboxContext {
            id: spec.context_id,
            sender,
            task: Mutex::new(Some(task)),
            torn_down: AtomicBool::new(false),
        }))
    }
}
