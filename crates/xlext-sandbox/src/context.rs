//! Isolated execution contexts and the message bus their traffic arrives on.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bootstrap::SandboxBootstrap;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Process-unique handle identifying one isolated execution context.
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One raw message as delivered by the transport, tagged with its sender.
pub struct InboundMessage {
    pub source: ContextId,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Public struct `ListenerId` used across extension runtimes.
pub struct ListenerId(u64);

#[derive(Default)]
struct BusState {
    next_listener: u64,
    listeners: BTreeMap<ListenerId, mpsc::UnboundedSender<InboundMessage>>,
}

/// Shared inbound channel for every context in the process.
///
/// Every listener sees every message, whatever its source; listeners are
/// responsible for filtering by source and instance.
#[derive(Clone, Default)]
pub struct SandboxMessageBus {
    state: Arc<Mutex<BusState>>,
}

impl fmt::Debug for SandboxMessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxMessageBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl SandboxMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<InboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_listener = state.next_listener.saturating_add(1);
        let id = ListenerId(state.next_listener);
        state.listeners.insert(id, sender);
        (id, receiver)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.lock().listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Delivers `data` from `source` to every registered listener.
    pub fn post(&self, source: ContextId, data: Value) {
        let mut state = self.lock();
        state.listeners.retain(|_, sender| {
            sender
                .send(InboundMessage {
                    source,
                    data: data.clone(),
                })
                .is_ok()
        });
    }
}

/// Sandbox flag set for new contexts: scripts run, everything else
/// (same-origin, storage, forms, popups, top navigation) stays denied.
pub const SANDBOX_FLAGS: &[&str] = &["allow-scripts"];

#[derive(Debug, Clone)]
/// Public struct `SandboxContextSpec` used across extension runtimes.
pub struct SandboxContextSpec {
    pub context_id: ContextId,
    pub sandbox_flags: &'static [&'static str],
    pub bootstrap: SandboxBootstrap,
    pub bootstrap_document: String,
}

/// A launched isolated execution context.
#[async_trait]
pub trait SandboxContext: Send + Sync {
    fn id(&self) -> ContextId;

    /// Queues `message` for delivery into the context.
    fn post_message(&self, message: Value) -> Result<()>;

    async fn teardown(&self);
}

/// Creates isolated execution contexts. Messages the context emits must be
/// posted to `bus` with `spec.context_id` as their source.
#[async_trait]
pub trait SandboxContextLauncher: Send + Sync {
    async fn launch(
        &self,
        spec: SandboxContextSpec,
        bus: SandboxMessageBus,
    ) -> Result<Arc<dyn SandboxContext>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ContextId, SandboxMessageBus};

    #[tokio::test]
    async fn unit_bus_fans_out_with_source_and_drops_removed_listeners() {
        let bus = SandboxMessageBus::new();
        let (first_id, mut first) = bus.add_listener();
        let (_second_id, mut second) = bus.add_listener();
        let source = ContextId::next();

        bus.post(source, json!({ "n": 1 }));
        assert_eq!(first.recv().await.expect("first").source, source);
        assert_eq!(second.recv().await.expect("second").data, json!({ "n": 1 }));

        assert!(bus.remove_listener(first_id));
        assert!(!bus.remove_listener(first_id));
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn regression_bus_prunes_listeners_whose_receiver_was_dropped() {
        let bus = SandboxMessageBus::new();
        let (_id, receiver) = bus.add_listener();
        drop(receiver);
        bus.post(ContextId::next(), json!(null));
        assert_eq!(bus.listener_count(), 0);
    }
}
