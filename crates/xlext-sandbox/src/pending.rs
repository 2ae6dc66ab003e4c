use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::oneshot;

struct PendingEntry<T, E> {
    method: String,
    sender: oneshot::Sender<Result<T, E>>,
}

struct PendingState<T, E> {
    next_request_id: u64,
    entries: HashMap<String, PendingEntry<T, E>>,
}

/// Correlation table from request id to the caller awaiting its outcome.
///
/// Transport agnostic: ids are generated here, outcomes are settled by id in
/// any order, and each entry is settled at most once because settling removes
/// it from the table.
pub struct PendingRequestTable<T, E> {
    state: Mutex<PendingState<T, E>>,
}

impl<T, E> Default for PendingRequestTable<T, E> {
    fn default() -> Self {
        Self {
            state: Mutex::new(PendingState {
                next_request_id: 0,
                entries: HashMap::new(),
            }),
        }
    }
}

impl<T, E> PendingRequestTable<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState<T, E>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocates the next request id and parks a receiver for its outcome.
    pub fn register(&self, method: &str) -> (String, oneshot::Receiver<Result<T, E>>) {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.lock();
        state.next_request_id = state.next_request_id.saturating_add(1);
        let request_id = state.next_request_id.to_string();
        state.entries.insert(
            request_id.clone(),
            PendingEntry {
                method: method.to_string(),
                sender,
            },
        );
        (request_id, receiver)
    }

    /// Settles `request_id` with the outcome built from its method name.
    /// Returns false when the id is unknown (already settled, timed out, or foreign).
    pub fn settle_with(
        &self,
        request_id: &str,
        outcome: impl FnOnce(&str) -> Result<T, E>,
    ) -> bool {
        let Some(entry) = self.lock().entries.remove(request_id) else {
            return false;
        };
        let _ = entry.sender.send(outcome(&entry.method));
        true
    }

    pub fn remove(&self, request_id: &str) -> bool {
        self.lock().entries.remove(request_id).is_some()
    }

    /// Rejects every outstanding request and empties the table.
    pub fn reject_all(&self, error: impl Fn(&str) -> E) -> usize {
        let drained = self.lock().entries.drain().collect::<Vec<_>>();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.sender.send(Err(error(&entry.method)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::PendingRequestTable;

    #[tokio::test]
    async fn unit_settles_out_of_order_exactly_once() {
        let table = PendingRequestTable::<u32, String>::new();
        let (first_id, first) = table.register("execute_tool");
        let (second_id, second) = table.register("run_command");
        assert_ne!(first_id, second_id);

        assert!(table.settle_with(&second_id, |_| Ok(2)));
        assert!(table.settle_with(&first_id, |_| Ok(1)));
        assert!(!table.settle_with(&first_id, |_| Ok(99)));

        assert_eq!(first.await.expect("first"), Ok(1));
        assert_eq!(second.await.expect("second"), Ok(2));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn functional_reject_all_names_each_method() {
        let table = PendingRequestTable::<u32, String>::new();
        let (_, deactivate) = table.register("deactivate");
        let (_, ui_action) = table.register("ui_action");
        assert_eq!(table.reject_all(|method| format!("{method} disposed")), 2);
        assert_eq!(
            deactivate.await.expect("deactivate"),
            Err("deactivate disposed".to_string())
        );
        assert_eq!(
            ui_action.await.expect("ui_action"),
            Err("ui_action disposed".to_string())
        );
        assert_eq!(table.reject_all(|method| method.to_string()), 0);
    }
}
