use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{OcppError, RequestCommand};

pub type Completion = Result<Value, OcppError>;

/// An outbound CALL waiting for its RESULT or ERROR.
#[derive(Debug)]
pub struct PendingRequest {
    pub command: RequestCommand,
    pub created_at: Instant,
    completion: oneshot::Sender<Completion>,
}

impl PendingRequest {
    /// Hand the outcome to the waiting caller. Returns false if it stopped waiting.
    pub fn complete(self, outcome: Completion) -> bool {
        self.completion.send(outcome).is_ok()
    }
}

/// In-flight requests of one engine, keyed by message id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    fn requests(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh message id and register the request under it.
    pub fn register(&self, command: RequestCommand) -> (String, oneshot::Receiver<Completion>) {
        let (completion, receiver) = oneshot::channel();
        let mut requests = self.requests();
        let mut message_id = uuid::Uuid::new_v4().to_string();
        while requests.contains_key(&message_id) {
            message_id = uuid::Uuid::new_v4().to_string();
        }
        requests.insert(
            message_id.clone(),
            PendingRequest {
                command,
                created_at: Instant::now(),
                completion,
            },
        );
        (message_id, receiver)
    }

    pub fn remove(&self, message_id: &str) -> Option<PendingRequest> {
        self.requests().remove(message_id)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.requests().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.requests().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorType;
    use std::collections::HashSet;

    #[test]
    fn test_register_allocates_unique_ids() {
        let pending = PendingRequests::default();
        let ids: HashSet<String> = (0..100)
            .map(|_| pending.register(RequestCommand::Heartbeat).0)
            .collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(pending.len(), 100);
    }

    #[tokio::test]
    async fn test_complete_delivers_outcome() {
        let pending = PendingRequests::default();
        let (message_id, receiver) = pending.register(RequestCommand::Authorize);
        assert!(pending.contains(&message_id));

        let request = pending.remove(&message_id).expect("Could not find pending request");
        assert_eq!(request.command, RequestCommand::Authorize);
        assert!(request.complete(Err(OcppError::new(ErrorType::SecurityError, "denied"))));

        let outcome = receiver.await.unwrap();
        assert_eq!(outcome.unwrap_err().code, ErrorType::SecurityError);
        assert!(pending.is_empty());
    }
}
