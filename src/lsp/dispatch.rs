//! Request correlation and demultiplexing of incoming messages.
//!
//! [`Correlator`] owns the id counter and the set of requests still waiting
//! for a response. The client allocates through it, the reader resolves
//! through it, and nobody else ever sees the underlying set.
//!
//! [`Dispatcher`] turns each decoded [`Message`] into an [`Incoming`] and
//! pushes it on the response or notification queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

use crate::lsp::message::{Incoming, Message, MessageId, Notification, RequestId, Response};

/// What to do with a response whose id we are not waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownIdPolicy {
    /// Stop the reader loop. The peer is not honouring correlation and any
    /// later response could be misattributed.
    #[default]
    Fail,
    /// Log a warning and discard the message.
    Drop,
}

/// Errors raised while routing a decoded message.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Response references unknown request id {0}")]
    UnknownResponseId(MessageId),

    #[error("Response {id} carries both result and error")]
    InvalidResponse { id: MessageId },

    #[error("Message has neither id nor method")]
    InvalidEnvelope,

    #[error("Client is no longer receiving messages")]
    ConsumerGone,
}

#[derive(Debug)]
struct CorrelatorState {
    next_id: u64,
    outstanding: HashSet<u64>,
}

/// Id allocation plus the outstanding request set, behind one lock.
///
/// The lock is held for a single operation only, never across I/O.
#[derive(Debug)]
pub struct Correlator {
    state: Mutex<CorrelatorState>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CorrelatorState {
                next_id: 1,
                outstanding: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        // The state is a counter and a set; both stay valid even if a
        // holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and mark it outstanding in one step.
    pub fn allocate(&self) -> RequestId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.outstanding.insert(id);
        RequestId(id)
    }

    /// Remove `id` from the outstanding set. Returns `false` if it was not
    /// there (never issued, or already resolved).
    pub fn resolve(&self, id: RequestId) -> bool {
        self.lock().outstanding.remove(&id.0)
    }

    /// Forget an id whose request never made it onto the wire.
    pub fn release(&self, id: RequestId) {
        self.lock().outstanding.remove(&id.0);
    }

    pub fn is_outstanding(&self, id: RequestId) -> bool {
        self.lock().outstanding.contains(&id.0)
    }

    /// Snapshot of the outstanding ids, sorted.
    pub fn outstanding(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self
            .lock()
            .outstanding
            .iter()
            .copied()
            .map(RequestId)
            .collect();
        ids.sort();
        ids
    }
}

/// Classify a message by shape, without looking at the outstanding set.
///
/// Anything with a `method` is unsolicited, including peer-initiated
/// requests that carry an id. Anything else with an id is a response.
fn classify(message: Message) -> Result<Incoming, RouteError> {
    match (message.method, message.id) {
        (Some(method), id) => Ok(Incoming::Notification(Notification {
            method,
            params: message.params.unwrap_or(Value::Null),
            id,
        })),
        (None, Some(id)) => {
            let payload = match (message.result, message.error) {
                (Some(_), Some(_)) => return Err(RouteError::InvalidResponse { id }),
                (_, Some(error)) => Err(error),
                (result, None) => Ok(result.unwrap_or(Value::Null)),
            };
            let request_id = match id {
                MessageId::Number(n) => RequestId(n),
                other => return Err(RouteError::UnknownResponseId(other)),
            };
            Ok(Incoming::Response(Response {
                id: request_id,
                payload,
            }))
        }
        (None, None) => Err(RouteError::InvalidEnvelope),
    }
}

/// Routes decoded messages onto the two delivery queues.
#[derive(Debug)]
pub struct Dispatcher {
    correlator: Arc<Correlator>,
    responses: UnboundedSender<Response>,
    notifications: UnboundedSender<Notification>,
    policy: UnknownIdPolicy,
}

impl Dispatcher {
    pub fn new(
        correlator: Arc<Correlator>,
        responses: UnboundedSender<Response>,
        notifications: UnboundedSender<Notification>,
        policy: UnknownIdPolicy,
    ) -> Self {
        Self {
            correlator,
            responses,
            notifications,
            policy,
        }
    }

    /// Deliver one message to the right queue.
    ///
    /// Only a response whose id is outstanding reaches the response queue,
    /// and its id is resolved exactly once on the way.
    pub fn route(&self, message: Message) -> Result<(), RouteError> {
        let incoming = match classify(message) {
            Err(RouteError::UnknownResponseId(id)) => return self.unknown_id(id),
            other => other?,
        };

        match incoming {
            Incoming::Response(response) => {
                if !self.correlator.resolve(response.id) {
                    return self.unknown_id(response.id.into());
                }
                trace!("Routing response {} to response queue", response.id);
                self.responses
                    .send(response)
                    .map_err(|_| RouteError::ConsumerGone)
            }
            Incoming::Notification(notification) => {
                trace!("Routing {} to notification queue", notification.method);
                self.notifications
                    .send(notification)
                    .map_err(|_| RouteError::ConsumerGone)
            }
        }
    }

    fn unknown_id(&self, id: MessageId) -> Result<(), RouteError> {
        match self.policy {
            UnknownIdPolicy::Fail => Err(RouteError::UnknownResponseId(id)),
            UnknownIdPolicy::Drop => {
                warn!("Dropping response for unknown request id {}", id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::message::ResponseError;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc::{error::TryRecvError, unbounded_channel, UnboundedReceiver};

    struct Harness {
        correlator: Arc<Correlator>,
        dispatcher: Dispatcher,
        responses: UnboundedReceiver<Response>,
        notifications: UnboundedReceiver<Notification>,
    }

    fn harness(policy: UnknownIdPolicy) -> Harness {
        let correlator = Arc::new(Correlator::new());
        let (response_tx, responses) = unbounded_channel();
        let (notification_tx, notifications) = unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::clone(&correlator), response_tx, notification_tx, policy);
        Harness {
            correlator,
            dispatcher,
            responses,
            notifications,
        }
    }

    fn parse(json: serde_json::Value) -> Message {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_allocate_is_monotonic_from_one() {
        let correlator = Correlator::new();
        let ids: Vec<u64> = (0..5).map(|_| correlator.allocate().get()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(correlator.outstanding().len(), 5);
    }

    #[test]
    fn test_resolve_exactly_once() {
        let correlator = Correlator::new();
        let id = correlator.allocate();
        assert!(correlator.is_outstanding(id));
        assert!(correlator.resolve(id));
        assert!(!correlator.resolve(id));
        assert!(!correlator.is_outstanding(id));
    }

    #[test]
    fn test_release_does_not_rewind_counter() {
        let correlator = Correlator::new();
        let first = correlator.allocate();
        correlator.release(first);
        let second = correlator.allocate();
        assert!(second > first);
        assert_eq!(correlator.outstanding(), vec![second]);
    }

    #[test]
    fn test_response_goes_to_response_queue() {
        let mut h = harness(UnknownIdPolicy::Fail);
        let id = h.correlator.allocate();

        h.dispatcher
            .route(parse(json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}})))
            .unwrap();

        let response = h.responses.try_recv().unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.payload, Ok(json!({"capabilities": {}})));
        assert!(h.correlator.outstanding().is_empty());
        assert!(matches!(h.notifications.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_error_response_keeps_error_object() {
        let mut h = harness(UnknownIdPolicy::Fail);
        h.correlator.allocate();

        h.dispatcher
            .route(parse(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32600, "message": "Invalid Request"}
            })))
            .unwrap();

        let response = h.responses.try_recv().unwrap();
        assert_eq!(
            response.payload,
            Err(ResponseError {
                code: -32600,
                message: "Invalid Request".to_string(),
                data: None,
            })
        );
    }

    #[test]
    fn test_response_without_result_is_null_result() {
        let mut h = harness(UnknownIdPolicy::Fail);
        h.correlator.allocate();

        h.dispatcher
            .route(parse(json!({"jsonrpc": "2.0", "id": 1})))
            .unwrap();

        assert_eq!(h.responses.try_recv().unwrap().payload, Ok(Value::Null));
    }

    #[test]
    fn test_notifications_keep_arrival_order() {
        let mut h = harness(UnknownIdPolicy::Fail);

        for i in 0..3 {
            h.dispatcher
                .route(parse(json!({
                    "jsonrpc": "2.0",
                    "method": "window/logMessage",
                    "params": {"message": i}
                })))
                .unwrap();
        }

        for i in 0..3 {
            let n = h.notifications.try_recv().unwrap();
            assert_eq!(n.method, "window/logMessage");
            assert_eq!(n.params, json!({"message": i}));
            assert_eq!(n.id, None);
        }
        assert!(matches!(h.responses.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_peer_request_is_delivered_as_notification() {
        let mut h = harness(UnknownIdPolicy::Fail);
        let ours = h.correlator.allocate();

        h.dispatcher
            .route(parse(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "window/workDoneProgress/create",
                "params": {"token": "t"}
            })))
            .unwrap();

        let n = h.notifications.try_recv().unwrap();
        assert_eq!(n.id, Some(MessageId::Number(1)));
        // Our request 1 is still waiting for its own response
        assert!(h.correlator.is_outstanding(ours));
    }

    #[test]
    fn test_unknown_id_fails_by_default() {
        let h = harness(UnknownIdPolicy::Fail);
        let result = h
            .dispatcher
            .route(parse(json!({"jsonrpc": "2.0", "id": 99, "result": {}})));
        assert!(matches!(
            result,
            Err(RouteError::UnknownResponseId(MessageId::Number(99)))
        ));
    }

    #[test]
    fn test_already_resolved_id_is_unknown() {
        let mut h = harness(UnknownIdPolicy::Fail);
        h.correlator.allocate();
        let reply = json!({"jsonrpc": "2.0", "id": 1, "result": null});

        h.dispatcher.route(parse(reply.clone())).unwrap();
        let result = h.dispatcher.route(parse(reply));

        assert!(matches!(result, Err(RouteError::UnknownResponseId(_))));
        assert!(h.responses.try_recv().is_ok());
        assert!(h.responses.try_recv().is_err());
    }

    #[test]
    fn test_string_id_response_is_unknown() {
        let h = harness(UnknownIdPolicy::Fail);
        let result = h
            .dispatcher
            .route(parse(json!({"jsonrpc": "2.0", "id": "1", "result": {}})));
        assert!(matches!(
            result,
            Err(RouteError::UnknownResponseId(MessageId::String(_)))
        ));
    }

    #[test]
    fn test_negative_or_fractional_id_response_is_unknown() {
        let h = harness(UnknownIdPolicy::Fail);
        h.correlator.allocate();
        for id in [json!(-1), json!(1.0)] {
            let result = h
                .dispatcher
                .route(parse(json!({"jsonrpc": "2.0", "id": id, "result": {}})));
            assert!(matches!(
                result,
                Err(RouteError::UnknownResponseId(MessageId::Other(_)))
            ));
        }
        // Id 1 was never claimed by the `1.0` response
        assert!(h.correlator.is_outstanding(RequestId(1)));
    }

    #[test]
    fn test_drop_policy_discards_unknown_ids() {
        let mut h = harness(UnknownIdPolicy::Drop);
        h.dispatcher
            .route(parse(json!({"jsonrpc": "2.0", "id": 5, "result": {}})))
            .unwrap();
        assert!(matches!(h.responses.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(h.notifications.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_result_and_error_together_is_invalid() {
        let h = harness(UnknownIdPolicy::Fail);
        h.correlator.allocate();
        let result = h.dispatcher.route(parse(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {},
            "error": {"code": 1, "message": "x"}
        })));
        assert!(matches!(result, Err(RouteError::InvalidResponse { .. })));
    }

    #[test]
    fn test_message_without_id_or_method_is_invalid() {
        let h = harness(UnknownIdPolicy::Fail);
        let result = h.dispatcher.route(parse(json!({"jsonrpc": "2.0", "result": {}})));
        assert!(matches!(result, Err(RouteError::InvalidEnvelope)));
    }

    #[test]
    fn test_closed_consumer_reports_consumer_gone() {
        let h = harness(UnknownIdPolicy::Fail);
        let Harness {
            dispatcher,
            notifications,
            ..
        } = h;
        drop(notifications);

        let result = dispatcher.route(parse(json!({"jsonrpc": "2.0", "method": "x"})));
        assert!(matches!(result, Err(RouteError::ConsumerGone)));
    }
}
