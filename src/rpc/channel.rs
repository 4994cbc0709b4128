use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use super::message::{response_outcome, Frame};
use crate::error::{Result, SfuError};

/// Receives everything the remote side initiates on one connection.
///
/// Calls are made one at a time, in arrival order. A handler must not await
/// [`RpcChannel::request`] on its own connection: the response would be
/// queued behind the call that is waiting for it.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Answer through `responder`. Dropping it unanswered leaves the remote
    /// request pending.
    async fn on_request(&self, method: String, data: Value, responder: Responder);

    async fn on_notification(&self, method: String, data: Value);

    /// Runs exactly once, after the last frame of the connection.
    async fn on_close(&self);
}

/// Completion handle for one incoming request.
pub struct Responder {
    request_id: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl Responder {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn accept(self, data: Value) {
        self.send(Frame::success(self.request_id.clone(), data));
    }

    pub fn reject(self, message: impl Into<String>) {
        self.send(Frame::failure(self.request_id.clone(), message));
    }

    fn send(&self, frame: Frame) {
        let result = frame
            .encode()
            .and_then(|text| self.outbound.send(text).map_err(|_| SfuError::ConnectionClosed));

        if let Err(e) = result {
            tracing::error!(
                request_id = %self.request_id,
                error = %e,
                "Failed to send response"
            );
        }
    }
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    entries: HashMap<String, oneshot::Sender<Result<Value>>>,
}

/// Symmetric request/response/notification endpoint over one duplex
/// connection. Cloning yields another handle to the same connection.
///
/// Outgoing frames go to the receiver returned by [`RpcChannel::new`];
/// incoming frames are fed through [`RpcChannel::run`].
#[derive(Clone)]
pub struct RpcChannel {
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<PendingTable>>,
}

impl RpcChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let channel = Self {
            outbound,
            pending: Arc::new(Mutex::new(PendingTable::default())),
        };
        (channel, outbound_rx)
    }

    /// Sends a request and waits for its response. There is no timeout; the
    /// call fails with [`SfuError::ConnectionClosed`] once the connection ends.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(SfuError::ConnectionClosed);
            }
            pending.entries.insert(request_id.clone(), tx);
        }

        let sent = Frame::request(request_id.clone(), method, data)
            .encode()
            .and_then(|text| self.outbound.send(text).map_err(|_| SfuError::ConnectionClosed));

        if let Err(e) = sent {
            self.pending.lock().await.entries.remove(&request_id);
            return Err(e);
        }

        tracing::debug!(request_id = %request_id, method = %method, "Sent request");

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SfuError::ConnectionClosed),
        }
    }

    /// Fire-and-forget. Transport failures surface through the connection
    /// closing, never here.
    pub fn notify(&self, method: &str, data: Value) {
        match Frame::notification(method, data).encode() {
            Ok(text) => {
                if self.outbound.send(text).is_err() {
                    tracing::debug!(method = %method, "Notification dropped, connection is gone");
                }
            }
            Err(e) => {
                tracing::error!(method = %method, error = %e, "Failed to encode notification");
            }
        }
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.entries.len()
    }

    /// Drives the connection until `incoming` ends, then rejects whatever is
    /// still pending and calls [`RpcHandler::on_close`].
    pub async fn run<S, H>(&self, incoming: S, handler: Arc<H>)
    where
        S: Stream<Item = String>,
        H: RpcHandler + ?Sized,
    {
        let mut incoming = std::pin::pin!(incoming);

        while let Some(text) = incoming.next().await {
            self.dispatch(&text, handler.as_ref()).await;
        }

        self.abandon_pending().await;
        handler.on_close().await;
    }

    async fn dispatch<H: RpcHandler + ?Sized>(&self, text: &str, handler: &H) {
        let Some(frame) = Frame::decode(text) else {
            return;
        };

        match frame {
            Frame::Request { request_id, method, data } => {
                let responder = Responder {
                    request_id,
                    outbound: self.outbound.clone(),
                };
                handler.on_request(method, data, responder).await;
            }
            Frame::Response { request_id, data, is_error, error_message } => {
                let waiter = self.pending.lock().await.entries.remove(&request_id);
                match waiter {
                    Some(waiter) => {
                        let outcome = response_outcome(data, is_error, error_message)
                            .map_err(SfuError::RequestFailed);
                        // The requester may have stopped waiting.
                        let _ = waiter.send(outcome);
                    }
                    None => {
                        tracing::debug!(request_id = %request_id, "Ignoring response for unknown request");
                    }
                }
            }
            Frame::Notification { method, data } => {
                handler.on_notification(method, data).await;
            }
        }
    }

    async fn abandon_pending(&self) {
        let mut pending = self.pending.lock().await;
        pending.closed = true;
        let abandoned = pending.entries.len();
        for (_, waiter) in pending.entries.drain() {
            let _ = waiter.send(Err(SfuError::ConnectionClosed));
        }
        if abandoned > 0 {
            tracing::debug!(abandoned, "Rejected pending requests on close");
        }
    }
}

/// Adapts the outbound side of one channel into the incoming side of another.
pub fn frames(mut rx: mpsc::UnboundedReceiver<String>) -> impl Stream<Item = String> {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes `data` back, rejects `fail`, leaves `hang` unanswered.
    #[derive(Default)]
    struct EchoHandler {
        notifications: Mutex<Vec<(String, Value)>>,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn on_request(&self, method: String, data: Value, responder: Responder) {
            match method.as_str() {
                "fail" => responder.reject("nope"),
                "hang" => drop(responder),
                _ => responder.accept(json!({ "method": method, "echo": data })),
            }
        }

        async fn on_notification(&self, method: String, data: Value) {
            self.notifications.lock().await.push((method, data));
        }

        async fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Pair {
        client: RpcChannel,
        server: RpcChannel,
        server_handler: Arc<EchoHandler>,
        server_task: tokio::task::JoinHandle<()>,
        client_task: tokio::task::JoinHandle<()>,
    }

    fn pair() -> Pair {
        let (client, client_out) = RpcChannel::new();
        let (server, server_out) = RpcChannel::new();
        let server_handler = Arc::new(EchoHandler::default());
        let client_handler = Arc::new(EchoHandler::default());

        let server_task = {
            let server = server.clone();
            let handler = server_handler.clone();
            tokio::spawn(async move { server.run(frames(client_out), handler).await })
        };
        let client_task = {
            let client = client.clone();
            tokio::spawn(async move { client.run(frames(server_out), client_handler).await })
        };

        Pair { client, server, server_handler, server_task, client_task }
    }

    #[tokio::test]
    async fn test_request_resolves_with_accepted_payload() {
        let pair = pair();
        let reply = pair.client.request("ping", json!({ "n": 1 })).await.unwrap();
        assert_eq!(reply, json!({ "method": "ping", "echo": { "n": 1 } }));
    }

    #[tokio::test]
    async fn test_request_fails_with_rejection_message() {
        let pair = pair();
        let err = pair.client.request("fail", json!({})).await.unwrap_err();
        assert!(matches!(err, SfuError::RequestFailed(ref msg) if msg == "nope"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_their_own_correlation() {
        let pair = pair();
        let calls = (0..20).map(|n| {
            let client = pair.client.clone();
            async move { (n, client.request("ping", json!({ "n": n })).await.unwrap()) }
        });
        for (n, reply) in futures::future::join_all(calls).await {
            assert_eq!(reply["echo"]["n"], json!(n));
        }
        assert_eq!(pair.client.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_both_ends_can_initiate() {
        let pair = pair();
        let reply = pair.server.request("whoami", json!({})).await.unwrap();
        assert_eq!(reply["method"], json!("whoami"));
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let pair = pair();
        for n in 0..5 {
            pair.client.notify("tick", json!({ "n": n }));
        }
        // A request queued behind the notifications proves they were handled.
        pair.client.request("ping", json!({})).await.unwrap();

        let seen = pair.server_handler.notifications.lock().await;
        let order: Vec<_> = seen.iter().map(|(_, data)| data["n"].clone()).collect();
        assert_eq!(order, (0..5).map(|n| json!(n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_ignored() {
        let (channel, _out) = RpcChannel::new();
        let handler = Arc::new(EchoHandler::default());
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(r#"{"mode":"response","requestId":"never-sent","data":{}}"#.to_string())
            .unwrap();
        tx.send("garbage".to_string()).unwrap();
        drop(tx);

        channel.run(frames(rx), handler.clone()).await;

        assert!(handler.notifications.lock().await.is_empty());
        assert_eq!(channel.pending_requests().await, 0);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    // In-flight requests fail on close rather than staying pending.
    #[tokio::test]
    async fn test_close_rejects_in_flight_requests() {
        let pair = pair();
        let client = pair.client.clone();
        let hanging = tokio::spawn(async move { client.request("hang", json!({})).await });

        while pair.client.pending_requests().await == 0 {
            tokio::task::yield_now().await;
        }

        pair.server_task.abort();
        drop(pair.server);
        let _ = pair.server_task.await;
        pair.client_task.await.unwrap();

        let outcome = hanging.await.unwrap();
        assert!(matches!(outcome, Err(SfuError::ConnectionClosed)));
        assert!(matches!(
            pair.client.request("ping", json!({})).await,
            Err(SfuError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_handler_runs_once() {
        let (channel, _out) = RpcChannel::new();
        let handler = Arc::new(EchoHandler::default());
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(tx);

        channel.run(frames(rx), handler.clone()).await;
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }
}
