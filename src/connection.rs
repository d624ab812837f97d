use crate::error::{QrcError, Result};
use crate::protocol::{self, EngineStatus, Inbound, PollResult, Request, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Events surfaced to the session supervisor by the socket reader
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// Unsolicited engine status notification
    EngineStatus(EngineStatus),
    /// Pushed change-group deltas (auto-poll)
    GroupPoll(PollResult),
    /// Socket closed or errored; all pending requests have been failed
    Closed,
}

/// Shared socket state
struct ConnState {
    /// Pending requests waiting for responses, keyed by correlation id
    pending: HashMap<u16, oneshot::Sender<Response>>,
    /// Channel feeding the writer task
    ws_tx: mpsc::UnboundedSender<Message>,
    /// Next candidate request id; cycles through 0..9999
    next_id: u16,
}

impl ConnState {
    /// Allocate the next free request id.
    ///
    /// Ids cycle through 0..9999 and must never collide with a still-pending
    /// request, so any id with an outstanding entry is skipped.
    fn alloc_id(&mut self) -> Result<u16> {
        for _ in 0..protocol::REQUEST_ID_SPAN {
            let id = self.next_id;
            self.next_id = (self.next_id + 1) % protocol::REQUEST_ID_SPAN;
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(QrcError::Channel("request id space exhausted".to_string()))
    }
}

/// One WebSocket session to a core
///
/// Owns the socket for its whole lifetime; a reconnect creates a fresh
/// `Connection` rather than reviving this one. Correlates responses to
/// requests by id and forwards everything else to the session supervisor.
pub(crate) struct Connection {
    state: Arc<Mutex<ConnState>>,
}

impl Connection {
    /// Open a socket to the given QRC URL
    ///
    /// Spawns the writer, reader and keepalive tasks. Returns the connection
    /// plus the event stream the reader feeds; the stream ends with
    /// [`ConnectionEvent::Closed`] exactly once.
    pub(crate) async fn open(
        url: &str,
        heartbeat: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        tracing::info!("Connecting to {}", url);

        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let state = Arc::new(Mutex::new(ConnState {
            pending: HashMap::new(),
            ws_tx: ws_tx.clone(),
            next_id: 0,
        }));

        // Writer: drain outgoing messages onto the socket
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send message: {}", e);
                    break;
                }
            }
        });

        // Keepalive: NoOp notification on a fixed cadence until the socket dies
        let hb_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let noop = Request::new("NoOp", json!({}));
                let text = match serde_json::to_string(&noop) {
                    Ok(text) => text,
                    Err(_) => break,
                };
                if ws_tx.send(Message::Text(text)).is_err() {
                    break;
                }
            }
        });

        // Reader: route inbound frames until the socket closes
        let state_clone = state.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        Self::handle_frame(&state_clone, &event_tx, &text).await;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Core closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Socket gone: fail every outstanding request, then tell the
            // supervisor. Dropping the oneshot senders resolves each waiting
            // caller with ConnectionClosed.
            hb_handle.abort();
            let mut state = state_clone.lock().await;
            state.pending.clear();
            drop(state);
            let _ = event_tx.send(ConnectionEvent::Closed);
        });

        Ok((Self { state }, event_rx))
    }

    async fn handle_frame(
        state: &Arc<Mutex<ConnState>>,
        event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
        text: &str,
    ) {
        tracing::debug!("Received: {}", text);

        match protocol::classify(text) {
            Ok(Inbound::Response(response)) => {
                let mut state = state.lock().await;
                match state.pending.remove(&response.id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    // Already timed out, or stray; dropped without error
                    None => tracing::debug!("Dropping response with no pending id {}", response.id),
                }
            }
            Ok(Inbound::EngineStatus(status)) => {
                let _ = event_tx.send(ConnectionEvent::EngineStatus(status));
            }
            Ok(Inbound::GroupPoll(poll)) => {
                let _ = event_tx.send(ConnectionEvent::GroupPoll(poll));
            }
            Ok(Inbound::Unknown(method)) => {
                tracing::debug!("Ignoring notification: {}", method);
            }
            Err(e) => tracing::warn!("Unparseable frame: {}", e),
        }
    }

    /// Send a request and wait for the matching response
    ///
    /// Responses are matched strictly by id, so out-of-order arrival is fine.
    /// On timeout the pending entry is removed first, which guarantees a late
    /// response is dropped instead of resolving a request that already failed.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut state = self.state.lock().await;
            let id = state.alloc_id()?;
            state.pending.insert(id, tx);

            let request = Request::new(method, params).with_id(id);
            let text = serde_json::to_string(&request)?;
            tracing::debug!("Sending: {}", text);

            if state.ws_tx.send(Message::Text(text)).is_err() {
                state.pending.remove(&id);
                return Err(QrcError::ConnectionClosed);
            }
            id
        };

        let response = match timeout(deadline, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(QrcError::ConnectionClosed),
            Err(_) => {
                let mut state = self.state.lock().await;
                state.pending.remove(&id);
                return Err(QrcError::Timeout);
            }
        };

        response.into_result()
    }

    /// Send a notification (no id, no response)
    pub(crate) async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let state = self.state.lock().await;
        let request = Request::new(method, params);
        let text = serde_json::to_string(&request)?;
        tracing::debug!("Sending (no response): {}", text);

        state
            .ws_tx
            .send(Message::Text(text))
            .map_err(|_| QrcError::ConnectionClosed)?;

        Ok(())
    }

    /// Ask the writer to close the socket
    pub(crate) async fn close(&self) {
        let state = self.state.lock().await;
        let _ = state.ws_tx.send(Message::Close(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    type ServerWs = WebSocketStream<TcpStream>;

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn recv_json(ws: &mut ServerWs) -> Value {
        loop {
            match ws.next().await.expect("socket ended").unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_json(ws: &mut ServerWs, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    fn respond(id: u64, result: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "result": result })
    }

    async fn open(url: &str) -> (Connection, mpsc::UnboundedReceiver<ConnectionEvent>) {
        Connection::open(url, Duration::from_secs(30)).await.unwrap()
    }

    #[tokio::test]
    async fn responses_match_by_id_out_of_order() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let first = recv_json(&mut ws).await;
            let second = recv_json(&mut ws).await;
            // Answer in reverse arrival order, echoing each request's method
            send_json(
                &mut ws,
                respond(second["id"].as_u64().unwrap(), second["method"].clone()),
            )
            .await;
            send_json(
                &mut ws,
                respond(first["id"].as_u64().unwrap(), first["method"].clone()),
            )
            .await;
            ws
        });

        let (conn, _events) = open(&url).await;
        let conn = Arc::new(conn);

        let a = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request("Test.A", json!({}), Duration::from_secs(2)).await
            })
        };
        let b = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request("Test.B", json!({}), Duration::from_secs(2)).await
            })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, json!("Test.A"));
        assert_eq!(b, json!("Test.B"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_request_ignores_late_response() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let first = recv_json(&mut ws).await;
            // Sit on the response until well past the deadline
            tokio::time::sleep(Duration::from_millis(150)).await;
            send_json(&mut ws, respond(first["id"].as_u64().unwrap(), json!("late"))).await;
            // The connection must still be usable afterwards
            let second = recv_json(&mut ws).await;
            send_json(&mut ws, respond(second["id"].as_u64().unwrap(), json!("ok"))).await;
            ws
        });

        let (conn, _events) = open(&url).await;
        let err = conn
            .request("Test.Slow", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, QrcError::Timeout));

        // Give the late response time to arrive and be dropped
        tokio::time::sleep(Duration::from_millis(200)).await;
        let ok = conn
            .request("Test.Fast", json!({}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(ok, json!("ok"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_is_surfaced_verbatim() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let req = recv_json(&mut ws).await;
            send_json(
                &mut ws,
                json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "error": { "code": 8, "message": "Unknown component" }
                }),
            )
            .await;
            ws
        });

        let (conn, _events) = open(&url).await;
        let err = conn
            .request("Component.GetControls", json!({"Name": "nope"}), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            QrcError::Remote { code, message } => {
                assert_eq!(code, 8);
                assert_eq!(message, "Unknown component");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn socket_close_fails_pending_requests() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let _ = recv_json(&mut ws).await;
            drop(ws);
        });

        let (conn, mut events) = open(&url).await;
        let err = conn
            .request("Test.Doomed", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, QrcError::ConnectionClosed));

        // The supervisor is told exactly once
        loop {
            match events.recv().await {
                Some(ConnectionEvent::Closed) | None => break,
                Some(_) => continue,
            }
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn notifications_carry_no_id() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            recv_json(&mut ws).await
        });

        let (conn, _events) = open(&url).await;
        conn.notify("NoOp", json!({})).await.unwrap();
        let frame = server.await.unwrap();
        assert_eq!(frame["method"], json!("NoOp"));
        assert!(frame.get("id").is_none());
    }

    #[tokio::test]
    async fn heartbeat_sends_noop() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            recv_json(&mut ws).await
        });

        let (_conn, _events) = Connection::open(&url, Duration::from_millis(50))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame["method"], json!("NoOp"));
        assert!(frame.get("id").is_none());
    }

    #[tokio::test]
    async fn ids_count_up_from_zero() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            for _ in 0..3u64 {
                let req = recv_json(&mut ws).await;
                let id = req["id"].as_u64().unwrap();
                send_json(&mut ws, respond(id, json!(id))).await;
            }
            ws
        });

        let (conn, _events) = open(&url).await;
        for expected in 0..3u64 {
            let result = conn
                .request("Test.Seq", json!({}), Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(result, json!(expected));
        }
        server.await.unwrap();
    }
}
