//! In-process WebSocket chat server and recorders shared by the async tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::endpoint::Endpoint;
use crate::protocol::{self, ChatEvent};
use crate::session::SessionUpdate;
use crate::supervisor::{ConnectionState, StateCause, SupervisorEvent, SupervisorSink};

/// Timeout for each async wait in tests.
pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Accepts WebSocket clients on an ephemeral port and hands each one to the test.
pub(crate) struct TestServer {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener has no address");
        let (tx, conns) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                if tx.send(ServerConn { ws }).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            conns,
            accept_task,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        Endpoint::parse(&self.url()).expect("test url is valid")
    }

    pub(crate) async fn next_conn(&mut self) -> ServerConn {
        timeout(TEST_TIMEOUT, self.conns.recv())
            .await
            .expect("timed out waiting for a client")
            .expect("accept loop stopped")
    }

    pub(crate) fn try_next_conn(&mut self) -> Option<ServerConn> {
        self.conns.try_recv().ok()
    }

    /// Stop listening; later connection attempts are refused.
    pub(crate) fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Server side of one accepted client.
pub(crate) struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Next chat frame from the client, skipping control frames.
    pub(crate) async fn recv_event(&mut self) -> ChatEvent {
        loop {
            let msg = timeout(TEST_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client went away")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return protocol::decode(text.as_bytes()).expect("client sent an invalid frame");
            }
        }
    }

    /// Wait until the client closes, returning its close frame.
    pub(crate) async fn expect_close(&mut self) -> Option<CloseFrame> {
        loop {
            let next = timeout(TEST_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close");
            match next {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub(crate) async fn send_event(&mut self, event: &ChatEvent) {
        let text = protocol::encode(event).expect("encodable event");
        self.send_raw(&text).await;
    }

    pub(crate) async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("failed to send to client");
    }

    /// Server-initiated close.
    pub(crate) async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// An endpoint nothing listens on.
pub(crate) async fn refused_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind throwaway listener");
    let addr = listener.local_addr().expect("listener has no address");
    drop(listener);
    Endpoint::parse(&format!("ws://{addr}/ws")).expect("valid url")
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Supervisor sink that records everything it is told.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<SupervisorEvent>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn states(&self) -> Vec<ConnectionState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::StateChanged { state, .. } => Some(state.clone()),
                SupervisorEvent::Received(_) => None,
            })
            .collect()
    }

    pub(crate) fn causes(&self) -> Vec<StateCause> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::StateChanged { cause, .. } => Some(cause.clone()),
                SupervisorEvent::Received(_) => None,
            })
            .collect()
    }

    pub(crate) fn received(&self) -> Vec<ChatEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::Received(event) => Some(event.clone()),
                SupervisorEvent::StateChanged { .. } => None,
            })
            .collect()
    }

    pub(crate) async fn wait_for_state(&self, predicate: impl Fn(&ConnectionState) -> bool) {
        wait_until("state", || self.states().iter().any(&predicate)).await;
    }

    pub(crate) async fn wait_for_cause(&self, predicate: impl Fn(&StateCause) -> bool) {
        wait_until("cause", || self.causes().iter().any(&predicate)).await;
    }

    pub(crate) async fn wait_for_received(&self, count: usize) {
        wait_until("received events", || self.received().len() >= count).await;
    }
}

impl SupervisorSink for RecordingSink {
    fn notify(&self, event: SupervisorEvent) {
        self.events.lock().push(event);
    }
}

/// Drains a session update channel into a log the test can query.
///
/// Waits consume the log: each `wait_for` only looks past the previous match.
pub(crate) struct UpdateLog {
    rx: mpsc::UnboundedReceiver<SessionUpdate>,
    seen: Vec<SessionUpdate>,
    cursor: usize,
}

impl UpdateLog {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SessionUpdate>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
            cursor: 0,
        }
    }

    /// Receive until an update satisfies `predicate`, returning it.
    pub(crate) async fn wait_for(
        &mut self,
        predicate: impl Fn(&SessionUpdate) -> bool,
    ) -> SessionUpdate {
        if let Some(offset) = self.seen[self.cursor..].iter().position(&predicate) {
            self.cursor += offset + 1;
            return self.seen[self.cursor - 1].clone();
        }
        loop {
            let update = timeout(TEST_TIMEOUT, self.rx.recv())
                .await
                .expect("timed out waiting for session update")
                .expect("update channel closed");
            self.seen.push(update.clone());
            if predicate(&update) {
                self.cursor = self.seen.len();
                return update;
            }
        }
    }

    pub(crate) async fn wait_for_state(&mut self, state: ConnectionState) {
        self.wait_for(|u| matches!(u, SessionUpdate::ConnectionStateChanged(s) if *s == state))
            .await;
    }

    /// Everything received so far, including whatever is already queued.
    pub(crate) fn drain(&mut self) -> &[SessionUpdate] {
        while let Ok(update) = self.rx.try_recv() {
            self.seen.push(update);
        }
        &self.seen
    }

    pub(crate) fn states(&mut self) -> Vec<ConnectionState> {
        self.drain()
            .iter()
            .filter_map(|u| match u {
                SessionUpdate::ConnectionStateChanged(state) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }
}
