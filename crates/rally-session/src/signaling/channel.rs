//! WebSocket signaling client for the dev relay protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rally_common::{ParticipantId, SessionId};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{JoinRequest, MessageHandler, Signaling, SignalingEvent, JOIN_FAILED};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Connection settings for a [`SignalingChannel`].
#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub url: String,
    pub session_id: SessionId,
    pub peer_id: ParticipantId,
    /// Reconnects attempted after a drop before giving up.
    pub max_reconnect_attempts: u32,
    /// Reconnect `n` waits `n * reconnect_base_delay`.
    pub reconnect_base_delay: Duration,
    pub connect_timeout: Duration,
}

impl SignalingOptions {
    pub fn new(url: impl Into<String>, session_id: SessionId, peer_id: ParticipantId) -> Self {
        Self {
            url: url.into(),
            session_id,
            peer_id,
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

type Outbound = mpsc::UnboundedSender<WsMessage>;

struct Shared {
    options: SignalingOptions,
    handler: RwLock<Option<MessageHandler>>,
    outbound: Mutex<Option<Outbound>>,
    /// Bumped by `connect` and `disconnect`; loops of older generations exit.
    generation: AtomicU64,
    cancelled: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn emit(&self, event: SignalingEvent) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(event),
            None => debug!("no signaling handler set, event dropped"),
        }
    }
}

/// Reconnecting WebSocket client for the dev relay.
///
/// On every successful open it sends `{type:"join", sessionId, peerId}` and
/// reports [`SignalingEvent::Connected`]. Drops are retried with linear
/// backoff up to `max_reconnect_attempts`.
#[derive(Clone)]
pub struct SignalingChannel {
    shared: Arc<Shared>,
}

impl SignalingChannel {
    pub fn new(options: SignalingOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                handler: RwLock::new(None),
                outbound: Mutex::new(None),
                generation: AtomicU64::new(0),
                cancelled: Notify::new(),
            }),
        }
    }

    pub fn options(&self) -> &SignalingOptions {
        &self.shared.options
    }
}

impl Signaling for SignalingChannel {
    fn connect(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.shared.outbound).take();
        self.shared.cancelled.notify_waiters();
        tokio::spawn(connection_loop(Arc::clone(&self.shared), generation));
    }

    fn send(&self, message: Value) {
        let outbound = lock(&self.shared.outbound);
        match outbound.as_ref() {
            Some(tx) if tx.send(WsMessage::Text(message.to_string().into())).is_ok() => {}
            _ => warn!("signaling not connected, message not sent"),
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.outbound).take();
        self.shared.cancelled.notify_waiters();
        info!("signaling disconnected");
    }

    fn is_connected(&self) -> bool {
        lock(&self.shared.outbound).is_some()
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

async fn connection_loop(shared: Arc<Shared>, generation: u64) {
    let options = shared.options.clone();
    let mut attempt: u32 = 0;

    loop {
        if !shared.is_current(generation) {
            return;
        }

        info!(url = %options.url, session = %options.session_id, "connecting to signaling server");
        match tokio::time::timeout(
            options.connect_timeout,
            tokio_tungstenite::connect_async(options.url.as_str()),
        )
        .await
        {
            Ok(Ok((ws, _))) => {
                if !shared.is_current(generation) {
                    return;
                }
                attempt = 0;
                run_socket(&shared, generation, ws).await;
                if !shared.is_current(generation) {
                    return;
                }
                info!("signaling connection lost");
                shared.emit(SignalingEvent::Disconnected);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to signaling server");
            }
            Err(_elapsed) => {
                warn!(
                    timeout_secs = options.connect_timeout.as_secs(),
                    "signaling connection timed out"
                );
            }
        }

        attempt += 1;
        if attempt > options.max_reconnect_attempts {
            error!(
                attempts = options.max_reconnect_attempts,
                "max signaling reconnection attempts reached"
            );
            if shared.is_current(generation) {
                shared.emit(SignalingEvent::Failed(JOIN_FAILED.to_string()));
            }
            return;
        }

        let delay = reconnect_delay(options.reconnect_base_delay, attempt);
        info!(
            attempt,
            max = options.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnecting to signaling server"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.cancelled.notified() => {}
        }
    }
}

/// Linear backoff: reconnect `attempt` waits `attempt * base`.
fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt
}

async fn run_socket(
    shared: &Arc<Shared>,
    generation: u64,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
) {
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let options = &shared.options;
    let join = JoinRequest::new(options.session_id.as_str(), options.peer_id.as_str());
    match serde_json::to_string(&join) {
        Ok(json) => {
            let _ = tx.send(WsMessage::Text(json.into()));
        }
        Err(e) => {
            error!(error = %e, "failed to encode join request");
            return;
        }
    }

    *lock(&shared.outbound) = Some(tx);
    info!(session = %options.session_id, peer = %options.peer_id, "signaling connected");
    shared.emit(SignalingEvent::Connected);

    // Ends once every sender is dropped, closing the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => shared.emit(SignalingEvent::Message(value)),
                    Err(e) => debug!(error = %e, "unparseable signaling frame dropped"),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("signaling server closed connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "signaling socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = shared.cancelled.notified() => {
                if !shared.is_current(generation) {
                    break;
                }
            }
        }
    }

    if shared.is_current(generation) {
        lock(&shared.outbound).take();
    }
    if tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .is_err()
    {
        debug!("signaling writer did not finish in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerSocket = WebSocketStream<TcpStream>;

    fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (handler, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("handler dropped")
    }

    async fn next_text(ws: &mut ServerSocket) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    fn options(url: String) -> SignalingOptions {
        let mut options = SignalingOptions::new(url, "s1".into(), "p1".into());
        options.reconnect_base_delay = Duration::from_millis(10);
        options.connect_timeout = Duration::from_secs(2);
        options
    }

    #[tokio::test]
    async fn joins_on_open_and_relays_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let join = next_text(&mut ws).await;
            ws.send(WsMessage::Text("not json".into())).await.unwrap();
            ws.send(WsMessage::Text(r#"{"type":"Connection","state":"SessionJoin"}"#.into()))
                .await
                .unwrap();
            let outbound = next_text(&mut ws).await;
            (join, outbound)
        });

        let channel = SignalingChannel::new(options(url));
        let (handler, mut events) = collecting_handler();
        channel.set_message_handler(handler);
        channel.connect();

        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        assert!(channel.is_connected());
        match next_event(&mut events).await {
            SignalingEvent::Message(value) => assert_eq!(value["state"], "SessionJoin"),
            other => panic!("unexpected event {other:?}"),
        }

        channel.send(serde_json::json!({"hello": "world"}));
        let (join, outbound) = server.await.unwrap();
        assert_eq!(
            join,
            serde_json::json!({"type": "join", "sessionId": "s1", "peerId": "p1"})
        );
        assert_eq!(outbound["hello"], "world");
        channel.disconnect();
    }

    #[tokio::test]
    async fn send_while_disconnected_is_a_no_op() {
        let channel = SignalingChannel::new(options("ws://127.0.0.1:1".into()));
        assert!(!channel.is_connected());
        channel.send(serde_json::json!({"state": "SessionJoin"}));
    }

    #[tokio::test]
    async fn exhausted_reconnects_report_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut opts = options(url);
        opts.max_reconnect_attempts = 2;
        let channel = SignalingChannel::new(opts);
        let (handler, mut events) = collecting_handler();
        channel.set_message_handler(handler);
        channel.connect();

        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Failed(JOIN_FAILED.to_string())
        );
    }

    #[test]
    fn reconnect_delay_grows_linearly() {
        let base = Duration::from_millis(1000);
        let delays: Vec<_> = (1..=4).map(|attempt| reconnect_delay(base, attempt)).collect();
        assert_eq!(
            delays,
            [1000, 2000, 3000, 4000].map(Duration::from_millis).to_vec()
        );
    }

    #[tokio::test]
    async fn failed_attempts_back_off_linearly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let mut opts = options(url);
        opts.reconnect_base_delay = Duration::from_millis(100);
        opts.max_reconnect_attempts = 3;
        let channel = SignalingChannel::new(opts);
        let (handler, mut events) = collecting_handler();
        channel.set_message_handler(handler);
        channel.connect();

        // Dropping the TCP stream fails the handshake, so every accept is one attempt.
        let mut accepted = Vec::new();
        for _ in 0..4 {
            let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .expect("client stopped retrying")
                .unwrap();
            accepted.push(tokio::time::Instant::now());
            drop(stream);
        }
        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Failed(JOIN_FAILED.to_string())
        );

        let gaps: Vec<Duration> = accepted.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(100), "{gaps:?}");
        assert!(gaps[0] < Duration::from_millis(250), "{gaps:?}");
        assert!(gaps[1] >= Duration::from_millis(200), "{gaps:?}");
        assert!(gaps[2] >= Duration::from_millis(300), "{gaps:?}");
    }

    #[tokio::test]
    async fn successful_open_resets_the_attempt_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            for _ in 0..3 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                let _ = next_text(&mut ws).await;
                ws.close(None).await.unwrap();
            }
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        // One retry per drop is enough as long as each open refills the budget.
        let mut opts = options(url);
        opts.max_reconnect_attempts = 1;
        let channel = SignalingChannel::new(opts);
        let (handler, mut events) = collecting_handler();
        channel.set_message_handler(handler);
        channel.connect();

        for _ in 0..3 {
            assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
            assert_eq!(next_event(&mut events).await, SignalingEvent::Disconnected);
        }
        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        channel.disconnect();
    }

    #[tokio::test]
    async fn reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            // First session is closed straight after the join frame.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = next_text(&mut ws).await;
            ws.close(None).await.unwrap();

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let join = next_text(&mut ws).await;
            assert_eq!(join["type"], "join");
            // Hold the socket open until the client leaves.
            while ws.next().await.is_some() {}
        });

        let channel = SignalingChannel::new(options(url));
        let (handler, mut events) = collecting_handler();
        channel.set_message_handler(handler);
        channel.connect();

        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        assert_eq!(next_event(&mut events).await, SignalingEvent::Disconnected);
        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        channel.disconnect();
    }

    #[tokio::test]
    async fn disconnect_cancels_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut opts = options(url);
        opts.reconnect_base_delay = Duration::from_millis(200);
        let channel = SignalingChannel::new(opts);
        let (handler, mut events) = collecting_handler();
        channel.set_message_handler(handler);
        channel.connect();
        channel.disconnect();

        let waited = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
        assert!(waited.is_err(), "no event expected after disconnect");
    }
}
