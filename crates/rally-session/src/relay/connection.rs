//! Background Action Cable connection loop with auto-reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::handler::{handle_frame, FrameOutcome, HandlerContext};
use super::types::{CableCommand, CableFrame, RelayCommand, RelayOptions};
use crate::peer::Lifecycle;
use crate::transport::TransportEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

type CommandRx = Arc<Mutex<mpsc::Receiver<RelayCommand>>>;

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

/// Runs until the client disconnects, the handle is dropped, or the server
/// refuses reconnection.
pub(crate) async fn connection_loop(
    options: RelayOptions,
    subscribed: Arc<RwLock<bool>>,
    event_tx: broadcast::Sender<TransportEvent>,
    command_rx: mpsc::Receiver<RelayCommand>,
) {
    let command_rx: CommandRx = Arc::new(Mutex::new(command_rx));
    let identifier = match options.identifier().encode() {
        Ok(identifier) => identifier,
        Err(e) => {
            error!(error = %e, "failed to encode relay channel identifier");
            return;
        }
    };
    let ctx = HandlerContext {
        local: options.player_id.clone(),
        identifier: options.identifier(),
        subscribed: Arc::clone(&subscribed),
        event_tx: event_tx.clone(),
    };
    let closing = Arc::new(AtomicBool::new(false));
    let mut reconnect_delay = options.reconnect_delay_secs;

    loop {
        info!(url = %options.url, session = %options.session_id, "connecting to relay");

        match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&options.url)).await {
            Ok(Ok((ws_stream, _))) => {
                reconnect_delay = options.reconnect_delay_secs;

                let (ws_write, mut ws_read) = ws_stream.split();
                let ws_write = Arc::new(Mutex::new(ws_write));

                let mut cmd_handle = tokio::spawn(command_forwarder(
                    Arc::clone(&command_rx),
                    Arc::clone(&ws_write),
                    identifier.clone(),
                    Arc::clone(&closing),
                ));

                loop {
                    tokio::select! {
                        msg = ws_read.next() => match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                let Ok(frame) = serde_json::from_str::<CableFrame>(&text) else {
                                    debug!(text = %text, "unrecognised relay frame");
                                    continue;
                                };
                                match handle_frame(&frame, &ctx).await {
                                    FrameOutcome::Continue => {}
                                    FrameOutcome::Subscribe => {
                                        write_command(&*ws_write, &CableCommand::subscribe(identifier.clone())).await;
                                    }
                                    FrameOutcome::Close { reconnect } => {
                                        if !reconnect {
                                            closing.store(true, Ordering::SeqCst);
                                        }
                                        break;
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                info!("relay closed connection");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "relay socket error");
                                break;
                            }
                            Some(Ok(_)) => {}
                        },
                        _ = &mut cmd_handle => break,
                    }
                }

                // Cleanup.
                cmd_handle.abort();
                *subscribed.write().await = false;
                let _ = event_tx.send(TransportEvent::Lifecycle {
                    remote: None,
                    state: Lifecycle::Disconnected,
                });
            }
            Ok(Err(e)) => {
                error!(error = %e, "failed to connect to relay");
                let _ = event_tx.send(TransportEvent::Lifecycle {
                    remote: None,
                    state: Lifecycle::Error,
                });
            }
            Err(_elapsed) => {
                error!("relay connection timed out after {}s", CONNECT_TIMEOUT.as_secs());
                let _ = event_tx.send(TransportEvent::Lifecycle {
                    remote: None,
                    state: Lifecycle::Error,
                });
            }
        }

        if closing.load(Ordering::SeqCst) {
            info!("relay connection closed");
            return;
        }

        // Exponential backoff reconnect.
        info!(delay = reconnect_delay, "reconnecting to relay in {} seconds", reconnect_delay);
        let sleep = tokio::time::sleep(Duration::from_secs(reconnect_delay));
        tokio::select! {
            _ = sleep => {}
            _ = wait_for_disconnect(&command_rx) => {
                info!("relay disconnect requested while reconnecting");
                return;
            }
        }
        reconnect_delay = (reconnect_delay * 2).min(options.max_reconnect_delay_secs);
    }
}

/// Drop commands that arrive between sockets until a disconnect shows up.
async fn wait_for_disconnect(command_rx: &CommandRx) {
    let mut rx = command_rx.lock().await;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RelayCommand::Disconnect => return,
            RelayCommand::Perform(_) => debug!("relay not connected, payload dropped"),
        }
    }
}

async fn write_command<S>(ws_write: &Mutex<S>, command: &CableCommand) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    match serde_json::to_string(command) {
        Ok(json) => ws_write.lock().await.send(WsMessage::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode relay command");
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Command Forwarder
// ---------------------------------------------------------------------------

async fn command_forwarder<S>(
    cmd_rx: CommandRx,
    cmd_write: Arc<Mutex<S>>,
    identifier: String,
    closing: Arc<AtomicBool>,
) where
    S: Sink<WsMessage> + Unpin,
{
    let mut rx = cmd_rx.lock().await;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RelayCommand::Perform(message) => {
                let timestamp = chrono::Utc::now().timestamp_millis();
                match CableCommand::perform(identifier.clone(), &message, timestamp) {
                    Ok(command) => {
                        if !write_command(&*cmd_write, &command).await {
                            warn!("relay write failed");
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode relay payload"),
                }
            }
            RelayCommand::Disconnect => {
                closing.store(true, Ordering::SeqCst);
                write_command(&*cmd_write, &CableCommand::unsubscribe(identifier.clone())).await;
                let _ = cmd_write.lock().await.send(WsMessage::Close(None)).await;
                return;
            }
        }
    }
    // Every handle is gone.
    closing.store(true, Ordering::SeqCst);
}
