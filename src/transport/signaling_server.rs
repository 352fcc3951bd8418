//! WebSocket signaling server
//!
//! Glue between axum WebSockets and the protocol state machine. Each socket
//! is split into a writer task draining the connection's `SignalingHandle`
//! and a loop that interleaves inbound frames with RTC session events.

use super::protocol::{Flow, SignalingSession};
use super::{ConnectionParams, OutboundFrame, SignalingHandle};
use crate::web::SharedState;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Grace period for the writer to flush after the connection ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawn the task forwarding queued frames to the socket
fn spawn_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let result = match frame {
                OutboundFrame::Text(text) => ws_sender.send(Message::Text(text.into())).await,
                OutboundFrame::Ping => ws_sender.send(Message::Ping(Bytes::new())).await,
                OutboundFrame::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    })
}

/// Handle a publisher/viewer signaling WebSocket connection
pub async fn handle_signaling_connection(socket: WebSocket, params: ConnectionParams, state: Arc<SharedState>) {
    info!(
        "New signaling connection (peerId={}, role={})",
        params.peer_id, params.role
    );
    let (ws_sender, mut ws_receiver) = socket.split();
    let (signaling, outbound) = SignalingHandle::channel();
    let send_task = spawn_writer(ws_sender, outbound);

    let opened = SignalingSession::open(
        params,
        signaling.clone(),
        state.broker.clone(),
        state.sessions.as_ref(),
    )
    .await;
    let (mut session, mut events) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Rejecting signaling connection: {}", e);
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, send_task).await;
            return;
        }
    };

    let ping_secs = state.config.server.ping_interval_secs;
    let mut ping = tokio::time::interval(Duration::from_secs(ping_secs.max(1)));
    ping.tick().await;

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame from {}", data.len(), session.key());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error from {}: {}", session.key(), e);
                    break;
                }
            },
            Some(event) = events.recv() => {
                if session.handle_rtc_event(event).await == Flow::Stop {
                    break;
                }
            }
            _ = ping.tick(), if ping_secs > 0 => {
                signaling.ping();
            }
        }
    }

    session.handle_transport_closed().await;
    signaling.close();
    let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, send_task).await;

    info!("Signaling connection handler finished ({})", session.key());
}

/// Handle a signaling-only connection with no peer identity
pub async fn handle_generic_connection(socket: WebSocket, state: Arc<SharedState>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (signaling, outbound) = SignalingHandle::channel();
    let id = signaling.id();
    let send_task = spawn_writer(ws_sender, outbound);

    state.broker.create_generic_connection(signaling);

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Generic connection {} sent {} bytes", id, text.len());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Generic connection {} error: {}", id, e);
                break;
            }
        }
    }

    state.broker.destroy_generic_connection(id);
    let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, send_task).await;
}
