//! WebSocket streaming of one session's terminal.
//!
//! The general protocol of attaching is:
//! Client -> WebSocket: [`ATTACH_REQUEST`] with a postcard serialized [`AttachRequest`].
//! WebSocket -> Client: [`ATTACH_OK`] with the session's cols and rows, then
//! the catch-up frames followed by live [`OUTPUT_FRAME`] messages.
//!
//! The socket is split into paired tasks: the receive side validates and
//! routes client commands (input, resize, detach), the send side delivers
//! frames. Closing the socket never ends the session; the gateway may
//! reconnect and resume from the ring buffer.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::{Buf, BufMut, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use postcard::from_bytes;
use protocol::*;
use session_core::model::Frame;
use session_core::services::TokenIdentity;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::Receiver;

/// Is called on error, sends the reason as a gateway error message followed
/// by a close frame.
async fn send_closing_message(
    sender: &mut SplitSink<WebSocket, Message>,
    closing_message: String,
) {
    let raw_data = closing_message.as_bytes();
    let mut msg = BytesMut::with_capacity(1 + raw_data.len());
    msg.put_u8(GATEWAY_ERROR);
    msg.put_slice(raw_data);

    let _ = sender.send(Message::Binary(msg.into())).await;
    let _ = sender.send(Message::Close(None)).await;
}

/// Everything the pump tasks need after a successful attach.
struct AttachOutcome {
    identity: TokenIdentity,
    spectate: bool,
    frames: Receiver<Frame>,
}

/// This function gets immediately called and upgrades the web response to a
/// web socket.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_session(socket, state, session_id))
}

/// Reads the attach request from the socket, validates the token and
/// subscribes to the session's frame stream.
async fn attach(
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    state: &Arc<AppState>,
    session_id: &str,
) -> Option<AttachOutcome> {
    // The first binary message we receive must be the attach request.
    let my_data = loop {
        let Some(raw_data) = receiver.next().await else {
            tracing::warn!("WebSocket closed before attach completed");
            return None;
        };
        match raw_data {
            Err(err) => {
                tracing::error!(?err, "Initial error during attach.");
                send_closing_message(sender, "Initial error during attach.".into()).await;
                return None;
            }
            Ok(Message::Binary(data)) => {
                break data;
            }
            // We do not care about any other message like ping pong messages.
            Ok(_) => {}
        }
    };

    if my_data.first() != Some(&ATTACH_REQUEST) {
        send_closing_message(sender, "Expected an attach request.".into()).await;
        return None;
    }
    let request = match from_bytes::<AttachRequest>(&my_data[1..]) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = ?e, "Failed to parse attach request");
            send_closing_message(sender, "Failed to parse attach request.".into()).await;
            return None;
        }
    };

    let identity = match state.credentials.validate_token(&request.token).await {
        Ok(identity) => identity,
        Err(error) => {
            tracing::warn!(?error, %session_id, "attach with invalid token");
            send_closing_message(sender, "Invalid token.".into()).await;
            return None;
        }
    };

    let (cols, rows, frames) = if request.spectate {
        let outcome = state
            .orchestrator
            .attach_spectator(session_id, identity.user_id, &identity.username)
            .await;
        let (_handle, frames) = match outcome {
            Ok(pair) => pair,
            Err(error) => {
                send_closing_message(sender, format!("Spectate refused: {error}")).await;
                return None;
            }
        };
        match state.orchestrator.get_session(session_id).await {
            Ok(session) => (session.cols, session.rows, frames),
            Err(error) => {
                send_closing_message(sender, format!("Session lookup failed: {error}")).await;
                return None;
            }
        }
    } else {
        match state
            .orchestrator
            .attach_player(session_id, identity.user_id)
            .await
        {
            Ok((session, frames)) => (session.cols, session.rows, frames),
            Err(error) => {
                send_closing_message(sender, format!("Attach refused: {error}")).await;
                return None;
            }
        }
    };

    let mut msg = BytesMut::with_capacity(ATTACH_OK_SIZE);
    msg.put_u8(ATTACH_OK);
    msg.put_u16(cols);
    msg.put_u16(rows);
    if sender.send(Message::Binary(msg.into())).await.is_err() {
        return None;
    }

    Some(AttachOutcome {
        identity,
        spectate: request.spectate,
        frames,
    })
}

/// Does the whole handling from start to finish: attach handshake ->
/// paired pump tasks -> shut down processing.
async fn stream_session(stream: WebSocket, state: Arc<AppState>, session_id: String) {
    // By splitting, we can send and receive at the same time.
    let (mut sender, mut receiver) = stream.split();

    let Some(outcome) = attach(&mut sender, &mut receiver, &state, &session_id).await else {
        return;
    };
    let AttachOutcome {
        identity,
        spectate,
        frames,
    } = outcome;
    tracing::info!(
        %session_id,
        user_id = identity.user_id,
        username = %identity.username,
        spectate,
        "stream attached"
    );

    let wrapped_sender = Arc::new(Mutex::new(sender));
    let mut send_task = tokio::spawn(send_logic(wrapped_sender.clone(), frames));

    let receive_state = state.clone();
    let receive_session = session_id.clone();
    let mut receive_task = tokio::spawn(async move {
        receive_logic(receiver, receive_state, receive_session, spectate).await
    });

    // If any one of the tasks run to completion, we abort the other.
    let result = tokio::select! {
        res_a = &mut send_task => {receive_task.abort(); res_a},
        res_b = &mut receive_task => {send_task.abort(); res_b},
    };
    let reason = result.unwrap_or_else(|err| {
        tracing::error!(?err, "Internal panic in stream logic.");
        "Internal panic in stream logic."
    });

    // A spectator leaving its socket leaves the session; the player's
    // session keeps running and may be re-attached.
    if spectate {
        if let Err(error) = state
            .orchestrator
            .remove_spectator(&session_id, identity.user_id)
            .await
        {
            tracing::debug!(?error, %session_id, "spectator already removed");
        }
    }

    let mut sender = wrapped_sender.lock().await;
    send_closing_message(&mut sender, reason.into()).await;
    tracing::info!(%session_id, user_id = identity.user_id, reason, "stream detached");
}

/// Delivers frames to this client. Each frame carries its id and timestamp so
/// clients can reason about gaps and replay timing.
async fn send_logic(
    sender: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    mut frames: Receiver<Frame>,
) -> &'static str {
    let mut enclosed = sender.lock().await;

    while let Some(frame) = frames.recv().await {
        let mut msg = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.data.len());
        msg.put_u8(OUTPUT_FRAME);
        msg.put_u64(frame.id);
        msg.put_i64(frame.timestamp_ns);
        msg.put_slice(&frame.data);
        if enclosed.send(Message::Binary(msg.into())).await.is_err() {
            return "Connection lost.";
        }
    }

    // The frame channel closed: the session ended or this watcher was removed.
    let mut closing = BytesMut::with_capacity(SESSION_CLOSED_MSG_SIZE);
    closing.put_u8(SESSION_CLOSED);
    let _ = enclosed.send(Message::Binary(closing.into())).await;
    "Session stream closed."
}

/// Takes care of the messages that are coming from the client side.
async fn receive_logic(
    mut receiver: SplitStream<WebSocket>,
    state: Arc<AppState>,
    session_id: String,
    spectate: bool,
) -> &'static str {
    while let Some(incoming) = receiver.next().await {
        match incoming {
            Ok(Message::Binary(bytes)) => {
                if bytes.is_empty() {
                    tracing::error!(%session_id, "Illegal empty message on session stream.");
                    return "Illegal empty message received.";
                }
                match bytes[0] {
                    PLAYER_INPUT => {
                        // Spectators only watch.
                        if spectate {
                            continue;
                        }
                        if let Err(error) = state
                            .orchestrator
                            .write_input(&session_id, &bytes[1..])
                            .await
                        {
                            tracing::warn!(?error, %session_id, "input rejected");
                            return "Session no longer accepts input.";
                        }
                    }
                    RESIZE_TERMINAL => {
                        if spectate {
                            continue;
                        }
                        if bytes.len() < RESIZE_MSG_SIZE {
                            tracing::error!(%session_id, "Malformed resize message");
                            return "Malformed resize message.";
                        }
                        let mut fields = &bytes[1..];
                        let cols = fields.get_u16();
                        let rows = fields.get_u16();
                        if let Err(error) = state
                            .orchestrator
                            .resize_terminal(&session_id, cols, rows)
                            .await
                        {
                            tracing::warn!(?error, %session_id, cols, rows, "resize rejected");
                            return "Resize rejected.";
                        }
                    }
                    CLIENT_DETACH => {
                        return "Client detached intentionally";
                    }
                    _ => {
                        tracing::error!(command = bytes[0], %session_id, "Illegal command from client.");
                        return "Illegal command from client";
                    }
                }
            }
            Ok(_) => {} // Ignore other messages
            Err(_) => {
                return "Connection lost.";
            }
        }
    }
    "Connection lost."
}
