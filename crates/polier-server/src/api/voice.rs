//! Realtime voice websocket endpoint for `/voice/ws`.
//!
//! Frontend responsibilities:
//! - microphone capture and playback
//! - client-side transcription (fragments arrive as text)
//!
//! Backend responsibilities:
//! - turn segmentation (idle timeout, explicit end, size limits)
//! - completion loop -> streamed assistant text
//! - speech synthesis -> streamed audio frames
//! - interruption / barge-in cancellation

use std::pin::pin;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, warn};

use polier_agent::history::Role;
use polier_agent::provider::ProviderMessage;

use crate::session::{FlushTrigger, PushOutcome, Session, IDLE_FLUSH_TIMEOUT};
use crate::state::AppState;
use crate::tts::stream_synthesis;

pub fn router() -> Router<AppState> {
    Router::new().route("/voice/ws", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
struct VoiceQuery {
    #[serde(default)]
    conversation_id: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<VoiceQuery>,
) -> Response {
    let conversation_id = query
        .conversation_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, conversation_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, conversation_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let session = Arc::new(Session::new(conversation_id));
    send_json(
        &out_tx,
        json!({
            "type": "server_hello",
            "conversation_id": session.conversation_id,
        }),
    );

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                warn!("voice websocket receive error: {err}");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                handle_text_frame(&state, &out_tx, &session, text.as_str()).await;
            }
            Message::Binary(data) => {
                // Audio upload is acknowledged but not processed;
                // transcription happens client-side.
                send_json(
                    &out_tx,
                    json!({ "type": "binary_received", "bytes": data.len() }),
                );
            }
            Message::Close(_) => break,
            Message::Ping(payload) => {
                let _ = out_tx.send(Message::Pong(payload));
            }
            Message::Pong(_) => {}
        }
    }

    session.cancel_idle_timer().await;
    interrupt_active_response(&out_tx, &session, "disconnect").await;
    drop(out_tx);
    let _ = writer.await;
}

/// Dispatch one client text frame. Malformed input is reported in-band
/// and never tears down the connection.
async fn handle_text_frame(
    state: &AppState,
    out_tx: &mpsc::UnboundedSender<Message>,
    session: &Arc<Session>,
    text: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            send_error(out_tx, "invalid_json");
            return;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("user_message") => {
            on_user_message(state, out_tx, session, value.get("text")).await;
        }
        Some("end_turn") => {
            session.cancel_idle_timer().await;
            flush_turn(state, out_tx, session, FlushTrigger::ExplicitEndTurn).await;
        }
        Some("interrupt") => {
            session.cancel_idle_timer().await;
            session.turn.lock().await.clear();
            interrupt_active_response(out_tx, session, "interrupt").await;
            send_json(out_tx, json!({ "type": "interrupted" }));
        }
        _ => send_error(out_tx, "unknown_type"),
    }
}

async fn on_user_message(
    state: &AppState,
    out_tx: &mpsc::UnboundedSender<Message>,
    session: &Arc<Session>,
    raw_text: Option<&Value>,
) {
    let Some(text) = raw_text.and_then(Value::as_str) else {
        send_error(out_tx, "invalid_text");
        return;
    };

    // New speech supersedes whatever the assistant is still saying.
    interrupt_active_response(out_tx, session, "new_user_message").await;

    let fragment = text.trim();
    if fragment.is_empty() {
        return;
    }

    let outcome = session.turn.lock().await.push(fragment);
    match outcome {
        PushOutcome::Appended => arm_idle_timer(state, out_tx, session).await,
        PushOutcome::TooLarge => {
            // The oversized fragment is dropped; everything buffered so
            // far goes out as a turn.
            send_error(out_tx, "turn_too_large");
            session.cancel_idle_timer().await;
            flush_turn(state, out_tx, session, FlushTrigger::Limits).await;
        }
    }
}

/// (Re)arm the silence timer. The epoch check keeps a timer that
/// already woke from flushing after it has been superseded.
async fn arm_idle_timer(
    state: &AppState,
    out_tx: &mpsc::UnboundedSender<Message>,
    session: &Arc<Session>,
) {
    let epoch = session.next_timer_epoch();
    let mut guard = session.idle_timer.lock().await;
    if let Some(previous) = guard.take() {
        previous.abort();
    }

    let state = state.clone();
    let out_tx = out_tx.clone();
    let timer_session = Arc::clone(session);
    *guard = Some(tokio::spawn(async move {
        tokio::time::sleep(IDLE_FLUSH_TIMEOUT).await;
        if !timer_session.timer_epoch_is_current(epoch) {
            return;
        }
        flush_turn(&state, &out_tx, &timer_session, FlushTrigger::IdleTimeout).await;
    }));
}

/// Close the buffered turn and start generating a response for it.
/// A no-op when nothing is buffered.
async fn flush_turn(
    state: &AppState,
    out_tx: &mpsc::UnboundedSender<Message>,
    session: &Arc<Session>,
    trigger: FlushTrigger,
) {
    let joined = session.turn.lock().await.take_joined();
    let Some(turn_text) = joined else {
        return;
    };

    interrupt_active_response(out_tx, session, "new_turn").await;

    state
        .history
        .append(&session.conversation_id, Role::User, &turn_text)
        .await;
    send_json(
        out_tx,
        json!({ "type": "turn_complete", "trigger": trigger.as_str() }),
    );

    let task = tokio::spawn(run_response_task(
        state.clone(),
        out_tx.clone(),
        session.conversation_id.clone(),
    ));
    *session.active_response.lock().await = Some(task);
}

/// Abort the in-flight response, if any, and tell the client the stream
/// ended early. Nothing is emitted when the task already finished.
async fn interrupt_active_response(
    out_tx: &mpsc::UnboundedSender<Message>,
    session: &Session,
    reason: &str,
) {
    if let Some(task) = session.active_response.lock().await.take() {
        if task.is_finished() {
            return;
        }
        task.abort();
        send_json(out_tx, json!({ "type": "stream_cancelled", "reason": reason }));
    }
}

/// One response: completion loop and speech synthesis running
/// concurrently, text chunks teed to both the client and the
/// synthesizer. Runs as its own task so barge-in can abort it; every
/// await point in here is a cancellation point.
async fn run_response_task(
    state: AppState,
    out_tx: mpsc::UnboundedSender<Message>,
    conversation_id: String,
) {
    let Ok(_permit) = state.request_semaphore.clone().acquire_owned().await else {
        return;
    };

    send_json(&out_tx, json!({ "type": "assistant_start" }));

    let messages: Vec<ProviderMessage> = state
        .history
        .entries(&conversation_id)
        .await
        .into_iter()
        .map(|entry| match entry.role {
            Role::User => ProviderMessage::user_text(entry.text),
            Role::Assistant => ProviderMessage::assistant_text(entry.text),
        })
        .collect();

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(32);
    let (synth_text_tx, synth_text_rx) = mpsc::unbounded_channel::<String>();
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(32);

    let engine = Arc::clone(&state.engine);
    let mut engine_fut = pin!(engine.run(messages, chunk_tx));

    let synthesis = state.synthesis.clone();
    let mut synth_fut = pin!(async move {
        if synthesis.enabled() {
            stream_synthesis(&synthesis, synth_text_rx, audio_tx).await
        } else {
            drop(synth_text_rx);
            drop(audio_tx);
            Ok(())
        }
    });

    let mut engine_result = None;
    let mut synth_result = None;
    let mut synth_text_tx = Some(synth_text_tx);
    let mut chunks_open = true;
    let mut audio_open = true;
    let mut full_text = String::new();

    while engine_result.is_none() || synth_result.is_none() || chunks_open || audio_open {
        tokio::select! {
            result = &mut engine_fut, if engine_result.is_none() => {
                engine_result = Some(result);
            }
            result = &mut synth_fut, if synth_result.is_none() => {
                synth_result = Some(result);
            }
            chunk = chunk_rx.recv(), if chunks_open => {
                match chunk {
                    Some(chunk) => {
                        full_text.push_str(&chunk);
                        send_json(&out_tx, json!({ "type": "assistant_token", "text": chunk }));
                        if let Some(tx) = &synth_text_tx {
                            let _ = tx.send(chunk);
                        }
                    }
                    None => {
                        chunks_open = false;
                        // Dropping the sender is end-of-input for the
                        // synthesizer.
                        synth_text_tx = None;
                    }
                }
            }
            audio = audio_rx.recv(), if audio_open => {
                match audio {
                    Some(bytes) => {
                        let _ = out_tx.send(Message::Binary(bytes.into()));
                    }
                    None => audio_open = false,
                }
            }
        }
    }

    if let Some(Err(err)) = &synth_result {
        // Text already streamed; a synthesis failure costs audio only.
        warn!(error = %err, "speech synthesis failed for this response");
    }

    match engine_result.unwrap_or(Ok(())) {
        Ok(()) => {
            let final_text = full_text.trim();
            if !final_text.is_empty() {
                state
                    .history
                    .append(&conversation_id, Role::Assistant, final_text)
                    .await;
            }
            send_json(&out_tx, json!({ "type": "assistant_done" }));
        }
        Err(err) => {
            error!(error = %err, code = err.code(), "response generation failed");
            send_json(
                &out_tx,
                json!({ "type": "assistant_error", "message": err.code() }),
            );
        }
    }
}

fn send_json(out_tx: &mpsc::UnboundedSender<Message>, value: Value) -> bool {
    match serde_json::to_string(&value) {
        Ok(text) => out_tx.send(Message::Text(text.into())).is_ok(),
        Err(err) => {
            warn!("failed to serialize voice ws event: {err}");
            false
        }
    }
}

fn send_error(out_tx: &mpsc::UnboundedSender<Message>, code: &str) {
    let _ = send_json(out_tx, json!({ "type": "error", "message": code }));
}
