//! Realtime streaming endpoint: admit, allocate, relay.
//!
//! The gateway terminates the client WebSocket, asks the session router
//! for a worker slot, and relays frames both ways for the lifetime of
//! the session. Auth happens after the upgrade so failures surface as
//! the documented close codes instead of opaque HTTP rejections.

use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite;
use uuid::Uuid;

use crate::error::RouterError;
use crate::gateway::auth::api_key_from_request;
use crate::gateway::AppState;
use crate::realtime::{SessionEnd, SessionRequest};
use crate::model::SessionStatus;

/// Invalid or missing API key.
pub const CLOSE_INVALID_KEY: u16 = 4001;
/// Key is valid but not allowed to stream.
pub const CLOSE_MISSING_SCOPE: u16 = 4003;
/// No worker slot available.
pub const CLOSE_RATE_LIMIT: u16 = 4029;

fn default_model() -> String {
    "fast".to_string()
}

fn default_encoding() -> String {
    "pcm_s16le".to_string()
}

fn default_sample_rate() -> u32 {
    16_000
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub word_timestamps: bool,
    #[serde(default)]
    pub interim_results: bool,
    #[serde(default)]
    pub store_audio: bool,
    #[serde(default)]
    pub store_transcript: bool,
    #[serde(default)]
    pub enhance_on_end: bool,
    /// Fallback auth for clients that cannot set headers.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Soft resume link to a dropped session. No transcript playback.
    #[serde(default)]
    pub resume_from: Option<Uuid>,
}

/// GET /v1/audio/transcriptions/stream
pub async fn stream(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state, params, headers))
}

async fn handle_stream(
    mut socket: WebSocket,
    state: AppState,
    params: StreamParams,
    headers: HeaderMap,
) {
    let key = params
        .api_key
        .clone()
        .or_else(|| api_key_from_request(&headers, None));

    let Some(key) = key else {
        close_with(&mut socket, CLOSE_INVALID_KEY, "missing api key").await;
        return;
    };
    let Some(tenant) = state.config.tenant_for_key(&key).map(String::from) else {
        close_with(&mut socket, CLOSE_INVALID_KEY, "invalid api key").await;
        return;
    };
    if !state.config.key_may_stream(&key) {
        close_with(&mut socket, CLOSE_MISSING_SCOPE, "streaming not permitted").await;
        return;
    }

    let request = SessionRequest {
        tenant_id: tenant,
        model: params.model.clone(),
        language: params.language.clone(),
        encoding: params.encoding.clone(),
        sample_rate: params.sample_rate,
        store_audio: params.store_audio,
        store_transcript: params.store_transcript,
        enhance_on_end: params.enhance_on_end,
        client_ip: None,
        resumed_from: params.resume_from,
    };
    let allocation = match state.router.allocate(request).await {
        Ok(allocation) => allocation,
        Err(RouterError::CapacityExhausted { model }) => {
            close_with(
                &mut socket,
                CLOSE_RATE_LIMIT,
                &format!("no capacity for model '{}'", model),
            )
            .await;
            return;
        }
        Err(e) => {
            tracing::error!("Session allocation failed: {}", e);
            close_with(&mut socket, 1011, "allocation failed").await;
            return;
        }
    };

    let worker_stream = match tokio_tungstenite::connect_async(&allocation.worker_endpoint).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::error!(
                worker_id = %allocation.worker_id,
                "Worker connect failed: {}",
                e
            );
            let _ = state
                .router
                .release(
                    allocation.session_id,
                    SessionEnd::interrupted(format!("worker connect failed: {}", e)),
                )
                .await;
            close_with(&mut socket, 1011, "worker unavailable").await;
            return;
        }
    };

    let hello = serde_json::json!({
        "type": "session.started",
        "session_id": allocation.session_id,
        "model": params.model,
        "resumed_from": params.resume_from,
    });
    if socket
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        let _ = state
            .router
            .release(allocation.session_id, SessionEnd::completed())
            .await;
        return;
    }

    let end = relay(socket, worker_stream, &state, &params, allocation.session_id).await;
    if let Err(e) = state.router.release(allocation.session_id, end).await {
        tracing::error!(session_id = %allocation.session_id, "Session release failed: {}", e);
    }
}

/// Pump frames between client and worker until either side goes away.
/// Returns the session's final facts.
async fn relay(
    socket: WebSocket,
    worker_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    state: &AppState,
    params: &StreamParams,
    session_id: Uuid,
) -> SessionEnd {
    let (mut client_tx, mut client_rx) = socket.split();
    let (mut worker_tx, mut worker_rx) = worker_stream.split();

    // The worker needs the stream parameters before any audio.
    let start_frame = serde_json::json!({
        "type": "start",
        "session_id": session_id,
        "model": params.model,
        "language": params.language,
        "encoding": params.encoding,
        "sample_rate": params.sample_rate,
        "word_timestamps": params.word_timestamps,
        "interim_results": params.interim_results,
    });
    if worker_tx
        .send(tungstenite::Message::text(start_frame.to_string()))
        .await
        .is_err()
    {
        return SessionEnd::interrupted("worker rejected session start");
    }

    let started = Instant::now();
    let mut audio: Vec<u8> = Vec::new();
    let mut transcript_lines: Vec<String> = Vec::new();
    let mut utterance_count: i32 = 0;
    let mut word_count: i32 = 0;
    let mut worker_error: Option<String> = None;

    loop {
        tokio::select! {
            from_client = client_rx.next() => {
                match from_client {
                    Some(Ok(Message::Binary(bytes))) => {
                        if params.store_audio {
                            audio.extend_from_slice(&bytes);
                        }
                        if worker_tx
                            .send(tungstenite::Message::Binary(bytes))
                            .await
                            .is_err()
                        {
                            worker_error = Some("worker dropped mid-stream".to_string());
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if worker_tx
                            .send(tungstenite::Message::text(text.to_string()))
                            .await
                            .is_err()
                        {
                            worker_error = Some("worker dropped mid-stream".to_string());
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the stack
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, "Client socket error: {}", e);
                        break;
                    }
                }
            }
            from_worker = worker_rx.next() => {
                match from_worker {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        tally_worker_frame(
                            text.as_str(),
                            &mut utterance_count,
                            &mut word_count,
                            params.store_transcript.then_some(&mut transcript_lines),
                        );
                        if client_tx
                            .send(Message::Text(text.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Binary(bytes))) => {
                        if client_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        worker_error = Some("worker closed mid-session".to_string());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        worker_error = Some(format!("worker socket error: {}", e));
                        break;
                    }
                }
            }
        }
    }

    let _ = worker_tx.send(tungstenite::Message::Close(None)).await;
    if let Some(reason) = &worker_error {
        let _ = client_tx
            .send(Message::Close(Some(CloseFrame {
                code: 1011,
                reason: reason.clone().into(),
            })))
            .await;
    }

    let mut end = SessionEnd {
        status: if worker_error.is_some() {
            SessionStatus::Interrupted
        } else {
            SessionStatus::Completed
        },
        error: worker_error,
        duration_ms: started.elapsed().as_millis() as i64,
        utterance_count,
        word_count,
        audio_blob: None,
        transcript_blob: None,
    };

    if params.store_audio && !audio.is_empty() {
        match state.blobs.put(&audio).await {
            Ok(reference) => end.audio_blob = Some(reference),
            Err(e) => tracing::error!(session_id = %session_id, "Audio store failed: {}", e),
        }
    }
    if params.store_transcript && !transcript_lines.is_empty() {
        match state.blobs.put(transcript_lines.join("\n").as_bytes()).await {
            Ok(reference) => end.transcript_blob = Some(reference),
            Err(e) => tracing::error!(session_id = %session_id, "Transcript store failed: {}", e),
        }
    }
    end
}

/// Count utterances/words off the worker's result frames; interim
/// results are forwarded but not counted.
fn tally_worker_frame(
    raw: &str,
    utterance_count: &mut i32,
    word_count: &mut i32,
    transcript: Option<&mut Vec<String>>,
) {
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(raw) else {
        return;
    };
    let is_final = matches!(
        frame.get("type").and_then(|t| t.as_str()),
        Some("utterance") | Some("final")
    );
    if !is_final {
        return;
    }
    let Some(text) = frame.get("text").and_then(|t| t.as_str()) else {
        return;
    };
    *utterance_count += 1;
    *word_count += text.split_whitespace().count() as i32;
    if let Some(lines) = transcript {
        lines.push(text.to_string());
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_counts_final_frames_only() {
        let mut utterances = 0;
        let mut words = 0;
        let mut lines: Vec<String> = Vec::new();

        tally_worker_frame(
            r#"{"type":"interim","text":"hel"}"#,
            &mut utterances,
            &mut words,
            Some(&mut lines),
        );
        tally_worker_frame(
            r#"{"type":"utterance","text":"hello world"}"#,
            &mut utterances,
            &mut words,
            Some(&mut lines),
        );
        tally_worker_frame("not json", &mut utterances, &mut words, Some(&mut lines));

        assert_eq!(utterances, 1);
        assert_eq!(words, 2);
        assert_eq!(lines, vec!["hello world".to_string()]);
    }

    #[test]
    fn stream_params_defaults() {
        let params: StreamParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.model, "fast");
        assert_eq!(params.encoding, "pcm_s16le");
        assert_eq!(params.sample_rate, 16_000);
        assert!(!params.store_audio);
        assert!(params.api_key.is_none());
    }
}
