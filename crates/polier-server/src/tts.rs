//! Streaming speech synthesis over the ElevenLabs `stream-input`
//! websocket.
//!
//! One session per response: a begin-of-stream config frame, one frame
//! per incoming text chunk, an explicit end-of-input frame once the text
//! source is exhausted. The receive path decodes audio frames as they
//! arrive and finishes when the provider signals the final frame or
//! closes the session.

use anyhow::{anyhow, Context};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::config::SynthesisConfig;

#[derive(Debug, Default, PartialEq)]
struct SynthesisFrame {
    audio: Option<Vec<u8>>,
    is_final: bool,
}

/// Decode one provider frame: base64 audio payload plus the final-frame
/// marker. Frames carrying neither (alignment metadata and the like)
/// decode to an empty frame.
fn decode_synthesis_frame(raw: &str) -> anyhow::Result<SynthesisFrame> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("synthesis frame is not valid JSON")?;

    let audio = match value.get("audio").and_then(serde_json::Value::as_str) {
        Some(encoded) if !encoded.is_empty() => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .context("synthesis frame carries undecodable audio")?,
        ),
        _ => None,
    };

    Ok(SynthesisFrame {
        audio,
        is_final: value
            .get("isFinal")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
    })
}

fn session_uri(config: &SynthesisConfig) -> String {
    format!(
        "wss://api.elevenlabs.io/v1/text-to-speech/{}/stream-input?model_id={}&output_format={}",
        config.voice_id, config.model_id, config.output_format
    )
}

/// Bridge a text-chunk stream to an audio-chunk stream through one
/// synthesis session. Returns once the input is exhausted and all
/// buffered audio has been drained; an empty audio sequence is valid.
pub async fn stream_synthesis(
    config: &SynthesisConfig,
    mut text_rx: mpsc::UnboundedReceiver<String>,
    audio_tx: mpsc::Sender<Vec<u8>>,
) -> anyhow::Result<()> {
    let api_key = config
        .api_key
        .as_deref()
        .ok_or_else(|| anyhow!("synthesis is not configured"))?;

    let (socket, _) = connect_async(session_uri(config))
        .await
        .context("failed to open synthesis session")?;
    let (mut write, mut read) = socket.split();

    // Begin-of-stream: voice settings and credentials before any text.
    let bos = json!({
        "text": " ",
        "voice_settings": { "stability": 0.5, "similarity_boost": 0.75 },
        "xi_api_key": api_key,
    });
    write
        .send(Message::text(bos.to_string()))
        .await
        .context("failed to send synthesis config frame")?;

    let mut text_done = false;
    loop {
        tokio::select! {
            maybe_chunk = text_rx.recv(), if !text_done => {
                match maybe_chunk {
                    Some(chunk) => {
                        if !chunk.is_empty() {
                            write
                                .send(Message::text(json!({ "text": chunk }).to_string()))
                                .await
                                .context("failed to send synthesis text frame")?;
                        }
                    }
                    None => {
                        // End-of-input: an empty text frame flushes the
                        // provider's buffer.
                        write
                            .send(Message::text(json!({ "text": "" }).to_string()))
                            .await
                            .context("failed to send synthesis end frame")?;
                        text_done = true;
                    }
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(raw))) => {
                        let frame = decode_synthesis_frame(raw.as_str())?;
                        if let Some(audio) = frame.audio {
                            if audio_tx.send(audio).await.is_err() {
                                debug!("audio consumer went away, closing synthesis session");
                                return Ok(());
                            }
                        }
                        if frame.is_final {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return Err(anyhow!("synthesis session failed: {err}"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_audio_frames() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let frame =
            decode_synthesis_frame(&format!(r#"{{"audio":"{encoded}","isFinal":false}}"#)).unwrap();
        assert_eq!(frame.audio, Some(vec![1, 2, 3]));
        assert!(!frame.is_final);
    }

    #[test]
    fn decodes_final_marker_without_audio() {
        let frame = decode_synthesis_frame(r#"{"isFinal":true}"#).unwrap();
        assert_eq!(frame, SynthesisFrame { audio: None, is_final: true });
    }

    #[test]
    fn metadata_frames_decode_empty() {
        let frame = decode_synthesis_frame(r#"{"alignment":{"chars":[]}}"#).unwrap();
        assert_eq!(frame, SynthesisFrame::default());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(decode_synthesis_frame("not json").is_err());
        assert!(decode_synthesis_frame(r#"{"audio":"%%%"}"#).is_err());
    }

    #[test]
    fn session_uri_carries_voice_and_format() {
        let config = SynthesisConfig {
            api_key: Some("key".to_string()),
            voice_id: "voice-1".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            output_format: "mp3_44100_128".to_string(),
        };
        let uri = session_uri(&config);
        assert!(uri.contains("/text-to-speech/voice-1/stream-input"));
        assert!(uri.contains("output_format=mp3_44100_128"));
    }
}
