//! WebSocket transport for live-agent sessions.
//!
//! Speaks the bidirectional JSON protocol used by realtime voice models:
//! a `setup` message on connect, base64 PCM `realtimeInput` frames outbound,
//! and `serverContent` messages carrying agent audio and turn signals inbound.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::encode::EncodedFrame;
use super::error::AudioError;
use super::transport::{AgentTransport, TransportConnection, TransportEvent, TransportHandle};
use crate::config::SessionConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

/// Session setup sent as the first message on a new connection
pub fn setup_message(config: &SessionConfig) -> serde_json::Value {
    let mut generation_config = json!({ "responseModalities": ["AUDIO"] });
    if let Some(voice) = config.voice_name.as_deref() {
        generation_config["speechConfig"] = json!({
            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
        });
    }

    json!({
        "setup": {
            "model": config.model,
            "generationConfig": generation_config,
        }
    })
}

pub fn realtime_input_message(frame: &EncodedFrame) -> Result<String, AudioError> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: frame.format.mime_type(),
                data: STANDARD.encode(&frame.data),
            }],
        },
    };
    serde_json::to_string(&message).map_err(|e| AudioError::transport(format!("failed to serialise frame: {}", e)))
}

/// Translate one server message into transport events.
///
/// Audio parts come first, then the interruption and turn signals. A part
/// whose payload is not valid base64 is dropped on its own.
pub fn parse_server_message(raw: &[u8]) -> Result<Vec<TransportEvent>, serde_json::Error> {
    let message: ServerMessage = serde_json::from_slice(raw)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(TransportEvent::Opened);
    }

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|part| part.inline_data) {
            match STANDARD.decode(inline.data.as_bytes()) {
                Ok(audio) => events.push(TransportEvent::AudioChunk(Bytes::from(audio))),
                Err(e) => {
                    let error = AudioError::decode_failed(inline.data.len(), &format!("invalid base64: {}", e));
                    warn!("Dropping inbound audio part: {}", error);
                }
            }
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }

    Ok(events)
}

fn connect_url(config: &SessionConfig) -> String {
    match config.api_key.as_deref() {
        Some(key) if !key.is_empty() => {
            let separator = if config.endpoint.contains('?') { '&' } else { '?' };
            format!("{}{}key={}", config.endpoint, separator, key)
        }
        _ => config.endpoint.clone(),
    }
}

pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for WebSocketTransport {
    async fn open(&self, config: &SessionConfig) -> Result<TransportConnection, AudioError> {
        info!("Connecting to agent at {} (model {})", config.endpoint, config.model);

        let (socket, _) = connect_async(connect_url(config))
            .await
            .map_err(|e| AudioError::transport_open(format!("failed to connect: {}", e)))?;
        let (mut sink, stream) = socket.split();

        sink.send(Message::Text(setup_message(config).to_string()))
            .await
            .map_err(|e| AudioError::transport_open(format!("failed to send setup: {}", e)))?;
        debug!("Setup sent, waiting for setupComplete");

        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(stream, events_tx));

        Ok(TransportConnection {
            handle: Box::new(WebSocketHandle { sink, reader, closed: false }),
            events,
        })
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::Sender<TransportEvent>) {
    while let Some(message) = stream.next().await {
        let parsed = match message {
            Ok(Message::Text(text)) => parse_server_message(text.as_bytes()),
            Ok(Message::Binary(data)) => parse_server_message(&data),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty());
                let _ = events.send(TransportEvent::Closed { reason }).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        };

        match parsed {
            Ok(batch) => {
                for event in batch {
                    if events.send(event).await.is_err() {
                        debug!("Event receiver dropped, stopping reader");
                        return;
                    }
                }
            }
            Err(e) => warn!("Ignoring unparseable server message: {}", e),
        }
    }

    let _ = events.send(TransportEvent::Closed { reason: None }).await;
}

struct WebSocketHandle {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl TransportHandle for WebSocketHandle {
    async fn send(&mut self, frame: &EncodedFrame) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::transport("connection already closed"));
        }
        let payload = realtime_input_message(frame)?;
        self.sink
            .send(Message::Text(payload))
            .await
            .map_err(|e| AudioError::transport(format!("failed to send frame {}: {}", frame.sequence, e)))
    }

    async fn close(&mut self) -> Result<(), AudioError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self.sink.close().await;
        self.reader.abort();
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("WebSocket close after remote shutdown: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode::{encode_pcm16, PcmFormat};

    #[test]
    fn test_setup_message_shape() {
        let config = SessionConfig {
            model: "models/test".to_string(),
            voice_name: Some("Puck".to_string()),
            ..SessionConfig::default()
        };
        let setup = setup_message(&config);

        assert_eq!(setup["setup"]["model"], "models/test");
        assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );

        let plain = setup_message(&SessionConfig::default());
        assert!(plain["setup"]["generationConfig"].get("speechConfig").is_none());
    }

    #[test]
    fn test_realtime_input_carries_mime_and_base64() {
        let frame = EncodedFrame {
            data: encode_pcm16(&[1.0, -1.0]),
            format: PcmFormat::mono(16000),
            sequence: 3,
        };
        let json: serde_json::Value = serde_json::from_str(&realtime_input_message(&frame).unwrap()).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];

        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(STANDARD.decode(chunk["data"].as_str().unwrap()).unwrap(), vec![0xFF, 0x7F, 0x00, 0x80]);
    }

    #[test]
    fn test_setup_complete_opens() {
        let events = parse_server_message(br#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(events, vec![TransportEvent::Opened]);
    }

    #[test]
    fn test_model_turn_audio_then_signals() {
        let audio = STANDARD.encode([0x00u8, 0x40, 0x00, 0xC0]);
        let raw = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}},{{"text":"hi"}}]}},"turnComplete":true}}}}"#,
            audio
        );
        let events = parse_server_message(raw.as_bytes()).unwrap();

        assert_eq!(
            events,
            vec![
                TransportEvent::AudioChunk(Bytes::from_static(&[0x00, 0x40, 0x00, 0xC0])),
                TransportEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_interrupted_signal() {
        let events = parse_server_message(br#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(events, vec![TransportEvent::Interrupted]);
    }

    #[test]
    fn test_invalid_base64_part_is_dropped() {
        let valid = STANDARD.encode([0x01u8, 0x00]);
        let raw = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"data":"%%%"}}}},{{"inlineData":{{"data":"{}"}}}}]}}}}}}"#,
            valid
        );
        let events = parse_server_message(raw.as_bytes()).unwrap();
        assert_eq!(events, vec![TransportEvent::AudioChunk(Bytes::from_static(&[0x01, 0x00]))]);
    }

    #[test]
    fn test_unknown_messages_produce_nothing() {
        assert!(parse_server_message(br#"{"usageMetadata":{"totalTokenCount":12}}"#).unwrap().is_empty());
        assert!(parse_server_message(b"not json").is_err());
    }

    #[test]
    fn test_api_key_is_appended_to_url() {
        let config = SessionConfig {
            endpoint: "wss://agent.example/ws".to_string(),
            api_key: Some("abc".to_string()),
            ..SessionConfig::default()
        };
        assert_eq!(connect_url(&config), "wss://agent.example/ws?key=abc");

        let config = SessionConfig { api_key: None, ..config };
        assert_eq!(connect_url(&config), "wss://agent.example/ws");
    }
}
