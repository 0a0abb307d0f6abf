//! Shared harness for integration tests
//!
//! Boots the real router on an ephemeral port with in-process mock backends
//! registered under the built-in names, so no model servers are needed.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, stream};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use voxhost::backends::{
    Backend, BackendDescriptor, BackendResult, BackendStatus, GenerationParams, Generator,
    RecognizerStream, Registries, SpeechRecognizer, SynthesizedAudio, Synthesizer, TokenStream,
    Transcript,
};
use voxhost::config::LiveConfig;
use voxhost::{AppState, ServerConfig, create_app};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EchoRecognizer {
    name: String,
}

#[async_trait]
impl Backend for EchoRecognizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _config: &LiveConfig) -> BackendResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(&self.name, "Test STT").loaded(true)
    }
}

#[async_trait]
impl SpeechRecognizer for EchoRecognizer {
    async fn open_stream(&self, _sample_rate: u32) -> BackendResult<Box<dyn RecognizerStream>> {
        Ok(Box::new(EchoStream { received: 0 }))
    }
}

/// Partial "hello" per chunk, final "hello world" once audio arrived
struct EchoStream {
    received: usize,
}

#[async_trait]
impl RecognizerStream for EchoStream {
    async fn accept_audio(&mut self, pcm: Bytes) -> BackendResult<Vec<Transcript>> {
        self.received += pcm.len();
        Ok(vec![Transcript::partial("hello")])
    }

    async fn finish(&mut self) -> BackendResult<Vec<Transcript>> {
        if self.received == 0 {
            return Ok(Vec::new());
        }
        self.received = 0;
        Ok(vec![Transcript::final_text("hello world")])
    }

    async fn close(&mut self) {}
}

pub struct SilentSynthesizer {
    name: String,
}

#[async_trait]
impl Backend for SilentSynthesizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _config: &LiveConfig) -> BackendResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(&self.name, "Test TTS").loaded(true)
    }
}

#[async_trait]
impl Synthesizer for SilentSynthesizer {
    async fn synthesize(&self, text: &str, _voice: Option<&str>) -> BackendResult<SynthesizedAudio> {
        Ok(SynthesizedAudio {
            pcm: Bytes::from(vec![0u8; text.len() * 2]),
            sample_rate: 24000,
            format: "pcm_s16le".to_string(),
        })
    }

    fn output_sample_rate(&self) -> u32 {
        24000
    }
}

pub struct CannedGenerator;

pub const CANNED_REPLY: &str = "Sure, here it is.";

#[async_trait]
impl Backend for CannedGenerator {
    fn name(&self) -> &str {
        "llama"
    }

    async fn initialize(&mut self, _config: &LiveConfig) -> BackendResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new("llama", "Test LLM").loaded(true)
    }
}

#[async_trait]
impl Generator for CannedGenerator {
    async fn generate(&self, _prompt: &str) -> BackendResult<String> {
        Ok(CANNED_REPLY.to_string())
    }

    async fn generate_stream(&self, _prompt: &str) -> BackendResult<TokenStream> {
        let pieces: Vec<BackendResult<String>> = CANNED_REPLY
            .split_inclusive(' ')
            .map(|piece| Ok(piece.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(pieces)))
    }

    fn params(&self) -> GenerationParams {
        GenerationParams::from_config(&LiveConfig::default())
    }
}

/// Registries with every built-in name shadowed by a mock.
pub fn mock_registries() -> Arc<Registries> {
    let registries = Arc::new(Registries::new());
    for name in ["vosk", "sherpa", "kroko"] {
        registries.stt().register(BackendDescriptor::new(name, "Test STT", move || {
            Box::new(EchoRecognizer {
                name: name.to_string(),
            }) as Box<dyn SpeechRecognizer>
        }));
    }
    for name in ["kokoro", "piper"] {
        registries.tts().register(BackendDescriptor::new(name, "Test TTS", move || {
            Box::new(SilentSynthesizer {
                name: name.to_string(),
            }) as Box<dyn Synthesizer>
        }));
    }
    registries.llm().register(BackendDescriptor::new("llama", "Test LLM", || {
        Box::new(CannedGenerator) as Box<dyn Generator>
    }));
    registries
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.stt_idle_timeout_ms = 600;
    config.retire_grace_secs = 1;
    config.load_models_on_start = false;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self) -> Client {
        let (client, _) = connect_async(self.ws_url())
            .await
            .expect("WebSocket connect failed");
        client
    }
}

/// Serve the full app with mock backends loaded.
pub async fn spawn_server(config: ServerConfig) -> TestServer {
    let state = AppState::with_registries(config, mock_registries());
    state.manager.load_initial().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_app(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer { addr, state }
}

pub async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

pub async fn send_raw(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Next frame that is not a ping or pong.
pub async fn next_frame(client: &mut Client) -> Message {
    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("transport error");
        if !matches!(frame, Message::Ping(_) | Message::Pong(_)) {
            return frame;
        }
    }
}

/// Next text frame, parsed.
pub async fn next_json(client: &mut Client) -> Value {
    match next_frame(client).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Skip frames until one of type `message_type` arrives.
pub async fn expect_type(client: &mut Client, message_type: &str) -> Value {
    loop {
        if let Message::Text(text) = next_frame(client).await {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == message_type {
                return value;
            }
        }
    }
}
