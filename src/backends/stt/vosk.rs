use std::time::Duration;

use async_trait::async_trait;

use super::ws_stream::{Dialect, WsRecognizerStream};
use crate::backends::base::{
    Backend, BackendError, BackendResult, BackendStatus, ConfigSchema, OptionSpec,
    RecognizerStream, SpeechRecognizer,
};
use crate::backends::endpoint::ensure_reachable;
use crate::config::{DEFAULT_SAMPLE_RATE, LiveConfig};

const NAME: &str = "vosk";
const READY_TIMEOUT: Duration = Duration::from_secs(2);

pub fn config_schema() -> ConfigSchema {
    ConfigSchema::from([
        (
            "vosk_url".to_string(),
            OptionSpec::string()
                .required()
                .with_default("ws://127.0.0.1:2700")
                .with_description("vosk-server websocket endpoint"),
        ),
        (
            "vosk_model_path".to_string(),
            OptionSpec::path().with_description("Model directory served by vosk-server"),
        ),
        (
            "stt_sample_rate".to_string(),
            OptionSpec::integer().with_default(DEFAULT_SAMPLE_RATE),
        ),
    ])
}

pub fn create() -> Box<dyn SpeechRecognizer> {
    Box::new(VoskRecognizer::default())
}

/// Client for a local vosk-server
#[derive(Debug, Default)]
pub struct VoskRecognizer {
    url: String,
    model_path: String,
    ready: bool,
}

#[async_trait]
impl Backend for VoskRecognizer {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()> {
        ensure_reachable(&config.vosk_url, READY_TIMEOUT).await?;
        self.url = config.vosk_url.clone();
        self.model_path = config.vosk_model_path.clone();
        self.ready = true;
        tracing::info!(backend = NAME, url = %self.url, "STT backend ready");
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(NAME, format!("Vosk @ {}", self.url))
            .loaded(self.ready)
            .with_path(self.model_path.clone())
            .with_extra("url", self.url.clone())
    }
}

#[async_trait]
impl SpeechRecognizer for VoskRecognizer {
    async fn open_stream(&self, sample_rate: u32) -> BackendResult<Box<dyn RecognizerStream>> {
        if !self.ready {
            return Err(BackendError::NotReady("vosk not initialized".to_string()));
        }
        let stream = WsRecognizerStream::connect(NAME, &self.url, Dialect::Vosk, sample_rate).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::base::Transcript;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    /// Minimal vosk-server: one partial per audio frame, a final after eof.
    async fn spawn_fake_vosk() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(tcp).await else {
                        return;
                    };
                    let mut frames = 0;
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Binary(_) => {
                                frames += 1;
                                let reply = format!(r#"{{"partial": "word{frames}"}}"#);
                                let _ = ws.send(Message::text(reply)).await;
                            }
                            Message::Text(t) if t.as_str().contains("eof") => {
                                let _ = ws.send(Message::text(r#"{"text": "hello world"}"#)).await;
                                let _ = ws.close(None).await;
                                break;
                            }
                            _ => {}
                        }
                    }
                });
            }
        });

        format!("ws://{addr}")
    }

    fn config_with_url(url: &str) -> LiveConfig {
        let mut config = LiveConfig::default();
        config.vosk_url = url.to_string();
        config
    }

    #[tokio::test]
    async fn test_initialize_fails_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut backend = VoskRecognizer::default();
        let err = backend.initialize(&config_with_url(&url)).await.unwrap_err();
        assert!(matches!(err, BackendError::Connection(_)));
        assert!(!backend.status().loaded);
    }

    #[tokio::test]
    async fn test_open_stream_requires_initialize() {
        let backend = VoskRecognizer::default();
        assert!(matches!(
            backend.open_stream(16000).await,
            Err(BackendError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let url = spawn_fake_vosk().await;
        let mut backend = VoskRecognizer::default();
        backend.initialize(&config_with_url(&url)).await.unwrap();
        assert!(backend.status().loaded);

        let mut stream = backend.open_stream(16000).await.unwrap();
        stream.accept_audio(Bytes::from(vec![0u8; 3200])).await.unwrap();

        let finals = stream.finish().await.unwrap();
        assert_eq!(finals, vec![Transcript::final_text("hello world")]);
        stream.close().await;
    }

    #[tokio::test]
    async fn test_process_audio_one_shot() {
        let url = spawn_fake_vosk().await;
        let mut backend = VoskRecognizer::default();
        backend.initialize(&config_with_url(&url)).await.unwrap();

        let text = backend
            .process_audio(Bytes::from(vec![0u8; 640]), 16000)
            .await
            .unwrap();
        assert_eq!(text.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_schema_lists_url() {
        let schema = config_schema();
        assert!(schema["vosk_url"].required);
        assert!(schema.contains_key("vosk_model_path"));
    }
}
