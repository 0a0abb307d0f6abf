//! Kokoro TTS over a local OpenAI-compatible HTTP server
//!
//! Requests `POST {kokoro_url}/v1/audio/speech` with `response_format: pcm`,
//! which returns raw 16-bit mono PCM at 24 kHz.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::backends::base::{
    Backend, BackendError, BackendResult, BackendStatus, ConfigSchema, OptionSpec,
    SynthesizedAudio, Synthesizer,
};
use crate::config::LiveConfig;

const NAME: &str = "kokoro";

/// Output sample rate of Kokoro PCM
pub const KOKORO_SAMPLE_RATE: u32 = 24000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const READY_TIMEOUT: Duration = Duration::from_secs(3);

pub fn config_schema() -> ConfigSchema {
    ConfigSchema::from([
        (
            "kokoro_url".to_string(),
            OptionSpec::string()
                .required()
                .with_default("http://127.0.0.1:8880"),
        ),
        (
            "kokoro_voice".to_string(),
            OptionSpec::string()
                .with_default("af_heart")
                .with_description("Voice id, or a weighted mix such as af_sky+af_bella"),
        ),
        (
            "kokoro_speed".to_string(),
            OptionSpec::number().with_default(1.0),
        ),
        (
            "kokoro_lang".to_string(),
            OptionSpec::string().with_default("en-us"),
        ),
    ])
}

pub fn create() -> Box<dyn Synthesizer> {
    Box::new(KokoroSynthesizer::default())
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f64,
    lang_code: &'a str,
    stream: bool,
}

#[derive(Debug, Default)]
pub struct KokoroSynthesizer {
    client: Option<Client>,
    url: String,
    voice: String,
    speed: f64,
    lang: String,
}

impl KokoroSynthesizer {
    fn client(&self) -> BackendResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| BackendError::NotReady("kokoro not initialized".to_string()))
    }
}

#[async_trait]
impl Backend for KokoroSynthesizer {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Configuration(e.to_string()))?;

        let url = config.kokoro_url.trim_end_matches('/').to_string();

        // Any HTTP answer proves the server is up; only transport errors fail
        client
            .get(format!("{url}/health"))
            .timeout(READY_TIMEOUT)
            .send()
            .await
            .map_err(|e| BackendError::Connection(format!("kokoro at {url}: {e}")))?;

        self.client = Some(client);
        self.url = url;
        self.voice = config.kokoro_voice.clone();
        self.speed = config.kokoro_speed;
        self.lang = config.kokoro_lang.clone();
        tracing::info!(backend = NAME, url = %self.url, voice = %self.voice, "TTS backend ready");
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(NAME, format!("Kokoro ({})", self.voice))
            .loaded(self.client.is_some())
            .with_extra("url", self.url.clone())
            .with_extra("voice", self.voice.clone())
            .with_extra("speed", self.speed)
            .with_extra("lang", self.lang.clone())
            .with_extra("sample_rate", KOKORO_SAMPLE_RATE)
    }
}

#[async_trait]
impl Synthesizer for KokoroSynthesizer {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> BackendResult<SynthesizedAudio> {
        let client = self.client()?;
        let request = SpeechRequest {
            model: "kokoro",
            input: text,
            voice: voice.filter(|v| !v.is_empty()).unwrap_or(&self.voice),
            response_format: "pcm",
            speed: self.speed,
            lang_code: &self.lang,
            stream: false,
        };

        let response = client
            .post(format!("{}/v1/audio/speech", self.url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Request(format!("kokoro returned {status}: {body}")));
        }

        let pcm = response.bytes().await?;
        Ok(SynthesizedAudio {
            pcm,
            sample_rate: KOKORO_SAMPLE_RATE,
            format: "pcm_s16le".to_string(),
        })
    }

    fn output_sample_rate(&self) -> u32 {
        KOKORO_SAMPLE_RATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn ready_backend(server: &MockServer) -> KokoroSynthesizer {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;

        let mut config = LiveConfig::default();
        config.kokoro_url = server.uri();
        config.kokoro_voice = "af_sky".to_string();

        let mut backend = KokoroSynthesizer::default();
        backend.initialize(&config).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_synthesize_posts_pcm_request() {
        let server = MockServer::start().await;
        let backend = ready_backend(&server).await;

        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(serde_json::json!({
                "input": "hello",
                "voice": "af_sky",
                "response_format": "pcm"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3, 4]))
            .mount(&server)
            .await;

        let audio = backend.synthesize("hello", None).await.unwrap();
        assert_eq!(audio.pcm.as_ref(), &[1, 2, 3, 4]);
        assert_eq!(audio.sample_rate, 24000);
        assert_eq!(audio.format, "pcm_s16le");
    }

    #[tokio::test]
    async fn test_voice_override() {
        let server = MockServer::start().await;
        let backend = ready_backend(&server).await;

        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(serde_json::json!({"voice": "am_adam"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 8]))
            .mount(&server)
            .await;

        let audio = backend.synthesize("hi", Some("am_adam")).await.unwrap();
        assert_eq!(audio.pcm.len(), 8);
    }

    #[tokio::test]
    async fn test_server_error_is_request_error() {
        let server = MockServer::start().await;
        let backend = ready_backend(&server).await;

        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .respond_with(ResponseTemplate::new(500).set_body_string("voice not found"))
            .mount(&server)
            .await;

        let err = backend.synthesize("hello", None).await.unwrap_err();
        assert!(err.to_string().contains("voice not found"));
    }

    #[tokio::test]
    async fn test_synthesize_before_initialize() {
        let backend = KokoroSynthesizer::default();
        assert!(matches!(
            backend.synthesize("hello", None).await,
            Err(BackendError::NotReady(_))
        ));
        assert!(!backend.status().loaded);
    }
}
