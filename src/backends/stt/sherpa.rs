use std::time::Duration;

use async_trait::async_trait;

use super::ws_stream::{Dialect, WsRecognizerStream};
use crate::backends::base::{
    Backend, BackendError, BackendResult, BackendStatus, ConfigSchema, OptionSpec,
    RecognizerStream, SpeechRecognizer,
};
use crate::backends::endpoint::ensure_reachable;
use crate::config::LiveConfig;

const NAME: &str = "sherpa";
const READY_TIMEOUT: Duration = Duration::from_secs(2);

pub fn config_schema() -> ConfigSchema {
    ConfigSchema::from([
        (
            "sherpa_url".to_string(),
            OptionSpec::string()
                .required()
                .with_default("ws://127.0.0.1:6007")
                .with_description("sherpa-onnx online websocket server endpoint"),
        ),
        (
            "sherpa_model_path".to_string(),
            OptionSpec::path().with_description("Streaming transducer model directory"),
        ),
    ])
}

pub fn create() -> Box<dyn SpeechRecognizer> {
    Box::new(SherpaRecognizer::default())
}

/// Client for a local sherpa-onnx streaming server
#[derive(Debug, Default)]
pub struct SherpaRecognizer {
    url: String,
    model_path: String,
    ready: bool,
}

#[async_trait]
impl Backend for SherpaRecognizer {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()> {
        ensure_reachable(&config.sherpa_url, READY_TIMEOUT).await?;
        self.url = config.sherpa_url.clone();
        self.model_path = config.sherpa_model_path.clone();
        self.ready = true;
        tracing::info!(backend = NAME, url = %self.url, "STT backend ready");
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(NAME, format!("Sherpa-ONNX @ {}", self.url))
            .loaded(self.ready)
            .with_path(self.model_path.clone())
            .with_extra("url", self.url.clone())
    }
}

#[async_trait]
impl SpeechRecognizer for SherpaRecognizer {
    async fn open_stream(&self, sample_rate: u32) -> BackendResult<Box<dyn RecognizerStream>> {
        if !self.ready {
            return Err(BackendError::NotReady("sherpa not initialized".to_string()));
        }
        let stream =
            WsRecognizerStream::connect(NAME, &self.url, Dialect::Sherpa, sample_rate).await?;
        Ok(Box::new(stream))
    }
}
