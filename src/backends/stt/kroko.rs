//! Kroko streaming STT
//!
//! Kroko speaks the sherpa websocket dialect. With `kroko_embedded` the
//! backend starts its own `kroko-server` on `kroko_port` during initialize
//! and stops it on shutdown; otherwise it connects to `kroko_url`.

use std::time::Duration;

use async_trait::async_trait;

use super::ws_stream::{Dialect, WsRecognizerStream};
use crate::backends::base::{
    Backend, BackendError, BackendResult, BackendStatus, ConfigSchema, OptionSpec,
    RecognizerStream, SpeechRecognizer,
};
use crate::backends::endpoint::{ensure_reachable, wait_for_port};
use crate::backends::process::ManagedProcess;
use crate::config::LiveConfig;

const NAME: &str = "kroko";
const READY_TIMEOUT: Duration = Duration::from_secs(2);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn config_schema() -> ConfigSchema {
    ConfigSchema::from([
        (
            "kroko_url".to_string(),
            OptionSpec::string()
                .with_default("ws://127.0.0.1:6006")
                .with_description("Remote kroko server, used when not embedded"),
        ),
        (
            "kroko_model_path".to_string(),
            OptionSpec::path().with_description("Model file; required when embedded"),
        ),
        (
            "kroko_language".to_string(),
            OptionSpec::string().with_default("en"),
        ),
        (
            "kroko_embedded".to_string(),
            OptionSpec::boolean()
                .with_default(false)
                .with_description("Start and supervise a local kroko-server"),
        ),
        ("kroko_port".to_string(), OptionSpec::integer().with_default(6006)),
        (
            "kroko_binary".to_string(),
            OptionSpec::string().with_default("kroko-server"),
        ),
    ])
}

pub fn create() -> Box<dyn SpeechRecognizer> {
    Box::new(KrokoRecognizer::default())
}

/// Arguments for the supervised `kroko-server`.
fn server_args(config: &LiveConfig) -> Vec<String> {
    vec![
        "--model".to_string(),
        config.kroko_model_path.clone(),
        "--port".to_string(),
        config.kroko_port.to_string(),
        "--language".to_string(),
        config.kroko_language.clone(),
    ]
}

#[derive(Default)]
pub struct KrokoRecognizer {
    url: String,
    model_path: String,
    language: String,
    embedded: bool,
    port: u16,
    process: Option<ManagedProcess>,
    ready: bool,
}

impl KrokoRecognizer {
    async fn start_embedded(&mut self, config: &LiveConfig) -> BackendResult<()> {
        if config.kroko_model_path.trim().is_empty() {
            return Err(BackendError::Configuration(
                "kroko_model_path is required when kroko_embedded is set".to_string(),
            ));
        }

        let process =
            ManagedProcess::spawn("kroko-server", &config.kroko_binary, &server_args(config))
                .await?;

        let addr = format!("127.0.0.1:{}", config.kroko_port);
        if let Err(e) = wait_for_port(&addr, STARTUP_TIMEOUT).await {
            let _ = process.stop().await;
            return Err(e);
        }

        self.process = Some(process);
        Ok(())
    }
}

#[async_trait]
impl Backend for KrokoRecognizer {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()> {
        let url = config.kroko_endpoint();
        if config.kroko_embedded {
            self.start_embedded(config).await?;
        } else {
            ensure_reachable(&url, READY_TIMEOUT).await?;
        }

        self.url = url;
        self.model_path = config.kroko_model_path.clone();
        self.language = config.kroko_language.clone();
        self.embedded = config.kroko_embedded;
        self.port = config.kroko_port;
        self.ready = true;
        tracing::info!(
            backend = NAME,
            url = %self.url,
            embedded = self.embedded,
            "STT backend ready"
        );
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        match &self.process {
            Some(process) => process.stop().await,
            None => Ok(()),
        }
    }

    fn status(&self) -> BackendStatus {
        let mode = if self.embedded { "embedded" } else { "remote" };
        let mut status = BackendStatus::new(NAME, format!("Kroko ({mode}) @ {}", self.url))
            .loaded(self.ready)
            .with_path(self.model_path.clone())
            .with_extra("url", self.url.clone())
            .with_extra("embedded", self.embedded)
            .with_extra("port", self.port)
            .with_extra("language", self.language.clone());
        if let Some(pid) = self.process.as_ref().and_then(ManagedProcess::pid) {
            status = status.with_extra("pid", pid);
        }
        status
    }
}

#[async_trait]
impl SpeechRecognizer for KrokoRecognizer {
    async fn open_stream(&self, sample_rate: u32) -> BackendResult<Box<dyn RecognizerStream>> {
        if !self.ready {
            return Err(BackendError::NotReady("kroko not initialized".to_string()));
        }
        let stream =
            WsRecognizerStream::connect(NAME, &self.url, Dialect::Sherpa, sample_rate).await?;
        Ok(Box::new(stream))
    }
}
