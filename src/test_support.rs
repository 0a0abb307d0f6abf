//! In-process mock backends for unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;

use crate::backends::{
    Backend, BackendError, BackendResult, BackendStatus, GenerationParams, Generator,
    RecognizerStream, SpeechRecognizer, SynthesizedAudio, Synthesizer, TokenStream, Transcript,
};
use crate::config::LiveConfig;

/// Lifecycle counters shared between a mock and the test that built it
#[derive(Debug, Default)]
pub struct Lifecycle {
    pub initialized: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl Lifecycle {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

/// How `initialize` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitBehavior {
    #[default]
    Succeed,
    Fail,
    Panic,
}

fn run_init(name: &str, behavior: InitBehavior, lifecycle: &Lifecycle) -> BackendResult<()> {
    match behavior {
        InitBehavior::Succeed => {
            lifecycle.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        InitBehavior::Fail => Err(BackendError::NotReady(format!("{name} refused to start"))),
        InitBehavior::Panic => panic!("{name} exploded during initialize"),
    }
}

pub struct MockRecognizer {
    name: String,
    pub partial: String,
    pub final_text: String,
    pub init: InitBehavior,
    pub lifecycle: Arc<Lifecycle>,
    model_path: String,
    ready: bool,
}

impl MockRecognizer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            partial: "hello".to_string(),
            final_text: "hello world".to_string(),
            init: InitBehavior::Succeed,
            lifecycle: Lifecycle::shared(),
            model_path: String::new(),
            ready: false,
        }
    }
}

#[async_trait]
impl Backend for MockRecognizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()> {
        run_init(&self.name, self.init, &self.lifecycle)?;
        self.model_path = config.stt_model_path().to_string();
        self.ready = true;
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        self.lifecycle.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(&self.name, "Mock STT")
            .loaded(self.ready)
            .with_path(self.model_path.clone())
    }
}

#[async_trait]
impl SpeechRecognizer for MockRecognizer {
    async fn open_stream(&self, _sample_rate: u32) -> BackendResult<Box<dyn RecognizerStream>> {
        Ok(Box::new(MockStream {
            partial: self.partial.clone(),
            final_text: self.final_text.clone(),
            received: 0,
        }))
    }
}

/// Emits the configured partial for every non-empty chunk
pub struct MockStream {
    partial: String,
    final_text: String,
    received: usize,
}

#[async_trait]
impl RecognizerStream for MockStream {
    async fn accept_audio(&mut self, pcm: Bytes) -> BackendResult<Vec<Transcript>> {
        if pcm.is_empty() {
            return Ok(Vec::new());
        }
        self.received += pcm.len();
        Ok(vec![Transcript::partial(self.partial.clone())])
    }

    async fn finish(&mut self) -> BackendResult<Vec<Transcript>> {
        if self.received == 0 {
            return Ok(Vec::new());
        }
        self.received = 0;
        Ok(vec![Transcript::final_text(self.final_text.clone())])
    }

    async fn close(&mut self) {}
}

pub struct MockSynthesizer {
    name: String,
    pub sample_rate: u32,
    pub init: InitBehavior,
    pub lifecycle: Arc<Lifecycle>,
    ready: bool,
}

impl MockSynthesizer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sample_rate: 24000,
            init: InitBehavior::Succeed,
            lifecycle: Lifecycle::shared(),
            ready: false,
        }
    }

    pub fn with_init(mut self, init: InitBehavior) -> Self {
        self.init = init;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

#[async_trait]
impl Backend for MockSynthesizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _config: &LiveConfig) -> BackendResult<()> {
        run_init(&self.name, self.init, &self.lifecycle)?;
        self.ready = true;
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        self.lifecycle.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(&self.name, "Mock TTS").loaded(self.ready)
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _voice: Option<&str>) -> BackendResult<SynthesizedAudio> {
        // One 16-bit sample per input byte
        let pcm = vec![0u8; text.len() * 2];
        Ok(SynthesizedAudio {
            pcm: Bytes::from(pcm),
            sample_rate: self.sample_rate,
            format: "pcm_s16le".to_string(),
        })
    }

    fn output_sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

pub struct MockGenerator {
    name: String,
    pub reply: String,
    pub init: InitBehavior,
    pub lifecycle: Arc<Lifecycle>,
    params: GenerationParams,
}

impl MockGenerator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reply: "Sure, here it is.".to_string(),
            init: InitBehavior::Succeed,
            lifecycle: Lifecycle::shared(),
            params: GenerationParams::from_config(&LiveConfig::default()),
        }
    }
}

#[async_trait]
impl Backend for MockGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()> {
        run_init(&self.name, self.init, &self.lifecycle)?;
        self.params = GenerationParams::from_config(config);
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        self.lifecycle.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::new(&self.name, "Mock LLM").loaded(true)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, _prompt: &str) -> BackendResult<String> {
        Ok(self.reply.clone())
    }

    async fn generate_stream(&self, _prompt: &str) -> BackendResult<TokenStream> {
        let pieces: Vec<BackendResult<String>> = self
            .reply
            .split_inclusive(' ')
            .map(|piece| Ok(piece.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(pieces)))
    }

    fn params(&self) -> GenerationParams {
        self.params.clone()
    }
}
