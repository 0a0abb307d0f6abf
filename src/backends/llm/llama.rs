//! llama.cpp generation via `llama-server`
//!
//! Talks to the OpenAI-compatible `/v1/chat/completions` endpoint. With
//! `llm_spawn_server` the backend starts `llama-server` itself, loading
//! `llm_model_path`, and stops it on shutdown.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::backends::base::{
    Backend, BackendError, BackendResult, BackendStatus, ConfigSchema, GenerationParams,
    Generator, OptionSpec, TokenStream,
};
use crate::backends::endpoint::wait_for_port;
use crate::backends::process::ManagedProcess;
use crate::config::LiveConfig;

const NAME: &str = "llama";
const READY_TIMEOUT: Duration = Duration::from_secs(3);
/// Large models take a while to map into memory
const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub fn config_schema() -> ConfigSchema {
    ConfigSchema::from([
        (
            "llm_url".to_string(),
            OptionSpec::string().with_default("http://127.0.0.1:8080"),
        ),
        (
            "llm_model_path".to_string(),
            OptionSpec::path().with_description("GGUF model; required when spawning the server"),
        ),
        (
            "llm_spawn_server".to_string(),
            OptionSpec::boolean().with_default(false),
        ),
        ("llm_port".to_string(), OptionSpec::integer().with_default(8080)),
        (
            "llm_context_size".to_string(),
            OptionSpec::integer().with_default(4096),
        ),
        ("llm_gpu_layers".to_string(), OptionSpec::integer().with_default(0)),
        ("llm_threads".to_string(), OptionSpec::integer().with_default(4)),
        (
            "llm_temperature".to_string(),
            OptionSpec::number().with_default(0.7),
        ),
        ("llm_top_p".to_string(), OptionSpec::number().with_default(0.9)),
        (
            "llm_max_tokens".to_string(),
            OptionSpec::integer().with_default(256),
        ),
        (
            "llm_repeat_penalty".to_string(),
            OptionSpec::number().with_default(1.1),
        ),
        ("llm_system_prompt".to_string(), OptionSpec::string()),
    ])
}

pub fn create() -> Box<dyn Generator> {
    Box::new(LlamaGenerator::default())
}

fn server_args(config: &LiveConfig) -> Vec<String> {
    vec![
        "-m".to_string(),
        config.llm_model_path.clone(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        config.llm_port.to_string(),
        "-c".to_string(),
        config.llm_context_size.to_string(),
        "-ngl".to_string(),
        config.llm_gpu_layers.to_string(),
        "-t".to_string(),
        config.llm_threads.to_string(),
    ]
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    repeat_penalty: f64,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatContent>,
    #[serde(default)]
    delta: Option<ChatContent>,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

/// One server-sent event line of a streaming completion
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<ChatResponse>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.and_then(|d| d.content))
            .filter(|t| !t.is_empty())
            .map(SseEvent::Token)
            .unwrap_or(SseEvent::Skip),
        Err(_) => SseEvent::Skip,
    }
}

#[derive(Default)]
pub struct LlamaGenerator {
    client: Option<Client>,
    url: String,
    model_path: String,
    params: Option<GenerationParams>,
    process: Option<ManagedProcess>,
}

impl LlamaGenerator {
    fn ready(&self) -> BackendResult<(&Client, &GenerationParams)> {
        match (&self.client, &self.params) {
            (Some(client), Some(params)) => Ok((client, params)),
            _ => Err(BackendError::NotReady("llama not initialized".to_string())),
        }
    }

    fn request<'a>(&self, params: &'a GenerationParams, prompt: &'a str, stream: bool) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !params.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &params.system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        ChatRequest {
            model: "local",
            messages,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            repeat_penalty: params.repeat_penalty,
            stream,
        }
    }

    async fn post(&self, prompt: &str, stream: bool) -> BackendResult<reqwest::Response> {
        let (client, params) = self.ready()?;
        let response = client
            .post(format!("{}/v1/chat/completions", self.url))
            .json(&self.request(params, prompt, stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Request(format!(
                "llama-server returned {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Backend for LlamaGenerator {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Configuration(e.to_string()))?;
        let url = config.llm_endpoint();

        if config.llm_spawn_server {
            if config.llm_model_path.trim().is_empty() {
                return Err(BackendError::Configuration(
                    "llm_model_path is required when llm_spawn_server is set".to_string(),
                ));
            }
            let process = ManagedProcess::spawn(
                "llama-server",
                &config.llm_server_binary,
                &server_args(config),
            )
            .await?;
            let addr = format!("127.0.0.1:{}", config.llm_port);
            if let Err(e) = wait_for_port(&addr, STARTUP_TIMEOUT).await {
                let _ = process.stop().await;
                return Err(e);
            }
            self.process = Some(process);
        } else {
            client
                .get(format!("{url}/health"))
                .timeout(READY_TIMEOUT)
                .send()
                .await
                .map_err(|e| BackendError::Connection(format!("llama-server at {url}: {e}")))?;
        }

        self.client = Some(client);
        self.url = url;
        self.model_path = config.llm_model_path.clone();
        self.params = Some(GenerationParams::from_config(config));
        tracing::info!(backend = NAME, url = %self.url, model = %self.model_path, "LLM backend ready");
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        match &self.process {
            Some(process) => process.stop().await,
            None => Ok(()),
        }
    }

    fn status(&self) -> BackendStatus {
        let model = std::path::Path::new(&self.model_path)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.url.clone());
        let mut status = BackendStatus::new(NAME, format!("llama.cpp ({model})"))
            .loaded(self.client.is_some())
            .with_path(self.model_path.clone())
            .with_extra("url", self.url.clone())
            .with_extra("spawned", self.process.is_some());
        if let Some(params) = &self.params
            && let Ok(value) = serde_json::to_value(params)
        {
            status = status.with_extra("params", value);
        }
        status
    }
}

#[async_trait]
impl Generator for LlamaGenerator {
    async fn generate(&self, prompt: &str) -> BackendResult<String> {
        let response = self.post(prompt, false).await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("invalid completion body: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.and_then(|m| m.content))
            .map(|t| t.trim().to_string())
            .ok_or_else(|| BackendError::Protocol("completion has no content".to_string()))
    }

    async fn generate_stream(&self, prompt: &str) -> BackendResult<TokenStream> {
        let response = self.post(prompt, true).await?;

        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(BackendError::from(e));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim()) {
                        SseEvent::Token(token) => yield Ok(token),
                        SseEvent::Done => return,
                        SseEvent::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn params(&self) -> GenerationParams {
        self.params.clone().unwrap_or_else(|| GenerationParams::from_config(&LiveConfig::default()))
    }
}
