//! WebSocket recognizer stream shared by the vosk, sherpa and kroko backends
//!
//! Both server families accept binary audio frames and answer with JSON text
//! frames. They differ in sample encoding, the end-of-stream marker and the
//! shape of their results, captured by [`Dialect`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::backends::base::{BackendError, BackendResult, RecognizerStream, Transcript};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire dialect of a recognizer server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// vosk-server: int16 PCM, `{"config":..}` preamble, `{"eof":1}` terminator,
    /// `{"partial":..}` / `{"text":..}` results
    Vosk,
    /// sherpa-onnx websocket server: float32 samples, `Done` terminator,
    /// `{"text":..,"segment":..}` results
    Sherpa,
}

impl Dialect {
    /// Convert 16-bit little-endian PCM to this dialect's sample encoding.
    pub fn encode(&self, pcm: &[u8]) -> Bytes {
        match self {
            Dialect::Vosk => Bytes::copy_from_slice(pcm),
            Dialect::Sherpa => {
                let mut out = BytesMut::with_capacity(pcm.len() * 2);
                for sample in pcm.chunks_exact(2) {
                    let s = i16::from_le_bytes([sample[0], sample[1]]);
                    out.put_f32_le(s as f32 / 32768.0);
                }
                out.freeze()
            }
        }
    }

    fn end_of_stream(&self) -> Message {
        match self {
            Dialect::Vosk => Message::text(r#"{"eof" : 1}"#),
            Dialect::Sherpa => Message::text("Done"),
        }
    }

    /// Parse one result frame.
    pub fn parse(&self, frame: &str) -> Option<Transcript> {
        let value: Value = serde_json::from_str(frame).ok()?;
        match self {
            Dialect::Vosk => {
                if let Some(text) = value.get("text").and_then(Value::as_str) {
                    Some(Transcript::final_text(text.trim()))
                } else {
                    value
                        .get("partial")
                        .and_then(Value::as_str)
                        .map(|t| Transcript::partial(t.trim()))
                }
            }
            Dialect::Sherpa => {
                let text = value.get("text").and_then(Value::as_str)?;
                let is_final = value
                    .get("is_final")
                    .or_else(|| value.get("final"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Some(Transcript {
                    text: text.trim().to_string(),
                    is_final,
                })
            }
        }
    }
}

/// One open recognition stream against a remote server
pub struct WsRecognizerStream {
    backend: &'static str,
    dialect: Dialect,
    socket: Option<WsStream>,
    latest: Option<String>,
}

impl WsRecognizerStream {
    pub async fn connect(
        backend: &'static str,
        url: &str,
        dialect: Dialect,
        sample_rate: u32,
    ) -> BackendResult<Self> {
        let (mut socket, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| BackendError::Connection(format!("timed out connecting to {url}")))??;

        if dialect == Dialect::Vosk {
            let preamble = serde_json::json!({ "config": { "sample_rate": sample_rate } });
            socket.send(Message::text(preamble.to_string())).await?;
        }

        debug!(backend = %backend, url = %url, sample_rate, "Opened recognizer stream");

        Ok(Self {
            backend,
            dialect,
            socket: Some(socket),
            latest: None,
        })
    }

    fn socket(&mut self) -> BackendResult<&mut WsStream> {
        self.socket
            .as_mut()
            .ok_or_else(|| BackendError::NotReady(format!("{} stream closed", self.backend)))
    }

    fn record(&mut self, transcript: &Transcript) {
        if transcript.is_final {
            self.latest = None;
        } else {
            self.latest = Some(transcript.text.clone());
        }
    }

    /// Servers that close without an explicit final: the last partial stands.
    fn promote_latest(&mut self) -> Option<Transcript> {
        self.latest
            .take()
            .filter(|t| !t.is_empty())
            .map(Transcript::final_text)
    }

    /// Consume result frames that are already buffered, without waiting.
    ///
    /// Every final is kept in arrival order; of the partials only the newest
    /// one after the last final is kept.
    fn drain_ready(&mut self) -> BackendResult<Vec<Transcript>> {
        let dialect = self.dialect;
        let mut finals = Vec::new();
        let mut partial: Option<Transcript> = None;

        loop {
            let polled = self.socket()?.next().now_or_never();
            match polled {
                Some(Some(Ok(Message::Text(frame)))) => {
                    if let Some(t) = dialect.parse(frame.as_str()) {
                        self.record(&t);
                        if t.is_final {
                            partial = None;
                            finals.push(t);
                        } else {
                            partial = Some(t);
                        }
                    }
                }
                Some(Some(Ok(Message::Close(_)))) | Some(None) => {
                    self.socket = None;
                    break;
                }
                Some(Some(Ok(_))) => continue,
                Some(Some(Err(e))) => return Err(e.into()),
                None => break,
            }
        }

        finals.extend(partial);
        Ok(finals)
    }
}

fn only_finals(transcripts: Vec<Transcript>) -> Vec<Transcript> {
    transcripts.into_iter().filter(|t| t.is_final).collect()
}

#[async_trait]
impl RecognizerStream for WsRecognizerStream {
    async fn accept_audio(&mut self, pcm: Bytes) -> BackendResult<Vec<Transcript>> {
        let frame = self.dialect.encode(&pcm);
        self.socket()?.send(Message::binary(frame)).await?;
        self.drain_ready()
    }

    async fn finish(&mut self) -> BackendResult<Vec<Transcript>> {
        let mut finals = only_finals(self.drain_ready()?);
        if self.socket.is_none() {
            finals.extend(self.promote_latest());
            return Ok(finals);
        }

        let marker = self.dialect.end_of_stream();
        self.socket()?.send(marker).await?;

        let deadline = Instant::now() + FINISH_TIMEOUT;
        let dialect = self.dialect;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = timeout(remaining, self.socket()?.next()).await;
            match next {
                Ok(Some(Ok(Message::Text(frame)))) => match dialect.parse(frame.as_str()) {
                    Some(t) if t.is_final => {
                        self.latest = None;
                        finals.push(t);
                        return Ok(finals);
                    }
                    Some(t) => self.record(&t),
                    None => {}
                },
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                    self.socket = None;
                    break;
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(e.into()),
                Err(_) => {
                    warn!(backend = %self.backend, "Timed out waiting for final transcript");
                    break;
                }
            }
        }

        finals.extend(self.promote_latest());
        Ok(finals)
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take()
            && let Err(e) = socket.close(None).await
        {
            debug!(backend = %self.backend, error = %e, "Error closing recognizer stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Server that answers the first audio chunk with two back-to-back finals,
    /// then closes on the end-of-stream marker without another result.
    async fn spawn_two_final_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let mut replied = false;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(_) if !replied => {
                        replied = true;
                        for text in ["first utterance", "second utterance"] {
                            let reply = serde_json::json!({ "text": text }).to_string();
                            ws.send(Message::text(reply)).await.unwrap();
                        }
                    }
                    Message::Text(t) if t.as_str().contains("eof") => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    _ => {}
                }
            }
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_back_to_back_finals_are_all_returned() {
        let url = spawn_two_final_server().await;
        let mut stream = WsRecognizerStream::connect("vosk", &url, Dialect::Vosk, 16000)
            .await
            .unwrap();

        let mut finals = Vec::new();
        let first = stream.accept_audio(Bytes::from(vec![0u8; 640])).await.unwrap();
        finals.extend(first.into_iter().filter(|t| t.is_final));

        // The replies may land after the first drain; the next chunk picks them up
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = stream.accept_audio(Bytes::from(vec![0u8; 640])).await.unwrap();
        finals.extend(second.into_iter().filter(|t| t.is_final));
        finals.extend(stream.finish().await.unwrap());

        let texts: Vec<&str> = finals.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["first utterance", "second utterance"]);
    }

    #[tokio::test]
    async fn test_finish_keeps_buffered_finals_before_close() {
        let url = spawn_two_final_server().await;
        let mut stream = WsRecognizerStream::connect("vosk", &url, Dialect::Vosk, 16000)
            .await
            .unwrap();

        stream
            .socket()
            .unwrap()
            .send(Message::binary(vec![0u8; 640]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let finals = stream.finish().await.unwrap();
        let texts: Vec<&str> = finals.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["first utterance", "second utterance"]);
    }

    #[test]
    fn test_vosk_parse() {
        let d = Dialect::Vosk;
        assert_eq!(
            d.parse(r#"{"partial" : "hello wor"}"#),
            Some(Transcript::partial("hello wor"))
        );
        assert_eq!(
            d.parse(r#"{"result": [], "text" : "hello world"}"#),
            Some(Transcript::final_text("hello world"))
        );
        assert_eq!(d.parse("not json"), None);
        assert_eq!(d.parse(r#"{"other": 1}"#), None);
    }

    #[test]
    fn test_sherpa_parse() {
        let d = Dialect::Sherpa;
        assert_eq!(
            d.parse(r#"{"text": " hi there ", "segment": 0}"#),
            Some(Transcript::partial("hi there"))
        );
        assert_eq!(
            d.parse(r#"{"text": "done", "segment": 1, "is_final": true}"#),
            Some(Transcript::final_text("done"))
        );
    }

    #[test]
    fn test_sherpa_encoding_is_float32() {
        let pcm: Vec<u8> = [0i16, 16384, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let encoded = Dialect::Sherpa.encode(&pcm);
        assert_eq!(encoded.len(), 12);

        let samples: Vec<f32> = encoded
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(samples, vec![0.0, 0.5, -1.0]);

        assert_eq!(Dialect::Vosk.encode(&pcm).as_ref(), pcm.as_slice());
    }
}
