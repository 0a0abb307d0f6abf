//! Per-connection session state
//!
//! A [`Session`] is created when a WebSocket is accepted and released when the
//! connection ends, whatever the exit path. It owns the connection's
//! recognizer stream exclusively.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backends::{Backend, RecognizerStream, SpeechRecognizer};
use crate::config::DEFAULT_SAMPLE_RATE;

/// Call id used until the client supplies one
pub const DEFAULT_CALL_ID: &str = "unknown";

/// Upper bound for audio buffered in modes that do not consume it (10 s at 16 kHz)
const MAX_BUFFERED_AUDIO: usize = 16000 * 2 * 10;

/// Full-mode turns waiting behind the one in progress
const TURN_QUEUE_DEPTH: usize = 8;

/// Which pipeline stages a session routes input through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// STT, then LLM, then TTS
    #[default]
    Full,
    Stt,
    Llm,
    Tts,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::Stt => "stt",
            Mode::Llm => "llm",
            Mode::Tts => "tts",
        }
    }

    /// Whether binary audio goes to the recognizer in this mode
    pub fn consumes_audio(&self) -> bool {
        matches!(self, Mode::Full | Mode::Stt)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(Mode::Full),
            "stt" => Ok(Mode::Stt),
            "llm" => Ok(Mode::Llm),
            "tts" => Ok(Mode::Tts),
            other => Err(format!("invalid mode '{other}'")),
        }
    }
}

/// Open recognizer stream plus the backend instance it was opened against
pub struct ActiveRecognizer {
    pub stream: Box<dyn RecognizerStream>,
    /// Keeps a retired backend alive until the stream is closed
    pub backend: Arc<dyn SpeechRecognizer>,
    /// STT generation the stream was opened under
    pub generation: u64,
}

/// One full-mode utterance waiting for an LLM reply and synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub call_id: String,
    pub transcript: String,
}

/// Worker that runs a session's turns one at a time, in arrival order
struct TurnQueue {
    tx: mpsc::Sender<Turn>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct FinalRecord {
    normalized: String,
    at: Instant,
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_transcript(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Session {
    call_id: String,
    mode: Mode,
    authenticated: bool,
    sample_rate: u32,
    recognizer: Option<ActiveRecognizer>,
    last_partial: String,
    last_final: Option<FinalRecord>,
    audio_buffer: BytesMut,
    last_activity: Instant,
    last_audio: Option<Instant>,
    turns: Option<TurnQueue>,
}

impl Session {
    /// A new session; starts authenticated when no token is required.
    pub fn new(requires_auth: bool) -> Self {
        Self {
            call_id: DEFAULT_CALL_ID.to_string(),
            mode: Mode::default(),
            authenticated: !requires_auth,
            sample_rate: DEFAULT_SAMPLE_RATE,
            recognizer: None,
            last_partial: String::new(),
            last_final: None,
            audio_buffer: BytesMut::new(),
            last_activity: Instant::now(),
            last_audio: None,
            turns: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Adopt a client-supplied call id; blank ids are ignored.
    pub fn set_call_id(&mut self, call_id: Option<&str>) {
        if let Some(id) = call_id.map(str::trim).filter(|id| !id.is_empty()) {
            self.call_id = id.to_string();
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            debug!(call_id = %self.call_id, from = %self.mode, to = %mode, "Session mode changed");
            self.audio_buffer.clear();
        }
        self.mode = mode;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn authenticate(&mut self) {
        self.authenticated = true;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Change the input sample rate; an open stream at another rate is dropped.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Option<ActiveRecognizer> {
        if sample_rate == 0 || sample_rate == self.sample_rate {
            return None;
        }
        self.sample_rate = sample_rate;
        self.recognizer.take()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn note_audio(&mut self) {
        self.last_audio = Some(Instant::now());
    }

    /// True when a recognizer stream is open and no audio arrived for `timeout`.
    pub fn recognizer_idle(&self, timeout: Duration) -> bool {
        self.recognizer.is_some()
            && self
                .last_audio
                .is_none_or(|at| at.elapsed() >= timeout)
    }

    #[cfg(test)]
    pub fn has_recognizer(&self) -> bool {
        self.recognizer.is_some()
    }

    /// The open stream if it belongs to `generation`; a stale stream is handed back
    /// through `stale` so the caller can close it.
    pub fn recognizer_for(
        &mut self,
        generation: u64,
        stale: &mut Option<ActiveRecognizer>,
    ) -> Option<&mut ActiveRecognizer> {
        if self
            .recognizer
            .as_ref()
            .is_some_and(|active| active.generation != generation)
        {
            *stale = self.recognizer.take();
        }
        self.recognizer.as_mut()
    }

    pub fn install_recognizer(&mut self, active: ActiveRecognizer) -> Option<ActiveRecognizer> {
        self.recognizer.replace(active)
    }

    pub fn take_recognizer(&mut self) -> Option<ActiveRecognizer> {
        self.last_partial.clear();
        self.recognizer.take()
    }

    /// Record a partial; true when it differs from the previous one.
    pub fn record_partial(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || text == self.last_partial {
            return false;
        }
        self.last_partial = text.to_string();
        true
    }

    /// Record a final transcript; false for empty text or a repeat inside `window`.
    pub fn accept_final(&mut self, text: &str, window: Duration) -> bool {
        self.accept_final_at(text, window, Instant::now())
    }

    pub fn accept_final_at(&mut self, text: &str, window: Duration, now: Instant) -> bool {
        self.last_partial.clear();
        let normalized = normalize_transcript(text);
        if normalized.is_empty() {
            return false;
        }
        if let Some(previous) = &self.last_final
            && previous.normalized == normalized
            && now.saturating_duration_since(previous.at) < window
        {
            debug!(call_id = %self.call_id, "Suppressed duplicate final transcript");
            return false;
        }
        self.last_final = Some(FinalRecord { normalized, at: now });
        true
    }

    /// Buffer audio that the current mode does not consume, keeping the newest bytes.
    pub fn buffer_audio(&mut self, chunk: &[u8]) {
        self.audio_buffer.extend_from_slice(chunk);
        if self.audio_buffer.len() > MAX_BUFFERED_AUDIO {
            let excess = self.audio_buffer.len() - MAX_BUFFERED_AUDIO;
            let _ = self.audio_buffer.split_to(excess);
        }
    }

    pub fn buffered_audio(&self) -> usize {
        self.audio_buffer.len()
    }

    #[cfg(test)]
    pub fn take_buffered_audio(&mut self) -> bytes::Bytes {
        self.audio_buffer.split().freeze()
    }

    /// Queue a turn behind any in progress; `start` spawns the worker on first use
    /// or after the previous worker ended. False when the queue is full.
    pub fn queue_turn<F>(&mut self, turn: Turn, start: F) -> bool
    where
        F: FnOnce(mpsc::Receiver<Turn>) -> JoinHandle<()>,
    {
        let turn = match self.turns.as_ref() {
            Some(queue) if !queue.task.is_finished() => match queue.tx.try_send(turn) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => {
                    warn!(call_id = %self.call_id, "Turn queue full; dropping utterance");
                    return false;
                }
                Err(TrySendError::Closed(turn)) => turn,
            },
            _ => turn,
        };

        let (tx, rx) = mpsc::channel(TURN_QUEUE_DEPTH);
        let accepted = tx.try_send(turn).is_ok();
        self.turns = Some(TurnQueue {
            tx,
            task: start(rx),
        });
        accepted
    }

    /// Release every backend handle. Safe to call more than once.
    pub async fn release(&mut self) {
        if let Some(queue) = self.turns.take() {
            queue.task.abort();
            if let Err(e) = queue.task.await
                && !e.is_cancelled()
            {
                warn!(call_id = %self.call_id, error = %e, "Turn worker failed");
            }
        }
        if let Some(mut active) = self.recognizer.take() {
            active.stream.close().await;
            debug!(call_id = %self.call_id, backend = %active.backend.name(), "Closed recognizer stream");
        }
        if !self.audio_buffer.is_empty() {
            warn!(
                call_id = %self.call_id,
                bytes = self.audio_buffer.len(),
                "Discarding unprocessed audio"
            );
        }
        self.audio_buffer.clear();
        self.last_partial.clear();
    }
}
