//! Audio, synthesis and generation pipelines
//!
//! Audio chunks feed the session's recognizer stream. In `full` mode every
//! accepted final transcript starts a turn (LLM reply, then TTS) on its own
//! task so the connection keeps reading audio while the turn runs.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backends::isolation::await_isolated;
use crate::backends::{Backend, BackendResult, Generator};
use crate::protocol::{MessageRoute, OutgoingMessage};
use crate::session::{ActiveRecognizer, Mode, Session, Turn};
use crate::state::AppState;

pub(super) async fn send(message_tx: &mpsc::Sender<MessageRoute>, message: OutgoingMessage) {
    if message_tx.send(MessageRoute::Outgoing(message)).await.is_err() {
        debug!("Writer task gone; dropping outgoing message");
    }
}

async fn close_active(active: Option<ActiveRecognizer>) {
    if let Some(mut active) = active {
        active.stream.close().await;
    }
}

/// Make sure the session holds a stream for the current recognizer.
async fn ensure_stream(
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> Option<u64> {
    let Some((backend, generation)) = app_state.manager.recognizer() else {
        warn!(call_id = %session.call_id(), "Audio received but no STT backend is loaded");
        send(
            message_tx,
            OutgoingMessage::error(session.call_id(), "STT backend not loaded"),
        )
        .await;
        return None;
    };

    let mut stale = None;
    let open = session.recognizer_for(generation, &mut stale).is_some();
    if stale.is_some() {
        info!(call_id = %session.call_id(), "Recognizer replaced; reopening stream");
        close_active(stale).await;
    }
    if open {
        return Some(generation);
    }

    match await_isolated(backend.open_stream(session.sample_rate())).await {
        Ok(stream) => {
            debug!(
                call_id = %session.call_id(),
                backend = %backend.name(),
                sample_rate = session.sample_rate(),
                "Opened recognizer stream"
            );
            let previous = session.install_recognizer(ActiveRecognizer {
                stream,
                backend,
                generation,
            });
            close_active(previous).await;
            Some(generation)
        }
        Err(e) => {
            warn!(call_id = %session.call_id(), error = %e, "Failed to open recognizer stream");
            send(
                message_tx,
                OutgoingMessage::error(session.call_id(), format!("STT unavailable: {e}")),
            )
            .await;
            None
        }
    }
}

/// Route one PCM chunk according to the session mode.
pub async fn handle_audio(
    pcm: Bytes,
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) {
    if !session.mode().consumes_audio() {
        session.buffer_audio(&pcm);
        debug!(
            call_id = %session.call_id(),
            mode = %session.mode(),
            buffered = session.buffered_audio(),
            "Buffered audio not used in this mode"
        );
        return;
    }
    if pcm.is_empty() {
        return;
    }
    session.note_audio();

    let Some(generation) = ensure_stream(session, message_tx, app_state).await else {
        return;
    };

    let result = {
        let mut stale = None;
        match session.recognizer_for(generation, &mut stale) {
            Some(active) => await_isolated(active.stream.accept_audio(pcm)).await,
            None => return,
        }
    };

    let transcripts = match result {
        Ok(transcripts) => transcripts,
        Err(e) => {
            warn!(call_id = %session.call_id(), error = %e, "Recognizer stream failed");
            close_active(session.take_recognizer()).await;
            send(
                message_tx,
                OutgoingMessage::error(session.call_id(), format!("STT error: {e}")),
            )
            .await;
            return;
        }
    };

    for transcript in transcripts {
        if transcript.is_final {
            handle_final(transcript.text, session, message_tx, app_state).await;
        } else if session.record_partial(&transcript.text) {
            send(
                message_tx,
                OutgoingMessage::SttResult {
                    call_id: session.call_id().to_string(),
                    text: transcript.text,
                    is_final: false,
                },
            )
            .await;
        }
    }
}

async fn handle_final(
    text: String,
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) {
    if !session.accept_final(&text, app_state.config.duplicate_window()) {
        return;
    }
    info!(call_id = %session.call_id(), text = %text, "Final transcript");
    send(
        message_tx,
        OutgoingMessage::SttResult {
            call_id: session.call_id().to_string(),
            text: text.clone(),
            is_final: true,
        },
    )
    .await;

    if session.mode() == Mode::Full {
        let turn = Turn {
            call_id: session.call_id().to_string(),
            transcript: text,
        };
        let app_state = Arc::clone(app_state);
        let message_tx = message_tx.clone();
        session.queue_turn(turn, move |turns| {
            tokio::spawn(run_turns(turns, app_state, message_tx))
        });
    }
}

/// Finalize and close the recognizer stream after a silence period.
pub async fn finalize_idle_stream(
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) {
    let Some(mut active) = session.take_recognizer() else {
        return;
    };
    debug!(call_id = %session.call_id(), "Recognizer idle; finalizing stream");
    let result = await_isolated(active.stream.finish()).await;
    active.stream.close().await;
    drop(active);

    match result {
        Ok(finals) => {
            for transcript in finals.into_iter().filter(|t| t.is_final) {
                handle_final(transcript.text, session, message_tx, app_state).await;
            }
        }
        Err(e) => warn!(call_id = %session.call_id(), error = %e, "Failed to finalize idle stream"),
    }
}

/// LLM reply then TTS for each queued utterance, one at a time.
async fn run_turns(
    mut turns: mpsc::Receiver<Turn>,
    app_state: Arc<AppState>,
    message_tx: mpsc::Sender<MessageRoute>,
) {
    while let Some(turn) = turns.recv().await {
        let Some(reply) =
            generate(&turn.transcript, false, &turn.call_id, &message_tx, &app_state).await
        else {
            continue;
        };
        if !reply.trim().is_empty() {
            synthesize(&reply, None, &turn.call_id, &message_tx, &app_state).await;
        }
    }
}

/// Synthesize `text`; sends the `tts_audio` header then the PCM frame.
pub async fn synthesize(
    text: &str,
    voice: Option<&str>,
    call_id: &str,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) {
    let Some(tts) = app_state.manager.synthesizer() else {
        send(message_tx, OutgoingMessage::error(call_id, "TTS backend not loaded")).await;
        return;
    };

    match await_isolated(tts.synthesize(text, voice)).await {
        Ok(audio) => {
            debug!(
                call_id = %call_id,
                backend = %tts.name(),
                bytes = audio.pcm.len(),
                "Synthesized audio"
            );
            let header = OutgoingMessage::TtsAudio {
                call_id: call_id.to_string(),
                sample_rate: audio.sample_rate,
                format: audio.format,
                bytes: audio.pcm.len(),
            };
            let route = MessageRoute::Audio {
                header,
                pcm: audio.pcm,
            };
            if message_tx.send(route).await.is_err() {
                debug!(call_id = %call_id, "Writer task gone; dropping audio");
            }
        }
        Err(e) => {
            warn!(call_id = %call_id, backend = %tts.name(), error = %e, "Synthesis failed");
            send(message_tx, OutgoingMessage::error(call_id, format!("TTS error: {e}"))).await;
        }
    }
}

/// Generate a reply to `prompt`, streaming deltas when asked; returns the full text.
pub async fn generate(
    prompt: &str,
    stream: bool,
    call_id: &str,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> Option<String> {
    let Some(llm) = app_state.manager.generator() else {
        send(message_tx, OutgoingMessage::error(call_id, "LLM backend not loaded")).await;
        return None;
    };

    let result = if stream {
        stream_reply(&*llm, prompt, call_id, message_tx).await
    } else {
        await_isolated(llm.generate(prompt)).await
    };

    match result {
        Ok(text) => {
            send(
                message_tx,
                OutgoingMessage::LlmResponse {
                    call_id: call_id.to_string(),
                    text: text.clone(),
                    done: true,
                    delta: None,
                },
            )
            .await;
            Some(text)
        }
        Err(e) => {
            warn!(call_id = %call_id, error = %e, "Generation failed");
            send(message_tx, OutgoingMessage::error(call_id, format!("LLM error: {e}"))).await;
            None
        }
    }
}

async fn stream_reply(
    llm: &dyn Generator,
    prompt: &str,
    call_id: &str,
    message_tx: &mpsc::Sender<MessageRoute>,
) -> BackendResult<String> {
    let mut tokens = await_isolated(llm.generate_stream(prompt)).await?;
    let mut text = String::new();
    while let Some(delta) = tokens.next().await {
        let delta = delta?;
        if delta.is_empty() {
            continue;
        }
        text.push_str(&delta);
        send(
            message_tx,
            OutgoingMessage::LlmResponse {
                call_id: call_id.to_string(),
                text: text.clone(),
                done: false,
                delta: Some(delta),
            },
        )
        .await;
    }
    Ok(text.trim().to_string())
}
