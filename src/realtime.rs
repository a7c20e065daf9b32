//! # AI Realtime Channel
//!
//! The outbound half of a bridged call: one tokio task per call that owns the
//! WebSocket connection to the OpenAI realtime speech API.
//!
//! ## Task shape:
//! After connect and `session.update`, the task runs a single `tokio::select!`
//! loop over two sources:
//! - events arriving from the AI socket (`response.audio.delta`,
//!   `input_audio_buffer.speech_started`, `error`), and
//! - commands arriving from the telephony actor over an mpsc channel
//!   (append caller audio, trigger the greeting, signal end of turn).
//!
//! ## Fail-together shutdown:
//! The telephony actor holds the only command sender. When the actor stops,
//! the sender drops, `recv()` yields `None`, and this task closes the AI
//! socket and exits. In the other direction, when this task exits for any
//! reason it sends `AgentChannelClosed` to the actor, which stops it. Either
//! leg dying therefore tears down the whole call.
//!
//! ## Locking discipline:
//! The shared `CallSession` mutex is only ever taken for short synchronous
//! sections; no lock is held across an `await`.

use std::sync::{Arc, Mutex};

use actix::Recipient;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::audio::AgentAudioEncoder;
use crate::config::GreetingTrigger;
use crate::session::{CallSession, Language};
use crate::state::AppState;
use crate::websocket::{
    clear_frame, mark_frame, media_frame, AgentChannelClosed, ForwardFrame, MARK_LABEL,
};

/// Commands the telephony actor sends to this task.
#[derive(Debug)]
pub enum AgentCommand {
    /// Caller audio, already transcoded to PCM16 at the realtime rate.
    AppendAudio(Vec<u8>),
    /// Push the one-time greeting (sender has already consumed the one-shot).
    Greet,
    /// The telephony stream ended gracefully; let the model finish the turn.
    EndOfTurn,
}

/// Everything the task needs, captured at call start.
#[derive(Debug, Clone)]
pub struct AgentChannelConfig {
    /// Full WebSocket URL including the model query parameter.
    pub url: String,
    pub api_key: String,
    pub voice: String,
    pub realtime_rate: u32,
    pub telephony_rate: u32,
    pub language: Language,
    pub greeting_trigger: GreetingTrigger,
}

/// Events arriving from the AI socket. Everything the bridge does not act on
/// collapses into `Other` and is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String, item_id: String },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<serde_json::Value>,
    },

    #[serde(other)]
    Other,
}

pub fn session_update_event(voice: &str, instructions: &str) -> serde_json::Value {
    json!({
        "type": "session.update",
        "session": {
            "turn_detection": { "type": "server_vad" },
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "voice": voice,
            "instructions": instructions,
        },
    })
}

pub fn append_audio_event(audio_b64: &str) -> serde_json::Value {
    json!({ "type": "input_audio_buffer.append", "audio": audio_b64 })
}

pub fn truncate_event(item_id: &str, audio_end_ms: u64) -> serde_json::Value {
    json!({
        "type": "conversation.item.truncate",
        "item_id": item_id,
        "content_index": 0,
        "audio_end_ms": audio_end_ms,
    })
}

pub fn greeting_item_event(text: &str) -> serde_json::Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text }],
        },
    })
}

pub fn response_create_event() -> serde_json::Value {
    json!({ "type": "response.create" })
}

pub fn end_of_turn_event() -> serde_json::Value {
    json!({ "type": "input_audio_buffer.end" })
}

/// System prompt for the tip-line agent, pinned to the caller's language.
pub fn tip_line_instructions(language: Language) -> String {
    let language_instruction = match language {
        Language::English => "You MUST respond exclusively in English.",
        Language::Spanish => "You MUST respond exclusively in Spanish.",
    };

    format!(
        "You are an AI assistant for an anonymous employee tip line. Your tone is calm, \
         professional, and neutral. Your primary goal is to gather clear and detailed \
         information about an incident. Ask one clear question at a time and wait for the \
         caller to finish speaking before you reply. Your questions should guide the caller \
         to provide information about: who was involved, what happened, when it occurred, \
         where it took place, and if there is any evidence. {} Do not switch languages \
         under any circumstances.",
        language_instruction
    )
}

pub fn greeting_text(language: Language) -> &'static str {
    match language {
        Language::English => {
            "Thank you for calling the anonymous tip line. To ensure your anonymity, \
             this call is not being recorded by us. How can I help you today?"
        }
        Language::Spanish => {
            "Gracias por llamar a la línea de denuncias anónimas. Para garantizar su \
             anonimato, esta llamada no está siendo grabada por nosotros. \
             ¿Cómo puedo ayudarle hoy?"
        }
    }
}

/// Run the AI channel for one call. Never returns an error to the caller;
/// failures are logged here and always end with `AgentChannelClosed` so the
/// telephony actor can tear down its side.
pub async fn run_agent_channel(
    config: AgentChannelConfig,
    session: Arc<Mutex<CallSession>>,
    commands: mpsc::UnboundedReceiver<AgentCommand>,
    frames: Recipient<ForwardFrame>,
    closed: Recipient<AgentChannelClosed>,
    app_state: AppState,
) {
    let call_id = session.lock().unwrap().call_id;

    if let Err(err) = run_inner(config, session, commands, &frames, &app_state).await {
        error!(call_id = %call_id, error = %err, "AI channel terminated with error");
    } else {
        info!(call_id = %call_id, "AI channel closed");
    }

    closed.do_send(AgentChannelClosed);
}

async fn run_inner(
    config: AgentChannelConfig,
    session: Arc<Mutex<CallSession>>,
    mut commands: mpsc::UnboundedReceiver<AgentCommand>,
    frames: &Recipient<ForwardFrame>,
    app_state: &AppState,
) -> Result<()> {
    let mut request = config
        .url
        .clone()
        .into_client_request()
        .context("invalid realtime endpoint URL")?;
    {
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .context("API key is not a valid header value")?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
    }

    // Fail fast on connect: a caller cannot wait through retries.
    let (mut ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("realtime connect failed")?;

    info!(url = %config.url, "Connected to AI realtime channel");

    let instructions = tip_line_instructions(config.language);
    ws.send(Message::Text(
        session_update_event(&config.voice, &instructions).to_string(),
    ))
    .await
    .context("session.update send failed")?;

    if config.greeting_trigger == GreetingTrigger::OnConnect {
        let should_greet = session.lock().unwrap().take_greeting();
        if should_greet {
            send_greeting(&mut ws, config.language).await?;
        }
    }

    // This pump owns the agent-direction transcoder for the whole call so the
    // resampler state is continuous across deltas.
    let mut encoder = AgentAudioEncoder::new(config.realtime_rate, config.telephony_rate);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(AgentCommand::AppendAudio(pcm)) => {
                        let event = append_audio_event(&B64.encode(&pcm));
                        ws.send(Message::Text(event.to_string()))
                            .await
                            .context("audio append send failed")?;
                    }
                    Some(AgentCommand::Greet) => {
                        send_greeting(&mut ws, config.language).await?;
                    }
                    Some(AgentCommand::EndOfTurn) => {
                        ws.send(Message::Text(end_of_turn_event().to_string()))
                            .await
                            .context("end-of-turn send failed")?;
                    }
                    None => {
                        // Telephony actor is gone; close our side and exit.
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                }
            }

            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let event = match serde_json::from_str::<AgentEvent>(&text) {
                            Ok(event) => event,
                            Err(err) => {
                                // Malformed payload: drop it, keep the call alive.
                                warn!(error = %err, "Dropping unparseable AI event");
                                continue;
                            }
                        };

                        match event {
                            AgentEvent::AudioDelta { delta, item_id } => {
                                handle_audio_delta(
                                    &delta, &item_id, &mut encoder, &session, frames,
                                );
                            }
                            AgentEvent::SpeechStarted => {
                                handle_speech_started(&session, frames, app_state, &mut ws)
                                    .await?;
                            }
                            AgentEvent::Error { error } => {
                                // The AI channel reported a session-level failure;
                                // treat it as fatal to the call.
                                anyhow::bail!(
                                    "AI channel error: {}",
                                    error.unwrap_or(serde_json::Value::Null)
                                );
                            }
                            AgentEvent::Other => {}
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws.send(Message::Pong(payload)).await.ok();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return Err(err).context("realtime socket error");
                    }
                }
            }
        }
    }
}

async fn send_greeting(
    ws: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    language: Language,
) -> Result<()> {
    ws.send(Message::Text(
        greeting_item_event(greeting_text(language)).to_string(),
    ))
    .await
    .context("greeting item send failed")?;
    ws.send(Message::Text(response_create_event().to_string()))
        .await
        .context("greeting response.create send failed")?;
    Ok(())
}

/// One chunk of synthesized speech: transcode it, frame it as a telephony
/// `media` event plus a playback `mark`, and update the session's playback
/// bookkeeping.
fn handle_audio_delta(
    delta_b64: &str,
    item_id: &str,
    encoder: &mut AgentAudioEncoder,
    session: &Arc<Mutex<CallSession>>,
    frames: &Recipient<ForwardFrame>,
) {
    let pcm = match B64.decode(delta_b64) {
        Ok(pcm) => pcm,
        Err(err) => {
            warn!(error = %err, "Dropping audio delta with invalid base64");
            return;
        }
    };

    let ulaw = match encoder.transcode(&pcm) {
        Ok(ulaw) => ulaw,
        Err(err) => {
            warn!(error = %err, "Dropping malformed audio delta");
            return;
        }
    };

    // Bookkeeping and stream-id lookup under one lock acquisition.
    let stream_sid = {
        let mut session = session.lock().unwrap();
        match session.stream_sid() {
            Some(sid) => {
                let sid = sid.to_string();
                session.note_assistant_audio(item_id);
                session.push_mark(MARK_LABEL);
                sid
            }
            None => {
                // The telephony start event has not arrived yet; a frame
                // without a stream id would be rejected anyway.
                warn!("Dropping AI audio delta before telephony start event");
                return;
            }
        }
    };

    frames.do_send(ForwardFrame(
        media_frame(&stream_sid, &B64.encode(&ulaw)).to_string(),
    ));
    frames.do_send(ForwardFrame(mark_frame(&stream_sid, MARK_LABEL).to_string()));
}

/// The caller started talking over the assistant. Truncate the in-flight
/// response at the amount actually heard, flush the telephony playback
/// buffer, and reset the turn-taking state.
async fn handle_speech_started(
    session: &Arc<Mutex<CallSession>>,
    frames: &Recipient<ForwardFrame>,
    app_state: &AppState,
    ws: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) -> Result<()> {
    // Decide and reset atomically; send after the lock is released.
    let (truncation, stream_sid) = {
        let mut session = session.lock().unwrap();
        let stream_sid = session.stream_sid().map(str::to_string);
        (session.begin_interruption(), stream_sid)
    };

    let truncation = match truncation {
        // Nothing is playing; the event needs no response.
        None => return Ok(()),
        Some(truncation) => truncation,
    };

    info!(
        item_id = %truncation.item_id,
        audio_end_ms = truncation.audio_end_ms,
        "Caller barge-in, truncating assistant response"
    );
    app_state.record_interruption();

    ws.send(Message::Text(
        truncate_event(&truncation.item_id, truncation.audio_end_ms).to_string(),
    ))
    .await
    .context("truncate send failed")?;

    if let Some(sid) = stream_sid {
        frames.do_send(ForwardFrame(clear_frame(&sid).to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix::{Actor, Context as ActorContext, Handler};
    use futures_util::Sink;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use std::time::Duration;

    /// Collects the frames that would be written to the telephony socket.
    struct FrameSink {
        frames: Arc<Mutex<Vec<String>>>,
    }

    impl Actor for FrameSink {
        type Context = ActorContext<Self>;
    }

    impl Handler<ForwardFrame> for FrameSink {
        type Result = ();

        fn handle(&mut self, msg: ForwardFrame, _ctx: &mut Self::Context) {
            self.frames.lock().unwrap().push(msg.0);
        }
    }

    /// Collects the messages that would be sent to the AI socket.
    struct RecordingSink(Vec<Message>);

    impl Sink<Message> for RecordingSink {
        type Error = tokio_tungstenite::tungstenite::Error;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.get_mut().0.push(item);
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[actix_web::test]
    async fn test_audio_delta_emits_media_then_mark() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = FrameSink {
            frames: collected.clone(),
        }
        .start();
        let frames = sink.recipient::<ForwardFrame>();

        let session = Arc::new(Mutex::new(CallSession::new(Language::English)));
        let mut encoder = AgentAudioEncoder::new(24_000, 8_000);
        let delta = B64.encode(vec![0u8; 480 * 2]);

        // Before the telephony start event the delta is dropped outright.
        handle_audio_delta(&delta, "item_1", &mut encoder, &session, &frames);

        session.lock().unwrap().set_stream_sid("MZ1".to_string());
        handle_audio_delta(&delta, "item_1", &mut encoder, &session, &frames);

        // Let the sink actor drain its mailbox.
        actix_web::rt::time::sleep(Duration::from_millis(20)).await;

        let frames = collected.lock().unwrap();
        assert_eq!(frames.len(), 2, "dropped delta must produce no frames");

        let media: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "MZ1");
        assert!(media["media"]["payload"].is_string());

        let mark: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(mark["event"], "mark");
        assert_eq!(mark["mark"]["name"], MARK_LABEL);

        let session = session.lock().unwrap();
        assert_eq!(session.pending_mark_count(), 1);
        assert_eq!(session.last_assistant_item(), Some("item_1"));
    }

    #[actix_web::test]
    async fn test_barge_in_truncates_and_clears() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = FrameSink {
            frames: collected.clone(),
        }
        .start();
        let frames = sink.recipient::<ForwardFrame>();

        let app_state = AppState::new(AppConfig::default());
        let session = Arc::new(Mutex::new(CallSession::new(Language::English)));
        {
            let mut session = session.lock().unwrap();
            session.set_stream_sid("MZ1".to_string());
            session.observe_media_timestamp(1000);
            session.note_assistant_audio("item_9");
            session.push_mark(MARK_LABEL);
            session.observe_media_timestamp(1600);
        }

        let mut ws = RecordingSink(Vec::new());
        handle_speech_started(&session, &frames, &app_state, &mut ws)
            .await
            .unwrap();

        actix_web::rt::time::sleep(Duration::from_millis(20)).await;

        // The AI channel gets a truncate at the elapsed playback time.
        assert_eq!(ws.0.len(), 1);
        let truncate: serde_json::Value = match &ws.0[0] {
            Message::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(truncate["type"], "conversation.item.truncate");
        assert_eq!(truncate["item_id"], "item_9");
        assert_eq!(truncate["audio_end_ms"], 600);

        // The telephony side gets a clear frame.
        {
            let collected = collected.lock().unwrap();
            assert_eq!(collected.len(), 1);
            let clear: serde_json::Value = serde_json::from_str(&collected[0]).unwrap();
            assert_eq!(clear["event"], "clear");
            assert_eq!(clear["streamSid"], "MZ1");
        }

        assert_eq!(app_state.get_metrics_snapshot().interruption_count, 1);
        assert_eq!(session.lock().unwrap().pending_mark_count(), 0);

        // A second speech_started with nothing playing sends nothing.
        handle_speech_started(&session, &frames, &app_state, &mut ws)
            .await
            .unwrap();
        assert_eq!(ws.0.len(), 1);
        assert_eq!(app_state.get_metrics_snapshot().interruption_count, 1);
    }

    #[test]
    fn test_session_update_shape() {
        let event = session_update_event("alloy", "be helpful");
        assert_eq!(event["type"], "session.update");
        assert_eq!(event["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(event["session"]["voice"], "alloy");
        assert_eq!(event["session"]["instructions"], "be helpful");
        assert_eq!(event["session"]["input_audio_format"], "pcm16");
    }

    #[test]
    fn test_truncate_event_shape() {
        let event = truncate_event("item_7", 430);
        assert_eq!(event["type"], "conversation.item.truncate");
        assert_eq!(event["item_id"], "item_7");
        assert_eq!(event["content_index"], 0);
        assert_eq!(event["audio_end_ms"], 430);
    }

    #[test]
    fn test_greeting_sequence_shape() {
        let item = greeting_item_event(greeting_text(Language::Spanish));
        assert_eq!(item["type"], "conversation.item.create");
        assert_eq!(item["item"]["role"], "assistant");
        assert!(item["item"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("Gracias por llamar"));

        assert_eq!(response_create_event()["type"], "response.create");
    }

    #[test]
    fn test_instructions_pin_language() {
        let en = tip_line_instructions(Language::English);
        assert!(en.contains("exclusively in English"));
        assert!(en.contains("anonymous employee tip line"));

        let es = tip_line_instructions(Language::Spanish);
        assert!(es.contains("exclusively in Spanish"));
    }

    #[test]
    fn test_agent_event_parsing() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"response.audio.delta","delta":"AAAA","item_id":"item_1"}"#,
        )
        .unwrap();
        match event {
            AgentEvent::AudioDelta { delta, item_id } => {
                assert_eq!(delta, "AAAA");
                assert_eq!(item_id, "item_1");
            }
            _ => panic!("wrong variant"),
        }

        let event: AgentEvent =
            serde_json::from_str(r#"{"type":"input_audio_buffer.speech_started"}"#).unwrap();
        assert!(matches!(event, AgentEvent::SpeechStarted));

        // Unknown event types are tolerated, not errors
        let event: AgentEvent =
            serde_json::from_str(r#"{"type":"response.done","response":{}}"#).unwrap();
        assert!(matches!(event, AgentEvent::Other));
    }

    #[test]
    fn test_agent_error_event_parsing() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"error","error":{"message":"session expired"}}"#,
        )
        .unwrap();
        match event {
            AgentEvent::Error { error } => {
                assert_eq!(error.unwrap()["message"], "session expired");
            }
            _ => panic!("wrong variant"),
        }
    }
}
