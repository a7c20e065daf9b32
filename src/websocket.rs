//! # Telephony Media-Stream Handler
//!
//! The telephony half of a bridged call. Each `/media-stream` WebSocket
//! connection becomes one actor which:
//!
//! 1. Parses the provider's JSON media-stream events (`start`, `media`,
//!    `mark`, `stop`) — this is the inbound pump,
//! 2. transcodes caller audio and forwards it to the AI channel task over an
//!    mpsc command channel, and
//! 3. writes outbound frames (`media`, `mark`, `clear`) produced by the AI
//!    channel task back to the telephony socket, in the order the task
//!    produced them (the actor mailbox preserves ordering).
//!
//! ## Lifecycle:
//! `started()` spawns the AI channel task; `stopped()` drops the command
//! sender, which the task observes as end-of-channel and closes the AI
//! socket. The task's own exit arrives here as `AgentChannelClosed` and stops
//! the actor. Either way both legs die together.

use crate::audio::CallerAudioEncoder;
use crate::config::GreetingTrigger;
use crate::error::AppError;
use crate::realtime::{run_agent_channel, AgentChannelConfig, AgentCommand};
use crate::session::{CallSession, Language};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Mark label attached to every outbound audio frame.
pub const MARK_LABEL: &str = "responsePart";

/// Inbound media-stream events. Unrecognized events parse as `Other` and are
/// ignored rather than treated as protocol errors.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
pub enum TelephonyEvent {
    #[serde(rename = "start")]
    Start { start: StartPayload },

    #[serde(rename = "media")]
    Media { media: MediaPayload },

    #[serde(rename = "mark")]
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },

    #[serde(rename = "stop")]
    Stop,

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct StartPayload {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64 µ-law audio.
    pub payload: String,
    /// Milliseconds since the stream started. The provider sends this as a
    /// JSON string, but some stacks emit a bare number; accept both.
    #[serde(default)]
    pub timestamp: Option<TimestampValue>,
}

#[derive(Debug, Deserialize)]
pub struct MarkPayload {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TimestampValue {
    Num(u64),
    Text(String),
}

impl TimestampValue {
    pub fn as_ms(&self) -> Option<u64> {
        match self {
            TimestampValue::Num(ms) => Some(*ms),
            TimestampValue::Text(text) => text.parse().ok(),
        }
    }
}

/// Outbound `media` frame carrying assistant audio to the caller.
pub fn media_frame(stream_sid: &str, payload_b64: &str) -> serde_json::Value {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload_b64 },
    })
}

/// Outbound `mark` frame: asks the telephony leg to acknowledge once the
/// preceding media frame has finished playing.
pub fn mark_frame(stream_sid: &str, name: &str) -> serde_json::Value {
    json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": { "name": name },
    })
}

/// Outbound `clear` frame: flush the caller-facing playback buffer. Sent on
/// interruption so the assistant stops mid-word instead of playing out the
/// rest of its buffered speech.
pub fn clear_frame(stream_sid: &str) -> serde_json::Value {
    json!({ "event": "clear", "streamSid": stream_sid })
}

/// A pre-serialized frame from the AI channel task to write to the telephony
/// socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ForwardFrame(pub String);

/// The AI channel task has exited (normally or not); the call is over.
#[derive(Message)]
#[rtype(result = "()")]
pub struct AgentChannelClosed;

/// WebSocket actor for one bridged call.
pub struct MediaStreamSocket {
    session: Arc<Mutex<CallSession>>,

    /// Command channel to the AI task. `None` once the call is shutting down.
    commands: Option<mpsc::UnboundedSender<AgentCommand>>,

    /// Caller-direction transcoder, owned by this pump for the whole call so
    /// the resampler state is continuous across frames.
    encoder: CallerAudioEncoder,

    greeting_trigger: GreetingTrigger,
    agent_config: AgentChannelConfig,
    app_state: web::Data<AppState>,

    last_heartbeat: Instant,
}

impl MediaStreamSocket {
    pub fn new(
        language: Language,
        agent_config: AgentChannelConfig,
        app_state: web::Data<AppState>,
    ) -> Self {
        let encoder = CallerAudioEncoder::new(
            agent_config.telephony_rate,
            agent_config.realtime_rate,
        );
        Self {
            session: Arc::new(Mutex::new(CallSession::new(language))),
            commands: None,
            encoder,
            greeting_trigger: agent_config.greeting_trigger,
            agent_config,
            app_state,
            last_heartbeat: Instant::now(),
        }
    }

    /// Send a command to the AI task; a closed channel means the task is gone
    /// and the call is ending, so the actor stops.
    fn send_command(&mut self, command: AgentCommand, ctx: &mut ws::WebsocketContext<Self>) {
        let alive = match &self.commands {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        };
        if !alive {
            debug!("AI channel gone, stopping telephony actor");
            ctx.stop();
        }
    }

    fn handle_event(&mut self, event: TelephonyEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            TelephonyEvent::Start { start } => {
                let mut session = self.session.lock().unwrap();
                let call_id = session.call_id;
                if session.set_stream_sid(start.stream_sid.clone()) {
                    info!(call_id = %call_id, stream_sid = %start.stream_sid, "Telephony stream started");
                } else {
                    warn!(call_id = %call_id, "Duplicate start event ignored");
                }
            }

            TelephonyEvent::Media { media } => {
                self.handle_media(media, ctx);
            }

            TelephonyEvent::Mark { mark } => {
                let acked = self.session.lock().unwrap().ack_mark();
                if !acked {
                    let name = mark.and_then(|m| m.name).unwrap_or_default();
                    warn!(name = %name, "Mark acknowledgement with empty pending queue");
                }
            }

            TelephonyEvent::Stop => {
                info!("Telephony stop event, ending call");
                // Give the model the end-of-turn signal, then let shutdown
                // propagate: stopping drops the sender and the task exits.
                self.send_command(AgentCommand::EndOfTurn, ctx);
                ctx.stop();
            }

            TelephonyEvent::Other => {
                debug!("Ignoring unrecognized telephony event");
            }
        }
    }

    fn handle_media(&mut self, media: MediaPayload, ctx: &mut ws::WebsocketContext<Self>) {
        let (pcm, greet) = match self.admit_media(&media) {
            Some(admitted) => admitted,
            None => return,
        };

        if greet {
            self.send_command(AgentCommand::Greet, ctx);
        }
        self.send_command(AgentCommand::AppendAudio(pcm), ctx);
    }

    /// Validate, admit, and transcode one inbound media frame.
    ///
    /// Returns the PCM16 payload for the AI channel plus whether this frame
    /// fires the one-time greeting. `None` means the frame is dropped (it
    /// arrived before `start`, or its payload is not valid base64) and the
    /// call carries on. The payload is decoded before the greeting one-shot
    /// is consumed, so a dropped frame never swallows the greeting.
    fn admit_media(&mut self, media: &MediaPayload) -> Option<(Vec<u8>, bool)> {
        let ulaw = match B64.decode(&media.payload) {
            Ok(ulaw) => ulaw,
            Err(err) => {
                // Malformed payload: drop the frame, keep the call alive.
                warn!(error = %err, "Dropping media frame with invalid base64");
                return None;
            }
        };

        // All session updates for this frame under one lock acquisition;
        // transcoding happens after the lock is released.
        let greet = {
            let mut session = self.session.lock().unwrap();
            if session.stream_sid().is_none() {
                // Media before start carries no usable stream context.
                warn!("Dropping media frame received before start event");
                return None;
            }
            if let Some(ts) = media.timestamp.as_ref().and_then(TimestampValue::as_ms) {
                session.observe_media_timestamp(ts);
            }
            self.greeting_trigger == GreetingTrigger::FirstMedia && session.take_greeting()
        };

        Some((self.encoder.transcode(&ulaw), greet))
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Spawn the AI channel task for this call.
    fn started(&mut self, ctx: &mut Self::Context) {
        let call_id = self.session.lock().unwrap().call_id;
        info!(call_id = %call_id, language = self.agent_config.language.as_str(), "Call session starting");

        let (sender, receiver) = mpsc::unbounded_channel();
        self.commands = Some(sender);

        tokio::spawn(run_agent_channel(
            self.agent_config.clone(),
            self.session.clone(),
            receiver,
            ctx.address().recipient::<ForwardFrame>(),
            ctx.address().recipient::<AgentChannelClosed>(),
            self.app_state.get_ref().clone(),
        ));

        // Connection liveness check. The provider streams media every 20ms,
        // so a minute of silence means the leg is dead.
        ctx.run_interval(Duration::from_secs(30), |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > Duration::from_secs(60) {
                warn!("Telephony heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let call_id = self.session.lock().unwrap().call_id;
        info!(call_id = %call_id, "Call session ended");

        // Dropping the sender tells the AI task to close its socket.
        self.commands = None;
        self.app_state.end_call();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<TelephonyEvent>(&text) {
                Ok(event) => self.handle_event(event, ctx),
                Err(err) => {
                    // Malformed frame from the telephony side: drop it.
                    warn!(error = %err, "Dropping unparseable telephony frame");
                }
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("Ignoring unexpected binary frame on media stream");
            }
            Ok(ws::Message::Ping(payload)) => {
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "Telephony socket closed");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "Telephony socket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<ForwardFrame> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, msg: ForwardFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<AgentChannelClosed> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, _msg: AgentChannelClosed, ctx: &mut Self::Context) {
        info!("AI channel closed, ending telephony leg");
        ctx.stop();
    }
}

#[derive(Debug, Deserialize)]
pub struct MediaStreamQuery {
    #[serde(default)]
    pub lang: Option<String>,
}

/// GET `/media-stream` — upgrade to the per-call WebSocket actor.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<MediaStreamQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = app_state.get_config();

    let language = query
        .lang
        .as_deref()
        .and_then(Language::from_query)
        .unwrap_or(Language::English);

    if !app_state.try_begin_call(config.bridge.max_concurrent_calls) {
        warn!(
            max = config.bridge.max_concurrent_calls,
            "Rejecting call, bridge at capacity"
        );
        return Err(AppError::ServiceUnavailable(
            "Maximum concurrent calls reached".to_string(),
        )
        .into());
    }

    let agent_config = AgentChannelConfig {
        url: config.realtime_url(),
        api_key: config.realtime.api_key.clone(),
        voice: config.realtime.voice.clone(),
        realtime_rate: config.realtime.sample_rate,
        telephony_rate: config.telephony.sample_rate,
        language,
        greeting_trigger: config.bridge.greeting_trigger,
    };

    let socket = MediaStreamSocket::new(language, agent_config, app_state.clone());
    match ws::start(socket, &req, stream) {
        Ok(response) => Ok(response),
        Err(err) => {
            // The actor never started, so stopped() will not release the slot.
            app_state.end_call();
            Err(err)
        }
    }
}
