//! # Call Session State
//!
//! Per-call bookkeeping shared between the two pumps of a bridged call.
//!
//! ## What lives here and why:
//! Most of a call's state is owned by exactly one pump (each direction has its
//! own transcoder, for example). The fields in `CallSession` are the ones both
//! pumps genuinely touch: the inbound pump advances the media clock and pops
//! mark acknowledgements, while the outbound pump records which assistant
//! response is playing and pushes marks. The struct is therefore wrapped in
//! `Arc<Mutex<_>>` by its owners and every compound update happens inside a
//! single `&mut` method so it is atomic under one lock acquisition.

use std::collections::VecDeque;
use uuid::Uuid;

/// Caller language chosen in the IVR menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
    Spanish,
}

impl Language {
    /// Map the IVR DTMF input to a language.
    ///
    /// The menu says "para español, presione uno"; every other input,
    /// including a timeout with no digits at all, falls through to English.
    pub fn from_digits(digits: &str) -> Self {
        if digits.trim() == "1" {
            Language::Spanish
        } else {
            Language::English
        }
    }

    /// Query-string value used on the media-stream URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
        }
    }

    pub fn from_query(value: &str) -> Option<Self> {
        match value {
            "en" => Some(Language::English),
            "es" => Some(Language::Spanish),
            _ => None,
        }
    }
}

/// One-shot greeting state machine.
///
/// The greeting must be pushed to the AI channel exactly once per call, no
/// matter how many media frames arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GreetingState {
    AwaitingTrigger,
    Greeted,
}

/// Everything the interruption controller needs to truncate the assistant,
/// captured atomically before the fields are cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    /// The assistant item currently being played to the caller.
    pub item_id: String,
    /// How much of it the caller has actually heard, in milliseconds.
    pub audio_end_ms: u64,
}

/// Shared per-call state.
#[derive(Debug)]
pub struct CallSession {
    /// Correlation id for logs, assigned before the telephony `start` event
    /// delivers the real stream id.
    pub call_id: Uuid,

    /// Telephony stream id. Set once by the `start` event; later `start`
    /// events are ignored.
    stream_sid: Option<String>,

    pub language: Language,

    /// Media clock: the highest timestamp seen on any inbound media frame,
    /// in milliseconds since the stream began. Never moves backwards.
    latest_media_timestamp: u64,

    /// Media-clock reading when the current assistant response began playing.
    /// `None` whenever no assistant audio is outstanding.
    response_start_timestamp: Option<u64>,

    /// Item id of the assistant response currently being played.
    last_assistant_item: Option<String>,

    /// Marks sent to the telephony side that have not been acknowledged yet.
    /// FIFO: the phone network acknowledges marks in send order.
    pending_marks: VecDeque<String>,

    greeting: GreetingState,
}

impl CallSession {
    pub fn new(language: Language) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            stream_sid: None,
            language,
            latest_media_timestamp: 0,
            response_start_timestamp: None,
            last_assistant_item: None,
            pending_marks: VecDeque::new(),
            greeting: GreetingState::AwaitingTrigger,
        }
    }

    /// Record the stream id from the telephony `start` event.
    ///
    /// Returns `false` when the id was already set, so the caller can log a
    /// protocol diagnostic without this module knowing about logging.
    pub fn set_stream_sid(&mut self, sid: String) -> bool {
        if self.stream_sid.is_some() {
            return false;
        }
        self.stream_sid = Some(sid);
        true
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    /// Advance the media clock. Out-of-order timestamps never move it back.
    pub fn observe_media_timestamp(&mut self, timestamp_ms: u64) {
        if timestamp_ms > self.latest_media_timestamp {
            self.latest_media_timestamp = timestamp_ms;
        }
    }

    pub fn latest_media_timestamp(&self) -> u64 {
        self.latest_media_timestamp
    }

    /// Record that assistant audio for `item_id` is flowing to the caller.
    ///
    /// The first delta of a response pins `response_start_timestamp` to the
    /// current media clock; later deltas of the same response leave it alone
    /// so the truncation offset measures from the start of playback.
    pub fn note_assistant_audio(&mut self, item_id: &str) {
        if self.response_start_timestamp.is_none() {
            self.response_start_timestamp = Some(self.latest_media_timestamp);
        }
        self.last_assistant_item = Some(item_id.to_string());
    }

    pub fn response_start_timestamp(&self) -> Option<u64> {
        self.response_start_timestamp
    }

    pub fn last_assistant_item(&self) -> Option<&str> {
        self.last_assistant_item.as_deref()
    }

    /// Queue a mark label after sending assistant audio to the telephony side.
    pub fn push_mark(&mut self, label: &str) {
        self.pending_marks.push_back(label.to_string());
    }

    /// Acknowledge the oldest outstanding mark.
    ///
    /// Returns `false` if the queue was already empty (an acknowledgement we
    /// never asked for); the caller logs it and carries on.
    pub fn ack_mark(&mut self) -> bool {
        self.pending_marks.pop_front().is_some()
    }

    pub fn pending_mark_count(&self) -> usize {
        self.pending_marks.len()
    }

    /// Begin an interruption: the caller started speaking over the assistant.
    ///
    /// When assistant audio is outstanding this computes how much the caller
    /// has heard and clears the playback state and mark queue in one step, so
    /// a concurrent media frame can never observe a half-reset session.
    /// Returns `None` when there is nothing to interrupt.
    pub fn begin_interruption(&mut self) -> Option<Truncation> {
        let item_id = self.last_assistant_item.take()?;
        let started = match self.response_start_timestamp.take() {
            Some(ts) => ts,
            None => {
                // Playback state was inconsistent; nothing sensible to truncate.
                self.pending_marks.clear();
                return None;
            }
        };

        self.pending_marks.clear();

        Some(Truncation {
            item_id,
            audio_end_ms: self.latest_media_timestamp.saturating_sub(started),
        })
    }

    /// Consume the one-shot greeting trigger.
    ///
    /// Returns `true` exactly once per call; every later call returns `false`.
    pub fn take_greeting(&mut self) -> bool {
        if self.greeting == GreetingState::AwaitingTrigger {
            self.greeting = GreetingState::Greeted;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_sid_is_set_once() {
        let mut session = CallSession::new(Language::English);
        assert!(session.set_stream_sid("MZ1".to_string()));
        assert!(!session.set_stream_sid("MZ2".to_string()));
        assert_eq!(session.stream_sid(), Some("MZ1"));
    }

    #[test]
    fn test_media_clock_is_monotone() {
        let mut session = CallSession::new(Language::English);
        session.observe_media_timestamp(100);
        session.observe_media_timestamp(40); // out-of-order frame
        assert_eq!(session.latest_media_timestamp(), 100);
        session.observe_media_timestamp(160);
        assert_eq!(session.latest_media_timestamp(), 160);
    }

    #[test]
    fn test_mark_queue_never_goes_negative() {
        let mut session = CallSession::new(Language::English);
        session.push_mark("agent-audio");
        session.push_mark("agent-audio");
        assert!(session.ack_mark());
        assert!(session.ack_mark());
        // Third acknowledgement has nothing to match
        assert!(!session.ack_mark());
        assert_eq!(session.pending_mark_count(), 0);
    }

    #[test]
    fn test_interruption_is_noop_when_idle() {
        let mut session = CallSession::new(Language::Spanish);
        session.observe_media_timestamp(5000);
        assert_eq!(session.begin_interruption(), None);
    }

    #[test]
    fn test_interruption_computes_elapsed_and_resets() {
        let mut session = CallSession::new(Language::English);
        session.observe_media_timestamp(1000);
        session.note_assistant_audio("item_A");
        session.push_mark("agent-audio");
        session.observe_media_timestamp(1730);

        let truncation = session.begin_interruption().unwrap();
        assert_eq!(truncation.item_id, "item_A");
        assert_eq!(truncation.audio_end_ms, 730);

        // All three playback fields reset together
        assert_eq!(session.last_assistant_item(), None);
        assert_eq!(session.response_start_timestamp(), None);
        assert_eq!(session.pending_mark_count(), 0);

        // A second interruption with nothing playing does nothing
        assert_eq!(session.begin_interruption(), None);
    }

    #[test]
    fn test_interruption_offset_saturates() {
        // A response that started "in the future" relative to the media
        // clock (clock skew) must not underflow.
        let mut session = CallSession::new(Language::English);
        session.observe_media_timestamp(500);
        session.note_assistant_audio("item_B");
        // Media clock has not advanced since the response began
        let truncation = session.begin_interruption().unwrap();
        assert_eq!(truncation.audio_end_ms, 0);
    }

    #[test]
    fn test_response_start_pins_to_first_delta() {
        let mut session = CallSession::new(Language::English);
        session.observe_media_timestamp(2000);
        session.note_assistant_audio("item_C");
        session.observe_media_timestamp(2400);
        // Second delta of the same response must not move the start marker
        session.note_assistant_audio("item_C");
        assert_eq!(session.response_start_timestamp(), Some(2000));
    }

    #[test]
    fn test_greeting_fires_exactly_once() {
        let mut session = CallSession::new(Language::Spanish);
        assert!(session.take_greeting());
        assert!(!session.take_greeting());
        assert!(!session.take_greeting());
    }

    #[test]
    fn test_language_digit_mapping() {
        assert_eq!(Language::from_digits("1"), Language::Spanish);
        assert_eq!(Language::from_digits(" 1 "), Language::Spanish);
        assert_eq!(Language::from_digits("2"), Language::English);
        assert_eq!(Language::from_digits(""), Language::English);
        assert_eq!(Language::from_query("es"), Some(Language::Spanish));
        assert_eq!(Language::from_query("fr"), None);
    }
}
