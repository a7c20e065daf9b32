//! # Audio Module
//!
//! Transcoding between the telephony leg (8kHz µ-law) and the AI realtime
//! leg (24kHz PCM16) of a bridged call.

pub mod transcode;

pub use transcode::{AgentAudioEncoder, CallerAudioEncoder, TranscodeError};
