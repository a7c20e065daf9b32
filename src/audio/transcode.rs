//! # Audio Transcoding
//!
//! Converts audio between the two legs of a bridged call:
//!
//! - The telephony leg carries 8-bit µ-law (G.711 PCMU) at 8 kHz.
//! - The AI realtime leg carries 16-bit little-endian PCM at 24 kHz.
//!
//! Both directions are **streaming**: audio arrives in small chunks (20 ms
//! frames from the phone network, variable-size deltas from the model) and the
//! resampler carries its interpolation state across chunk boundaries. Feeding
//! one large buffer or the same bytes split into many small chunks produces
//! identical output.
//!
//! µ-law companding follows ITU-T G.711 with the standard lookup tables.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;

/// Errors produced while transcoding a chunk of audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeError {
    /// A PCM16 chunk whose byte length is not a multiple of the sample width.
    /// The chunk is dropped; the stream continues with the next one.
    MalformedChunk { len: usize },
}

impl fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscodeError::MalformedChunk { len } => {
                write!(f, "PCM16 chunk of {} bytes is not sample-aligned", len)
            }
        }
    }
}

impl std::error::Error for TranscodeError {}

// µ-law segment (exponent) table, indexed by the biased magnitude >> 7.
static ULAW_ENCODE_TABLE: [i16; 256] = [
    0, 0, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
];

// µ-law expansion table, indexed by the code word as it appears on the wire.
static ULAW_DECODE_TABLE: [i16; 256] = [
    -32124, -31100, -30076, -29052, -28028, -27004, -25980, -24956,
    -23932, -22908, -21884, -20860, -19836, -18812, -17788, -16764,
    -15996, -15484, -14972, -14460, -13948, -13436, -12924, -12412,
    -11900, -11388, -10876, -10364, -9852, -9340, -8828, -8316,
    -7932, -7676, -7420, -7164, -6908, -6652, -6396, -6140,
    -5884, -5628, -5372, -5116, -4860, -4604, -4348, -4092,
    -3900, -3772, -3644, -3516, -3388, -3260, -3132, -3004,
    -2876, -2748, -2620, -2492, -2364, -2236, -2108, -1980,
    -1884, -1820, -1756, -1692, -1628, -1564, -1500, -1436,
    -1372, -1308, -1244, -1180, -1116, -1052, -988, -924,
    -876, -844, -812, -780, -748, -716, -684, -652,
    -620, -588, -556, -524, -492, -460, -428, -396,
    -372, -356, -340, -324, -308, -292, -276, -260,
    -244, -228, -212, -196, -180, -164, -148, -132,
    -120, -112, -104, -96, -88, -80, -72, -64,
    -56, -48, -40, -32, -24, -16, -8, 0,
    32124, 31100, 30076, 29052, 28028, 27004, 25980, 24956,
    23932, 22908, 21884, 20860, 19836, 18812, 17788, 16764,
    15996, 15484, 14972, 14460, 13948, 13436, 12924, 12412,
    11900, 11388, 10876, 10364, 9852, 9340, 8828, 8316,
    7932, 7676, 7420, 7164, 6908, 6652, 6396, 6140,
    5884, 5628, 5372, 5116, 4860, 4604, 4348, 4092,
    3900, 3772, 3644, 3516, 3388, 3260, 3132, 3004,
    2876, 2748, 2620, 2492, 2364, 2236, 2108, 1980,
    1884, 1820, 1756, 1692, 1628, 1564, 1500, 1436,
    1372, 1308, 1244, 1180, 1116, 1052, 988, 924,
    876, 844, 812, 780, 748, 716, 684, 652,
    620, 588, 556, 524, 492, 460, 428, 396,
    372, 356, 340, 324, 308, 292, 276, 260,
    244, 228, 212, 196, 180, 164, 148, 132,
    120, 112, 104, 96, 88, 80, 72, 64,
    56, 48, 40, 32, 24, 16, 8, 0,
];

/// Encode a 16-bit PCM sample to 8-bit µ-law.
///
/// Follows the ITU-T G.711 recommendation: bias the magnitude, quantize
/// logarithmically via the segment table, then invert the bits.
pub(crate) fn encode_ulaw(sample: i16) -> u8 {
    // -32768 would overflow when negated
    let value = if sample == i16::MIN { 32767 } else { sample.abs() };

    // Add the 132 bias, clamping to the 16-bit positive range
    let value = if value as u32 + 132 > 32767 {
        32767u16
    } else {
        (value + 132) as u16
    };

    let sign = if sample < 0 { 0x80u8 } else { 0u8 };
    let exponent = ULAW_ENCODE_TABLE[(value >> 7) as usize] as u8;
    let mantissa = ((value >> (exponent as u16 + 3)) & 0x0F) as u8;

    // The whole code word is inverted, so digital silence is 0xFF.
    (sign | (exponent << 4) | mantissa) ^ 0xFF
}

/// Decode an 8-bit µ-law sample to 16-bit PCM.
pub(crate) fn decode_ulaw(encoded: u8) -> i16 {
    ULAW_DECODE_TABLE[encoded as usize]
}

/// Streaming linear-interpolation resampler.
///
/// ## How state is carried:
/// The phase accumulator counts in units of `1/to_rate` of one input-sample
/// interval, so all arithmetic is exact integer arithmetic and the output
/// length for a given total input is fully deterministic regardless of how the
/// input is chunked. `prev` holds the last sample of the previous chunk so the
/// first outputs of a new chunk interpolate across the boundary.
#[derive(Debug, Clone)]
pub struct ResamplerState {
    from_rate: u64,
    to_rate: u64,
    /// Last input sample seen, carried across chunks.
    prev: i16,
    /// Position of the next output inside the current input interval,
    /// in units of 1/to_rate. Always < from_rate + to_rate.
    phase: u64,
}

impl ResamplerState {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate: from_rate as u64,
            to_rate: to_rate as u64,
            prev: 0,
            phase: 0,
        }
    }

    /// Resample one chunk, appending output samples to `out`.
    pub fn process(&mut self, input: &[i16], out: &mut Vec<i16>) {
        for &cur in input {
            // Emit every output that falls inside [prev, cur].
            while self.phase < self.to_rate {
                let frac = self.phase as f64 / self.to_rate as f64;
                let interpolated =
                    self.prev as f64 + (cur as f64 - self.prev as f64) * frac;
                out.push(interpolated.round() as i16);
                self.phase += self.from_rate;
            }
            self.phase -= self.to_rate;
            self.prev = cur;
        }
    }
}

/// Caller direction: µ-law at the telephony rate in, PCM16 little-endian at
/// the realtime rate out. Owned exclusively by the inbound pump.
#[derive(Debug)]
pub struct CallerAudioEncoder {
    resampler: ResamplerState,
}

impl CallerAudioEncoder {
    pub fn new(telephony_rate: u32, realtime_rate: u32) -> Self {
        Self {
            resampler: ResamplerState::new(telephony_rate, realtime_rate),
        }
    }

    /// Decompand and upsample one telephony frame.
    ///
    /// µ-law input can never be malformed at this layer (every byte is a
    /// valid code word), so this direction is infallible.
    pub fn transcode(&mut self, ulaw: &[u8]) -> Vec<u8> {
        let pcm: Vec<i16> = ulaw.iter().map(|&b| decode_ulaw(b)).collect();

        let mut resampled = Vec::with_capacity(
            pcm.len() * self.resampler.to_rate as usize / self.resampler.from_rate as usize + 1,
        );
        self.resampler.process(&pcm, &mut resampled);

        let mut bytes = Vec::with_capacity(resampled.len() * 2);
        for sample in resampled {
            // Vec<u8> writes are infallible
            let _ = bytes.write_i16::<LittleEndian>(sample);
        }
        bytes
    }
}

/// Agent direction: PCM16 little-endian at the realtime rate in, µ-law at the
/// telephony rate out. Owned exclusively by the outbound pump.
#[derive(Debug)]
pub struct AgentAudioEncoder {
    resampler: ResamplerState,
}

impl AgentAudioEncoder {
    pub fn new(realtime_rate: u32, telephony_rate: u32) -> Self {
        Self {
            resampler: ResamplerState::new(realtime_rate, telephony_rate),
        }
    }

    /// Downsample and compand one model audio delta.
    ///
    /// Rejects chunks whose byte length is not a whole number of 16-bit
    /// samples; the caller drops the chunk and the stream continues.
    pub fn transcode(&mut self, pcm_bytes: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        if pcm_bytes.len() % 2 != 0 {
            return Err(TranscodeError::MalformedChunk {
                len: pcm_bytes.len(),
            });
        }

        let pcm: Vec<i16> = pcm_bytes
            .chunks_exact(2)
            .map(LittleEndian::read_i16)
            .collect();

        let mut resampled = Vec::with_capacity(
            pcm.len() * self.resampler.to_rate as usize / self.resampler.from_rate as usize + 1,
        );
        self.resampler.process(&pcm, &mut resampled);

        Ok(resampled.into_iter().map(encode_ulaw).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_round_trip_is_close() {
        for &value in &[0i16, 100, -100, 1000, -1000, 8000, -8000, 30000, -30000] {
            let decoded = decode_ulaw(encode_ulaw(value));
            // µ-law is lossy; quantization error grows with magnitude
            let tolerance = (value.unsigned_abs() / 16).max(8) as i32;
            assert!(
                (decoded as i32 - value as i32).abs() <= tolerance,
                "{} round-tripped to {}",
                value,
                decoded
            );
        }
    }

    #[test]
    fn test_ulaw_extremes() {
        // i16::MIN must not panic on negation
        let decoded = decode_ulaw(encode_ulaw(i16::MIN));
        assert!(decoded < -30000);
        let decoded = decode_ulaw(encode_ulaw(i16::MAX));
        assert!(decoded > 30000);
    }

    #[test]
    fn test_upsample_length_is_deterministic() {
        // One 20ms telephony frame at 8kHz is 160 samples; at 24kHz that
        // is exactly three output samples per input sample.
        let mut encoder = CallerAudioEncoder::new(8_000, 24_000);
        let frame = vec![0xFFu8; 160]; // µ-law silence
        let out = encoder.transcode(&frame);
        assert_eq!(out.len(), 160 * 3 * 2);

        // Every subsequent frame produces the same length
        let out = encoder.transcode(&frame);
        assert_eq!(out.len(), 160 * 3 * 2);
    }

    #[test]
    fn test_downsample_length_is_deterministic() {
        let mut encoder = AgentAudioEncoder::new(24_000, 8_000);
        let pcm = vec![0u8; 480 * 2];
        let out = encoder.transcode(&pcm).unwrap();
        assert_eq!(out.len(), 160);
        let out = encoder.transcode(&pcm).unwrap();
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn test_resampler_state_carries_across_chunks() {
        // A ramp split into two chunks must resample identically to the
        // same ramp processed in one piece.
        let ramp: Vec<i16> = (0..320).map(|i| (i * 50) as i16).collect();

        let mut whole = ResamplerState::new(8_000, 24_000);
        let mut out_whole = Vec::new();
        whole.process(&ramp, &mut out_whole);

        let mut split = ResamplerState::new(8_000, 24_000);
        let mut out_split = Vec::new();
        split.process(&ramp[..160], &mut out_split);
        split.process(&ramp[160..], &mut out_split);

        assert_eq!(out_whole, out_split);
    }

    #[test]
    fn test_downsample_then_upsample_preserves_duration() {
        let mut down = AgentAudioEncoder::new(24_000, 8_000);
        let mut up = CallerAudioEncoder::new(8_000, 24_000);

        let pcm = vec![0u8; 960 * 2]; // 40ms at 24kHz
        let ulaw = down.transcode(&pcm).unwrap();
        assert_eq!(ulaw.len(), 320); // 40ms at 8kHz

        let back = up.transcode(&ulaw);
        assert_eq!(back.len(), 960 * 2);
    }

    #[test]
    fn test_malformed_chunk_is_rejected() {
        let mut encoder = AgentAudioEncoder::new(24_000, 8_000);
        let err = encoder.transcode(&[0u8; 33]).unwrap_err();
        assert_eq!(err, TranscodeError::MalformedChunk { len: 33 });

        // The encoder keeps working after a rejected chunk
        assert!(encoder.transcode(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_empty_chunk_produces_empty_output() {
        let mut encoder = CallerAudioEncoder::new(8_000, 24_000);
        assert!(encoder.transcode(&[]).is_empty());

        let mut encoder = AgentAudioEncoder::new(24_000, 8_000);
        assert!(encoder.transcode(&[]).unwrap().is_empty());
    }
}
