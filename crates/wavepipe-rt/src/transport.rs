//! Stream formats, transport states and position time formats.

use serde::{Deserialize, Serialize};

/// Frame rate used for SMPTE positions.
pub const SMPTE_FPS: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Playback,
    Capture,
}

/// Interleaved little-endian PCM sample encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleEncoding {
    U8,
    S16Le,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleEncoding {
    pub fn bits(self) -> u16 {
        match self {
            SampleEncoding::U8 => 8,
            SampleEncoding::S16Le => 16,
            SampleEncoding::S24Le => 24,
            SampleEncoding::S32Le | SampleEncoding::F32Le => 32,
        }
    }

    pub fn bytes(self) -> usize {
        usize::from(self.bits() / 8)
    }

    /// Byte pattern of a silent sample. Unsigned 8-bit PCM is centred on 0x80.
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleEncoding::U8 => 0x80,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("unsupported channel count {0}")]
    Channels(u16),
    #[error("unsupported sample rate {0}")]
    SampleRate(u32),
}

/// Negotiated stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub encoding: SampleEncoding,
    pub channels: u16,
    pub sample_rate: u32,
}

impl PcmFormat {
    pub const MAX_CHANNELS: u16 = 8;
    pub const MIN_RATE: u32 = 8_000;
    pub const MAX_RATE: u32 = 192_000;

    pub fn new(encoding: SampleEncoding, channels: u16, sample_rate: u32) -> Self {
        Self {
            encoding,
            channels,
            sample_rate,
        }
    }

    /// CD quality: 16-bit stereo at 44.1 kHz.
    pub fn cd() -> Self {
        Self::new(SampleEncoding::S16Le, 2, 44_100)
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.channels == 0 || self.channels > Self::MAX_CHANNELS {
            return Err(FormatError::Channels(self.channels));
        }
        if !(Self::MIN_RATE..=Self::MAX_RATE).contains(&self.sample_rate) {
            return Err(FormatError::SampleRate(self.sample_rate));
        }
        Ok(())
    }

    /// Size of one frame (one sample for every channel) in bytes.
    pub fn block_align(&self) -> usize {
        self.encoding.bytes() * usize::from(self.channels)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.block_align() as u64 * u64::from(self.sample_rate)
    }

    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.block_align()
    }

    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        bytes / self.block_align().max(1)
    }

    pub fn fill_silence(&self, data: &mut [u8]) {
        data.fill(self.encoding.silence_byte());
    }

    /// Playing time of `bytes` in whole milliseconds.
    pub fn millis_of(&self, bytes: u64) -> u64 {
        bytes * 1000 / self.bytes_per_second().max(1)
    }

    /// Converts a byte position into the requested time format.
    pub fn to_time(&self, bytes: u64, format: TimeFormat) -> StreamTime {
        match format {
            TimeFormat::Bytes => StreamTime::Bytes(bytes),
            TimeFormat::Samples => StreamTime::Samples(bytes / self.block_align().max(1) as u64),
            TimeFormat::Millis => StreamTime::Millis(self.millis_of(bytes)),
            TimeFormat::Smpte => StreamTime::Smpte(self.smpte_of(bytes)),
        }
    }

    fn smpte_of(&self, bytes: u64) -> Smpte {
        let rate = u64::from(self.sample_rate.max(1));
        let fps = u64::from(SMPTE_FPS);
        // Round up to the next whole frame.
        let samples = bytes / self.block_align().max(1) as u64 + rate / fps - 1;
        let total_secs = samples / rate;
        let remainder = samples - total_secs * rate;
        Smpte {
            // Timecode hours wrap at midnight.
            hour: (total_secs / 3600 % 24) as u8,
            min: (total_secs / 60 % 60) as u8,
            sec: (total_secs % 60) as u8,
            frame: (remainder * fps / rate) as u8,
            fps: SMPTE_FPS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Stopped,
    Playing,
    Paused,
    Closed,
}

pub fn encode_state(state: StreamState) -> u8 {
    match state {
        StreamState::Stopped => 0,
        StreamState::Playing => 1,
        StreamState::Paused => 2,
        StreamState::Closed => 3,
    }
}

pub fn decode_state(value: u8) -> StreamState {
    match value {
        1 => StreamState::Playing,
        2 => StreamState::Paused,
        3 => StreamState::Closed,
        _ => StreamState::Stopped,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFormat {
    Bytes,
    Millis,
    Samples,
    Smpte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Smpte {
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
    pub frame: u8,
    pub fps: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamTime {
    Bytes(u64),
    Millis(u64),
    Samples(u64),
    Smpte(Smpte),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cd_format_derivations() {
        let format = PcmFormat::cd();
        assert_eq!(format.block_align(), 4);
        assert_eq!(format.bytes_per_second(), 176_400);
        assert_eq!(format.frames_to_bytes(1024), 4096);
        assert_eq!(format.millis_of(4096), 23);
    }

    #[test]
    fn position_conversions() {
        let format = PcmFormat::cd();
        assert_eq!(format.to_time(176_400, TimeFormat::Samples), StreamTime::Samples(44_100));
        assert_eq!(format.to_time(88_200, TimeFormat::Millis), StreamTime::Millis(500));

        // 1 hour, 1 minute, 1 second and half a second.
        let bytes = (3661 * 44_100 + 22_050) * 4;
        match format.to_time(bytes, TimeFormat::Smpte) {
            StreamTime::Smpte(smpte) => {
                assert_eq!((smpte.hour, smpte.min, smpte.sec), (1, 1, 1));
                assert_eq!(smpte.frame, 15);
                assert_eq!(smpte.fps, 30);
            }
            other => panic!("unexpected time {other:?}"),
        }
    }

    #[test]
    fn smpte_hours_wrap_after_a_day() {
        let format = PcmFormat::cd();
        // 300 hours and 5 seconds.
        let bytes = (300 * 3600 + 5) * 44_100 * 4;
        match format.to_time(bytes, TimeFormat::Smpte) {
            StreamTime::Smpte(smpte) => {
                assert_eq!((smpte.hour, smpte.min, smpte.sec), (12, 0, 5));
            }
            other => panic!("unexpected time {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_odd_formats() {
        assert_eq!(
            PcmFormat::new(SampleEncoding::S16Le, 0, 44_100).validate(),
            Err(FormatError::Channels(0))
        );
        assert_eq!(
            PcmFormat::new(SampleEncoding::S16Le, 2, 1_000).validate(),
            Err(FormatError::SampleRate(1_000))
        );
        assert!(PcmFormat::new(SampleEncoding::U8, 1, 8_000).validate().is_ok());
    }

    #[test]
    fn unsigned_silence_is_centred() {
        let mut data = [0u8; 4];
        PcmFormat::new(SampleEncoding::U8, 1, 8_000).fill_silence(&mut data);
        assert_eq!(data, [0x80; 4]);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            StreamState::Stopped,
            StreamState::Playing,
            StreamState::Paused,
            StreamState::Closed,
        ] {
            assert_eq!(decode_state(encode_state(state)), state);
        }
    }
}
