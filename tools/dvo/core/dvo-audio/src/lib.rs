#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod audio_output;
pub mod mixing;

pub use audio_output::{audio_channel, AudioConsumer, AudioProducer, AudioSink, NullSink, Playback, Publish};
pub use mixing::{Gain, Limiter};

/// Shape of the chunk ring and the conditioning applied on the way in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// emulated frames per second, one chunk each
    pub frame_rate: u32,
    pub frames_per_chunk: usize,
    /// ring capacity in chunks
    pub depth: usize,
    pub gain: Gain,
    /// below this many queued chunks the producer falls back to the hard clamp
    pub low_watermark: usize,
    /// length of the fade-in/fade-out ramps around an underrun
    pub fade_frames: usize,
}

impl AudioConfig {
    /// I2S output at 24 kHz, one 400-frame chunk per 60 Hz frame.
    pub const I2S_24K: AudioConfig = AudioConfig {
        sample_rate: 24_000,
        frame_rate: 60,
        frames_per_chunk: 400,
        depth: 16,
        gain: Gain::new(8, 5),
        low_watermark: 0,
        fade_frames: 128,
    };

    /// Buffer-pool output at 22.05 kHz.
    pub const POOL_22K: AudioConfig = AudioConfig {
        sample_rate: 22_050,
        frame_rate: 60,
        frames_per_chunk: 512,
        depth: 4,
        gain: Gain::UNITY,
        low_watermark: 0,
        fade_frames: 128,
    };

    /// Native 32040 Hz stream played back at 55 frames per second.
    pub const FRAMEDROP_32K: AudioConfig = AudioConfig {
        sample_rate: 32_040 * 60 / 55,
        frame_rate: 55,
        frames_per_chunk: 635,
        depth: 5,
        gain: Gain::UNITY,
        low_watermark: 0,
        fade_frames: 128,
    };

    pub fn chunk_micros(&self) -> u64 {
        self.frames_per_chunk as u64 * 1_000_000 / self.sample_rate.max(1) as u64
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::I2S_24K
    }
}
