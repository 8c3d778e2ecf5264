use alloc::vec;
use alloc::vec::Vec;
use core::convert::Infallible;

use log::{debug, trace, warn};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::mixing::{condition, pack, scale_frame, unpack, Limiter};
use crate::AudioConfig;

pub const MAX_VOLUME: u8 = 128;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Publish {
    Published,
    /// The ring was full; the chunk was discarded.
    Dropped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Playback {
    Playing,
    /// First chunk after an underrun, head ramped up from silence.
    FadingIn,
    /// First empty step after playback, the previous tail ramped down.
    FadingOut,
    Silence,
}

/// Build the chunk ring for `config` and hand out its two ends.
///
/// Both ends own one half of an `rtrb` ring, which is single-producer
/// single-consumer by construction: neither handle can be cloned.
pub fn audio_channel(config: AudioConfig) -> (AudioProducer, AudioConsumer) {
    let chunk = config.frames_per_chunk.max(1);
    let capacity = chunk * config.depth.max(1);
    let (producer, consumer) = RingBuffer::<u32>::new(capacity);
    debug!(
        "audio ring: {} chunks of {} frames at {} Hz",
        config.depth, chunk, config.sample_rate
    );

    (
        AudioProducer {
            config,
            chunk,
            capacity,
            ring: producer,
            published: 0,
            dropped: 0,
        },
        AudioConsumer {
            config,
            chunk,
            ring: consumer,
            last: vec![0; chunk],
            silent: true,
            volume: MAX_VOLUME,
            enabled: true,
            consumed: 0,
            underruns: 0,
            scratch: vec![0; chunk],
        },
    )
}

pub struct AudioProducer {
    config: AudioConfig,
    chunk: usize,
    capacity: usize,
    ring: Producer<u32>,
    published: u32,
    dropped: u32,
}

impl AudioProducer {
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Condition one frame's interleaved stereo mix and publish it as a
    /// chunk. A short mix is padded with silence, a long one truncated.
    pub fn publish(&mut self, samples: &[i16], limiter: Limiter) -> Publish {
        let gain = self.config.gain;
        let frames = (0..self.chunk).map(|i| {
            let l = samples.get(2 * i).copied().unwrap_or(0);
            let r = samples.get(2 * i + 1).copied().unwrap_or(0);
            condition(l, r, gain, limiter)
        });

        match self.ring.write_chunk_uninit(self.chunk) {
            Ok(slots) => {
                // commits only once every slot of the chunk is written
                slots.fill_from_iter(frames);
                self.published = self.published.wrapping_add(1);
                trace!("audio chunk {} published", self.published);
                Publish::Published
            }
            Err(_) => {
                self.dropped = self.dropped.wrapping_add(1);
                warn!("audio ring full, chunk dropped ({} total)", self.dropped);
                Publish::Dropped
            }
        }
    }

    /// Chunks published but not yet consumed.
    pub fn fill(&self) -> usize {
        (self.capacity - self.ring.slots()) / self.chunk
    }

    pub fn depth(&self) -> usize {
        self.capacity / self.chunk
    }

    pub fn is_full(&self) -> bool {
        self.ring.slots() < self.chunk
    }

    pub fn published(&self) -> u32 {
        self.published
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

pub struct AudioConsumer {
    config: AudioConfig,
    chunk: usize,
    ring: Consumer<u32>,
    /// what went out last, for the fade-out
    last: Vec<u32>,
    silent: bool,
    volume: u8,
    enabled: bool,
    consumed: u32,
    underruns: u32,
    scratch: Vec<u32>,
}

impl AudioConsumer {
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn frames_per_chunk(&self) -> usize {
        self.chunk
    }

    /// Clamped to `0..=128`.
    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(MAX_VOLUME);
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    pub fn underruns(&self) -> u32 {
        self.underruns
    }

    /// Produce one chunk of output into `out` (at most one chunk is written,
    /// any remainder is zeroed).
    pub fn next_chunk(&mut self, out: &mut [u32]) -> Playback {
        let n = self.chunk.min(out.len());
        let fade = self.config.fade_frames.min(n);

        let state = match self.ring.read_chunk(self.chunk) {
            Ok(chunk) => {
                let (head, tail) = chunk.as_slices();
                let split = head.len().min(n);
                out[..split].copy_from_slice(&head[..split]);
                let rest = (n - split).min(tail.len());
                out[split..split + rest].copy_from_slice(&tail[..rest]);
                chunk.commit_all();
                self.consumed = self.consumed.wrapping_add(1);

                if self.silent {
                    for (i, frame) in out[..fade].iter_mut().enumerate() {
                        *frame = scale_frame(*frame, i as i32, fade as i32);
                    }
                    self.silent = false;
                    Playback::FadingIn
                } else {
                    Playback::Playing
                }
            }
            Err(_) => {
                self.underruns = self.underruns.wrapping_add(1);
                if self.silent {
                    out[..n].fill(0);
                    Playback::Silence
                } else {
                    let tail = &self.last[self.last.len() - fade..];
                    for (i, (frame, prev)) in out[..fade].iter_mut().zip(tail).enumerate() {
                        *frame = scale_frame(*prev, (fade - 1 - i) as i32, fade as i32);
                    }
                    out[fade..n].fill(0);
                    self.silent = true;
                    debug!("audio underrun after {} chunks, fading out", self.consumed);
                    Playback::FadingOut
                }
            }
        };
        out[n..].fill(0);

        if matches!(state, Playback::Playing | Playback::FadingIn) {
            self.last[..n].copy_from_slice(&out[..n]);
        }

        if !self.enabled {
            out[..n].fill(0);
        } else if self.volume < MAX_VOLUME {
            let volume = self.volume as i32;
            for frame in out[..n].iter_mut() {
                *frame = scale_frame_shift(*frame, volume);
            }
        }

        state
    }

    /// Pull one chunk and hand it to `sink`.
    pub fn play_into<S: AudioSink>(&mut self, sink: &mut S) -> Result<Playback, S::Error> {
        let mut out = core::mem::take(&mut self.scratch);
        let state = self.next_chunk(&mut out);
        let result = sink.write(&out);
        self.scratch = out;
        result.map(|_| state)
    }
}

fn scale_frame_shift(frame: u32, volume: i32) -> u32 {
    let (l, r) = unpack(frame);
    pack(((l as i32 * volume) >> 7) as i16, ((r as i32 * volume) >> 7) as i16)
}

/// Output device fed by the consumer, one packed chunk at a time.
pub trait AudioSink {
    type Error;

    fn sample_rate(&self) -> u32;

    fn write(&mut self, frames: &[u32]) -> Result<(), Self::Error>;
}

/// Discards everything.
pub struct NullSink {
    pub sample_rate: u32,
}

impl AudioSink for NullSink {
    type Error = Infallible;

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, _frames: &[u32]) -> Result<(), Infallible> {
        Ok(())
    }
}
