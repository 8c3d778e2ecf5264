use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use dvo_audio::mixing::unpack;
use dvo_audio::{AudioConsumer, AudioSink, Playback};
use dvo_core::config::VideoConfig;
use dvo_core::framebuffer::PixelBuffers;
use dvo_core::hw::sim::SimVideo;
use dvo_core::palette::Palette;
use dvo_core::scanline::{LineBuffers, ScanlineProducer, ACTIVE_START, LINES_PER_FRAME};
use image::{Rgb, RgbImage};
use tracing::{debug, info, warn};

/// 16-bit stereo WAV capture of the consumer output.
pub struct WavSink {
    writer: hound::WavWriter<BufWriter<File>>,
    sample_rate: u32,
}

impl WavSink {
    pub fn create(path: &Path, sample_rate: u32) -> anyhow::Result<Self> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec).with_context(|| format!("creating {}", path.display()))?;
        Ok(Self { writer, sample_rate })
    }

    pub fn finalize(self) -> anyhow::Result<()> {
        self.writer.finalize()?;
        Ok(())
    }
}

impl AudioSink for WavSink {
    type Error = hound::Error;

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, frames: &[u32]) -> Result<(), hound::Error> {
        for &frame in frames {
            let (l, r) = unpack(frame);
            self.writer.write_sample(l)?;
            self.writer.write_sample(r)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct OutputSummary {
    pub frames: u64,
    pub playing: u64,
    pub faded: u64,
    pub silent: u64,
    pub irqs_missed: u32,
}

pub struct OutputCore<S: AudioSink> {
    pub video: VideoConfig,
    pub hw: SimVideo,
    pub palette: &'static Palette,
    pub pixels: &'static PixelBuffers,
    pub lines: &'static LineBuffers,
    pub audio: AudioConsumer,
    pub sink: S,
    pub period: Duration,
}

impl<S> OutputCore<S>
where
    S: AudioSink,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    /// Scan a frame of lines and play a chunk per period until `done`, then
    /// scan one captured frame. Returns the sink for finalising.
    pub fn run(self, done: &AtomicBool, snapshot: Option<&Path>) -> anyhow::Result<(OutputSummary, S)> {
        let OutputCore {
            video,
            hw,
            palette,
            pixels,
            lines,
            mut audio,
            mut sink,
            period,
        } = self;

        #[cfg(not(target_arch = "wasm32"))]
        {
            use thread_priority::*;
            // if it didn't work, oh well
            let _ = set_current_thread_priority(ThreadPriority::Max);
        }

        let mut producer = ScanlineProducer::start(&video, hw, palette, pixels, lines)?;
        info!("scanout started at {}x{}", video.resolution.width, video.resolution.height);

        let mut summary = OutputSummary::default();
        let mut next = Instant::now();
        while !done.load(Ordering::Acquire) {
            producer.scan_frame();
            match audio.play_into(&mut sink)? {
                Playback::Playing => summary.playing += 1,
                Playback::FadingIn | Playback::FadingOut => summary.faded += 1,
                Playback::Silence => summary.silent += 1,
            }
            summary.frames += 1;

            next += period;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else if now - next > period * 4 {
                warn!("output core {}ms behind", (now - next).as_millis());
                next = now;
            }
        }

        if let Some(path) = snapshot {
            producer.hardware().capture_frames(true);
            producer.scan_frame();
            save_snapshot(producer.hardware(), &video, path)?;
            info!("snapshot written to {}", path.display());
        }

        summary.irqs_missed = producer.hardware().stats().irqs_missed;
        debug!("{} interrupts handled", producer.irq_count());
        Ok((summary, sink))
    }
}

/// Decode the captured frame back into the active window, one pixel per
/// line slot.
pub fn save_snapshot(hw: &SimVideo, video: &VideoConfig, path: &Path) -> anyhow::Result<()> {
    let height = video.resolution.height as u32;
    let width = dvo_core::config::MAX_WIDTH as u32;
    let mut img = RgbImage::new(width, height);

    for row in 0..height {
        // a row is filled on its second line and streamed on the next pair
        let line = ((2 * row + 3) % LINES_PER_FRAME as u32) as u16;
        let Some(decoded) = hw.decode_line(line, &video.pinout) else {
            continue;
        };
        for x in 0..width {
            let clock = 2 * (ACTIVE_START + x as usize);
            if let Some(Some(rgb)) = decoded.get(clock) {
                img.put_pixel(x, row, Rgb(*rgb));
            }
        }
    }

    img.save(path).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
