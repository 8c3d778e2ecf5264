mod demo;
mod output;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use dvo_audio::{audio_channel, AudioConfig, NullSink};
use dvo_core::arena::{ArenaLayout, ExternalHeap, KIB};
use dvo_core::config::{Resolution, Shift, VideoConfig};
use dvo_core::framebuffer::PixelBuffers;
use dvo_core::hw::sim::SimVideo;
use dvo_core::hw::VideoPeripherals;
use dvo_core::palette::Palette;
use dvo_core::scanline::LineBuffers;
use dvo_core::scheduler::{AdaptiveSkip, BalanceSkip, FixedPattern, FrameScheduler, SchedulerConfig, SkipPolicy, TimeDaemon};
use tracing::{info, Level};
use tracing_subscriber::util::SubscriberInitExt;

use crate::demo::ColourBars;
use crate::output::{OutputCore, WavSink};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Policy {
    /// skip renders when late
    Adaptive,
    /// fixed render/skip cycle, see --pattern
    Pattern,
    /// skip after a whole period of accumulated debt
    Balance,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum AudioPreset {
    I2s24k,
    Pool22k,
    Framedrop32k,
}

impl AudioPreset {
    fn config(self) -> AudioConfig {
        match self {
            AudioPreset::I2s24k => AudioConfig::I2S_24K,
            AudioPreset::Pool22k => AudioConfig::POOL_22K,
            AudioPreset::Framedrop32k => AudioConfig::FRAMEDROP_32K,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "dvo")]
#[command(version, about = "Run the scanout, frame scheduler and audio handoff against simulated hardware", long_about = None)]
struct Cli {
    /// Emulated frames to run
    #[arg(short, long, default_value_t = 300)]
    frames: u64,

    #[arg(long, value_enum, default_value_t = Policy::Adaptive)]
    policy: Policy,

    /// Rendered/cycle for the pattern policy, e.g. 2/6
    #[arg(long, default_value = "2/6", value_parser = parse_pattern)]
    pattern: FixedPattern,

    /// Halve the video rate for 500ms after a frame more than a period late
    #[arg(long)]
    cap30: bool,

    #[arg(long, value_enum, default_value_t = AudioPreset::I2s24k)]
    audio: AudioPreset,

    #[arg(long, default_value_t = 256)]
    width: u16,

    #[arg(long, default_value_t = 239)]
    height: u16,

    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    shift_x: i16,

    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    shift_y: i16,

    /// Extra emulation time per frame, in microseconds
    #[arg(long, default_value_t = 0)]
    load_us: u64,

    /// Random extra time per frame, up to this many microseconds
    #[arg(long, default_value_t = 0)]
    jitter_us: u64,

    /// Size of the simulated PSRAM, in MiB
    #[arg(long, default_value_t = 8)]
    psram_mib: usize,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Write the decoded last frame as a PNG
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Capture the audio output as a WAV
    #[arg(long)]
    wav: Option<PathBuf>,
}

fn parse_pattern(s: &str) -> Result<FixedPattern, String> {
    let (rendered, cycle) = s.split_once('/').ok_or_else(|| format!("expected RENDERED/CYCLE, got {s}"))?;
    let rendered: u8 = rendered.trim().parse().map_err(|e| format!("{e}"))?;
    let cycle: u8 = cycle.trim().parse().map_err(|e| format!("{e}"))?;
    FixedPattern::render_of(rendered, cycle).map_err(|e| e.to_string())
}

fn setup_logging(level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .compact()
        .finish()
        .init();
}

pub struct InstantClock {
    pub instant: Instant,
}

impl TimeDaemon for InstantClock {
    fn now_us(&self) -> u64 {
        self.instant.elapsed().as_micros() as u64
    }

    fn busy_wait_us(&self, us: u64) {
        let until = self.now_us() + us;
        // sleep through most of it, spin the rest
        if us > 2_000 {
            thread::sleep(Duration::from_micros(us - 1_000));
        }
        while self.now_us() < until {
            std::hint::spin_loop();
        }
    }
}

/// Host memory standing in for PSRAM.
fn host_psram(mib: usize) -> &'static mut [u8] {
    let words: &'static mut [u32] = Box::leak(vec![0u32; mib * 1024 * KIB / 4].into_boxed_slice());
    bytemuck::cast_slice_mut(words)
}

pub fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level);
    info!("stdout logger started");

    let video = VideoConfig {
        resolution: Resolution {
            width: cli.width,
            height: cli.height,
        },
        shift: Shift {
            x: cli.shift_x,
            y: cli.shift_y,
        },
        ..VideoConfig::default()
    };
    video.validate().context("invalid video configuration")?;
    let audio = cli.audio.config();

    let mut heap = ExternalHeap::new(host_psram(cli.psram_mib), ArenaLayout::standard())?;
    // SAFETY: the pixel store lives for the whole run; the heap is never rolled back below it
    let storage: &'static mut [AtomicU32] = unsafe { heap.alloc_zeroed_slice(PixelBuffers::storage_words(video.resolution)) }?;
    let pixels: &'static PixelBuffers = Box::leak(Box::new(PixelBuffers::from_storage(video.resolution, storage)?));
    heap.mark_session();

    let palette: &'static Palette = Box::leak(Box::new(Palette::new(video.pinout)));
    let lines: &'static LineBuffers = Box::leak(Box::new(LineBuffers::new()));
    let hw = SimVideo::new(VideoPeripherals::claim()?);

    let (tx, rx) = audio_channel(audio);
    let done = Arc::new(AtomicBool::new(false));
    let period = Duration::from_micros(1_000_000 / audio.frame_rate as u64);

    let output = {
        let done = done.clone();
        let snapshot = cli.snapshot.clone();
        let wav = cli.wav.clone();
        thread::Builder::new().name("output".into()).spawn(move || -> anyhow::Result<()> {
            match wav {
                Some(path) => {
                    let sink = WavSink::create(&path, audio.sample_rate)?;
                    let core = OutputCore { video, hw, palette, pixels, lines, audio: rx, sink, period };
                    let (summary, sink) = core.run(&done, snapshot.as_deref())?;
                    sink.finalize()?;
                    info!("output: {:?}, audio written to {}", summary, path.display());
                }
                None => {
                    let sink = NullSink { sample_rate: audio.sample_rate };
                    let core = OutputCore { video, hw, palette, pixels, lines, audio: rx, sink, period };
                    let (summary, _) = core.run(&done, snapshot.as_deref())?;
                    info!("output: {:?}", summary);
                }
            }
            Ok(())
        })?
    };

    let policy: Box<dyn SkipPolicy + Send> = match cli.policy {
        Policy::Adaptive => Box::new(AdaptiveSkip::new()),
        Policy::Pattern => Box::new(cli.pattern),
        Policy::Balance => Box::new(BalanceSkip::new()),
    };
    let mut config = if audio.frame_rate == 60 {
        SchedulerConfig::default()
    } else {
        SchedulerConfig::for_rate(audio.frame_rate)
    };
    config.cap30_hold_us = cli.cap30.then_some(500_000);

    let frames = cli.frames;
    let (load, jitter) = (Duration::from_micros(cli.load_us), cli.jitter_us);
    let emulation = thread::Builder::new().name("emulation".into()).spawn(move || {
        let core = ColourBars::new(video.resolution.width, audio.sample_rate, load, jitter);
        let clock = InstantClock { instant: Instant::now() };
        let mut scheduler = FrameScheduler::new(clock, core, policy, config, pixels, palette, tx);

        let (mut rendered, mut dropped) = (0u64, 0u64);
        for _ in 0..frames {
            let report = scheduler.tick();
            rendered += report.rendered as u64;
            dropped += (report.audio == dvo_audio::Publish::Dropped) as u64;
        }
        info!("emulation: {} frames, {} rendered, {} audio chunks dropped", frames, rendered, dropped);
    })?;

    emulation.join().map_err(|_| anyhow::anyhow!("emulation thread panicked"))?;
    // let the output core drain what is queued
    thread::sleep(period * audio.depth as u32);
    done.store(true, Ordering::Release);
    output.join().map_err(|_| anyhow::anyhow!("output thread panicked"))??;

    info!("psram: {} KiB used, {} KiB free", heap.used() / KIB, heap.remaining() / KIB);
    Ok(())
}
