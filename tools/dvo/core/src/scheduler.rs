//! Fixed-cadence frame pacing for the emulation core.
//!
//! Each [`FrameScheduler::tick`] runs exactly one emulated frame and publishes
//! exactly one audio chunk. Video is the only thing that gives: when the loop
//! falls behind its deadline the frame is emulated without rendering, up to a
//! bounded number of frames in a row. Audio is never skipped.

use alloc::vec;
use alloc::vec::Vec;

use bit_field::BitField;
use dvo_audio::{AudioProducer, Limiter, Publish};
use log::{debug, info, trace, warn};

use crate::emulator::{EmulationCore, FrameTarget};
use crate::error::ConfigError;
use crate::framebuffer::PixelBuffers;
use crate::palette::Palette;

/// Monotonic microsecond clock. There is no sleep: waiting spins.
pub trait TimeDaemon {
    fn now_us(&self) -> u64;

    fn busy_wait_us(&self, us: u64) {
        let until = self.now_us().saturating_add(us);
        while self.now_us() < until {
            core::hint::spin_loop();
        }
    }
}

impl<T: TimeDaemon + ?Sized> TimeDaemon for &T {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn busy_wait_us(&self, us: u64) {
        (**self).busy_wait_us(us)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub period_us: u32,
    /// lateness beyond which a render may be skipped
    pub skip_threshold_us: u32,
    /// consecutive skips allowed while less than one period late
    pub max_skip_normal: u32,
    /// absolute consecutive-skip bound, whatever the policy
    pub max_skip_extended: u32,
    /// overshoot treated as on time
    pub late_tolerance_us: u32,
    /// lateness at which the deadline is moved to now
    pub resync_us: u32,
    /// when set, more than one period of lateness halves the video rate for
    /// this long
    pub cap30_hold_us: Option<u32>,
    pub stats_window_us: u32,
}

impl SchedulerConfig {
    pub const fn for_rate(frames_per_second: u32) -> Self {
        let period_us = 1_000_000 / frames_per_second;
        Self {
            period_us,
            skip_threshold_us: 4_000,
            max_skip_normal: 1,
            max_skip_extended: 4,
            late_tolerance_us: 1_000,
            resync_us: period_us * 4,
            cap30_hold_us: None,
            stats_window_us: 1_000_000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_us: 16_667,
            resync_us: 16_667 * 4,
            ..Self::for_rate(60)
        }
    }
}

/// What a policy sees before a frame runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameContext {
    /// frames since start, rendered or not
    pub frame: u64,
    pub now_us: u64,
    /// after resync and jitter clamping
    pub late_us: i64,
    pub consecutive_skips: u32,
    /// audio chunks waiting for the output core
    pub queue_fill: usize,
}

pub trait SkipPolicy {
    fn name(&self) -> &'static str;

    /// Whether this frame should be emulated without rendering.
    fn should_skip(&mut self, ctx: &FrameContext, config: &SchedulerConfig) -> bool;

    /// Consecutive skips this policy allows right now. The scheduler caps it
    /// at `max_skip_extended`.
    fn skip_budget(&self, _ctx: &FrameContext, config: &SchedulerConfig) -> u32 {
        config.max_skip_extended
    }

    /// Called once the frame, its audio and the buffer swap are done.
    fn frame_finished(&mut self, _now_us: u64, _config: &SchedulerConfig) {}
}

/// Skip when meaningfully late; allow longer runs of skips once more than a
/// whole period behind.
#[derive(Debug, Default)]
pub struct AdaptiveSkip {
    cap_until_us: u64,
    capped: bool,
}

impl AdaptiveSkip {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the 30 fps overload cap holds.
    pub fn capped(&self) -> bool {
        self.capped
    }
}

impl SkipPolicy for AdaptiveSkip {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn should_skip(&mut self, ctx: &FrameContext, config: &SchedulerConfig) -> bool {
        if let Some(hold) = config.cap30_hold_us {
            if ctx.late_us > config.period_us as i64 {
                if !self.capped {
                    debug!("overloaded, capping video at half rate for {}ms", hold / 1000);
                }
                self.cap_until_us = ctx.now_us + hold as u64;
            }
            self.capped = ctx.now_us < self.cap_until_us;
        }

        let late = ctx.late_us > config.skip_threshold_us as i64;
        late || (self.capped && ctx.frame & 1 == 1)
    }

    fn skip_budget(&self, ctx: &FrameContext, config: &SchedulerConfig) -> u32 {
        if ctx.late_us > config.period_us as i64 {
            config.max_skip_extended
        } else {
            config.max_skip_normal
        }
    }
}

/// Deterministic render/skip cycle. Bit `i` set renders frame `i` of the
/// cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FixedPattern {
    pattern: u32,
    cycle: u8,
}

impl FixedPattern {
    pub const MAX_CYCLE: u8 = 32;

    /// Render `rendered` of every `cycle` frames, spread as evenly as the
    /// cycle allows.
    pub fn render_of(rendered: u8, cycle: u8) -> Result<Self, ConfigError> {
        if cycle == 0 || cycle > Self::MAX_CYCLE || rendered == 0 || rendered > cycle {
            return Err(ConfigError::SkipPattern { rendered, cycle });
        }

        let mut pattern = 0u32;
        for i in 0..rendered as usize {
            pattern.set_bit(i * cycle as usize / rendered as usize, true);
        }
        Ok(Self { pattern, cycle })
    }

    pub fn from_bits(pattern: u32, cycle: u8) -> Result<Self, ConfigError> {
        let valid = (1..=Self::MAX_CYCLE).contains(&cycle) && pattern.get_bits(0..cycle as usize) != 0;
        if !valid {
            return Err(ConfigError::SkipPattern {
                rendered: pattern.get_bits(0..cycle.clamp(1, Self::MAX_CYCLE) as usize).count_ones() as u8,
                cycle,
            });
        }
        Ok(Self { pattern, cycle })
    }

    pub fn renders(&self, frame: u64) -> bool {
        self.pattern.get_bit((frame % self.cycle as u64) as usize)
    }

    pub fn cycle(&self) -> u8 {
        self.cycle
    }
}

impl SkipPolicy for FixedPattern {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn should_skip(&mut self, ctx: &FrameContext, _config: &SchedulerConfig) -> bool {
        !self.renders(ctx.frame)
    }
}

/// Debt accounting: every frame adds its overrun to a balance, and once the
/// balance exceeds a whole period the next render is dropped.
#[derive(Debug, Default)]
pub struct BalanceSkip {
    balance_us: i64,
    last_us: Option<u64>,
    skip_next: bool,
}

impl BalanceSkip {
    /// Debt under this is measurement noise.
    pub const FORGIVE_US: i64 = 550;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_us(&self) -> i64 {
        self.balance_us
    }
}

impl SkipPolicy for BalanceSkip {
    fn name(&self) -> &'static str {
        "balance"
    }

    fn should_skip(&mut self, _ctx: &FrameContext, _config: &SchedulerConfig) -> bool {
        self.skip_next
    }

    fn frame_finished(&mut self, now_us: u64, config: &SchedulerConfig) {
        let period = config.period_us as i64;
        if let Some(last) = self.last_us {
            self.balance_us += now_us.saturating_sub(last) as i64 - period;
            if self.balance_us < Self::FORGIVE_US {
                self.balance_us = 0;
            }
        }
        self.last_us = Some(now_us);
        self.skip_next = self.balance_us > period;
    }
}

/// Boxed policies, for picking one at run time.
impl SkipPolicy for alloc::boxed::Box<dyn SkipPolicy + Send> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn should_skip(&mut self, ctx: &FrameContext, config: &SchedulerConfig) -> bool {
        (**self).should_skip(ctx, config)
    }

    fn skip_budget(&self, ctx: &FrameContext, config: &SchedulerConfig) -> u32 {
        (**self).skip_budget(ctx, config)
    }

    fn frame_finished(&mut self, now_us: u64, config: &SchedulerConfig) {
        (**self).frame_finished(now_us, config)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    pub late_us: i64,
    pub rendered: bool,
    pub resynced: bool,
    pub consecutive_skips: u32,
    pub queue_fill: usize,
    pub limiter: Limiter,
    pub audio: Publish,
    pub emulation_us: u64,
    pub mix_us: u64,
    pub pack_us: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameSummary {
    pub window_us: u64,
    pub frames: u32,
    pub rendered: u32,
    pub skipped: u32,
    pub resyncs: u32,
    pub dropped_chunks: u32,
    pub emul_render_avg_us: u64,
    pub emul_render_max_us: u64,
    pub emul_skip_avg_us: u64,
    pub emul_skip_max_us: u64,
    pub mix_avg_us: u64,
    pub mix_max_us: u64,
    pub pack_avg_us: u64,
    pub pack_max_us: u64,
    pub max_late_us: i64,
    pub min_fill: usize,
    pub max_fill: usize,
}

/// One accumulator window of [`FrameReport`]s.
#[derive(Debug)]
pub struct FrameStats {
    window_us: u64,
    start_us: u64,
    current: FrameSummary,
    render_total: u64,
    skip_total: u64,
    mix_total: u64,
    pack_total: u64,
}

fn avg(total: u64, count: u32) -> u64 {
    if count == 0 {
        0
    } else {
        total / count as u64
    }
}

impl FrameStats {
    pub fn new(window_us: u64, now_us: u64) -> Self {
        let mut stats = Self {
            window_us,
            start_us: now_us,
            current: FrameSummary::default(),
            render_total: 0,
            skip_total: 0,
            mix_total: 0,
            pack_total: 0,
        };
        stats.reset(now_us);
        stats
    }

    fn reset(&mut self, now_us: u64) {
        self.start_us = now_us;
        self.current = FrameSummary {
            min_fill: usize::MAX,
            ..FrameSummary::default()
        };
        self.render_total = 0;
        self.skip_total = 0;
        self.mix_total = 0;
        self.pack_total = 0;
    }

    /// Fold in one frame; returns the closed window once it spans
    /// `window_us`.
    pub fn record(&mut self, report: &FrameReport, now_us: u64) -> Option<FrameSummary> {
        let s = &mut self.current;
        s.frames += 1;
        if report.rendered {
            s.rendered += 1;
            self.render_total += report.emulation_us;
            s.emul_render_max_us = s.emul_render_max_us.max(report.emulation_us);
        } else {
            s.skipped += 1;
            self.skip_total += report.emulation_us;
            s.emul_skip_max_us = s.emul_skip_max_us.max(report.emulation_us);
        }
        s.resyncs += report.resynced as u32;
        s.dropped_chunks += (report.audio == Publish::Dropped) as u32;
        self.mix_total += report.mix_us;
        s.mix_max_us = s.mix_max_us.max(report.mix_us);
        self.pack_total += report.pack_us;
        s.pack_max_us = s.pack_max_us.max(report.pack_us);
        s.max_late_us = s.max_late_us.max(report.late_us);
        s.min_fill = s.min_fill.min(report.queue_fill);
        s.max_fill = s.max_fill.max(report.queue_fill);

        let elapsed = now_us.saturating_sub(self.start_us);
        if elapsed < self.window_us {
            return None;
        }

        let mut summary = self.current;
        summary.window_us = elapsed;
        summary.emul_render_avg_us = avg(self.render_total, summary.rendered);
        summary.emul_skip_avg_us = avg(self.skip_total, summary.skipped);
        summary.mix_avg_us = avg(self.mix_total, summary.frames);
        summary.pack_avg_us = avg(self.pack_total, summary.frames);
        self.reset(now_us);
        Some(summary)
    }
}

impl FrameSummary {
    pub fn log(&self) {
        let fps_x10 = self.frames as u64 * 10_000_000 / self.window_us.max(1);
        info!(
            "{}.{} fps ({} rendered, {} skipped, {} resync) emu r {}/{}us s {}/{}us mix {}/{}us pack {}/{}us late<={}us q {}..{} drop {}",
            fps_x10 / 10,
            fps_x10 % 10,
            self.rendered,
            self.skipped,
            self.resyncs,
            self.emul_render_avg_us,
            self.emul_render_max_us,
            self.emul_skip_avg_us,
            self.emul_skip_max_us,
            self.mix_avg_us,
            self.mix_max_us,
            self.pack_avg_us,
            self.pack_max_us,
            self.max_late_us,
            self.min_fill,
            self.max_fill,
            self.dropped_chunks,
        );
    }
}

pub struct FrameScheduler<'a, Clock: TimeDaemon, Core: EmulationCore, Policy: SkipPolicy> {
    clock: Clock,
    core: Core,
    policy: Policy,
    config: SchedulerConfig,
    pixels: &'a PixelBuffers,
    palette: &'a Palette,
    audio: AudioProducer,
    mix: Vec<i16>,
    deadline_us: u64,
    skipped: u32,
    frame: u64,
    stats: FrameStats,
    last_summary: Option<FrameSummary>,
}

impl<'a, Clock: TimeDaemon, Core: EmulationCore, Policy: SkipPolicy> FrameScheduler<'a, Clock, Core, Policy> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Clock,
        core: Core,
        policy: Policy,
        config: SchedulerConfig,
        pixels: &'a PixelBuffers,
        palette: &'a Palette,
        audio: AudioProducer,
    ) -> Self {
        let now = clock.now_us();
        let frames = audio.config().frames_per_chunk;
        info!(
            "frame scheduler: {} policy, period {}us, skip after {}us, max skip {}/{}, resync at {}us",
            policy.name(),
            config.period_us,
            config.skip_threshold_us,
            config.max_skip_normal,
            config.max_skip_extended,
            config.resync_us
        );

        Self {
            clock,
            core,
            policy,
            config,
            pixels,
            palette,
            audio,
            mix: vec![0; frames * 2],
            deadline_us: now + config.period_us as u64,
            skipped: 0,
            frame: 0,
            stats: FrameStats::new(config.stats_window_us as u64, now),
            last_summary: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn core(&mut self) -> &mut Core {
        &mut self.core
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn audio(&self) -> &AudioProducer {
        &self.audio
    }

    pub fn deadline_us(&self) -> u64 {
        self.deadline_us
    }

    /// Most recent closed statistics window.
    pub fn last_summary(&self) -> Option<FrameSummary> {
        self.last_summary
    }

    /// Wait for the deadline, then emulate, mix and publish one frame.
    pub fn tick(&mut self) -> FrameReport {
        let config = self.config;
        let mut now = self.clock.now_us();
        let mut late = now as i64 - self.deadline_us as i64;

        let mut resynced = false;
        if late > config.resync_us as i64 {
            warn!("{}us behind schedule, resynchronising", late);
            // the skip run carries over so the bound holds across a resync
            self.deadline_us = now;
            late = 0;
            resynced = true;
        }

        if late < 0 {
            self.clock.busy_wait_us(late.unsigned_abs());
            now = self.clock.now_us();
            late = now as i64 - self.deadline_us as i64;
        }
        if late > 0 && late <= config.late_tolerance_us as i64 {
            late = 0;
        }

        let queue_fill = self.audio.fill();
        let ctx = FrameContext {
            frame: self.frame,
            now_us: now,
            late_us: late,
            consecutive_skips: self.skipped,
            queue_fill,
        };
        let budget = self.policy.skip_budget(&ctx, &config).min(config.max_skip_extended);
        let skip = self.policy.should_skip(&ctx, &config) && self.skipped < budget;
        let render = !skip;

        let t0 = self.clock.now_us();
        let mut target = FrameTarget::new(render, self.pixels, self.palette);
        self.core.run_one_frame(&mut target);
        let t1 = self.clock.now_us();

        let frames = self.audio.config().frames_per_chunk;
        self.core.mix_audio(&mut self.mix, frames);
        let t2 = self.clock.now_us();

        let limiter = if late <= config.late_tolerance_us as i64 && queue_fill >= self.audio.config().low_watermark {
            Limiter::Soft
        } else {
            Limiter::Hard
        };
        let audio = self.audio.publish(&self.mix, limiter);
        let t3 = self.clock.now_us();

        if render {
            self.skipped = 0;
            self.pixels.swap();
        } else {
            self.skipped += 1;
            trace!("frame {} skipped ({}us late, {} in a row)", self.frame, late, self.skipped);
        }

        self.core.end_of_frame(&mut target);
        self.policy.frame_finished(self.clock.now_us(), &config);

        let report = FrameReport {
            frame: self.frame,
            late_us: late,
            rendered: render,
            resynced,
            consecutive_skips: self.skipped,
            queue_fill,
            limiter,
            audio,
            emulation_us: t1 - t0,
            mix_us: t2 - t1,
            pack_us: t3 - t2,
        };

        self.deadline_us += config.period_us as u64;
        self.frame += 1;

        if let Some(summary) = self.stats.record(&report, self.clock.now_us()) {
            summary.log();
            self.last_summary = Some(summary);
        }
        report
    }

    /// Tick `frames` times.
    pub fn run(&mut self, frames: u64) {
        for _ in 0..frames {
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use core::cell::Cell;
    use dvo_audio::{audio_channel, AudioConfig, Gain};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::rc::Rc;

    use crate::config::{Pinout, Resolution};

    /// Only moves when something spends time on it.
    #[derive(Clone, Default)]
    struct ManualClock(Rc<Cell<u64>>);

    impl ManualClock {
        fn advance(&self, us: u64) {
            self.0.set(self.0.get() + us);
        }
    }

    impl TimeDaemon for ManualClock {
        fn now_us(&self) -> u64 {
            self.0.get()
        }

        fn busy_wait_us(&self, us: u64) {
            self.advance(us);
        }
    }

    /// Spends the next scripted cost on every frame.
    struct ScriptedCore {
        clock: ManualClock,
        costs: Vec<u64>,
        next: usize,
        renders: Vec<bool>,
    }

    impl ScriptedCore {
        fn new(clock: &ManualClock, costs: Vec<u64>) -> Self {
            Self {
                clock: clock.clone(),
                costs,
                next: 0,
                renders: Vec::new(),
            }
        }
    }

    impl EmulationCore for ScriptedCore {
        fn run_one_frame(&mut self, target: &mut FrameTarget) {
            let cost = self.costs.get(self.next).copied().unwrap_or(0);
            self.next += 1;
            self.clock.advance(cost);
            self.renders.push(target.render());
            if target.render() {
                target.pixels().fill(self.next as u8 % 200);
            }
        }

        fn mix_audio(&mut self, dst: &mut [i16], frames: usize) {
            dst[..frames * 2].fill(100);
        }
    }

    fn quiet_audio() -> AudioConfig {
        AudioConfig {
            sample_rate: 4_800,
            frame_rate: 60,
            frames_per_chunk: 80,
            depth: 4,
            gain: Gain::UNITY,
            low_watermark: 0,
            fade_frames: 16,
        }
    }

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    fn video() -> (&'static PixelBuffers, &'static Palette) {
        (
            leak(PixelBuffers::new(Resolution { width: 8, height: 2 })),
            leak(Palette::new(Pinout::default())),
        )
    }

    fn scheduler<P: SkipPolicy>(
        policy: P,
        costs: Vec<u64>,
    ) -> (FrameScheduler<'static, ManualClock, ScriptedCore, P>, ManualClock, dvo_audio::AudioConsumer) {
        let clock = ManualClock::default();
        let (pixels, palette) = video();
        let (tx, rx) = audio_channel(quiet_audio());
        let core = ScriptedCore::new(&clock, costs);
        let sched = FrameScheduler::new(clock.clone(), core, policy, SchedulerConfig::default(), pixels, palette, tx);
        (sched, clock, rx)
    }

    #[test]
    fn on_time_frames_wait_for_the_deadline() {
        let (mut sched, clock, _rx) = scheduler(AdaptiveSkip::new(), vec![5_000; 3]);
        let first = sched.tick();
        assert_eq!(clock.now_us(), 16_667 + 5_000);
        assert!(first.rendered);
        assert_eq!(first.late_us, 0);
        assert_eq!(first.limiter, Limiter::Soft);
        assert_eq!(first.audio, Publish::Published);

        sched.tick();
        assert_eq!(clock.now_us(), 2 * 16_667 + 5_000);
    }

    #[test]
    fn jitter_under_tolerance_counts_as_on_time() {
        let (mut sched, clock, _rx) = scheduler(AdaptiveSkip::new(), vec![]);
        clock.advance(16_667 + 900);
        let report = sched.tick();
        assert_eq!(report.late_us, 0);
        assert_eq!(report.limiter, Limiter::Soft);
    }

    #[test]
    fn late_frames_skip_within_budget() {
        // every frame costs 22ms against a 16.7ms period
        let (mut sched, _clock, _rx) = scheduler(AdaptiveSkip::new(), vec![22_000; 8]);
        let reports: Vec<FrameReport> = (0..8).map(|_| sched.tick()).collect();
        let renders: Vec<bool> = reports.iter().map(|r| r.rendered).collect();
        // one skip while under a period late, then up to four once past it
        assert_eq!(renders, [true, false, true, false, false, false, false, true]);
        assert!(reports[4].late_us > 16_667);
    }

    #[test]
    fn late_frames_use_the_hard_clamp() {
        let (mut sched, clock, _rx) = scheduler(AdaptiveSkip::new(), vec![]);
        clock.advance(16_667 + 5_000);
        let report = sched.tick();
        assert_eq!(report.late_us, 5_000);
        assert_eq!(report.limiter, Limiter::Hard);
        assert!(!report.rendered);
    }

    #[test]
    fn far_behind_resynchronises() {
        let (mut sched, clock, _rx) = scheduler(AdaptiveSkip::new(), vec![]);
        clock.advance(16_667 * 10);
        let report = sched.tick();
        assert!(report.resynced);
        assert!(report.rendered);
        assert_eq!(report.late_us, 0);
        assert_eq!(sched.deadline_us(), clock.now_us() + 16_667);
    }

    #[test]
    fn swap_happens_only_on_rendered_frames() {
        let (mut sched, clock, _rx) = scheduler(AdaptiveSkip::new(), vec![]);
        let pixels = sched.pixels;
        let before = pixels.draw_index();
        sched.tick();
        assert_eq!(pixels.draw_index(), before ^ 1);

        clock.advance(16_667 + 8_000);
        assert!(!sched.tick().rendered);
        assert_eq!(pixels.draw_index(), before ^ 1);
    }

    #[test]
    fn audio_is_published_on_skipped_frames_too() {
        let (mut sched, _clock, mut rx) = scheduler(AdaptiveSkip::new(), vec![30_000; 3]);
        let reports: Vec<FrameReport> = (0..3).map(|_| sched.tick()).collect();
        assert!(reports.iter().any(|r| !r.rendered));
        assert_eq!(sched.audio().published(), 3);

        let mut out = [0u32; 80];
        rx.next_chunk(&mut out);
        assert_eq!(out[79], dvo_audio::mixing::pack(100, 100));
    }

    #[test]
    fn full_ring_drops_chunk_without_stalling() {
        let (mut sched, _clock, _rx) = scheduler(AdaptiveSkip::new(), vec![]);
        let reports: Vec<Publish> = (0..5).map(|_| sched.tick().audio).collect();
        assert_eq!(reports[..4], [Publish::Published; 4]);
        assert_eq!(reports[4], Publish::Dropped);
    }

    #[test]
    fn cap30_halves_the_video_rate() {
        let clock = ManualClock::default();
        let (pixels, palette) = video();
        let (tx, _rx) = audio_channel(quiet_audio());
        let config = SchedulerConfig {
            cap30_hold_us: Some(500_000),
            ..SchedulerConfig::default()
        };
        let core = ScriptedCore::new(&clock, vec![]);
        let mut sched = FrameScheduler::new(clock.clone(), core, AdaptiveSkip::new(), config, pixels, palette, tx);

        clock.advance(16_667 + 20_000);
        assert!(!sched.tick().rendered);
        assert!(sched.policy().capped());
        // the overloaded frame itself was skipped, so frame 1 must render
        let renders: Vec<bool> = (0..6).map(|_| sched.tick().rendered).collect();
        assert_eq!(renders, [true, true, false, true, false, true]);
    }

    #[test]
    fn pattern_renders_two_of_six() {
        let pattern = FixedPattern::render_of(2, 6).unwrap();
        let (mut sched, _clock, _rx) = scheduler(pattern, vec![]);
        let renders: Vec<bool> = (0..12).map(|_| sched.tick().rendered).collect();
        assert_eq!(
            renders,
            [true, false, false, true, false, false, true, false, false, true, false, false]
        );
    }

    #[test]
    fn pattern_rejects_impossible_cycles() {
        assert_eq!(
            FixedPattern::render_of(0, 6),
            Err(ConfigError::SkipPattern { rendered: 0, cycle: 6 })
        );
        assert!(FixedPattern::render_of(3, 33).is_err());
        assert!(FixedPattern::from_bits(0b1000, 3).is_err());
        assert!(FixedPattern::from_bits(0b100, 3).is_ok());
    }

    #[test]
    fn balance_skips_after_a_period_of_debt() {
        let config = SchedulerConfig::default();
        let mut policy = BalanceSkip::new();
        let ctx = FrameContext {
            frame: 0,
            now_us: 0,
            late_us: 0,
            consecutive_skips: 0,
            queue_fill: 0,
        };

        policy.frame_finished(0, &config);
        policy.frame_finished(16_667 + 500, &config);
        assert_eq!(policy.balance_us(), 0);

        let mut now = 16_667 + 500;
        for _ in 0..2 {
            now += 16_667 + 9_000;
            policy.frame_finished(now, &config);
        }
        assert_eq!(policy.balance_us(), 18_000);
        assert!(policy.should_skip(&ctx, &config));

        now += 1_000;
        policy.frame_finished(now, &config);
        assert!(!policy.should_skip(&ctx, &config));
    }

    #[test]
    fn stats_close_a_window_per_second() {
        let (mut sched, _clock, _rx) = scheduler(AdaptiveSkip::new(), vec![1_000; 70]);
        let mut closed = 0;
        for _ in 0..70 {
            sched.tick();
            if sched.last_summary().is_some() && closed == 0 {
                closed = 1;
                let summary = sched.last_summary().unwrap();
                assert_eq!(summary.frames, 60);
                assert_eq!(summary.skipped, 0);
                assert_eq!(summary.emul_render_max_us, 1_000);
            }
        }
        assert_eq!(closed, 1);
    }

    proptest! {
        #[test]
        fn prop_consecutive_skips_are_bounded(
            costs in proptest::collection::vec(0u64..120_000, 1..300),
            dynamic in any::<bool>(),
        ) {
            let frames = costs.len();
            let policy: Box<dyn SkipPolicy + Send> = if dynamic {
                Box::new(AdaptiveSkip::new())
            } else {
                Box::new(FixedPattern::render_of(1, 8).unwrap())
            };
            let (mut sched, _clock, _rx) = scheduler(policy, costs);
            let bound = sched.config().max_skip_extended;

            let mut run = 0;
            for _ in 0..frames {
                let report = sched.tick();
                run = if report.rendered { 0 } else { run + 1 };
                prop_assert!(run <= bound);
                prop_assert_eq!(run, report.consecutive_skips);
            }
        }

        #[test]
        fn prop_adaptive_respects_its_budget(costs in proptest::collection::vec(0u64..40_000, 1..300)) {
            let frames = costs.len();
            let (mut sched, _clock, _rx) = scheduler(AdaptiveSkip::new(), costs);
            let config = *sched.config();
            for _ in 0..frames {
                let report = sched.tick();
                if report.late_us <= config.period_us as i64 && !report.rendered {
                    prop_assert!(report.consecutive_skips <= config.max_skip_normal);
                }
            }
        }
    }
}
