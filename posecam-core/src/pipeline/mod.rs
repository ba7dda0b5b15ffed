//! pipeline — the frame loop
//!
//! One logical thread of control: pull a frame, run the estimator to
//! completion, draw, hand the frame to the sink, then yield until the next
//! scheduling slot. Iterations never overlap; a slow estimator simply lowers
//! the effective frame rate. The loop stops only through the cancel flag,
//! the frame budget, or the source ending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::estimation::PoseEstimator;
use crate::overlay;
use crate::pose::Pose;
use crate::video::{FrameSource, RgbFrame};

/// How often (in frames) timing profiles are logged.
const PROFILE_EVERY: u64 = 300;
/// How often (in frames) loop throughput is logged.
const THROUGHPUT_EVERY: u64 = 120;

/// Stop flag shared with whoever controls the session; checked between
/// iterations, never mid-frame.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// When the next iteration may start. Injectable so tests can step the loop.
pub trait FrameScheduler {
    /// Block until the next slot. Must yield (sleep), never spin.
    fn wait_for_next(&mut self);
}

/// Fixed-cadence pacing: one iteration per display-refresh interval.
/// A late iteration is not "caught up" with a burst; the schedule is
/// re-anchored to now instead.
pub struct RefreshPaced {
    interval: Duration,
    next_deadline: Option<Instant>,
}

impl RefreshPaced {
    pub fn new(refresh_rate: f64) -> Self {
        let rate = refresh_rate.max(1.0);
        Self {
            interval: Duration::from_secs_f64(1.0 / rate),
            next_deadline: None,
        }
    }
}

impl FrameScheduler for RefreshPaced {
    fn wait_for_next(&mut self) {
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + self.interval);
    }
}

/// No pacing: the source itself governs the rate (a blocking camera read or
/// an offline file pass).
pub struct Immediate;

impl FrameScheduler for Immediate {
    fn wait_for_next(&mut self) {}
}

/// Wraps the estimator with the per-frame failure policy and a timing
/// profile.
///
/// A failed inference is logged and yields zero poses for that frame; the
/// session keeps running. No retries.
pub struct Analyzer<E> {
    estimator: E,
    prof_frames: u64,
    prof_estimate: Duration,
}

impl<E: PoseEstimator> Analyzer<E> {
    pub fn new(estimator: E) -> Self {
        Self {
            estimator,
            prof_frames: 0,
            prof_estimate: Duration::ZERO,
        }
    }

    pub fn analyze(&mut self, frame: &RgbFrame, config: &RunConfig) -> Vec<Pose> {
        let start = Instant::now();
        let poses = match self.estimator.estimate(frame, &config.detection) {
            Ok(poses) => poses,
            Err(e) => {
                warn!("pose estimation error: {e:#}");
                Vec::new()
            }
        };
        self.prof_estimate += start.elapsed();
        self.prof_frames += 1;

        if self.prof_frames % PROFILE_EVERY == 0 {
            info!(
                frames = self.prof_frames,
                estimate_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_estimate.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "analyzer timings"
            );
        }
        poses
    }
}

/// The render loop: estimate → mirror → draw, one frame at a time.
pub struct FrameLoop<E> {
    analyzer: Analyzer<E>,
    config: RunConfig,
    cancel: CancelFlag,
}

impl<E: PoseEstimator> FrameLoop<E> {
    pub fn new(estimator: E, config: RunConfig, cancel: CancelFlag) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            analyzer: Analyzer::new(estimator),
            config,
            cancel,
        })
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// One iteration. The estimator sees the raw frame; mirroring happens
    /// after, so flipped keypoint coordinates line up with the flipped image.
    pub fn step(&mut self, frame: &mut RgbFrame) {
        let poses = self.analyzer.analyze(frame, &self.config);

        if !self.config.output.show_video {
            overlay::clear(frame, [0, 0, 0]);
        } else if self.config.detection.flip_horizontal {
            overlay::mirror_inplace(frame);
        }
        overlay::render(frame, &poses, &self.config.detection, &self.config.output);
    }

    /// Drive the loop until the cancel flag is raised, `max_frames` is
    /// reached, or the source ends. Every annotated frame is handed to
    /// `sink`. Returns the number of frames processed.
    pub fn run<S, F>(
        &mut self,
        source: &mut S,
        scheduler: &mut dyn FrameScheduler,
        max_frames: Option<u64>,
        mut sink: F,
    ) -> Result<u64>
    where
        S: FrameSource,
        F: FnMut(&RgbFrame) -> Result<()>,
    {
        let started = Instant::now();
        let mut frames = 0u64;

        while !self.cancel.is_cancelled() {
            if max_frames.is_some_and(|max| frames >= max) {
                break;
            }
            let Some(mut frame) = source.next_frame()? else {
                break;
            };

            self.step(&mut frame);
            sink(&frame)?;
            frames += 1;

            if frames % THROUGHPUT_EVERY == 0 {
                info!(
                    fps = format!("{:.1}", frames as f64 / started.elapsed().as_secs_f64()),
                    "loop throughput"
                );
            }

            scheduler.wait_for_next();
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputConfig;
    use crate::pose::tests::{uniform_pose, with_position};
    use crate::pose::Part;
    use std::collections::VecDeque;

    struct FakeEstimator {
        responses: VecDeque<Result<Vec<Pose>>>,
        calls: u64,
    }

    impl FakeEstimator {
        fn new(responses: Vec<Result<Vec<Pose>>>) -> Self {
            Self {
                responses: responses.into(),
                calls: 0,
            }
        }
    }

    impl PoseEstimator for FakeEstimator {
        fn estimate(
            &mut self,
            _frame: &RgbFrame,
            _params: &crate::config::DetectionConfig,
        ) -> Result<Vec<Pose>> {
            self.calls += 1;
            self.responses
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct VecSource(VecDeque<RgbFrame>);

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
            Ok(self.0.pop_front())
        }
    }

    struct CountingScheduler {
        waits: u64,
    }

    impl FrameScheduler for CountingScheduler {
        fn wait_for_next(&mut self) {
            self.waits += 1;
        }
    }

    fn frame() -> RgbFrame {
        RgbFrame {
            data: vec![0u8; 64 * 64 * 3],
            width: 64,
            height: 64,
            pts: 0,
        }
    }

    fn frames(n: usize) -> VecSource {
        VecSource((0..n).map(|_| frame()).collect())
    }

    fn test_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.detection.flip_horizontal = false;
        config
    }

    #[test]
    fn processes_every_frame_and_yields_between_iterations() {
        let mut frame_loop =
            FrameLoop::new(FakeEstimator::new(vec![]), test_config(), CancelFlag::new()).unwrap();
        let mut scheduler = CountingScheduler { waits: 0 };
        let mut sunk = 0u64;

        let processed = frame_loop
            .run(&mut frames(3), &mut scheduler, None, |_| {
                sunk += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(processed, 3);
        assert_eq!(sunk, 3);
        assert_eq!(scheduler.waits, 3);
    }

    #[test]
    fn cancelled_loop_never_runs() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let estimator = FakeEstimator::new(vec![]);
        let mut frame_loop = FrameLoop::new(estimator, test_config(), cancel).unwrap();

        let processed = frame_loop
            .run(&mut frames(3), &mut Immediate, None, |_| Ok(()))
            .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(frame_loop.analyzer.estimator.calls, 0);
    }

    #[test]
    fn cancel_is_honored_between_iterations() {
        let cancel = CancelFlag::new();
        let mut frame_loop =
            FrameLoop::new(FakeEstimator::new(vec![]), test_config(), cancel.clone()).unwrap();

        let mut sunk = 0u64;
        let processed = frame_loop
            .run(&mut frames(10), &mut Immediate, None, |_| {
                sunk += 1;
                if sunk == 2 {
                    cancel.cancel();
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(processed, 2);
    }

    #[test]
    fn estimator_failure_skips_the_frame_and_continues() {
        let estimator = FakeEstimator::new(vec![
            Err(anyhow::anyhow!("inference exploded")),
            Ok(vec![uniform_pose(0.9, 0.9)]),
        ]);
        let mut frame_loop = FrameLoop::new(estimator, test_config(), CancelFlag::new()).unwrap();

        let mut sunk = 0u64;
        let processed = frame_loop
            .run(&mut frames(2), &mut Immediate, None, |_| {
                sunk += 1;
                Ok(())
            })
            .unwrap();

        // Both frames flow through; the failed one just carries no overlay.
        assert_eq!(processed, 2);
        assert_eq!(sunk, 2);
    }

    #[test]
    fn max_frames_bounds_the_session() {
        let mut frame_loop =
            FrameLoop::new(FakeEstimator::new(vec![]), test_config(), CancelFlag::new()).unwrap();
        let processed = frame_loop
            .run(&mut frames(10), &mut Immediate, Some(4), |_| Ok(()))
            .unwrap();
        assert_eq!(processed, 4);
    }

    #[test]
    fn step_draws_the_detected_pose() {
        let pose = with_position(uniform_pose(0.9, 0.9), Part::Nose, 32.0, 32.0);
        let estimator = FakeEstimator::new(vec![Ok(vec![pose])]);
        let mut config = test_config();
        config.output = OutputConfig {
            show_video: false,
            show_skeleton: false,
            show_points: true,
            show_bounding_box: false,
        };
        let mut frame_loop = FrameLoop::new(estimator, config, CancelFlag::new()).unwrap();

        let mut f = frame();
        f.data.fill(10); // visibly non-black input
        frame_loop.step(&mut f);

        let at = ((32 * 64 + 32) * 3) as usize;
        assert_eq!(
            [f.data[at], f.data[at + 1], f.data[at + 2]],
            crate::overlay::KEYPOINT_COLOR
        );
        // show_video off: the background was cleared, not passed through.
        assert_eq!(&f.data[0..3], &[0, 0, 0]);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = test_config();
        config.detection.min_part_confidence = 7.0;
        assert!(FrameLoop::new(FakeEstimator::new(vec![]), config, CancelFlag::new()).is_err());
    }
}
