use anyhow::Result;
use crossbeam::channel::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Instant;

use crate::chart_detector::{ChartLocator, DetectionResult};
use crate::frame::{ChartQuad, Frame};
use crate::overlay::{OverlayState, OverlayTransition};
use crate::worker_pool::WorkerPool;

/// The one detection in flight.
struct DetectionJob {
    result: Receiver<DetectionResult>,
    source_size: (u32, u32),
    submitted_at: Instant,
}

/// What the overlay should now display, in display-space coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayUpdate {
    Show(ChartQuad),
    Hide,
}

#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub submitted: bool,
    pub drained: Option<DetectionResult>,
    pub update: Option<OverlayUpdate>,
}

/// Runs the chart locator on preview frames without ever blocking frame
/// delivery. At most one detection job is outstanding; frames arriving while
/// it runs are not inspected.
pub struct DetectionScheduler {
    pool: WorkerPool,
    locator: Arc<ChartLocator>,
    job: Option<DetectionJob>,
    overlay: OverlayState,
    display_size: (u32, u32),
}

impl DetectionScheduler {
    pub fn new(
        locator: Arc<ChartLocator>,
        workers: usize,
        miss_hysteresis: u32,
        display_size: (u32, u32),
    ) -> Result<Self> {
        Ok(Self {
            pool: WorkerPool::new("chart-detect", workers)?,
            locator,
            job: None,
            overlay: OverlayState::new(miss_hysteresis),
            display_size,
        })
    }

    pub fn on_frame_ready(&mut self, frame: &Frame) -> FrameOutcome {
        let submitted = if self.job.is_none() {
            self.submit(frame.clone());
            true
        } else {
            false
        };

        let mut outcome = FrameOutcome {
            submitted,
            ..Default::default()
        };

        if let Some((result, source_size)) = self.try_drain() {
            outcome.update = self.apply(&result, source_size);
            outcome.drained = Some(result);
        }
        outcome
    }

    pub fn has_outstanding_job(&self) -> bool {
        self.job.is_some()
    }

    /// True once the outstanding job has a result waiting to be drained.
    pub fn outstanding_job_finished(&self) -> bool {
        self.job
            .as_ref()
            .map(|job| !job.result.is_empty())
            .unwrap_or(false)
    }

    pub fn chart_visible(&self) -> bool {
        self.overlay.is_shown()
    }

    pub fn display_size(&self) -> (u32, u32) {
        self.display_size
    }

    fn submit(&mut self, frame: Frame) {
        let locator = Arc::clone(&self.locator);
        let source_size = frame.dimensions();
        let result = self.pool.submit(move || locator.locate(&frame));

        self.job = Some(DetectionJob {
            result,
            source_size,
            submitted_at: Instant::now(),
        });
    }

    fn try_drain(&mut self) -> Option<(DetectionResult, (u32, u32))> {
        let job = self.job.as_ref()?;
        let result = match job.result.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => {
                log::warn!("Detection job ended without a result");
                DetectionResult::none()
            }
        };

        let job = self.job.take()?;
        log::debug!(
            "Detection finished in {:?} with score {:.3}",
            job.submitted_at.elapsed(),
            result.score
        );
        Some((result, job.source_size))
    }

    fn apply(&mut self, result: &DetectionResult, source_size: (u32, u32)) -> Option<OverlayUpdate> {
        match self.overlay.observe(result.is_positive()) {
            OverlayTransition::Show => result
                .chart
                .map(|chart| OverlayUpdate::Show(chart.rescale(source_size, self.display_size))),
            OverlayTransition::Hide => Some(OverlayUpdate::Hide),
            OverlayTransition::Hold => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart_detector::{ChartDetector, DetectorError, RetryPolicy};
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns scripted scores in order, sleeping a scripted latency first and
    /// tracking how many calls overlap.
    struct Scripted {
        script: Mutex<VecDeque<(f32, u64)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: impl IntoIterator<Item = (f32, u64)>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ChartDetector for Scripted {
        fn detect(&self, _frame: &Frame) -> Result<DetectionResult, DetectorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);

            let (score, latency) = self.script.lock().unwrap().pop_front().unwrap_or((0.0, 0));
            std::thread::sleep(Duration::from_millis(latency));

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(DetectionResult {
                score,
                chart: Some(ChartQuad::from_pairs([[80.0, 60.0], [80.0, 120.0], [160.0, 120.0], [160.0, 60.0]])),
            })
        }
    }

    fn scheduler(detector: Arc<Scripted>) -> DetectionScheduler {
        // retries disabled so each frame is exactly one detector call
        let policy = RetryPolicy {
            gains: Vec::new(),
            ..RetryPolicy::default()
        };
        let locator = Arc::new(ChartLocator::new(detector, policy));
        DetectionScheduler::new(locator, 4, 10, (800, 800)).unwrap()
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(800, 600, Rgb([128, 128, 128])))
    }

    fn wait_for_job(scheduler: &DetectionScheduler) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.has_outstanding_job() && !scheduler.outstanding_job_finished() {
            assert!(Instant::now() < deadline, "detection job never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_frames_while_pending_are_not_submitted() {
        let detector = Arc::new(Scripted::new([(0.9, 200)]));
        let mut scheduler = scheduler(detector.clone());

        let first = scheduler.on_frame_ready(&frame());
        assert!(first.submitted);
        assert!(first.drained.is_none());

        for _ in 0..5 {
            let outcome = scheduler.on_frame_ready(&frame());
            if outcome.drained.is_some() {
                break;
            }
            assert!(!outcome.submitted);
            assert!(scheduler.has_outstanding_job());
        }

        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_at_most_one_outstanding_job() {
        let latencies = [0, 15, 3, 40, 0, 7, 25, 1, 0, 12, 30, 2];
        let detector = Arc::new(Scripted::new(latencies.iter().map(|l| (0.0, *l))));
        let mut scheduler = scheduler(detector.clone());

        let mut drains = 0;
        for step in 0..200 {
            let outcome = scheduler.on_frame_ready(&frame());
            if outcome.drained.is_some() {
                drains += 1;
            }
            // irregular frame cadence relative to the detector latency
            std::thread::sleep(Duration::from_millis((step % 5) as u64));
        }

        assert!(drains > 0);
        assert_eq!(detector.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_positive_detection_is_rescaled_for_display() {
        let detector = Arc::new(Scripted::new([(0.9, 0)]));
        let mut scheduler = scheduler(detector);

        let mut update = None;
        for _ in 0..10 {
            let outcome = scheduler.on_frame_ready(&frame());
            if outcome.drained.is_some() {
                update = outcome.update;
                break;
            }
            wait_for_job(&scheduler);
        }

        let Some(OverlayUpdate::Show(chart)) = update else {
            panic!("expected the overlay to be shown, got {:?}", update);
        };
        // 800x600 source mapped onto the 800x800 display
        assert_eq!(chart.corners[0].x, 80.0);
        assert_eq!(chart.corners[0].y, 80.0);
        assert_eq!(chart.corners[2].y, 160.0);
        assert!(scheduler.chart_visible());
    }

    #[test]
    fn test_scores_drive_hysteresis() {
        let mut scores = vec![0.9];
        scores.extend(std::iter::repeat(0.0).take(11));
        let detector = Arc::new(Scripted::new(scores.iter().map(|s| (*s, 0))));
        let mut scheduler = scheduler(detector);

        let mut updates = Vec::new();
        let mut drained = 0;
        while drained < scores.len() {
            let outcome = scheduler.on_frame_ready(&frame());
            if outcome.drained.is_some() {
                drained += 1;
                updates.push(outcome.update);
                assert_eq!(scheduler.chart_visible(), drained <= 11);
            }
            wait_for_job(&scheduler);
        }

        assert!(matches!(updates[0], Some(OverlayUpdate::Show(_))));
        assert!(updates[1..11].iter().all(|u| u.is_none()));
        assert_eq!(updates[11], Some(OverlayUpdate::Hide));
    }
}
