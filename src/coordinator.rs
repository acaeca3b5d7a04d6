use anyhow::Result;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::camera_controller::{FrameSource, SourceEvent};
use crate::capture_request::CaptureRequest;
use crate::frame::Frame;
use crate::overlay::{render_overlay, OverlaySurface};
use crate::scheduler::{DetectionScheduler, OverlayUpdate};
use crate::session::{CaptureError, CaptureRecord, CaptureSession, CaptureStep};
use crate::tuning::{self, HardwareProfile, TuningInvoker};
use crate::validator::{Rejection, StrictValidator};

/// Something the user should be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    CaptureAccepted(CaptureRecord),
    CaptureRejected(Rejection),
    CaptureFailed(String),
    TuningFinished(Vec<PathBuf>),
    TuningFailed(String),
}

/// Owns the camera, the detection loop and the capture session, and moves
/// completions between them. Everything here runs on the UI thread; the
/// only blocking work (detection, validation, tuning) happens elsewhere.
pub struct CaptureCoordinator {
    source: Box<dyn FrameSource>,
    events_tx: Sender<SourceEvent>,
    events_rx: Receiver<SourceEvent>,
    scheduler: DetectionScheduler,
    session: CaptureSession,
    validator: Arc<StrictValidator>,
    tuner: Arc<dyn TuningInvoker>,
    profiles: Vec<HardwareProfile>,
    runtime: Handle,
    validation: Option<oneshot::Receiver<Result<(), Rejection>>>,
    tuning: Option<oneshot::Receiver<Result<Vec<PathBuf>>>>,
    latest_frame: Option<Frame>,
    frame_requested: bool,
    running: bool,
    notices: VecDeque<Notice>,
}

impl CaptureCoordinator {
    pub fn new(
        source: Box<dyn FrameSource>,
        scheduler: DetectionScheduler,
        session: CaptureSession,
        validator: Arc<StrictValidator>,
        tuner: Arc<dyn TuningInvoker>,
        profiles: Vec<HardwareProfile>,
        runtime: Handle,
    ) -> Self {
        let (events_tx, events_rx) = channel::unbounded();
        Self {
            source,
            events_tx,
            events_rx,
            scheduler,
            session,
            validator,
            tuner,
            profiles,
            runtime,
            validation: None,
            tuning: None,
            latest_frame: None,
            frame_requested: false,
            running: false,
            notices: VecDeque::new(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.source.start()?;
        self.running = true;
        self.request_next_frame();
        log::info!("Capture session started in {}", self.session.directory().display());
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if self.running {
            self.running = false;
            self.source.stop();
        }
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn latest_frame(&self) -> Option<&Frame> {
        self.latest_frame.as_ref()
    }

    pub fn chart_visible(&self) -> bool {
        self.scheduler.chart_visible()
    }

    pub fn is_tuning(&self) -> bool {
        self.tuning.is_some()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    /// Handles every completion that has arrived since the last call.
    /// Returns true when a new preview frame came in.
    pub fn tick(&mut self, surface: &mut dyn OverlaySurface) -> bool {
        let mut new_frame = false;

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                SourceEvent::FrameReady(frame) => {
                    self.frame_requested = false;
                    self.on_frame_ready(frame, surface);
                    new_frame = true;
                }
                SourceEvent::StillCaptured { path } => {
                    log::debug!("Still written to {}", path.display());
                    self.on_still_captured();
                }
                SourceEvent::StillFailed { path, reason } => {
                    log::debug!("Still {} failed", path.display());
                    let err = self.session.still_failed(reason);
                    self.notices.push_back(Notice::CaptureFailed(err.to_string()));
                }
            }
        }

        self.poll_validation();
        self.poll_tuning();
        self.request_next_frame();
        new_frame
    }

    pub fn request_capture(&mut self, request: CaptureRequest, overwrite_confirmed: bool) -> Result<(), CaptureError> {
        let path = self.session.begin_capture(request, overwrite_confirmed)?;
        // the source drops any outstanding frame request when it switches to stills
        self.frame_requested = false;
        self.source.capture_still(&path, self.events_tx.clone());
        Ok(())
    }

    /// Locks the session and starts tuning in the background.
    pub fn finish(&mut self) -> Result<(), CaptureError> {
        self.session.begin_finish()?;

        let tuner = Arc::clone(&self.tuner);
        let directory = self.session.directory().to_path_buf();
        let profiles = self.profiles.clone();
        let (tx, rx) = oneshot::channel();

        log::info!("Starting tuning for {} profile(s)", profiles.len());
        self.runtime.spawn_blocking(move || {
            let _ = tx.send(tuning::run_all(tuner.as_ref(), &directory, &profiles));
        });
        self.tuning = Some(rx);
        Ok(())
    }

    fn on_frame_ready(&mut self, frame: Frame, surface: &mut dyn OverlaySurface) {
        self.latest_frame = Some(frame.clone());

        // late frame from before the still started, or tuning is running
        if self.session.is_camera_busy() || self.session.is_finishing() {
            return;
        }

        let outcome = self.scheduler.on_frame_ready(&frame);
        let Some(update) = outcome.update else { return };

        let size = self.scheduler.display_size();
        let overlay = match &update {
            OverlayUpdate::Show(chart) => render_overlay(size, Some(chart)),
            OverlayUpdate::Hide => render_overlay(size, None),
        };
        if let Err(e) = surface.set_overlay(overlay) {
            log::debug!("Overlay not updated: {}", e);
        }
    }

    fn on_still_captured(&mut self) {
        match self.session.still_completed() {
            Ok(CaptureStep::Accepted(record)) => {
                self.notices.push_back(Notice::CaptureAccepted(record));
            }
            Ok(CaptureStep::Validate(path)) => {
                let validator = Arc::clone(&self.validator);
                let (tx, rx) = oneshot::channel();
                self.runtime.spawn_blocking(move || {
                    let _ = tx.send(validator.validate(&path));
                });
                self.validation = Some(rx);
            }
            Err(e) => {
                log::warn!("Still completion not applied: {}", e);
                self.notices.push_back(Notice::CaptureFailed(e.to_string()));
            }
        }
    }

    fn poll_validation(&mut self) {
        let Some(rx) = self.validation.as_mut() else { return };
        let verdict = match rx.try_recv() {
            Ok(verdict) => verdict,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => Err(Rejection::Unreadable("validation did not finish".to_string())),
        };
        self.validation = None;

        let notice = match self.session.validation_completed(verdict) {
            Ok(record) => Notice::CaptureAccepted(record),
            Err(CaptureError::Rejected(rejection)) => Notice::CaptureRejected(rejection),
            Err(e) => Notice::CaptureFailed(e.to_string()),
        };
        self.notices.push_back(notice);
    }

    fn poll_tuning(&mut self) {
        let Some(rx) = self.tuning.as_mut() else { return };
        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => Err(anyhow::anyhow!("tuning task ended without a result")),
        };
        self.tuning = None;

        // nothing needs the camera after tuning
        self.shutdown();

        let notice = match outcome {
            Ok(files) => {
                log::info!("Tuning finished: {} file(s)", files.len());
                Notice::TuningFinished(files)
            }
            Err(e) => {
                log::error!("Tuning failed: {:#}", e);
                Notice::TuningFailed(format!("{:#}", e))
            }
        };
        self.notices.push_back(notice);
    }

    fn request_next_frame(&mut self) {
        if !self.running || self.frame_requested || self.session.is_camera_busy() {
            return;
        }
        self.source.request_frame(self.events_tx.clone());
        self.frame_requested = true;
    }
}

impl Drop for CaptureCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
