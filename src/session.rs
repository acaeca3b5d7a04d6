use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::capture_request::{
    cac_file_name, lens_shading_file_name, macbeth_file_name, CaptureCategory, CaptureRequest,
    Temperature,
};
use crate::validator::Rejection;

/// Stills land here until they are accepted.
pub const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    pub request: CaptureRequest,
    /// Repeat index for lens shading, running counter for CAC, 1 for charts.
    pub index: u32,
    pub file_name: String,
    pub path: PathBuf,
    pub captured_at: DateTime<Local>,
    /// Chart stills only: passed the post-capture check.
    pub validated: bool,
}

impl CaptureRecord {
    /// File name with the local time it was taken, as listed in the UI.
    pub fn label(&self) -> String {
        format!("{}  {}", self.file_name, self.captured_at.format("%H:%M:%S"))
    }
}

/// Which calibration keys have been captured so far.
#[derive(Debug, Default)]
pub struct SessionLedger {
    chart_shots: BTreeMap<Temperature, CaptureRecord>,
    lens_shading: Vec<CaptureRecord>,
    cac: Vec<CaptureRecord>,
}

impl SessionLedger {
    pub fn chart_temperature_count(&self) -> usize {
        self.chart_shots.len()
    }

    pub fn lens_shading_count(&self) -> usize {
        self.lens_shading.len()
    }

    pub fn cac_count(&self) -> usize {
        self.cac.len()
    }

    pub fn has_chart_temperature(&self, temperature: Temperature) -> bool {
        self.chart_shots.contains_key(&temperature)
    }

    pub fn chart_shot(&self, temperature: Temperature) -> Option<&CaptureRecord> {
        self.chart_shots.get(&temperature)
    }

    pub fn next_lens_shading_index(&self, temperature: Temperature) -> u32 {
        let taken = self
            .lens_shading
            .iter()
            .filter(|r| matches!(r.request, CaptureRequest::LensShading { temperature: t } if t == temperature))
            .count();
        taken as u32 + 1
    }

    pub fn next_cac_index(&self) -> u32 {
        self.cac.len() as u32 + 1
    }

    /// Tuning needs two chart temperatures and some lens shading data.
    pub fn ready_for_tuning(&self) -> bool {
        self.chart_temperature_count() >= 2 && self.lens_shading_count() >= 1
    }

    pub fn records(&self, category: CaptureCategory) -> Vec<&CaptureRecord> {
        match category {
            CaptureCategory::Macbeth => self.chart_shots.values().collect(),
            CaptureCategory::LensShading => self.lens_shading.iter().collect(),
            CaptureCategory::ChromaticAberration => self.cac.iter().collect(),
        }
    }

    #[cfg(test)]
    pub fn file_names(&self, category: CaptureCategory) -> Vec<String> {
        self.records(category)
            .into_iter()
            .map(|r| r.file_name.clone())
            .collect()
    }

    fn put_chart_shot(&mut self, temperature: Temperature, record: CaptureRecord) -> Option<CaptureRecord> {
        self.chart_shots.insert(temperature, record)
    }

    fn restore_chart_shot(&mut self, temperature: Temperature, prior: Option<CaptureRecord>) {
        match prior {
            Some(prior) => {
                self.chart_shots.insert(temperature, prior);
            }
            None => {
                self.chart_shots.remove(&temperature);
            }
        }
    }

    fn push(&mut self, record: CaptureRecord) {
        match record.request.category() {
            CaptureCategory::LensShading => self.lens_shading.push(record),
            CaptureCategory::ChromaticAberration => self.cac.push(record),
            CaptureCategory::Macbeth => {
                if let CaptureRequest::Macbeth { temperature, .. } = record.request {
                    self.chart_shots.insert(temperature, record);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingCapture {
    pub record: CaptureRecord,
    pub staging_path: PathBuf,
    prior: Option<CaptureRecord>,
}

#[derive(Debug, Clone)]
pub enum CaptureState {
    Idle,
    CaptureInFlight(PendingCapture),
    ValidatingMacbethCapture(PendingCapture),
    Finishing,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("a capture is already in progress")]
    Busy,

    #[error("the session is finishing")]
    Finishing,

    #[error("an image for {0}K already exists; confirm to overwrite it")]
    OverwriteUnconfirmed(Temperature),

    #[error("no capture is in progress")]
    NothingInFlight,

    #[error("tuning needs two chart temperatures and one lens shading image")]
    NotReadyToFinish,

    #[error("{0}")]
    Rejected(#[from] Rejection),

    #[error("capture failed: {0}")]
    Failed(String),

    #[error("file operation failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What happens after a still has been written.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureStep {
    Accepted(CaptureRecord),
    /// Chart still: check the file at this path before accepting it.
    Validate(PathBuf),
}

/// Tracks one calibration session: what has been captured and what the
/// camera is currently doing for it.
pub struct CaptureSession {
    directory: PathBuf,
    ledger: SessionLedger,
    state: CaptureState,
}

impl CaptureSession {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            ledger: SessionLedger::default(),
            state: CaptureState::Idle,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, CaptureState::Idle)
    }

    /// The camera is writing a still; preview frames must not be requested.
    pub fn is_camera_busy(&self) -> bool {
        matches!(self.state, CaptureState::CaptureInFlight(_))
    }

    pub fn is_validating(&self) -> bool {
        matches!(self.state, CaptureState::ValidatingMacbethCapture(_))
    }

    pub fn is_finishing(&self) -> bool {
        matches!(self.state, CaptureState::Finishing)
    }

    pub fn needs_overwrite_confirmation(&self, request: &CaptureRequest) -> bool {
        match request {
            CaptureRequest::Macbeth { temperature, .. } => self.ledger.has_chart_temperature(*temperature),
            _ => false,
        }
    }

    pub fn can_finish(&self) -> bool {
        self.is_idle() && self.ledger.ready_for_tuning()
    }

    /// Starts a capture and returns the path the still must be written to.
    pub fn begin_capture(
        &mut self,
        request: CaptureRequest,
        overwrite_confirmed: bool,
    ) -> Result<PathBuf, CaptureError> {
        match self.state {
            CaptureState::Idle => {}
            CaptureState::Finishing => return Err(CaptureError::Finishing),
            _ => return Err(CaptureError::Busy),
        }

        if self.needs_overwrite_confirmation(&request) && !overwrite_confirmed {
            if let CaptureRequest::Macbeth { temperature, .. } = request {
                return Err(CaptureError::OverwriteUnconfirmed(temperature));
            }
        }

        let (file_name, index) = match request {
            CaptureRequest::Macbeth { temperature, lux } => (macbeth_file_name(temperature, lux), 1),
            CaptureRequest::LensShading { temperature } => {
                let index = self.ledger.next_lens_shading_index(temperature);
                (lens_shading_file_name(temperature, index), index)
            }
            CaptureRequest::ChromaticAberration => {
                let index = self.ledger.next_cac_index();
                (cac_file_name(index), index)
            }
        };

        let staging_dir = self.directory.join(STAGING_DIR);
        std::fs::create_dir_all(&staging_dir)?;
        let staging_path = staging_dir.join(&file_name);

        let record = CaptureRecord {
            request,
            index,
            path: self.directory.join(&file_name),
            file_name,
            captured_at: Local::now(),
            validated: false,
        };

        let prior = match request {
            CaptureRequest::Macbeth { temperature, .. } => {
                self.ledger.put_chart_shot(temperature, record.clone())
            }
            _ => None,
        };

        log::info!("Capturing {}", record.file_name);
        self.state = CaptureState::CaptureInFlight(PendingCapture {
            record,
            staging_path: staging_path.clone(),
            prior,
        });
        Ok(staging_path)
    }

    pub fn still_completed(&mut self) -> Result<CaptureStep, CaptureError> {
        let pending = match std::mem::replace(&mut self.state, CaptureState::Idle) {
            CaptureState::CaptureInFlight(pending) => pending,
            other => {
                self.state = other;
                return Err(CaptureError::NothingInFlight);
            }
        };

        if let CaptureRequest::Macbeth { .. } = pending.record.request {
            let path = pending.staging_path.clone();
            self.state = CaptureState::ValidatingMacbethCapture(pending);
            return Ok(CaptureStep::Validate(path));
        }

        if let Err(e) = std::fs::rename(&pending.staging_path, &pending.record.path) {
            self.roll_back(pending);
            return Err(e.into());
        }

        log::info!("Saved {}", pending.record.file_name);
        self.ledger.push(pending.record.clone());
        Ok(CaptureStep::Accepted(pending.record))
    }

    pub fn still_failed(&mut self, reason: impl Into<String>) -> CaptureError {
        match std::mem::replace(&mut self.state, CaptureState::Idle) {
            CaptureState::CaptureInFlight(pending) => {
                let reason = reason.into();
                log::error!("Capture of {} failed: {}", pending.record.file_name, reason);
                self.roll_back(pending);
                CaptureError::Failed(reason)
            }
            other => {
                self.state = other;
                CaptureError::NothingInFlight
            }
        }
    }

    pub fn validation_completed(
        &mut self,
        verdict: Result<(), Rejection>,
    ) -> Result<CaptureRecord, CaptureError> {
        let pending = match std::mem::replace(&mut self.state, CaptureState::Idle) {
            CaptureState::ValidatingMacbethCapture(pending) => pending,
            other => {
                self.state = other;
                return Err(CaptureError::NothingInFlight);
            }
        };

        if let Err(rejection) = verdict {
            log::warn!("Rejected {}: {}", pending.record.file_name, rejection);
            self.roll_back(pending);
            return Err(rejection.into());
        }

        if let Err(e) = std::fs::rename(&pending.staging_path, &pending.record.path) {
            self.roll_back(pending);
            return Err(e.into());
        }

        let mut record = pending.record;
        record.validated = true;
        self.ledger.push(record.clone());

        if let Some(prior) = pending.prior {
            if prior.path != record.path {
                if let Err(e) = std::fs::remove_file(&prior.path) {
                    log::warn!("Could not remove replaced {}: {}", prior.path.display(), e);
                }
            }
        }

        log::info!("Accepted {}", record.file_name);
        Ok(record)
    }

    /// Stops further captures. The staging directory is removed.
    pub fn begin_finish(&mut self) -> Result<(), CaptureError> {
        if !self.can_finish() {
            return Err(CaptureError::NotReadyToFinish);
        }
        self.state = CaptureState::Finishing;

        let staging_dir = self.directory.join(STAGING_DIR);
        match std::fs::remove_dir_all(&staging_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove {}: {}", staging_dir.display(), e),
        }
        Ok(())
    }

    fn roll_back(&mut self, pending: PendingCapture) {
        if pending.staging_path.exists() {
            if let Err(e) = std::fs::remove_file(&pending.staging_path) {
                log::warn!("Could not remove {}: {}", pending.staging_path.display(), e);
            }
        }
        if let CaptureRequest::Macbeth { temperature, .. } = pending.record.request {
            self.ledger.restore_chart_shot(temperature, pending.prior);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_still(path: &Path, contents: &str) {
        std::fs::write(path, contents).unwrap();
    }

    fn take(session: &mut CaptureSession, request: CaptureRequest, confirmed: bool) -> CaptureStep {
        let path = session.begin_capture(request, confirmed).unwrap();
        assert!(session.is_camera_busy());
        write_still(&path, "raw");
        session.still_completed().unwrap()
    }

    fn chart(temperature: &str, lux: &str) -> CaptureRequest {
        CaptureRequest::macbeth(temperature, lux).unwrap()
    }

    fn shading(temperature: &str) -> CaptureRequest {
        CaptureRequest::lens_shading(temperature).unwrap()
    }

    #[test]
    fn test_chart_recapture_keeps_one_entry() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        assert!(matches!(take(&mut session, chart("3200", "1000"), false), CaptureStep::Validate(_)));
        assert!(session.is_validating());
        session.validation_completed(Ok(())).unwrap();

        assert!(session.needs_overwrite_confirmation(&chart("3200", "1000")));
        take(&mut session, chart("3200", "1000"), true);
        let record = session.validation_completed(Ok(())).unwrap();

        assert!(record.validated);
        assert_eq!(session.ledger().file_names(CaptureCategory::Macbeth), vec!["3200K_1000L.dng"]);
        assert_eq!(session.ledger().chart_temperature_count(), 1);
        assert!(dir.path().join("3200K_1000L.dng").exists());
        assert!(session.is_idle());
    }

    #[test]
    fn test_chart_recapture_at_new_lux_replaces_file() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        take(&mut session, chart("3200", "1000"), false);
        session.validation_completed(Ok(())).unwrap();
        take(&mut session, chart("3200", "600"), true);
        session.validation_completed(Ok(())).unwrap();

        assert_eq!(session.ledger().file_names(CaptureCategory::Macbeth), vec!["3200K_600L.dng"]);
        assert!(!dir.path().join("3200K_1000L.dng").exists());
        assert!(dir.path().join("3200K_600L.dng").exists());
    }

    #[test]
    fn test_overwrite_needs_confirmation() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        take(&mut session, chart("3200", "1000"), false);
        session.validation_completed(Ok(())).unwrap();

        let err = session.begin_capture(chart("3200", "800"), false).unwrap_err();
        assert!(matches!(err, CaptureError::OverwriteUnconfirmed(t) if t.kelvin() == 3200));
        assert!(session.is_idle());
    }

    #[test]
    fn test_lens_shading_repeats_are_indexed() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        assert!(matches!(take(&mut session, shading("3200"), false), CaptureStep::Accepted(_)));
        take(&mut session, shading("3200"), false);
        take(&mut session, shading("5000"), false);

        assert_eq!(
            session.ledger().file_names(CaptureCategory::LensShading),
            vec!["alsc_3200K_1.dng", "alsc_3200K_2.dng", "alsc_5000K_1.dng"]
        );
        assert!(dir.path().join("alsc_3200K_2.dng").exists());
    }

    #[test]
    fn test_cac_counter() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        take(&mut session, CaptureRequest::ChromaticAberration, false);
        take(&mut session, CaptureRequest::ChromaticAberration, false);

        assert_eq!(
            session.ledger().file_names(CaptureCategory::ChromaticAberration),
            vec!["cac_chart1.dng", "cac_chart2.dng"]
        );
    }

    #[test]
    fn test_record_label_carries_capture_time() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        let CaptureStep::Accepted(record) = take(&mut session, shading("5000"), false) else {
            panic!("lens shading stills need no validation");
        };
        let time = record.captured_at.format("%H:%M:%S").to_string();
        assert_eq!(record.label(), format!("alsc_5000K_1.dng  {}", time));

        let listed = session.ledger().records(CaptureCategory::LensShading);
        assert_eq!(listed[0].label(), record.label());
    }

    #[test]
    fn test_rejection_deletes_file_and_entry() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        let CaptureStep::Validate(staged) = take(&mut session, chart("3200", "1000"), false) else {
            panic!("chart stills need validation");
        };
        assert!(session.ledger().has_chart_temperature("3200".parse().unwrap()));

        let err = session
            .validation_completed(Err(Rejection::TooDark { mean_level: 0.01, floor: 0.08 }))
            .unwrap_err();

        assert_eq!(err.to_string(), "Image is too dark, please fix the lighting.");
        assert!(!staged.exists());
        assert!(!dir.path().join("3200K_1000L.dng").exists());
        assert!(!session.ledger().has_chart_temperature("3200".parse().unwrap()));
        assert!(session.is_idle());
    }

    #[test]
    fn test_rejected_recapture_restores_previous_shot() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        take(&mut session, chart("3200", "1000"), false);
        session.validation_completed(Ok(())).unwrap();

        take(&mut session, chart("3200", "1000"), true);
        session.validation_completed(Err(Rejection::ChartNotFound)).unwrap_err();

        let kept = session.ledger().chart_shot("3200".parse().unwrap()).unwrap();
        assert!(kept.validated);
        assert!(dir.path().join("3200K_1000L.dng").exists());
    }

    #[test]
    fn test_failed_still_rolls_back() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        session.begin_capture(chart("4000", "500"), false).unwrap();
        assert!(matches!(session.begin_capture(shading("4000"), false), Err(CaptureError::Busy)));

        let err = session.still_failed("rpicam-still exited with 255");
        assert!(matches!(err, CaptureError::Failed(_)));
        assert!(session.is_idle());
        assert_eq!(session.ledger().chart_temperature_count(), 0);
        assert!(matches!(session.still_completed(), Err(CaptureError::NothingInFlight)));
    }

    #[test]
    fn test_finish_gating() {
        let dir = TempDir::new().unwrap();
        let mut session = CaptureSession::new(dir.path().to_path_buf());

        take(&mut session, chart("3200", "1000"), false);
        assert!(!session.can_finish());
        session.validation_completed(Ok(())).unwrap();
        take(&mut session, shading("3200"), false);
        assert!(!session.can_finish());
        assert!(matches!(session.begin_finish(), Err(CaptureError::NotReadyToFinish)));

        take(&mut session, chart("5000", "1000"), false);
        // still validating
        assert!(!session.can_finish());
        session.validation_completed(Ok(())).unwrap();
        assert!(session.can_finish());

        session.begin_finish().unwrap();
        assert!(session.is_finishing());
        assert!(!dir.path().join(STAGING_DIR).exists());
        assert!(matches!(
            session.begin_capture(CaptureRequest::ChromaticAberration, false),
            Err(CaptureError::Finishing)
        ));
    }
}
