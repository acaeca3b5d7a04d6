use serde::Deserialize;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::DetectionConfig;
use crate::frame::{ChartQuad, Frame};

/// Outcome of looking for a chart in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub score: f32,
    pub chart: Option<ChartQuad>,
}

impl DetectionResult {
    pub fn none() -> Self {
        Self {
            score: 0.0,
            chart: None,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.chart.is_some()
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to write probe image: {0}")]
    Probe(#[from] image::ImageError),

    #[error("failed to run detector: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("detector exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("unreadable detector output: {0}")]
    Output(#[from] serde_json::Error),
}

/// The external chart detector. Implementations must tolerate being called
/// from a worker thread; they are never called concurrently by the scheduler.
pub trait ChartDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<DetectionResult, DetectorError>;
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    score: f32,
    corners: Option<[[f32; 2]; 4]>,
}

/// Runs an external probe program against a PNG copy of the frame.
///
/// The probe prints `{"score": 0.82, "corners": [[x, y], ...]}` on stdout,
/// with `corners` null when nothing was found.
pub struct CommandChartDetector {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
    counter: AtomicU64,
}

impl CommandChartDetector {
    pub fn new(command: &[String], scratch_dir: PathBuf) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Detector command is empty"))?;
        std::fs::create_dir_all(&scratch_dir)?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            scratch_dir,
            counter: AtomicU64::new(0),
        })
    }
}

impl ChartDetector for CommandChartDetector {
    fn detect(&self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let probe_path = self.scratch_dir.join(format!("probe_{}.png", n));
        frame.image().save(&probe_path)?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&probe_path)
            .output();
        let _ = std::fs::remove_file(&probe_path);
        let output = output?;

        if !output.status.success() {
            return Err(DetectorError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)?;
        Ok(DetectionResult {
            score: parsed.score.clamp(0.0, 1.0),
            chart: parsed.corners.map(ChartQuad::from_pairs),
        })
    }
}

/// Brightened attempts after the first one; a frame costs at most three
/// detector calls.
pub const MAX_RETRIES: usize = 2;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_below: f32,
    pub accept_above: f32,
    pub gains: Vec<f32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_below: 0.75,
            accept_above: 0.5,
            gains: vec![2.0, 4.0],
        }
    }
}

impl From<&DetectionConfig> for RetryPolicy {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            retry_below: config.retry_below,
            accept_above: config.accept_above,
            gains: config.retry_gains.clone(),
        }
    }
}

/// Wraps a detector with fixed brightened retries for under-exposed frames.
pub struct ChartLocator {
    detector: Arc<dyn ChartDetector>,
    policy: RetryPolicy,
}

impl ChartLocator {
    pub fn new(detector: Arc<dyn ChartDetector>, policy: RetryPolicy) -> Self {
        Self { detector, policy }
    }

    pub fn locate(&self, frame: &Frame) -> DetectionResult {
        let mut best = self.attempt(frame, 1.0);

        for &gain in self.policy.gains.iter().take(MAX_RETRIES) {
            if best.score >= self.policy.retry_below {
                break;
            }
            let candidate = self.attempt(&frame.brightened(gain), gain);
            if candidate.score > best.score {
                best = candidate;
            }
        }

        if best.score > self.policy.accept_above && best.chart.is_some() {
            best
        } else {
            DetectionResult::none()
        }
    }

    fn attempt(&self, frame: &Frame, gain: f32) -> DetectionResult {
        match self.detector.detect(frame) {
            Ok(result) => {
                log::debug!("Detector score {:.3} at gain {}", result.score, gain);
                result
            }
            Err(e) => {
                log::warn!("Chart detector failed at gain {}: {}", gain, e);
                DetectionResult::none()
            }
        }
    }
}
