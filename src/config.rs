use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chart_detector::MAX_RETRIES;
use crate::tuning::HardwareProfile;

pub const DEFAULT_CONFIG_FILE: &str = "ctt_capture.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub display: DisplayConfig,
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub validation: ValidationConfig,
    pub tuning: TuningConfig,
    pub paths: PathConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub window_width: u32,
    pub window_height: u32,
    pub preview_width: u32,
    pub preview_height: u32,
    /// Side of the square buffer the chart outline is drawn into.
    pub overlay_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub list_command: String,
    pub video_command: String,
    pub still_command: String,
    pub preview_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub workers: usize,
    /// Scores below this trigger a brightened retry.
    pub retry_below: f32,
    /// Best score must exceed this to count as a detection.
    pub accept_above: f32,
    pub retry_gains: Vec<f32>,
    pub miss_hysteresis: u32,
    /// Program and leading arguments; the probe image path is appended.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Added to the sensor black level to get the darkness floor.
    pub darkness_margin: f64,
    /// Program and leading arguments; the DNG path is appended.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    pub python: String,
    pub ctt_dir: PathBuf,
    pub profiles: Vec<HardwareProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub scratch_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let ctt_dir = dirs::home_dir()
            .unwrap_or_default()
            .join("libcamera/utils/raspberrypi/ctt");

        Self {
            display: DisplayConfig {
                window_width: 1400,
                window_height: 600,
                preview_width: 800,
                preview_height: 600,
                overlay_size: 800,
            },
            camera: CameraConfig {
                list_command: "rpicam-hello".to_string(),
                video_command: "rpicam-vid".to_string(),
                still_command: "rpicam-still".to_string(),
                preview_quality: 70,
            },
            detection: DetectionConfig {
                workers: 4,
                retry_below: 0.75,
                accept_above: 0.5,
                retry_gains: vec![2.0, 4.0],
                miss_hysteresis: 10,
                command: vec!["ctt-macbeth-probe".to_string(), "locate".to_string()],
            },
            validation: ValidationConfig {
                darkness_margin: 1.0 / 64.0,
                command: vec!["ctt-macbeth-probe".to_string(), "inspect".to_string()],
            },
            tuning: TuningConfig {
                python: "python3".to_string(),
                ctt_dir,
                profiles: vec![HardwareProfile::Pisp, HardwareProfile::Vc4],
            },
            paths: PathConfig {
                scratch_dir: std::env::temp_dir().join("ctt-capture"),
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_or_create(DEFAULT_CONFIG_FILE)
    }

    /// Reads `path`, writing the defaults there first when it does not exist.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            log::info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            Ok(default_config)
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| "Failed to parse configuration file")?;

        config.validate()?;
        log::info!("Configuration loaded from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
            }
        }

        std::fs::write(path.as_ref(), contents)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        log::info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.display.preview_width == 0 || self.display.preview_height == 0 {
            return Err(anyhow::anyhow!("Invalid preview dimensions"));
        }

        if self.display.overlay_size == 0 {
            return Err(anyhow::anyhow!("Invalid overlay size"));
        }

        if self.detection.workers == 0 {
            return Err(anyhow::anyhow!("Detection needs at least one worker"));
        }

        for (name, value) in [
            ("retry_below", self.detection.retry_below),
            ("accept_above", self.detection.accept_above),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("Invalid detection threshold {}: {}", name, value));
            }
        }

        if self.detection.retry_gains.len() > MAX_RETRIES {
            return Err(anyhow::anyhow!(
                "At most {} retry gains are allowed, got {}",
                MAX_RETRIES,
                self.detection.retry_gains.len()
            ));
        }

        if self.detection.retry_gains.iter().any(|gain| *gain < 1.0) {
            return Err(anyhow::anyhow!("Retry gains must brighten the frame (>= 1.0)"));
        }

        if self.detection.command.is_empty() || self.validation.command.is_empty() {
            return Err(anyhow::anyhow!("Detector and validator commands must not be empty"));
        }

        if !(0.0..1.0).contains(&self.validation.darkness_margin) {
            return Err(anyhow::anyhow!("Invalid darkness margin: {}", self.validation.darkness_margin));
        }

        if self.tuning.profiles.is_empty() {
            return Err(anyhow::anyhow!("At least one hardware profile is required"));
        }

        Ok(())
    }

    pub fn preview_size(&self) -> (u32, u32) {
        (self.display.preview_width, self.display.preview_height)
    }

    pub fn overlay_size(&self) -> (u32, u32) {
        (self.display.overlay_size, self.display.overlay_size)
    }
}
