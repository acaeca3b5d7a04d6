use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Measurements taken from a saved raw still. Levels are normalised to [0, 1].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageStatistics {
    pub mean_level: f64,
    pub black_level: f64,
    pub chart_found: bool,
}

/// Why a chart capture was thrown away. The messages are shown to the user.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("Image is too dark, please fix the lighting.")]
    TooDark { mean_level: f64, floor: f64 },

    #[error("Could not find macbeth chart in the image, please take the photo again.")]
    ChartNotFound,

    #[error("Could not check the image ({0}), please take the photo again.")]
    Unreadable(String),
}

#[derive(Debug, Error)]
pub enum InspectorError {
    #[error("failed to run inspector: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("inspector exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("unreadable inspector output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Measures a raw calibration still on disk.
pub trait ImageInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<ImageStatistics, InspectorError>;
}

/// Runs an external program on the DNG. It prints
/// `{"mean_level": f, "black_level": f, "chart_found": bool}` on stdout.
pub struct CommandImageInspector {
    program: String,
    args: Vec<String>,
}

impl CommandImageInspector {
    pub fn new(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Inspector command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl ImageInspector for CommandImageInspector {
    fn inspect(&self, path: &Path) -> Result<ImageStatistics, InspectorError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .output()?;

        if !output.status.success() {
            return Err(InspectorError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BrightnessFloor {
    pub margin: f64,
}

impl Default for BrightnessFloor {
    fn default() -> Self {
        Self { margin: 1.0 / 64.0 }
    }
}

impl BrightnessFloor {
    pub fn floor(&self, black_level: f64) -> f64 {
        black_level + self.margin
    }

    /// Brightness is checked before chart presence.
    pub fn classify(&self, stats: &ImageStatistics) -> Result<(), Rejection> {
        let floor = self.floor(stats.black_level);
        if stats.mean_level < floor {
            return Err(Rejection::TooDark {
                mean_level: stats.mean_level,
                floor,
            });
        }
        if !stats.chart_found {
            return Err(Rejection::ChartNotFound);
        }
        Ok(())
    }
}

/// Post-capture check for chart stills.
pub struct StrictValidator {
    inspector: Box<dyn ImageInspector>,
    floor: BrightnessFloor,
}

impl StrictValidator {
    pub fn new(inspector: Box<dyn ImageInspector>, floor: BrightnessFloor) -> Self {
        Self { inspector, floor }
    }

    pub fn validate(&self, path: &Path) -> Result<(), Rejection> {
        let stats = self.inspector.inspect(path).map_err(|e| {
            log::error!("Failed to inspect {}: {}", path.display(), e);
            Rejection::Unreadable(e.to_string())
        })?;

        log::info!(
            "{}: mean level {:.4}, black level {:.4}, chart found: {}",
            path.display(),
            stats.mean_level,
            stats.black_level,
            stats.chart_found
        );
        self.floor.classify(&stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ImageStatistics);

    impl ImageInspector for Fixed {
        fn inspect(&self, _path: &Path) -> Result<ImageStatistics, InspectorError> {
            Ok(self.0.clone())
        }
    }

    fn stats(mean_level: f64, chart_found: bool) -> ImageStatistics {
        ImageStatistics {
            mean_level,
            black_level: 4096.0 / 65536.0,
            chart_found,
        }
    }

    #[test]
    fn test_dark_image_rejected_before_chart_check() {
        let floor = BrightnessFloor::default();
        let result = floor.classify(&stats(0.07, true));
        assert!(matches!(result, Err(Rejection::TooDark { .. })));
        assert_eq!(
            result.unwrap_err().to_string(),
            "Image is too dark, please fix the lighting."
        );
    }

    #[test]
    fn test_missing_chart_rejected() {
        let floor = BrightnessFloor::default();
        assert_eq!(floor.classify(&stats(0.3, false)), Err(Rejection::ChartNotFound));
        assert_eq!(floor.classify(&stats(0.3, true)), Ok(()));
    }

    #[test]
    fn test_floor_is_black_level_plus_margin() {
        let floor = BrightnessFloor { margin: 0.25 };
        assert_eq!(floor.floor(0.5), 0.75);
    }

    #[test]
    fn test_validator_uses_inspector() {
        let validator = StrictValidator::new(Box::new(Fixed(stats(0.01, false))), BrightnessFloor::default());
        let result = validator.validate(Path::new("/tmp/3200K_1000L.dng"));
        assert!(matches!(result, Err(Rejection::TooDark { .. })));
    }

    #[test]
    fn test_inspector_failure_is_a_rejection() {
        let inspector = CommandImageInspector::new(&["/nonexistent/ctt-probe".to_string()]).unwrap();
        let validator = StrictValidator::new(Box::new(inspector), BrightnessFloor::default());
        let result = validator.validate(Path::new("/tmp/missing.dng"));
        assert!(matches!(result, Err(Rejection::Unreadable(_))));
    }
}
