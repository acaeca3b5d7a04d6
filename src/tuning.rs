use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// ISP generation a calibration file is produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareProfile {
    /// Raspberry Pi 5
    Pisp,
    /// Raspberry Pi 4 and earlier
    Vc4,
}

impl HardwareProfile {
    /// Value of the tuning tool's `-t` option.
    pub fn target(&self) -> &'static str {
        match self {
            HardwareProfile::Pisp => "pisp",
            HardwareProfile::Vc4 => "vc4",
        }
    }

    pub fn board(&self) -> &'static str {
        match self {
            HardwareProfile::Pisp => "pi5",
            HardwareProfile::Vc4 => "pi4",
        }
    }

    pub fn output_file_name(&self) -> String {
        format!("calibration_file_{}.json", self.board())
    }
}

pub trait TuningInvoker: Send + Sync {
    fn run_tuning(&self, output: &Path, capture_dir: &Path, profile: HardwareProfile) -> Result<()>;
}

/// Runs libcamera's `ctt.py`.
pub struct CttTuningInvoker {
    python: String,
    script: PathBuf,
}

impl CttTuningInvoker {
    pub fn new(python: impl Into<String>, ctt_dir: &Path) -> Self {
        Self {
            python: python.into(),
            script: ctt_dir.join("ctt.py"),
        }
    }
}

impl TuningInvoker for CttTuningInvoker {
    fn run_tuning(&self, output: &Path, capture_dir: &Path, profile: HardwareProfile) -> Result<()> {
        log::info!(
            "Running {} for {} on {}",
            self.script.display(),
            profile.target(),
            capture_dir.display()
        );

        // ctt writes its log next to where it runs
        let result = Command::new(&self.python)
            .arg(&self.script)
            .arg("-i")
            .arg(capture_dir)
            .arg("-o")
            .arg(output)
            .arg("-t")
            .arg(profile.target())
            .current_dir(capture_dir)
            .output()
            .with_context(|| format!("Failed to start {}", self.script.display()))?;

        if !result.status.success() {
            return Err(anyhow!(
                "ctt failed for {} with {}: {}",
                profile.target(),
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            ));
        }

        if !output.exists() {
            return Err(anyhow!("ctt finished but {} was not written", output.display()));
        }
        Ok(())
    }
}

/// Produces one calibration file per profile inside `capture_dir`.
pub fn run_all(
    invoker: &dyn TuningInvoker,
    capture_dir: &Path,
    profiles: &[HardwareProfile],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let output = capture_dir.join(profile.output_file_name());
        invoker
            .run_tuning(&output, capture_dir, *profile)
            .with_context(|| format!("Tuning for {} failed", profile.board()))?;
        log::info!("Wrote {}", output.display());
        written.push(output);
    }
    Ok(written)
}
