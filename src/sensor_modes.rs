use anyhow::{anyhow, Context, Result};
use std::process::Command;
use thiserror::Error;

/// One sensor readout mode as reported by `rpicam-hello --list-cameras`.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorMode {
    pub format: String,
    pub bit_depth: u8,
    pub size: (u32, u32),
    /// Crop rectangle on the full pixel array: (x, y, width, height).
    pub crop: (u32, u32, u32, u32),
}

impl SensorMode {
    pub fn crop_area(&self) -> u64 {
        self.crop.2 as u64 * self.crop.3 as u64
    }

    /// Value for the `--mode` option of the rpicam tools.
    pub fn rpicam_arg(&self) -> String {
        format!("{}:{}:{}:P", self.size.0, self.size.1, self.bit_depth)
    }

    fn has_origin_crop(&self) -> bool {
        let (x, y, w, h) = self.crop;
        [x, y, w, h].iter().filter(|v| **v == 0).count() > 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraListing {
    pub model: String,
    pub modes: Vec<SensorMode>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SensorModeError {
    #[error("no camera found in listing")]
    NoCamera,

    #[error("malformed mode entry: {0}")]
    MalformedMode(String),
}

/// Runs the camera listing command and parses the first camera.
pub fn list_cameras(program: &str) -> Result<CameraListing> {
    let output = Command::new(program)
        .arg("--list-cameras")
        .output()
        .with_context(|| format!("Failed to run {} --list-cameras", program))?;

    if !output.status.success() {
        return Err(anyhow!(
            "{} --list-cameras failed with status {}",
            program,
            output.status
        ));
    }

    // rpicam-hello prints the listing on stdout, older builds on stderr
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let listing = parse_listing(&text)?;
    log::info!(
        "Found camera {} with {} sensor modes",
        listing.model,
        listing.modes.len()
    );
    Ok(listing)
}

/// Parses the first camera block of a `--list-cameras` listing.
///
/// ```text
/// 0 : imx219 [3280x2464 10-bit RGGB] (/base/soc/i2c0mux/i2c@1/imx219@10)
///     Modes: 'SRGGB10_CSI2P' : 640x480 [206.65 fps - (1000, 752)/1280x960 crop]
///                              3280x2464 [21.19 fps - (0, 0)/3280x2464 crop]
/// ```
pub fn parse_listing(text: &str) -> Result<CameraListing, SensorModeError> {
    let mut model = None;
    let mut modes = Vec::new();
    let mut bit_depth = None;
    let mut format = String::new();

    for line in text.lines() {
        let trimmed = line.trim();

        if model.is_none() {
            if let Some(rest) = trimmed.strip_prefix("0 :") {
                let name = rest.trim().split_whitespace().next().unwrap_or_default();
                if !name.is_empty() {
                    model = Some(name.to_string());
                }
            }
            continue;
        }

        // second camera block: stop
        if trimmed.starts_with("1 :") {
            break;
        }

        let mut entry = trimmed.strip_prefix("Modes:").map(str::trim).unwrap_or(trimmed);

        if entry.starts_with('\'') {
            let Some((quoted, rest)) = entry[1..].split_once('\'') else {
                return Err(SensorModeError::MalformedMode(trimmed.to_string()));
            };
            format = quoted.to_string();
            bit_depth = Some(parse_bit_depth(quoted)?);
            entry = rest.trim().trim_start_matches(':').trim();
        }

        if entry.is_empty() || !entry.contains("crop") {
            continue;
        }

        let depth = bit_depth.ok_or_else(|| SensorModeError::MalformedMode(trimmed.to_string()))?;
        modes.push(parse_mode(entry, &format, depth)?);
    }

    let model = model.ok_or(SensorModeError::NoCamera)?;
    Ok(CameraListing { model, modes })
}

fn parse_bit_depth(format: &str) -> Result<u8, SensorModeError> {
    let digits: String = format
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse()
        .map_err(|_| SensorModeError::MalformedMode(format.to_string()))
}

fn parse_size(text: &str) -> Option<(u32, u32)> {
    let (w, h) = text.trim().split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

// "1640x1232 [41.85 fps - (0, 0)/3280x2464 crop]"
fn parse_mode(entry: &str, format: &str, bit_depth: u8) -> Result<SensorMode, SensorModeError> {
    let malformed = || SensorModeError::MalformedMode(entry.to_string());

    let (size_text, rest) = entry.split_once('[').ok_or_else(malformed)?;
    let size = parse_size(size_text).ok_or_else(malformed)?;

    let open = rest.find('(').ok_or_else(malformed)?;
    let close = rest.find(')').ok_or_else(malformed)?;
    let (x, y) = rest[open + 1..close].split_once(',').ok_or_else(malformed)?;
    let x: u32 = x.trim().parse().map_err(|_| malformed())?;
    let y: u32 = y.trim().parse().map_err(|_| malformed())?;

    let crop_text = rest[close + 1..]
        .trim_start_matches('/')
        .split_whitespace()
        .next()
        .ok_or_else(malformed)?;
    let (cw, ch) = parse_size(crop_text).ok_or_else(malformed)?;

    Ok(SensorMode {
        format: format.to_string(),
        bit_depth,
        size,
        crop: (x, y, cw, ch),
    })
}

/// Picks the sensor mode for the preview stream. Raw stills always read out
/// the full sensor.
///
/// Only modes reading from the array origin are considered. The largest crop
/// defines the full size; a mode of exactly half that size is preferred when
/// one exists, highest bit depth first.
pub fn select_sensor_mode(modes: &[SensorMode]) -> Option<SensorMode> {
    let candidates: Vec<&SensorMode> = modes.iter().filter(|m| m.has_origin_crop()).collect();

    match candidates.len() {
        0 => return None,
        1 => return Some(candidates[0].clone()),
        _ => {}
    }

    // binned and full readouts share the same crop; the larger output wins
    let full = candidates
        .iter()
        .max_by_key(|m| (m.crop_area(), m.size.0 as u64 * m.size.1 as u64))?
        .size;

    let half = if full.0 % 2 == 0 && full.1 % 2 == 0 {
        Some((full.0 / 2, full.1 / 2))
    } else {
        None
    };

    let deepest = |size: (u32, u32)| {
        candidates
            .iter()
            .filter(|m| m.size == size)
            .max_by_key(|m| m.bit_depth)
            .map(|m| (*m).clone())
    };

    half.and_then(deepest).or_else(|| deepest(full))
}
